//! /24 subnet prefix parsing and host enumeration.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::CoreError;

/// The first three octets of a /24 network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubnetPrefix([u8; 3]);

impl SubnetPrefix {
    pub fn of(addr: Ipv4Addr) -> Self {
        let [a, b, c, _] = addr.octets();
        Self([a, b, c])
    }

    /// Host addresses `.1` through `.254`.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        (1..=254u8).map(move |last| self.host(last))
    }

    pub fn host(&self, last: u8) -> Ipv4Addr {
        let [a, b, c] = self.0;
        Ipv4Addr::new(a, b, c, last)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        Self::of(addr) == *self
    }

    /// Key under which scan results for this prefix are cached.
    pub fn cache_key(&self, quick: bool) -> String {
        format!("{self}|{}", if quick { "quick" } else { "full" })
    }
}

impl fmt::Display for SubnetPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.0;
        write!(f, "{a}.{b}.{c}")
    }
}

/// Accepts `a.b.c`, `a.b.c.d` and `a.b.c.d/24`.
impl FromStr for SubnetPrefix {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || CoreError::MalformedTarget(format!("invalid subnet prefix: '{s}'"));
        let trimmed = s.trim();

        let body = match trimmed.split_once('/') {
            Some((body, "24")) => body,
            Some((_, bits)) => {
                return Err(CoreError::MalformedTarget(format!(
                    "only /24 subnets are supported, got /{bits}"
                )))
            }
            None => trimmed,
        };

        let parts: Vec<&str> = body.split('.').collect();
        if parts.len() != 3 && parts.len() != 4 {
            return Err(malformed());
        }
        let mut octets = [0u8; 4];
        for (slot, part) in octets.iter_mut().zip(&parts) {
            *slot = part.parse::<u8>().map_err(|_| malformed())?;
        }
        Ok(Self([octets[0], octets[1], octets[2]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_all_three_forms() {
        let expected = SubnetPrefix([192, 168, 1]);
        assert_eq!("192.168.1".parse::<SubnetPrefix>().unwrap(), expected);
        assert_eq!("192.168.1.77".parse::<SubnetPrefix>().unwrap(), expected);
        assert_eq!(" 192.168.1.0/24 ".parse::<SubnetPrefix>().unwrap(), expected);
    }

    #[test]
    fn test_parse_rejects_malformed_input() {
        for bad in ["", "192.168", "192.168.1.2.3", "300.1.1", "a.b.c", "10.0.0.0/16", "10.0.0.0/"] {
            let err = bad.parse::<SubnetPrefix>().unwrap_err();
            assert_eq!(err.kind(), "MalformedTarget", "input {bad:?}");
        }
    }

    #[test]
    fn test_hosts_cover_one_to_254() {
        let prefix: SubnetPrefix = "10.0.5".parse().unwrap();
        let hosts: Vec<_> = prefix.hosts().collect();
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], Ipv4Addr::new(10, 0, 5, 1));
        assert_eq!(hosts[253], Ipv4Addr::new(10, 0, 5, 254));
    }

    #[test]
    fn test_contains_and_cache_key() {
        let prefix: SubnetPrefix = "10.0.5".parse().unwrap();
        assert!(prefix.contains(Ipv4Addr::new(10, 0, 5, 200)));
        assert!(!prefix.contains(Ipv4Addr::new(10, 0, 6, 200)));
        assert_eq!(prefix.cache_key(true), "10.0.5|quick");
        assert_ne!(prefix.cache_key(true), prefix.cache_key(false));
    }
}
