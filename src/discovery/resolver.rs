//! Reverse DNS hostname resolution.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use async_trait::async_trait;
use dns_lookup::lookup_addr;

#[async_trait]
pub trait HostnameResolver: Send + Sync {
    /// Hostname for `addr`, `None` when lookup fails or times out.
    async fn resolve(&self, addr: Ipv4Addr) -> Option<String>;
}

/// Blocking `getnameinfo` lookup run off the async threads, bounded by a timeout.
pub struct DnsResolver {
    timeout: Duration,
}

impl DnsResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HostnameResolver for DnsResolver {
    async fn resolve(&self, addr: Ipv4Addr) -> Option<String> {
        let lookup = tokio::task::spawn_blocking(move || reverse_lookup(addr));
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                tracing::debug!("Reverse lookup task for {addr} failed: {e}");
                None
            }
            Err(_) => {
                tracing::trace!("Reverse lookup for {addr} timed out");
                None
            }
        }
    }
}

/// Reverse lookup that treats an echo of the address itself as no answer.
pub fn reverse_lookup(ip: Ipv4Addr) -> Option<String> {
    match lookup_addr(&IpAddr::V4(ip)) {
        Ok(hostname) if hostname != ip.to_string() && !hostname.is_empty() => Some(hostname),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_never_echoes_address() {
        let resolver = DnsResolver::new(Duration::from_secs(2));
        if let Some(name) = resolver.resolve(Ipv4Addr::LOCALHOST).await {
            assert_ne!(name, "127.0.0.1");
        }
    }
}
