//! Pure input handling extracted from the command functions.
//!
//! These functions take plain parameters (no `AppState` dependency) and can be
//! unit-tested without composing the core.

use std::net::{IpAddr, Ipv4Addr};

use serde::Deserialize;

use crate::core::flows::{FlowKey, Protocol};
use crate::error::{CoreError, CoreResult};

/// Events returned when the caller names no limit.
pub const DEFAULT_EVENT_LIMIT: usize = 100;

/// Upper bound on events returned by one call.
pub const MAX_EVENT_LIMIT: usize = 1000;

/// Counters for one flow as reported by a capture collaborator.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FlowObservation {
    pub source: String,
    pub source_port: u16,
    pub destination: String,
    pub destination_port: u16,
    pub protocol: String,
    #[serde(default)]
    pub bytes_sent: u64,
    #[serde(default)]
    pub bytes_received: u64,
    #[serde(default)]
    pub packets_sent: u64,
    #[serde(default)]
    pub packets_received: u64,
}

/// Parse a single IPv4 host address as accepted by enforcement commands.
pub fn parse_target(input: &str) -> CoreResult<Ipv4Addr> {
    input
        .trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| CoreError::MalformedTarget(format!("not an IPv4 address: '{input}'")))
}

fn parse_address(input: &str) -> CoreResult<IpAddr> {
    input
        .trim()
        .parse::<IpAddr>()
        .map_err(|_| CoreError::MalformedTarget(format!("not an IP address: '{input}'")))
}

/// `tcp`, `udp`, `icmp` (any case) or an IP protocol number.
pub fn parse_protocol(input: &str) -> CoreResult<Protocol> {
    let trimmed = input.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        "icmp" | "icmpv6" => Ok(Protocol::Icmp),
        other => other
            .parse::<u8>()
            .map(Protocol::from_number)
            .map_err(|_| CoreError::MalformedTarget(format!("unknown protocol '{trimmed}'"))),
    }
}

/// Build the flow key for an observation.
pub fn flow_key(observation: &FlowObservation) -> CoreResult<FlowKey> {
    Ok(FlowKey::new(
        parse_address(&observation.source)?,
        observation.source_port,
        parse_address(&observation.destination)?,
        observation.destination_port,
        parse_protocol(&observation.protocol)?,
    ))
}

/// Clamp a requested event count to `1..=MAX_EVENT_LIMIT`.
pub fn resolve_event_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_EVENT_LIMIT).clamp(1, MAX_EVENT_LIMIT)
}

/// Reason recorded for an optimization the caller asked for.
pub fn resolve_optimization_reason(reason: Option<String>) -> String {
    reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "manual".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(protocol: &str) -> FlowObservation {
        FlowObservation {
            source: "192.168.1.20".into(),
            source_port: 51000,
            destination: "93.184.216.34".into(),
            destination_port: 443,
            protocol: protocol.into(),
            bytes_sent: 100,
            bytes_received: 2000,
            packets_sent: 2,
            packets_received: 3,
        }
    }

    #[test]
    fn test_parse_target_trims_whitespace() {
        assert_eq!(parse_target(" 192.168.1.5 ").unwrap(), Ipv4Addr::new(192, 168, 1, 5));
    }

    #[test]
    fn test_parse_target_rejects_garbage_and_v6() {
        assert_eq!(parse_target("192.168.1").unwrap_err().kind(), "MalformedTarget");
        assert_eq!(parse_target("router").unwrap_err().kind(), "MalformedTarget");
        assert_eq!(parse_target("::1").unwrap_err().kind(), "MalformedTarget");
    }

    #[test]
    fn test_parse_protocol_names_and_numbers() {
        assert_eq!(parse_protocol("TCP").unwrap(), Protocol::Tcp);
        assert_eq!(parse_protocol("udp").unwrap(), Protocol::Udp);
        assert_eq!(parse_protocol("icmp").unwrap(), Protocol::Icmp);
        assert_eq!(parse_protocol("17").unwrap(), Protocol::Udp);
        assert_eq!(parse_protocol("47").unwrap(), Protocol::Other(47));
        assert_eq!(parse_protocol("sctp!").unwrap_err().kind(), "MalformedTarget");
    }

    #[test]
    fn test_flow_key_from_observation() {
        let key = flow_key(&observation("tcp")).unwrap();
        assert_eq!(key.to_string(), "192.168.1.20:51000-93.184.216.34:443-TCP");
    }

    #[test]
    fn test_flow_key_accepts_v6_endpoints() {
        let mut obs = observation("udp");
        obs.source = "fe80::1".into();
        obs.destination = "fe80::2".into();
        let key = flow_key(&obs).unwrap();
        assert!(key.source.is_ipv6());
        assert_eq!(key.protocol, Protocol::Udp);
    }

    #[test]
    fn test_flow_key_bad_address() {
        let mut obs = observation("tcp");
        obs.destination = "example.com".into();
        assert_eq!(flow_key(&obs).unwrap_err().kind(), "MalformedTarget");
    }

    #[test]
    fn test_observation_counters_default_to_zero() {
        let obs: FlowObservation = serde_json::from_str(
            r#"{"source":"10.0.0.1","source_port":1,"destination":"10.0.0.2","destination_port":2,"protocol":"udp"}"#,
        )
        .unwrap();
        assert_eq!(obs.bytes_sent, 0);
        assert_eq!(obs.packets_received, 0);
    }

    #[test]
    fn test_event_limit_default_and_clamp() {
        assert_eq!(resolve_event_limit(None), DEFAULT_EVENT_LIMIT);
        assert_eq!(resolve_event_limit(Some(0)), 1);
        assert_eq!(resolve_event_limit(Some(25)), 25);
        assert_eq!(resolve_event_limit(Some(1_000_000)), MAX_EVENT_LIMIT);
    }

    #[test]
    fn test_optimization_reason_default() {
        assert_eq!(resolve_optimization_reason(None), "manual");
        assert_eq!(resolve_optimization_reason(Some("  ".into())), "manual");
        assert_eq!(resolve_optimization_reason(Some(" lag ".into())), "lag");
    }
}
