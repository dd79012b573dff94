//! Threat and anomaly heuristics over flow snapshots.
//!
//! Everything here is a pure function of the flows and thresholds; the
//! analyzer decides what to persist, publish and tag.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::config::DetectionConfig;

use super::flows::{FlowKey, FlowSnapshot, Protocol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// Risk added to a flow the first time a finding of this severity tags it.
    pub fn risk_increment(&self) -> u8 {
        match self {
            Severity::Low => 5,
            Severity::Medium => 10,
            Severity::High => 20,
            Severity::Critical => 30,
        }
    }
}

/// One triggered per-flow check.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowFinding {
    pub key: FlowKey,
    pub kind: &'static str,
    pub severity: Severity,
    pub description: String,
}

/// A triggered indicator check, before dedup against known indicators.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorFinding {
    pub indicator_type: &'static str,
    pub value: String,
    pub source: &'static str,
    pub confidence: f64,
}

/// Mean bytes and packets across the active flows of one cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Baseline {
    pub mean_bytes: f64,
    pub mean_packets: f64,
}

pub fn baseline(flows: &[FlowSnapshot]) -> Option<Baseline> {
    if flows.is_empty() {
        return None;
    }
    let n = flows.len() as f64;
    Some(Baseline {
        mean_bytes: flows.iter().map(|f| f.total_bytes() as f64).sum::<f64>() / n,
        mean_packets: flows.iter().map(|f| f.total_packets() as f64).sum::<f64>() / n,
    })
}

/// Run every independent per-flow check against one flow.
pub fn evaluate_flow(
    flow: &FlowSnapshot,
    baseline: Option<&Baseline>,
    config: &DetectionConfig,
) -> Vec<FlowFinding> {
    let mut findings = Vec::new();
    let mut hit = |kind: &'static str, severity: Severity, description: String| {
        findings.push(FlowFinding {
            key: flow.key,
            kind,
            severity,
            description,
        })
    };

    let total_bytes = flow.total_bytes();
    let total_packets = flow.total_packets();

    if total_bytes > config.high_bandwidth_bytes {
        hit(
            "high_bandwidth",
            Severity::Medium,
            format!("High bandwidth usage: {total_bytes} bytes"),
        );
    }

    if flow.bytes_sent > flow.bytes_received.saturating_mul(config.exfiltration_ratio) {
        hit(
            "data_exfiltration",
            Severity::Critical,
            format!(
                "Possible data exfiltration: {} sent vs {} received",
                flow.bytes_sent, flow.bytes_received
            ),
        );
    }

    if config.remote_access_ports.contains(&flow.key.destination_port) {
        hit(
            "remote_access",
            Severity::High,
            format!("Remote access protocol on port {}", flow.key.destination_port),
        );
    }

    if flow.packets_sent > config.flood_packets {
        hit(
            "flood",
            Severity::Critical,
            format!("Possible flood: {} packets sent", flow.packets_sent),
        );
    }

    if let Some(base) = baseline {
        if total_bytes as f64 > base.mean_bytes * config.anomaly_bytes_factor {
            hit(
                "anomaly_high_bandwidth",
                Severity::High,
                format!(
                    "Anomalous bandwidth: {total_bytes} bytes (mean {:.0})",
                    base.mean_bytes
                ),
            );
        }
        if total_packets as f64 > base.mean_packets * config.anomaly_packets_factor {
            hit(
                "anomaly_high_packets",
                Severity::High,
                format!(
                    "Anomalous packet count: {total_packets} packets (mean {:.0})",
                    base.mean_packets
                ),
            );
        }
    }

    findings
}

/// Sources contacting more than `threshold` distinct destination ports.
pub fn port_scan_sources(flows: &[FlowSnapshot], threshold: usize) -> Vec<(IpAddr, usize)> {
    let mut ports: BTreeMap<IpAddr, BTreeSet<u16>> = BTreeMap::new();
    for flow in flows {
        ports
            .entry(flow.key.source)
            .or_default()
            .insert(flow.key.destination_port);
    }
    ports
        .into_iter()
        .map(|(src, set)| (src, set.len()))
        .filter(|(_, count)| *count > threshold)
        .collect()
}

/// All indicator checks for one cycle.
pub fn indicator_findings(flows: &[FlowSnapshot], config: &DetectionConfig) -> Vec<IndicatorFinding> {
    let mut findings = Vec::new();

    for (source, _) in port_scan_sources(flows, config.port_scan_threshold) {
        findings.push(IndicatorFinding {
            indicator_type: "behavior",
            value: format!("port_scanning_{source}"),
            source: "port_scanning_detection",
            confidence: 0.7,
        });
    }

    let unusual: BTreeSet<Protocol> = flows
        .iter()
        .map(|f| f.key.protocol)
        .filter(|p| !p.is_common())
        .collect();
    for protocol in unusual {
        findings.push(IndicatorFinding {
            indicator_type: "protocol",
            value: protocol.to_string(),
            source: "unusual_protocol",
            confidence: 0.6,
        });
    }

    let suspicious: BTreeSet<IpAddr> = flows
        .iter()
        .filter(|f| {
            f.packets_sent > config.flood_packets
                || f.packets_received > config.flood_packets
                || (config.attack_ports.contains(&f.key.destination_port)
                    && f.packets_sent > config.suspicious_destination_packets)
        })
        .map(|f| f.key.destination)
        .collect();
    for destination in suspicious {
        findings.push(IndicatorFinding {
            indicator_type: "ip",
            value: destination.to_string(),
            source: "suspicious_destination",
            confidence: 0.8,
        });
    }

    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::flows::tests::key;

    fn flow(dport: u16, sent: u64, received: u64, packets_sent: u64) -> FlowSnapshot {
        FlowSnapshot {
            key: key([192, 168, 1, 5], 40000, [10, 0, 0, 1], dport),
            bytes_sent: sent,
            bytes_received: received,
            packets_sent,
            packets_received: 0,
            first_seen: 0,
            last_seen: 0,
            bandwidth_bps: 0.0,
            tags: vec![],
            risk_score: 0,
            active: true,
        }
    }

    fn kinds(findings: &[FlowFinding]) -> Vec<&'static str> {
        findings.iter().map(|f| f.kind).collect()
    }

    #[test]
    fn test_quiet_flow_triggers_nothing() {
        let f = flow(443, 1000, 1000, 10);
        assert!(evaluate_flow(&f, None, &DetectionConfig::default()).is_empty());
    }

    #[test]
    fn test_exfiltration_ratio_boundary() {
        let cfg = DetectionConfig::default();
        assert!(kinds(&evaluate_flow(&flow(443, 1000, 100, 1), None, &cfg)).is_empty());
        assert_eq!(
            kinds(&evaluate_flow(&flow(443, 1001, 100, 1), None, &cfg)),
            vec!["data_exfiltration"]
        );
    }

    #[test]
    fn test_independent_checks_all_fire() {
        let f = flow(3389, 2_000_000, 0, 1500);
        let found = evaluate_flow(&f, None, &DetectionConfig::default());
        assert_eq!(
            kinds(&found),
            vec!["high_bandwidth", "data_exfiltration", "remote_access", "flood"]
        );
        assert_eq!(found[1].severity, Severity::Critical);
        assert_eq!(found[2].severity, Severity::High);
    }

    #[test]
    fn test_anomaly_against_baseline() {
        let mut flows: Vec<_> = (0..29).map(|_| flow(443, 100, 100, 1)).collect();
        flows.push(flow(443, 5000, 5000, 500));
        let base = baseline(&flows).unwrap();
        let found = evaluate_flow(&flows[29], Some(&base), &DetectionConfig::default());
        assert!(kinds(&found).contains(&"anomaly_high_bandwidth"));
        assert!(kinds(&found).contains(&"anomaly_high_packets"));
        assert!(evaluate_flow(&flows[0], Some(&base), &DetectionConfig::default()).is_empty());
    }

    #[test]
    fn test_baseline_of_nothing_is_none() {
        assert!(baseline(&[]).is_none());
    }

    #[test]
    fn test_port_scan_needs_more_than_threshold_ports() {
        let flows: Vec<_> = (1..=11).map(|p| flow(p, 1, 1, 1)).collect();
        assert!(port_scan_sources(&flows[..10], 10).is_empty());
        let scanners = port_scan_sources(&flows, 10);
        assert_eq!(scanners.len(), 1);
        assert_eq!(scanners[0].1, 11);

        let indicators = indicator_findings(&flows, &DetectionConfig::default());
        assert_eq!(indicators.len(), 1);
        assert_eq!(indicators[0].value, "port_scanning_192.168.1.5");
        assert_eq!(indicators[0].source, "port_scanning_detection");
        assert!((indicators[0].confidence - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unusual_protocol_and_suspicious_destination() {
        let mut gre = flow(0, 10, 10, 1);
        gre.key.protocol = Protocol::Other(47);
        let attack = flow(445, 10, 10, 101);
        let found = indicator_findings(&[gre, attack], &DetectionConfig::default());

        let protocol = found.iter().find(|i| i.indicator_type == "protocol").unwrap();
        assert_eq!(protocol.value, "PROTO-47");
        let dest = found.iter().find(|i| i.indicator_type == "ip").unwrap();
        assert_eq!(dest.value, "10.0.0.1");
        assert_eq!(dest.source, "suspicious_destination");
    }

    #[test]
    fn test_severity_round_trip_and_order() {
        for s in [Severity::Low, Severity::Medium, Severity::High, Severity::Critical] {
            assert_eq!(Severity::parse(s.as_str()), Some(s));
        }
        assert!(Severity::Critical > Severity::Medium);
        assert_eq!(Severity::parse("urgent"), None);
    }
}
