//! Per-connection traffic accounting using DashMap for lock-free concurrent access.
//!
//! A flow is one (source, source port, destination, destination port, protocol)
//! tuple. Each flow keeps byte/packet counters, a bounded sample history for
//! trailing-window bandwidth, the suspicious-activity tags raised against it
//! and a capped risk score.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::DetectionConfig;
use crate::db::chrono_timestamp;
use crate::discovery::Device;

use super::packet::parse_ip_packet;

/// Transport protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl Protocol {
    /// Map an IP protocol number (ICMPv6 folds into `Icmp`).
    pub fn from_number(n: u8) -> Self {
        match n {
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            1 | 58 => Protocol::Icmp,
            other => Protocol::Other(other),
        }
    }

    pub fn is_common(&self) -> bool {
        !matches!(self, Protocol::Other(_))
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Udp => f.write_str("UDP"),
            Protocol::Icmp => f.write_str("ICMP"),
            Protocol::Other(n) => write!(f, "PROTO-{n}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub source: IpAddr,
    pub source_port: u16,
    pub destination: IpAddr,
    pub destination_port: u16,
    pub protocol: Protocol,
}

impl FlowKey {
    pub fn new(
        source: IpAddr,
        source_port: u16,
        destination: IpAddr,
        destination_port: u16,
        protocol: Protocol,
    ) -> Self {
        Self {
            source,
            source_port,
            destination,
            destination_port,
            protocol,
        }
    }
}

/// `src:sport-dst:dport-PROTO`
impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}-{}",
            self.source, self.source_port, self.destination, self.destination_port, self.protocol
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    bytes: u64,
}

/// Running state of one flow.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub key: FlowKey,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Unix seconds.
    pub first_seen: i64,
    pub last_seen: i64,
    last_seen_at: Instant,
    history: VecDeque<Sample>,
    pub tags: BTreeSet<String>,
    pub risk_score: u8,
}

impl FlowRecord {
    fn new(key: FlowKey) -> Self {
        let now = chrono_timestamp();
        Self {
            key,
            bytes_sent: 0,
            bytes_received: 0,
            packets_sent: 0,
            packets_received: 0,
            first_seen: now,
            last_seen: now,
            last_seen_at: Instant::now(),
            history: VecDeque::new(),
            tags: BTreeSet::new(),
            risk_score: 0,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent.saturating_add(self.bytes_received)
    }

    pub fn total_packets(&self) -> u64 {
        self.packets_sent.saturating_add(self.packets_received)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen_at.elapsed()
    }

    /// Bytes per second over the trailing `window`, from the sample history.
    pub fn bandwidth_bps(&self, window: Duration) -> f64 {
        if window.is_zero() {
            return 0.0;
        }
        let bytes: u64 = self
            .history
            .iter()
            .rev()
            .take_while(|s| s.at.elapsed() <= window)
            .fold(0u64, |acc, s| acc.saturating_add(s.bytes));
        bytes as f64 / window.as_secs_f64()
    }
}

/// Serializable view of a flow at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowSnapshot {
    pub key: FlowKey,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub first_seen: i64,
    pub last_seen: i64,
    pub bandwidth_bps: f64,
    pub tags: Vec<String>,
    pub risk_score: u8,
    /// Seen within the activity window.
    pub active: bool,
}

impl FlowSnapshot {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent.saturating_add(self.bytes_received)
    }

    pub fn total_packets(&self) -> u64 {
        self.packets_sent.saturating_add(self.packets_received)
    }
}

/// Thread-safe flow tracker. Keyed by `FlowKey`.
pub struct FlowTracker {
    flows: DashMap<FlowKey, FlowRecord>,
    port_usage: DashMap<u16, u64>,
    protocol_usage: DashMap<Protocol, u64>,
    devices: DashMap<Ipv4Addr, Device>,
    total_bytes: AtomicU64,
    total_packets: AtomicU64,
    flows_seen: AtomicU64,
    history_samples: usize,
    bandwidth_window: Duration,
    active_window: Duration,
    started: Instant,
}

impl FlowTracker {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            flows: DashMap::new(),
            port_usage: DashMap::new(),
            protocol_usage: DashMap::new(),
            devices: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            total_packets: AtomicU64::new(0),
            flows_seen: AtomicU64::new(0),
            history_samples: config.history_samples.max(1),
            bandwidth_window: config.bandwidth_window(),
            active_window: config.active_window(),
            started: Instant::now(),
        }
    }

    /// Add counters to the flow for `key`, creating it on first sight.
    pub fn observe(
        &self,
        key: FlowKey,
        bytes_sent: u64,
        bytes_received: u64,
        packets_sent: u64,
        packets_received: u64,
    ) {
        let bytes = bytes_sent.saturating_add(bytes_received);
        let packets = packets_sent.saturating_add(packets_received);
        let now = Instant::now();

        {
            let mut record = self.flows.entry(key).or_insert_with(|| {
                self.flows_seen.fetch_add(1, Ordering::Relaxed);
                FlowRecord::new(key)
            });
            record.bytes_sent = record.bytes_sent.saturating_add(bytes_sent);
            record.bytes_received = record.bytes_received.saturating_add(bytes_received);
            record.packets_sent = record.packets_sent.saturating_add(packets_sent);
            record.packets_received = record.packets_received.saturating_add(packets_received);
            record.last_seen = chrono_timestamp();
            record.last_seen_at = now;
            record.history.push_back(Sample { at: now, bytes });
            while record.history.len() > self.history_samples {
                record.history.pop_front();
            }
        }

        *self.port_usage.entry(key.destination_port).or_insert(0) += 1;
        *self.protocol_usage.entry(key.protocol).or_insert(0) += 1;
        add_saturating(&self.total_bytes, bytes);
        add_saturating(&self.total_packets, packets);
    }

    /// Account one raw IP packet. Returns false when the header is not parseable.
    pub fn observe_packet(&self, data: &[u8], outbound: bool) -> bool {
        let Some(meta) = parse_ip_packet(data) else {
            return false;
        };
        if outbound {
            self.observe(meta.key, meta.length, 0, 1, 0);
        } else {
            self.observe(meta.key, 0, meta.length, 0, 1);
        }
        true
    }

    /// Remember the LAN devices from the latest scan.
    pub fn seed_devices(&self, devices: &[Device]) {
        for device in devices {
            self.devices.insert(device.address, device.clone());
        }
    }

    pub fn known_devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.iter().map(|d| d.value().clone()).collect();
        devices.sort_by_key(|d| d.address);
        devices
    }

    pub fn is_known_device(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => self.devices.contains_key(&v4),
            IpAddr::V6(_) => false,
        }
    }

    fn snapshot_of(&self, record: &FlowRecord) -> FlowSnapshot {
        FlowSnapshot {
            key: record.key,
            bytes_sent: record.bytes_sent,
            bytes_received: record.bytes_received,
            packets_sent: record.packets_sent,
            packets_received: record.packets_received,
            first_seen: record.first_seen,
            last_seen: record.last_seen,
            bandwidth_bps: record.bandwidth_bps(self.bandwidth_window),
            tags: record.tags.iter().cloned().collect(),
            risk_score: record.risk_score,
            active: record.idle_for() <= self.active_window,
        }
    }

    pub fn snapshot(&self) -> Vec<FlowSnapshot> {
        self.flows.iter().map(|e| self.snapshot_of(e.value())).collect()
    }

    pub fn active_flows(&self) -> Vec<FlowSnapshot> {
        self.snapshot().into_iter().filter(|f| f.active).collect()
    }

    pub fn get(&self, key: &FlowKey) -> Option<FlowSnapshot> {
        self.flows.get(key).map(|r| self.snapshot_of(r.value()))
    }

    /// Drop flows idle for longer than `window`. Returns how many were removed.
    pub fn remove_idle(&self, window: Duration) -> usize {
        let before = self.flows.len();
        self.flows.retain(|_, record| record.idle_for() <= window);
        before - self.flows.len()
    }

    /// Tag the flow and raise its risk, capped at 100. Re-tagging the same
    /// cause leaves the score unchanged.
    ///
    /// Returns whether the tag was new, or `None` if the flow no longer exists.
    pub fn add_risk(&self, key: &FlowKey, tag: &str, increment: u8) -> Option<bool> {
        let mut record = self.flows.get_mut(key)?;
        if record.tags.insert(tag.to_string()) {
            record.risk_score = record.risk_score.saturating_add(increment).min(100);
            Some(true)
        } else {
            Some(false)
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Distinct flows created since start, including removed ones.
    pub fn flows_seen(&self) -> u64 {
        self.flows_seen.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn total_packets(&self) -> u64 {
        self.total_packets.load(Ordering::Relaxed)
    }

    pub fn runtime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Most used destination ports by observation count, descending.
    pub fn top_ports(&self, limit: usize) -> Vec<(u16, u64)> {
        let mut ports: Vec<(u16, u64)> = self.port_usage.iter().map(|e| (*e.key(), *e.value())).collect();
        ports.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ports.truncate(limit);
        ports
    }

    pub fn protocol_usage(&self) -> BTreeMap<String, u64> {
        self.protocol_usage
            .iter()
            .map(|e| (e.key().to_string(), *e.value()))
            .collect()
    }
}

/// Counters stick at `u64::MAX` instead of wrapping.
fn add_saturating(counter: &AtomicU64, n: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_add(n))
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn key(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> FlowKey {
        FlowKey::new(
            IpAddr::V4(Ipv4Addr::from(src)),
            sport,
            IpAddr::V4(Ipv4Addr::from(dst)),
            dport,
            Protocol::Tcp,
        )
    }

    fn tracker() -> FlowTracker {
        FlowTracker::new(&DetectionConfig::default())
    }

    #[test]
    fn test_flow_key_display() {
        let k = key([192, 168, 1, 5], 50000, [1, 1, 1, 1], 53);
        assert_eq!(k.to_string(), "192.168.1.5:50000-1.1.1.1:53-TCP");
        let mut other = k;
        other.protocol = Protocol::Other(47);
        assert!(other.to_string().ends_with("-PROTO-47"));
    }

    #[tokio::test]
    async fn test_observe_accumulates_into_one_flow() {
        let t = tracker();
        let k = key([192, 168, 1, 5], 50000, [1, 1, 1, 1], 443);
        t.observe(k, 100, 200, 1, 2);
        t.observe(k, 50, 0, 1, 0);

        assert_eq!(t.len(), 1);
        let flow = t.get(&k).unwrap();
        assert_eq!(flow.bytes_sent, 150);
        assert_eq!(flow.bytes_received, 200);
        assert_eq!(flow.total_packets(), 4);
        assert!(flow.active);
        assert_eq!(t.total_bytes(), 350);
        assert_eq!(t.flows_seen(), 1);
        assert_eq!(t.top_ports(5), vec![(443, 2)]);
        assert_eq!(t.protocol_usage().get("TCP"), Some(&2));
    }

    #[tokio::test]
    async fn test_counters_saturate_instead_of_overflowing() {
        let t = tracker();
        let k = key([192, 168, 1, 5], 50000, [1, 1, 1, 1], 443);
        t.observe(k, u64::MAX, 1, 1, 1);
        t.observe(k, u64::MAX, u64::MAX, u64::MAX, 1);

        let flow = t.get(&k).unwrap();
        assert_eq!(flow.bytes_sent, u64::MAX);
        assert_eq!(flow.bytes_received, u64::MAX);
        assert_eq!(flow.packets_sent, u64::MAX);
        assert_eq!(flow.total_bytes(), u64::MAX);
        assert_eq!(flow.total_packets(), u64::MAX);
        assert_eq!(t.total_bytes(), u64::MAX);
        assert_eq!(t.total_packets(), u64::MAX);
        assert!(flow.bandwidth_bps > 0.0);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let t = FlowTracker::new(&DetectionConfig {
            history_samples: 3,
            ..DetectionConfig::default()
        });
        let k = key([10, 0, 0, 1], 1, [10, 0, 0, 2], 2);
        for _ in 0..10 {
            t.observe(k, 1, 0, 1, 0);
        }
        assert_eq!(t.flows.get(&k).unwrap().history.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bandwidth_uses_trailing_window() {
        let t = tracker();
        let k = key([10, 0, 0, 1], 1, [10, 0, 0, 2], 2);
        t.observe(k, 6000, 0, 1, 0);
        tokio::time::advance(Duration::from_secs(90)).await;
        t.observe(k, 600, 0, 1, 0);

        let flow = t.get(&k).unwrap();
        assert!((flow.bandwidth_bps - 10.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_flows_removed_and_inactive_marked() {
        let t = tracker();
        let stale = key([10, 0, 0, 1], 1, [10, 0, 0, 2], 2);
        let fresh = key([10, 0, 0, 1], 3, [10, 0, 0, 2], 4);
        t.observe(stale, 1, 1, 1, 1);

        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        t.observe(fresh, 1, 1, 1, 1);
        assert!(!t.get(&stale).unwrap().active);
        assert_eq!(t.active_flows().len(), 1);

        tokio::time::advance(Duration::from_secs(25 * 60)).await;
        assert_eq!(t.remove_idle(Duration::from_secs(30 * 60)), 1);
        assert!(t.get(&stale).is_none());
        assert!(t.get(&fresh).is_some());
        assert_eq!(t.flows_seen(), 2);
    }

    #[tokio::test]
    async fn test_add_risk_once_per_tag_and_capped() {
        let t = tracker();
        let k = key([10, 0, 0, 1], 1, [10, 0, 0, 2], 2);
        t.observe(k, 1, 1, 1, 1);

        assert_eq!(t.add_risk(&k, "flood", 60), Some(true));
        assert_eq!(t.add_risk(&k, "flood", 60), Some(false));
        assert_eq!(t.get(&k).unwrap().risk_score, 60);

        assert_eq!(t.add_risk(&k, "data_exfiltration", 60), Some(true));
        let flow = t.get(&k).unwrap();
        assert_eq!(flow.risk_score, 100);
        assert_eq!(flow.tags, vec!["data_exfiltration".to_string(), "flood".to_string()]);

        let missing = key([9, 9, 9, 9], 1, [9, 9, 9, 9], 1);
        assert_eq!(t.add_risk(&missing, "flood", 10), None);
    }

    #[tokio::test]
    async fn test_observe_packet_directions() {
        let t = tracker();
        let mut pkt = vec![0u8; 24];
        pkt[0] = 0x45;
        pkt[3] = 24;
        pkt[9] = 17;
        pkt[12..16].copy_from_slice(&[192, 168, 1, 9]);
        pkt[16..20].copy_from_slice(&[8, 8, 8, 8]);
        pkt[22..24].copy_from_slice(&53u16.to_be_bytes());

        assert!(t.observe_packet(&pkt, true));
        assert!(t.observe_packet(&pkt, false));
        assert!(!t.observe_packet(&[0u8; 3], true));

        let flow = &t.snapshot()[0];
        assert_eq!(flow.key.protocol, Protocol::Udp);
        assert_eq!((flow.bytes_sent, flow.bytes_received), (24, 24));
        assert_eq!((flow.packets_sent, flow.packets_received), (1, 1));
    }

    #[tokio::test]
    async fn test_seeded_devices_are_known() {
        let t = tracker();
        t.seed_devices(&[Device::new(Ipv4Addr::new(192, 168, 1, 30))]);
        assert!(t.is_known_device(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 30))));
        assert!(!t.is_known_device(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 31))));
        assert_eq!(t.known_devices().len(), 1);
    }
}
