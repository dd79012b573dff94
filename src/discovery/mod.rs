//! LAN host discovery over a /24 segment.
//!
//! A scan probes `.1` through `.254` in batches through the worker pool, merges the OS
//! neighbor table, then resolves hardware address, vendor and hostname for
//! every live address. Results are cached per `(subnet, quick)` for the cache TTL.

pub mod neighbors;
pub mod probe;
pub mod resolver;
pub mod subnet;
pub mod vendor;

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ScanConfig;
use crate::core::events::{CoreEvent, EventBus};
use crate::core::resources::ResourceManager;
use crate::db::chrono_timestamp;
use crate::enforcement::command::CommandRunner;
use crate::error::CoreResult;

pub use neighbors::{NeighborEntry, NeighborTable, SystemNeighborTable};
pub use probe::{LivenessProbe, SystemProbe};
pub use resolver::{DnsResolver, HostnameResolver};
pub use subnet::SubnetPrefix;

/// A host found on the LAN. Identity is `address`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub address: Ipv4Addr,
    /// Normalized `AA:BB:CC:DD:EE:FF`, when the neighbor table knows it.
    pub hardware_address: Option<String>,
    pub vendor: String,
    pub hostname: String,
    pub is_local_host: bool,
    /// Unix seconds.
    pub last_seen: i64,
}

impl Device {
    pub fn new(address: Ipv4Addr) -> Self {
        Self {
            address,
            hardware_address: None,
            vendor: vendor::UNKNOWN.to_string(),
            hostname: vendor::UNKNOWN.to_string(),
            is_local_host: false,
            last_seen: chrono_timestamp(),
        }
    }
}

pub struct Scanner {
    resources: Arc<ResourceManager>,
    probe: Arc<dyn LivenessProbe>,
    neighbors: Arc<dyn NeighborTable>,
    resolver: Arc<dyn HostnameResolver>,
    config: ScanConfig,
    local_address: Option<Ipv4Addr>,
    bus: Option<EventBus>,
    probe_count: Arc<AtomicU64>,
}

impl Scanner {
    /// Scanner backed by real sockets, the OS neighbor table and reverse DNS.
    pub fn new(
        resources: Arc<ResourceManager>,
        config: ScanConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let probe = Arc::new(SystemProbe::new(Arc::clone(&resources), &config));
        let neighbors = Arc::new(SystemNeighborTable::new(
            runner,
            Duration::from_millis(config.neighbor_populate_delay_ms),
        ));
        let resolver = Arc::new(DnsResolver::new(Duration::from_millis(config.hostname_timeout_ms)));
        Self::with_components(resources, config, probe, neighbors, resolver)
    }

    pub fn with_components(
        resources: Arc<ResourceManager>,
        config: ScanConfig,
        probe: Arc<dyn LivenessProbe>,
        neighbors: Arc<dyn NeighborTable>,
        resolver: Arc<dyn HostnameResolver>,
    ) -> Self {
        Self {
            resources,
            probe,
            neighbors,
            resolver,
            config,
            local_address: None,
            bus: None,
            probe_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Override local-address detection.
    pub fn with_local_address(mut self, addr: Ipv4Addr) -> Self {
        self.local_address = Some(addr);
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Liveness probes issued since construction.
    pub fn probe_count(&self) -> u64 {
        self.probe_count.load(Ordering::Relaxed)
    }

    /// Discover live hosts in `subnet` (`a.b.c`, `a.b.c.d` or `a.b.c.0/24`).
    ///
    /// Quick mode probes the same addresses with TCP only. A failing address
    /// never fails the scan; only a malformed prefix does.
    pub async fn scan(&self, subnet: &str, quick: bool) -> CoreResult<Vec<Device>> {
        let prefix: SubnetPrefix = subnet.parse()?;
        let key = prefix.cache_key(quick);

        if let Some(devices) = self.resources.get_cached(&key) {
            tracing::debug!("Scan of {prefix}.0/24 served from cache ({} devices)", devices.len());
            self.publish_completed(&prefix, quick, devices.len(), true);
            return Ok(devices);
        }

        tracing::info!("Scanning {prefix}.0/24 (quick={quick})");
        let mut live = self.probe_hosts(&prefix, quick).await;

        match self.neighbors.entries().await {
            Ok(entries) => {
                let before = live.len();
                live.extend(
                    entries
                        .iter()
                        .filter(|e| e.complete && prefix.contains(e.address))
                        .map(|e| e.address),
                );
                tracing::debug!("Neighbor table added {} hosts", live.len() - before);
            }
            Err(e) => tracing::warn!("Neighbor table unavailable: {e}"),
        }

        let local = match self.local_address {
            Some(addr) => Some(addr),
            None => detect_local_address().await,
        };

        let mut devices = self.describe_all(live).await;
        for device in &mut devices {
            device.is_local_host = Some(device.address) == local;
        }
        devices.sort_by(|a, b| {
            b.is_local_host
                .cmp(&a.is_local_host)
                .then_with(|| a.address.cmp(&b.address))
        });

        tracing::info!("Scan of {prefix}.0/24 found {} devices", devices.len());
        self.resources.put_cached(key, devices.clone());
        self.publish_completed(&prefix, quick, devices.len(), false);
        Ok(devices)
    }

    async fn probe_hosts(&self, prefix: &SubnetPrefix, quick: bool) -> BTreeSet<Ipv4Addr> {
        let candidates: Vec<Ipv4Addr> = prefix.hosts().collect();
        let batch_size = self.config.batch_size.max(1);
        let pause = Duration::from_millis(self.config.batch_pause_ms);
        let batches = candidates.chunks(batch_size).count();
        let mut live = BTreeSet::new();

        for (index, batch) in candidates.chunks(batch_size).enumerate() {
            let handles: Vec<_> = batch
                .iter()
                .map(|&addr| {
                    let probe = Arc::clone(&self.probe);
                    let count = Arc::clone(&self.probe_count);
                    let handle = self.resources.submit(async move {
                        count.fetch_add(1, Ordering::Relaxed);
                        probe.is_alive(addr, quick).await
                    });
                    (addr, handle)
                })
                .collect();

            for (addr, handle) in handles {
                match handle.await {
                    Ok(Ok(true)) => {
                        live.insert(addr);
                    }
                    Ok(Ok(false)) => {}
                    Ok(Err(e)) if e.is_retryable() => {
                        tracing::warn!("Probe of {addr} could not run: {e}")
                    }
                    Ok(Err(e)) => tracing::debug!("Probe of {addr} failed: {e}"),
                    Err(e) => tracing::debug!("Probe task for {addr} aborted: {e}"),
                }
            }

            if index + 1 < batches && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }
        live
    }

    async fn describe_all(&self, live: BTreeSet<Ipv4Addr>) -> Vec<Device> {
        let handles: Vec<_> = live
            .into_iter()
            .map(|addr| {
                let neighbors = Arc::clone(&self.neighbors);
                let resolver = Arc::clone(&self.resolver);
                let handle = self
                    .resources
                    .submit(async move { Ok(describe(addr, neighbors, resolver).await) });
                (addr, handle)
            })
            .collect();

        let mut devices = Vec::with_capacity(handles.len());
        for (addr, handle) in handles {
            match handle.await {
                Ok(Ok(device)) => devices.push(device),
                Ok(Err(e)) => {
                    tracing::debug!("Metadata for {addr} unavailable: {e}");
                    devices.push(Device::new(addr));
                }
                Err(e) => {
                    tracing::debug!("Metadata task for {addr} aborted: {e}");
                    devices.push(Device::new(addr));
                }
            }
        }
        devices
    }

    fn publish_completed(&self, prefix: &SubnetPrefix, quick: bool, device_count: usize, cached: bool) {
        if let Some(bus) = &self.bus {
            bus.publish(CoreEvent::ScanCompleted {
                subnet: prefix.to_string(),
                quick,
                device_count,
                cached,
            });
        }
    }
}

async fn describe(
    addr: Ipv4Addr,
    neighbors: Arc<dyn NeighborTable>,
    resolver: Arc<dyn HostnameResolver>,
) -> Device {
    let mut device = Device::new(addr);

    let mut mac = neighbors.lookup(addr).await;
    if mac.is_none() {
        neighbors.populate(addr).await;
        mac = neighbors.lookup(addr).await;
    }
    if let Some(mac) = &mac {
        device.vendor = vendor::lookup_vendor(mac);
    }
    device.hardware_address = mac;

    if let Some(hostname) = resolver.resolve(addr).await {
        device.hostname = hostname;
    }
    if let Some(hinted) = vendor::refine_from_hostname(&device.vendor, &device.hostname) {
        device.vendor = hinted.to_string();
    }
    device
}

/// Address of the interface that routes outward. Connecting a UDP socket sends nothing.
pub async fn detect_local_address() -> Option<Ipv4Addr> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("8.8.8.8:80").await.ok()?;
    match socket.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(v4) if !v4.is_unspecified() => Some(v4),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::neighbors::testing::FakeNeighborTable;
    use super::probe::testing::FakeProbe;
    use super::resolver::testing::StaticResolver;
    use super::*;
    use crate::config::ResourceConfig;
    use crate::error::CoreError;

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 1, last)
    }

    fn scanner(probe: FakeProbe, neighbors: FakeNeighborTable, names: &[(u8, &str)]) -> Scanner {
        let resources = Arc::new(ResourceManager::new(ResourceConfig::default()));
        let resolver = StaticResolver(
            names
                .iter()
                .map(|(last, name)| (ip(*last), name.to_string()))
                .collect::<HashMap<_, _>>(),
        );
        Scanner::with_components(
            resources,
            ScanConfig::default(),
            Arc::new(probe),
            Arc::new(neighbors),
            Arc::new(resolver),
        )
        .with_local_address(ip(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_merges_neighbors_and_sorts_local_first() {
        let probe = FakeProbe::alive(&[ip(1), ip(10), ip(42)]);
        let neighbors = FakeNeighborTable::default()
            .with_entry(ip(1), "A4:2B:B0:11:22:33", true)
            .with_entry(ip(7), "B8:27:EB:00:00:07", true)
            .with_entry(ip(8), "00:00:00:00:00:00", false)
            .with_entry(Ipv4Addr::new(10, 0, 0, 5), "00:0C:29:00:00:05", true);
        let scanner = scanner(probe, neighbors, &[(1, "router.lan")]);

        let devices = scanner.scan("192.168.1.0/24", false).await.unwrap();
        let addrs: Vec<_> = devices.iter().map(|d| d.address).collect();
        assert_eq!(addrs, vec![ip(10), ip(1), ip(7), ip(42)]);

        assert!(devices[0].is_local_host);
        assert!(devices[1..].iter().all(|d| !d.is_local_host));
        assert_eq!(devices[1].hostname, "router.lan");
        assert_eq!(devices[2].vendor, "Raspberry Pi Foundation");
        assert_eq!(devices[3].hostname, "Unknown");
        assert_eq!(scanner.probe_count(), 254);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_scan_is_served_from_cache() {
        let scanner = scanner(FakeProbe::alive(&[ip(3)]), FakeNeighborTable::default(), &[]);
        let first = scanner.scan("192.168.1", true).await.unwrap();
        let second = scanner.scan("192.168.1.99", true).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(scanner.probe_count(), 254);

        // A different mode is a different cache key.
        scanner.scan("192.168.1", false).await.unwrap();
        assert_eq!(scanner.probe_count(), 508);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires_after_ttl() {
        let scanner = scanner(FakeProbe::alive(&[ip(3)]), FakeNeighborTable::default(), &[]);
        scanner.scan("192.168.1", true).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        scanner.scan("192.168.1", true).await.unwrap();
        assert_eq!(scanner.probe_count(), 508);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_mode_disables_icmp_fallback() {
        let mut probe = FakeProbe::alive(&[ip(2)]);
        probe.icmp_only.insert(ip(9));
        let scanner = scanner(probe, FakeNeighborTable::default(), &[]);

        let quick: Vec<_> = scanner.scan("192.168.1", true).await.unwrap();
        assert_eq!(quick.len(), 1);
        let full = scanner.scan("192.168.1", false).await.unwrap();
        assert_eq!(full.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_liveness_check_counts_as_absent() {
        let mut probe = FakeProbe::alive(&[ip(2), ip(3)]);
        probe.broken.insert(ip(3));
        probe.broken.insert(ip(4));
        let scanner = scanner(probe, FakeNeighborTable::default(), &[]);

        let devices = scanner.scan("192.168.1", true).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].address, ip(2));
        assert_eq!(scanner.probe_count(), 254);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_mac_triggers_populate_and_hostname_hint() {
        let neighbors = FakeNeighborTable::default().with_hidden(ip(20), "02:11:22:33:44:55");
        let scanner = scanner(FakeProbe::alive(&[ip(20), ip(21)]), neighbors, &[(20, "PS5-Living")]);

        let devices = scanner.scan("192.168.1", true).await.unwrap();
        let console = devices.iter().find(|d| d.address == ip(20)).unwrap();
        assert_eq!(console.hardware_address.as_deref(), Some("02:11:22:33:44:55"));
        assert_eq!(console.vendor, "Sony PlayStation");

        let other = devices.iter().find(|d| d.address == ip(21)).unwrap();
        assert!(other.hardware_address.is_none());
        assert_eq!(other.vendor, "Unknown");
    }

    #[tokio::test]
    async fn test_malformed_subnet_fails_before_probing() {
        let scanner = scanner(FakeProbe::default(), FakeNeighborTable::default(), &[]);
        let err = scanner.scan("192.168", true).await.unwrap_err();
        assert!(matches!(err, CoreError::MalformedTarget(_)));
        assert_eq!(scanner.probe_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_publishes_completion_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let scanner = scanner(FakeProbe::alive(&[ip(5)]), FakeNeighborTable::default(), &[])
            .with_event_bus(bus);

        scanner.scan("192.168.1", true).await.unwrap();
        match rx.recv().await.unwrap() {
            CoreEvent::ScanCompleted {
                subnet,
                device_count,
                cached,
                ..
            } => {
                assert_eq!(subnet, "192.168.1");
                assert_eq!(device_count, 1);
                assert!(!cached);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
