//! Centralized runtime constants and the composed service configuration.
//!
//! All tunable intervals, thresholds, and counts are collected here so they can
//! be found and adjusted in a single place rather than scattered across modules.
//! `CoreConfig` groups them per component; it deserializes with defaults so a
//! collaborator can hand over whatever subset it loaded.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default size of the bounded worker pool.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 10;

/// Worker pool size is clamped to this range.
pub const WORKER_POOL_RANGE: (usize, usize) = (5, 20);

/// Capacity of the socket pool.
pub const SOCKET_POOL_CAPACITY: usize = 50;

/// How long `acquire_socket` waits on an exhausted pool before creating on demand (milliseconds).
pub const SOCKET_POOL_WAIT_MS: u64 = 500;

/// Lifetime of a cached scan result (seconds).
pub const SCAN_CACHE_TTL_SECS: u64 = 60;

/// Addresses per scan batch.
pub const SCAN_BATCH_SIZE: usize = 10;

/// Pause between scan batches (milliseconds).
pub const SCAN_BATCH_PAUSE_MS: u64 = 200;

/// Per-port TCP connect timeout during liveness probing (milliseconds).
pub const PROBE_CONNECT_TIMEOUT_MS: u64 = 500;

/// ICMP echo timeout (milliseconds).
pub const ICMP_TIMEOUT_MS: u64 = 800;

/// Reverse DNS lookup timeout (milliseconds).
pub const HOSTNAME_TIMEOUT_MS: u64 = 2000;

/// Delay between poking a host and re-reading the neighbor table (milliseconds).
pub const NEIGHBOR_POPULATE_DELAY_MS: u64 = 100;

/// Ports tried, in order, by the TCP liveness probe.
pub const PROBE_PORTS: &[u16] = &[80, 443, 22, 21, 23, 25, 53, 110, 143, 993, 995];

/// Interval between detection cycles (seconds).
pub const DETECTION_INTERVAL_SECS: u64 = 30;

/// Interval between flow / event cleanup passes (seconds).
pub const CLEANUP_INTERVAL_SECS: u64 = 60;

/// Flows not seen for this long are dropped (seconds).
pub const FLOW_INACTIVITY_SECS: u64 = 30 * 60;

/// Flows seen within this window count as active (seconds).
pub const FLOW_ACTIVE_WINDOW_SECS: u64 = 5 * 60;

/// Samples kept per flow for trailing-window bandwidth.
pub const FLOW_HISTORY_SAMPLES: usize = 100;

/// Trailing window used for flow bandwidth (seconds).
pub const BANDWIDTH_WINDOW_SECS: u64 = 60;

/// Maximum persisted event age before pruning (days).
pub const EVENT_RETENTION_DAYS: u64 = 30;

/// Interval between optimizer samples (seconds).
pub const OPTIMIZER_SAMPLE_INTERVAL_SECS: u64 = 30;

/// Minimum time between automatic optimizations (seconds).
pub const OPTIMIZATION_COOLDOWN_SECS: u64 = 300;

/// Default timeout for an external OS command (seconds).
pub const COMMAND_TIMEOUT_SECS: u64 = 15;

/// Timeout for slow OS commands such as QoS policy creation (seconds).
pub const SLOW_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Capacity of the broadcast channel carrying core events.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Resource Manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub worker_pool_size: usize,
    pub socket_pool_capacity: usize,
    pub socket_wait_ms: u64,
    pub cache_ttl_secs: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            socket_pool_capacity: SOCKET_POOL_CAPACITY,
            socket_wait_ms: SOCKET_POOL_WAIT_MS,
            cache_ttl_secs: SCAN_CACHE_TTL_SECS,
        }
    }
}

impl ResourceConfig {
    /// Worker pool size clamped to the supported range.
    pub fn effective_pool_size(&self) -> usize {
        self.worker_pool_size
            .clamp(WORKER_POOL_RANGE.0, WORKER_POOL_RANGE.1)
    }

    pub fn socket_wait(&self) -> Duration {
        Duration::from_millis(self.socket_wait_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Discovery Scanner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub batch_size: usize,
    pub batch_pause_ms: u64,
    pub probe_ports: Vec<u16>,
    pub connect_timeout_ms: u64,
    pub icmp_timeout_ms: u64,
    pub hostname_timeout_ms: u64,
    pub neighbor_populate_delay_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: SCAN_BATCH_SIZE,
            batch_pause_ms: SCAN_BATCH_PAUSE_MS,
            probe_ports: PROBE_PORTS.to_vec(),
            connect_timeout_ms: PROBE_CONNECT_TIMEOUT_MS,
            icmp_timeout_ms: ICMP_TIMEOUT_MS,
            hostname_timeout_ms: HOSTNAME_TIMEOUT_MS,
            neighbor_populate_delay_ms: NEIGHBOR_POPULATE_DELAY_MS,
        }
    }
}

/// Traffic Analyzer thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub high_bandwidth_bytes: u64,
    pub exfiltration_ratio: u64,
    pub remote_access_ports: Vec<u16>,
    pub attack_ports: Vec<u16>,
    pub flood_packets: u64,
    pub suspicious_destination_packets: u64,
    pub anomaly_bytes_factor: f64,
    pub anomaly_packets_factor: f64,
    pub port_scan_threshold: usize,
    pub inactivity_secs: u64,
    pub active_window_secs: u64,
    pub history_samples: usize,
    pub bandwidth_window_secs: u64,
    pub max_recent_events: usize,
    pub max_indicators: usize,
    pub event_retention_days: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            interval_secs: DETECTION_INTERVAL_SECS,
            cleanup_interval_secs: CLEANUP_INTERVAL_SECS,
            high_bandwidth_bytes: 1_000_000,
            exfiltration_ratio: 10,
            remote_access_ports: vec![22, 23, 3389, 5900],
            attack_ports: vec![22, 23, 3389, 445, 1433, 3306],
            flood_packets: 1000,
            suspicious_destination_packets: 100,
            anomaly_bytes_factor: 5.0,
            anomaly_packets_factor: 10.0,
            port_scan_threshold: 10,
            inactivity_secs: FLOW_INACTIVITY_SECS,
            active_window_secs: FLOW_ACTIVE_WINDOW_SECS,
            history_samples: FLOW_HISTORY_SAMPLES,
            bandwidth_window_secs: BANDWIDTH_WINDOW_SECS,
            max_recent_events: 1000,
            max_indicators: 1000,
            event_retention_days: EVENT_RETENTION_DAYS,
        }
    }
}

impl DetectionConfig {
    pub fn inactivity(&self) -> Duration {
        Duration::from_secs(self.inactivity_secs)
    }

    pub fn active_window(&self) -> Duration {
        Duration::from_secs(self.active_window_secs)
    }

    pub fn bandwidth_window(&self) -> Duration {
        Duration::from_secs(self.bandwidth_window_secs)
    }
}

/// Manipulation Engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcementConfig {
    /// Prefix used for every OS-level rule name so they can be found again.
    pub rule_name_prefix: String,
    pub command_timeout_secs: u64,
    pub slow_command_timeout_secs: u64,
    /// Interface for `tc`; detected from the default route when unset.
    pub interface: Option<String>,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            rule_name_prefix: "LanWard".to_string(),
            command_timeout_secs: COMMAND_TIMEOUT_SECS,
            slow_command_timeout_secs: SLOW_COMMAND_TIMEOUT_SECS,
            interface: None,
        }
    }
}

impl EnforcementConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn slow_command_timeout(&self) -> Duration {
        Duration::from_secs(self.slow_command_timeout_secs)
    }
}

/// Optimization Controller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub enabled: bool,
    pub cooldown_secs: u64,
    pub sample_interval_secs: u64,
    pub latency_threshold_ms: f64,
    pub bandwidth_threshold_mbps: f64,
    /// Host measured with a TCP connect to derive latency.
    pub latency_probe: String,
    /// Destination ports of the priority traffic class (game servers).
    pub priority_ports: Vec<u16>,
    /// DSCP value stamped on priority traffic. 46 is expedited forwarding.
    pub priority_dscp: u8,
    /// Cap applied to de-prioritized hosts.
    pub background_bandwidth_mbps: f64,
    /// How many non-priority hosts are throttled per optimization.
    pub max_throttled_hosts: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_secs: OPTIMIZATION_COOLDOWN_SECS,
            sample_interval_secs: OPTIMIZER_SAMPLE_INTERVAL_SECS,
            latency_threshold_ms: 100.0,
            bandwidth_threshold_mbps: 80.0,
            latency_probe: "8.8.8.8:53".to_string(),
            priority_ports: vec![2302, 2303],
            priority_dscp: 46,
            background_bandwidth_mbps: 5.0,
            max_throttled_hosts: 3,
        }
    }
}

impl OptimizerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Full configuration for `AppState::new`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// SQLite file for rules, events and indicators. In-memory when unset.
    pub database_path: Option<PathBuf>,
    pub resources: ResourceConfig,
    pub scan: ScanConfig,
    pub detection: DetectionConfig,
    pub enforcement: EnforcementConfig,
    pub optimizer: OptimizerConfig,
}

impl CoreConfig {
    /// Defaults overridden by `LANWARD_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = env_var("LANWARD_DB_PATH") {
            config.database_path = Some(PathBuf::from(path));
        }
        config.resources.worker_pool_size = env_parse_u64(
            "LANWARD_WORKERS",
            config.resources.worker_pool_size as u64,
            WORKER_POOL_RANGE.0 as u64,
            WORKER_POOL_RANGE.1 as u64,
        ) as usize;
        config.resources.cache_ttl_secs =
            env_parse_u64("LANWARD_CACHE_TTL_SECS", config.resources.cache_ttl_secs, 1, 3600);
        config.detection.interval_secs =
            env_parse_u64("LANWARD_DETECTION_INTERVAL_SECS", config.detection.interval_secs, 1, 3600);
        config.optimizer.enabled = env_parse_bool("LANWARD_OPTIMIZER", config.optimizer.enabled);
        config.enforcement.interface = env_var("LANWARD_INTERFACE").or(config.enforcement.interface);
        config
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse_u64(name: &str, default: u64, min: u64, max: u64) -> u64 {
    match env_var(name).and_then(|v| v.parse::<u64>().ok()) {
        Some(v) => v.clamp(min, max),
        None => default,
    }
}

fn env_parse_bool(name: &str, default: bool) -> bool {
    match env_var(name) {
        Some(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => default,
    }
}
