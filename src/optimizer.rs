//! Advisory traffic prioritization.
//!
//! The controller samples latency and bandwidth on an interval. When either
//! exceeds its threshold and the cooldown has elapsed, it marks priority
//! traffic with a DSCP value and throttles the heaviest LAN hosts that are
//! not carrying it. Rules it created on a previous run are removed first, so
//! at most one policy from the controller is in force at a time. Hosts that
//! already carry a throttle it did not create are left alone.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sysinfo::Networks;
use tokio::time::Instant;

use crate::config::OptimizerConfig;
use crate::core::events::{CoreEvent, EventBus};
use crate::core::flows::{FlowSnapshot, FlowTracker};
use crate::core::resources::ResourceManager;
use crate::db::chrono_timestamp;
use crate::enforcement::{ManipulationEngine, RuleKind, ThrottleParams};
use crate::error::{CoreError, CoreResult};

const LATENCY_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_HISTORY: usize = 50;

#[async_trait]
pub trait MetricsSampler: Send + Sync {
    /// Round-trip estimate in milliseconds, `None` when unmeasurable.
    async fn latency_ms(&self) -> Option<f64>;

    /// Interface throughput since the previous call, `None` on the first call.
    async fn bandwidth_mbps(&self) -> Option<f64>;
}

/// TCP connect time to a well-known host, and interface byte counters.
pub struct SystemSampler {
    resources: Arc<ResourceManager>,
    probe: Option<SocketAddr>,
    networks: Mutex<Networks>,
    previous: Mutex<Option<(u64, Instant)>>,
}

impl SystemSampler {
    pub fn new(resources: Arc<ResourceManager>, config: &OptimizerConfig) -> Self {
        let probe = match config.latency_probe.parse() {
            Ok(addr) => Some(addr),
            Err(_) => {
                tracing::warn!(
                    "Latency probe '{}' is not an ip:port address, latency sampling disabled",
                    config.latency_probe
                );
                None
            }
        };
        Self {
            resources,
            probe,
            networks: Mutex::new(Networks::new_with_refreshed_list()),
            previous: Mutex::new(None),
        }
    }

    fn total_bytes(&self) -> u64 {
        let mut networks = self.networks.lock().unwrap_or_else(|e| e.into_inner());
        networks.refresh();
        networks
            .iter()
            .fold(0u64, |acc, (_, data)| {
                acc.saturating_add(data.total_received())
                    .saturating_add(data.total_transmitted())
            })
    }
}

#[async_trait]
impl MetricsSampler for SystemSampler {
    async fn latency_ms(&self) -> Option<f64> {
        let addr = self.probe?;
        let mut lease = match self.resources.acquire_socket().await {
            Ok(lease) => lease,
            Err(e) => {
                tracing::debug!("Latency sample skipped: {e}");
                return None;
            }
        };
        match lease.connect(addr, LATENCY_PROBE_TIMEOUT).await {
            Ok(elapsed) => Some(elapsed.as_secs_f64() * 1000.0),
            Err(e) => {
                tracing::debug!("Latency probe to {addr} failed: {e}");
                None
            }
        }
    }

    async fn bandwidth_mbps(&self) -> Option<f64> {
        let total = self.total_bytes();
        let now = Instant::now();
        let mut previous = self.previous.lock().unwrap_or_else(|e| e.into_inner());
        let rate = previous.and_then(|(bytes, at)| {
            let secs = now.duration_since(at).as_secs_f64();
            (secs > 0.0).then(|| total.saturating_sub(bytes) as f64 * 8.0 / secs / 1_000_000.0)
        });
        *previous = Some((total, now));
        rate
    }
}

/// Which hosts to protect and which to throttle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OptimizationPlan {
    pub priority_hosts: Vec<Ipv4Addr>,
    pub throttle_hosts: Vec<Ipv4Addr>,
}

fn lan_v4(addr: IpAddr) -> Option<Ipv4Addr> {
    match addr {
        IpAddr::V4(v4) if v4.is_private() => Some(v4),
        _ => None,
    }
}

/// Priority hosts are LAN endpoints of flows on a priority port. The
/// heaviest remaining LAN hosts, excluding `local`, get throttled.
pub fn plan_optimization(
    flows: &[FlowSnapshot],
    config: &OptimizerConfig,
    local: Option<Ipv4Addr>,
) -> OptimizationPlan {
    let mut priority = BTreeSet::new();
    for flow in flows {
        let key = &flow.key;
        if config.priority_ports.contains(&key.destination_port)
            || config.priority_ports.contains(&key.source_port)
        {
            priority.extend(lan_v4(key.source));
            priority.extend(lan_v4(key.destination));
        }
    }

    let mut usage: BTreeMap<Ipv4Addr, u64> = BTreeMap::new();
    for flow in flows {
        for host in [lan_v4(flow.key.source), lan_v4(flow.key.destination)].into_iter().flatten() {
            let total = usage.entry(host).or_insert(0);
            *total = total.saturating_add(flow.total_bytes());
        }
    }

    let mut candidates: Vec<(Ipv4Addr, u64)> = usage
        .into_iter()
        .filter(|(host, bytes)| *bytes > 0 && !priority.contains(host) && Some(*host) != local)
        .collect();
    candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    OptimizationPlan {
        priority_hosts: priority.into_iter().collect(),
        throttle_hosts: candidates
            .into_iter()
            .take(config.max_throttled_hosts)
            .map(|(host, _)| host)
            .collect(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationRecord {
    pub id: String,
    pub timestamp: i64,
    pub reason: String,
    pub priority_hosts: Vec<Ipv4Addr>,
    pub throttled_hosts: Vec<Ipv4Addr>,
    /// Planned for throttling but already under a throttle set elsewhere.
    pub skipped_hosts: Vec<Ipv4Addr>,
    /// Every rule the controller now owns, priority marks included.
    pub rule_ids: Vec<String>,
    /// Rules that could not be applied, with the reason.
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OptimizationOutcome {
    Applied(OptimizationRecord),
    CoolingDown { remaining_secs: u64 },
    Disabled,
}

/// Latency and bandwidth observed by one sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricsSample {
    pub latency_ms: Option<f64>,
    pub bandwidth_mbps: Option<f64>,
}

pub struct OptimizationController {
    config: OptimizerConfig,
    enabled: AtomicBool,
    last_run: Mutex<Option<Instant>>,
    engine: Arc<ManipulationEngine>,
    tracker: Arc<FlowTracker>,
    sampler: Arc<dyn MetricsSampler>,
    local: Option<Ipv4Addr>,
    owned_rules: tokio::sync::Mutex<Vec<String>>,
    history: Mutex<VecDeque<OptimizationRecord>>,
    bus: EventBus,
}

impl OptimizationController {
    pub fn new(
        config: OptimizerConfig,
        engine: Arc<ManipulationEngine>,
        tracker: Arc<FlowTracker>,
        sampler: Arc<dyn MetricsSampler>,
        local: Option<Ipv4Addr>,
        bus: EventBus,
    ) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            config,
            last_run: Mutex::new(None),
            engine,
            tracker,
            sampler,
            local,
            owned_rules: tokio::sync::Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            bus,
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        tracing::info!("Optimization {}", if enabled { "enabled" } else { "disabled" });
    }

    fn cooldown_remaining(&self) -> Option<Duration> {
        let last = self.last_run.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = last.as_ref()?.elapsed();
        self.config.cooldown().checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    /// Enabled and outside the cooldown window.
    pub fn can_optimize(&self) -> bool {
        self.is_enabled() && self.cooldown_remaining().is_none()
    }

    /// Claim the cooldown window. Fails when another run holds it.
    fn claim(&self) -> Option<OptimizationOutcome> {
        if !self.is_enabled() {
            return Some(OptimizationOutcome::Disabled);
        }
        let mut last = self.last_run.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(at) = *last {
            if let Some(remaining) = self.config.cooldown().checked_sub(at.elapsed()) {
                if !remaining.is_zero() {
                    return Some(OptimizationOutcome::CoolingDown {
                        remaining_secs: remaining.as_secs().max(1),
                    });
                }
            }
        }
        *last = Some(Instant::now());
        None
    }

    /// Apply the prioritization policy now, subject to the enabled flag and cooldown.
    pub async fn trigger_optimization(&self, reason: &str) -> CoreResult<OptimizationOutcome> {
        if let Some(outcome) = self.claim() {
            return Ok(outcome);
        }

        let plan = plan_optimization(&self.tracker.active_flows(), &self.config, self.local);
        let mut owned = self.owned_rules.lock().await;

        for id in owned.drain(..) {
            match self.engine.remove_rule(&id).await {
                Ok(_) | Err(CoreError::NotFound(_)) => {}
                Err(e) => tracing::warn!("Failed to lift previous optimization rule {id}: {e}"),
            }
        }

        // Whatever is left after lifting our own rules belongs to someone else.
        let foreign = self.engine.list_rules().await;
        let mut failures = Vec::new();

        for host in &plan.priority_hosts {
            for &port in &self.config.priority_ports {
                let taken = foreign.iter().any(|r| {
                    r.kind == RuleKind::Priority && r.target == *host && r.port == Some(port)
                });
                if taken {
                    continue;
                }
                match self.engine.prioritize(*host, port, self.config.priority_dscp).await {
                    Ok(rule) => owned.push(rule.id),
                    Err(e) => {
                        tracing::warn!("Optimization could not prioritize {host}:{port}: {e}");
                        failures.push(format!("{host}:{port}: {e}"));
                    }
                }
            }
        }

        let params = ThrottleParams::bandwidth(self.config.background_bandwidth_mbps);
        let mut throttled_hosts = Vec::new();
        let mut skipped_hosts = Vec::new();
        for host in &plan.throttle_hosts {
            if foreign
                .iter()
                .any(|r| r.kind == RuleKind::Throttle && r.target == *host)
            {
                tracing::info!("Leaving existing throttle on {host} in place");
                skipped_hosts.push(*host);
                continue;
            }
            match self.engine.throttle(*host, params.clone()).await {
                Ok(rule) => {
                    owned.push(rule.id);
                    throttled_hosts.push(*host);
                }
                Err(e) => {
                    tracing::warn!("Optimization could not throttle {host}: {e}");
                    failures.push(format!("{host}: {e}"));
                }
            }
        }

        let record = OptimizationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono_timestamp(),
            reason: reason.to_string(),
            priority_hosts: plan.priority_hosts,
            throttled_hosts,
            skipped_hosts,
            rule_ids: owned.clone(),
            failures,
        };
        tracing::info!(
            "Optimization applied ({}): {} priority hosts, {} throttled",
            record.reason,
            record.priority_hosts.len(),
            record.throttled_hosts.len()
        );

        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            history.push_back(record.clone());
            while history.len() > MAX_HISTORY {
                history.pop_front();
            }
        }
        self.bus.publish(CoreEvent::OptimizationApplied(record.clone()));
        Ok(OptimizationOutcome::Applied(record))
    }

    pub async fn sample(&self) -> MetricsSample {
        MetricsSample {
            latency_ms: self.sampler.latency_ms().await,
            bandwidth_mbps: self.sampler.bandwidth_mbps().await,
        }
    }

    /// One control-loop step: sample, and optimize when a threshold is crossed.
    pub async fn sample_and_act(&self) -> CoreResult<Option<OptimizationOutcome>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let metrics = self.sample().await;
        tracing::debug!("Optimizer sample: {metrics:?}");

        let reason = match (metrics.latency_ms, metrics.bandwidth_mbps) {
            (Some(latency), _) if latency > self.config.latency_threshold_ms => {
                format!("latency {latency:.0} ms above {:.0} ms", self.config.latency_threshold_ms)
            }
            (_, Some(mbps)) if mbps > self.config.bandwidth_threshold_mbps => {
                format!("bandwidth {mbps:.1} Mbps above {:.1} Mbps", self.config.bandwidth_threshold_mbps)
            }
            _ => return Ok(None),
        };

        if !self.can_optimize() {
            tracing::debug!("Threshold crossed ({reason}) but optimization is cooling down");
            return Ok(None);
        }
        self.trigger_optimization(&reason).await.map(Some)
    }

    /// Most recent first.
    pub fn history(&self) -> Vec<OptimizationRecord> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().rev().cloned().collect()
    }
}
