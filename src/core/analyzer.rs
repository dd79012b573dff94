//! Periodic detection over the flow tracker.
//!
//! The analyzer owns the event history and the threat indicator map. Each
//! detection cycle evaluates the active flows, emits events for every triggered
//! check, raises flow risk scores and merges indicators. Persistence and the
//! event bus are optional collaborators.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::config::DetectionConfig;
use crate::db::{chrono_timestamp, Database};
use crate::error::CoreResult;

use super::detection::{self, IndicatorFinding, Severity};
use super::events::{CoreEvent, EventBus};
use super::flows::FlowTracker;

/// One triggered per-flow check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficEvent {
    /// Row id once persisted.
    pub id: Option<i64>,
    pub kind: String,
    pub flow_key: String,
    pub description: String,
    pub severity: Severity,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatIndicator {
    pub indicator_type: String,
    pub value: String,
    pub source: String,
    /// Always within [0, 1].
    pub confidence: f64,
    pub first_seen: i64,
    pub last_seen: i64,
    pub active: bool,
}

type IndicatorId = (String, String, String);

impl ThreatIndicator {
    fn id(&self) -> IndicatorId {
        (
            self.indicator_type.clone(),
            self.value.clone(),
            self.source.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DetectionReport {
    pub flows_checked: usize,
    /// Flows that disappeared mid-cycle and were skipped.
    pub flows_skipped: usize,
    pub events_emitted: usize,
    pub indicators_raised: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub flows_removed: usize,
    pub indicators_trimmed: usize,
    pub events_pruned: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortUsage {
    pub port: u16,
    pub count: u64,
}

/// Aggregate view for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisSummary {
    pub active_flows: usize,
    pub total_flows: usize,
    pub total_bytes: u64,
    pub total_packets: u64,
    pub runtime_seconds: u64,
    pub threat_indicator_count: usize,
    pub known_devices: usize,
    pub top_ports: Vec<PortUsage>,
    pub protocol_usage: BTreeMap<String, u64>,
}

const TOP_PORTS: usize = 10;

pub struct TrafficAnalyzer {
    tracker: Arc<FlowTracker>,
    config: DetectionConfig,
    indicators: RwLock<HashMap<IndicatorId, ThreatIndicator>>,
    recent: Mutex<VecDeque<TrafficEvent>>,
    db: Option<Arc<Database>>,
    bus: EventBus,
}

impl TrafficAnalyzer {
    /// Build an analyzer, restoring indicators from `db` when one is attached.
    pub fn new(
        tracker: Arc<FlowTracker>,
        config: DetectionConfig,
        db: Option<Arc<Database>>,
        bus: EventBus,
    ) -> Self {
        let mut indicators = HashMap::new();
        if let Some(db) = &db {
            match db.load_indicators() {
                Ok(stored) => {
                    tracing::info!("Restored {} threat indicators", stored.len());
                    for indicator in stored {
                        indicators.insert(indicator.id(), indicator);
                    }
                }
                Err(e) => tracing::warn!("Failed to load threat indicators: {e:#}"),
            }
        }

        Self {
            tracker,
            config,
            indicators: RwLock::new(indicators),
            recent: Mutex::new(VecDeque::new()),
            db,
            bus,
        }
    }

    pub fn tracker(&self) -> &Arc<FlowTracker> {
        &self.tracker
    }

    /// Evaluate every active flow once. Always completes; flows removed while
    /// the cycle runs are skipped.
    pub fn run_detection_cycle(&self) -> DetectionReport {
        let flows = self.tracker.active_flows();
        let baseline = detection::baseline(&flows);
        let now = chrono_timestamp();
        let mut report = DetectionReport {
            flows_checked: flows.len(),
            ..DetectionReport::default()
        };

        let mut events = Vec::new();
        for flow in &flows {
            for finding in detection::evaluate_flow(flow, baseline.as_ref(), &self.config) {
                if self
                    .tracker
                    .add_risk(&finding.key, finding.kind, finding.severity.risk_increment())
                    .is_none()
                {
                    tracing::debug!("Flow {} vanished during detection, skipping", flow.key);
                    report.flows_skipped += 1;
                    break;
                }
                events.push(TrafficEvent {
                    id: None,
                    kind: finding.kind.to_string(),
                    flow_key: finding.key.to_string(),
                    description: finding.description,
                    severity: finding.severity,
                    timestamp: now,
                });
            }
        }

        report.events_emitted = events.len();
        self.record_events(events);

        for finding in detection::indicator_findings(&flows, &self.config) {
            if self.raise_indicator(finding, now) {
                report.indicators_raised += 1;
            }
        }

        if report.events_emitted > 0 || report.indicators_raised > 0 {
            tracing::info!(
                "Detection cycle: {} flows, {} events, {} indicators",
                report.flows_checked,
                report.events_emitted,
                report.indicators_raised
            );
        }
        report
    }

    fn record_events(&self, events: Vec<TrafficEvent>) {
        if events.is_empty() {
            return;
        }

        if let Some(db) = &self.db {
            if let Err(e) = db.insert_events(&events) {
                tracing::error!("Failed to persist {} traffic events: {e:#}", events.len());
            }
        }

        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        for event in events {
            tracing::warn!(
                "Traffic event [{}] {}: {}",
                event.severity.as_str(),
                event.flow_key,
                event.description
            );
            self.bus.publish(CoreEvent::TrafficEvent(event.clone()));
            recent.push_back(event);
        }
        let max = self.config.max_recent_events.max(1);
        while recent.len() > max {
            recent.pop_front();
        }
    }

    /// Merge one finding. Returns true when the indicator is new or its
    /// confidence rose.
    fn raise_indicator(&self, finding: IndicatorFinding, now: i64) -> bool {
        let confidence = finding.confidence.clamp(0.0, 1.0);
        let id = (
            finding.indicator_type.to_string(),
            finding.value,
            finding.source.to_string(),
        );

        let (indicator, raised) = {
            let mut map = self.indicators.write().unwrap_or_else(|e| e.into_inner());
            match map.get_mut(&id) {
                Some(existing) => {
                    let raised = confidence > existing.confidence || !existing.active;
                    existing.confidence = existing.confidence.max(confidence);
                    existing.last_seen = now;
                    existing.active = true;
                    (existing.clone(), raised)
                }
                None => {
                    let indicator = ThreatIndicator {
                        indicator_type: id.0.clone(),
                        value: id.1.clone(),
                        source: id.2.clone(),
                        confidence,
                        first_seen: now,
                        last_seen: now,
                        active: true,
                    };
                    map.insert(id, indicator.clone());
                    (indicator, true)
                }
            }
        };

        if let Some(db) = &self.db {
            if let Err(e) = db.upsert_indicator(&indicator) {
                tracing::error!("Failed to persist indicator {}: {e:#}", indicator.value);
            }
        }
        if raised {
            tracing::warn!(
                "Threat indicator {}/{} from {} (confidence {:.2})",
                indicator.indicator_type,
                indicator.value,
                indicator.source,
                indicator.confidence
            );
            self.bus.publish(CoreEvent::IndicatorRaised(indicator));
        }
        raised
    }

    /// Remove idle flows and trim history to bounded windows.
    pub fn cleanup(&self) -> CleanupReport {
        let flows_removed = self.tracker.remove_idle(self.config.inactivity());

        let indicators_trimmed = {
            let mut map = self.indicators.write().unwrap_or_else(|e| e.into_inner());
            let excess = map.len().saturating_sub(self.config.max_indicators);
            if excess > 0 {
                let mut by_age: Vec<(i64, IndicatorId)> =
                    map.values().map(|i| (i.last_seen, i.id())).collect();
                by_age.sort();
                for (_, id) in by_age.drain(..excess) {
                    map.remove(&id);
                }
                // Persisted indicators older than every one still held go too.
                if let (Some(db), Some((oldest_kept, _))) = (&self.db, by_age.first()) {
                    if let Err(e) = db.delete_indicators_before(*oldest_kept) {
                        tracing::error!("Failed to trim persisted indicators: {e:#}");
                    }
                }
            }
            excess
        };

        let events_pruned = match &self.db {
            Some(db) => db
                .prune_old_events(self.config.event_retention_days)
                .unwrap_or_else(|e| {
                    tracing::error!("Failed to prune traffic events: {e:#}");
                    0
                }),
            None => 0,
        };

        if flows_removed > 0 {
            tracing::debug!("Removed {flows_removed} idle flows");
        }
        CleanupReport {
            flows_removed,
            indicators_trimmed,
            events_pruned,
        }
    }

    pub fn summary(&self) -> AnalysisSummary {
        let threat_indicator_count = self
            .indicators
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        AnalysisSummary {
            active_flows: self.tracker.active_flows().len(),
            total_flows: self.tracker.len(),
            total_bytes: self.tracker.total_bytes(),
            total_packets: self.tracker.total_packets(),
            runtime_seconds: self.tracker.runtime().as_secs(),
            threat_indicator_count,
            known_devices: self.tracker.known_devices().len(),
            top_ports: self
                .tracker
                .top_ports(TOP_PORTS)
                .into_iter()
                .map(|(port, count)| PortUsage { port, count })
                .collect(),
            protocol_usage: self.tracker.protocol_usage(),
        }
    }

    /// Newest first. Reads the persisted history when a database is attached.
    pub fn recent_events(&self, limit: usize) -> CoreResult<Vec<TrafficEvent>> {
        if let Some(db) = &self.db {
            return Ok(db.recent_events(limit)?);
        }
        let recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        Ok(recent.iter().rev().take(limit).cloned().collect())
    }

    /// Indicators ordered by confidence, highest first.
    pub fn indicators(&self) -> Vec<ThreatIndicator> {
        let mut list: Vec<ThreatIndicator> = self
            .indicators
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.value.cmp(&b.value))
        });
        list
    }
}
