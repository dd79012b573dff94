//! Flow accounting, analysis summary, event and indicator commands.

use crate::core::analyzer::{AnalysisSummary, ThreatIndicator, TrafficEvent};
use crate::core::flows::FlowSnapshot;
use crate::error::CoreResult;

use super::logic::{flow_key, resolve_event_limit, FlowObservation};
use super::state::AppState;

/// Add counters reported by a capture collaborator.
pub fn observe_flow(state: &AppState, observation: &FlowObservation) -> CoreResult<()> {
    let key = flow_key(observation)?;
    state.tracker.observe(
        key,
        observation.bytes_sent,
        observation.bytes_received,
        observation.packets_sent,
        observation.packets_received,
    );
    Ok(())
}

/// Account one raw IP packet. Returns false when it could not be parsed.
pub fn observe_packet(state: &AppState, data: &[u8], outbound: bool) -> bool {
    state.tracker.observe_packet(data, outbound)
}

pub fn get_analysis_summary(state: &AppState) -> AnalysisSummary {
    state.analyzer.summary()
}

/// Newest events first, at most `limit` (default 100).
pub fn get_recent_events(state: &AppState, limit: Option<usize>) -> CoreResult<Vec<TrafficEvent>> {
    state.analyzer.recent_events(resolve_event_limit(limit))
}

/// Persisted events with a timestamp at or after `from_timestamp` (unix seconds).
pub fn count_events_since(state: &AppState, from_timestamp: i64) -> CoreResult<usize> {
    Ok(state.database.count_events_since(from_timestamp)?)
}

pub fn get_threat_indicators(state: &AppState) -> Vec<ThreatIndicator> {
    state.analyzer.indicators()
}

pub fn get_active_flows(state: &AppState) -> Vec<FlowSnapshot> {
    state.tracker.active_flows()
}
