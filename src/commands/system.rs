//! Optimization control and event subscription commands.

use tokio::sync::broadcast;

use crate::core::events::CoreEvent;
use crate::error::CoreResult;
use crate::optimizer::{OptimizationOutcome, OptimizationRecord};

use super::logic::resolve_optimization_reason;
use super::state::AppState;

// ---- Optimization ----

pub fn can_optimize(state: &AppState) -> bool {
    state.optimizer.can_optimize()
}

pub async fn trigger_optimization(
    state: &AppState,
    reason: Option<String>,
) -> CoreResult<OptimizationOutcome> {
    let reason = resolve_optimization_reason(reason);
    state.optimizer.trigger_optimization(&reason).await
}

pub fn set_optimization_enabled(state: &AppState, enabled: bool) {
    state.optimizer.set_enabled(enabled);
}

pub fn get_optimization_history(state: &AppState) -> Vec<OptimizationRecord> {
    state.optimizer.history()
}

// ---- Observers ----

/// Receive every core event published from now on.
pub fn subscribe_events(state: &AppState) -> broadcast::Receiver<CoreEvent> {
    state.bus.subscribe()
}
