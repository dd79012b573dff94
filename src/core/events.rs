//! Notifications published by the core for any number of observers.
//!
//! Observers call `EventBus::subscribe` and receive every event published after
//! that point. Slow receivers lag and skip events rather than blocking publishers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::EVENT_BUS_CAPACITY;
use crate::core::analyzer::{ThreatIndicator, TrafficEvent};
use crate::enforcement::Rule;
use crate::optimizer::OptimizationRecord;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    ScanCompleted {
        subnet: String,
        quick: bool,
        device_count: usize,
        cached: bool,
    },
    TrafficEvent(TrafficEvent),
    IndicatorRaised(ThreatIndicator),
    RuleApplied(Rule),
    RuleRemoved {
        rule_id: String,
        inverse_succeeded: bool,
    },
    RuleStateChanged {
        rule_id: String,
        enabled: bool,
    },
    OptimizationApplied(OptimizationRecord),
}

/// Cloneable handle over a broadcast channel of `CoreEvent`s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, event: CoreEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
