//! Core logic: resource pooling, flow accounting, detection and notifications.
//!
//! - [`ResourceManager`]: worker pool, socket leases and the scan result cache
//! - [`FlowTracker`]: per-flow counters keyed by the 5-tuple
//! - [`TrafficAnalyzer`]: periodic detection, events and threat indicators
//! - [`detection`]: pure heuristics over flow snapshots
//! - [`packet`]: IPv4/IPv6 header parsing for raw packet samples
//! - [`EventBus`]: broadcast channel for observers

pub mod analyzer;
pub mod detection;
pub mod events;
pub mod flows;
pub mod packet;
pub mod resources;

pub use analyzer::{AnalysisSummary, ThreatIndicator, TrafficAnalyzer, TrafficEvent};
pub use events::{CoreEvent, EventBus};
pub use flows::{FlowKey, FlowSnapshot, FlowTracker, Protocol};
pub use resources::ResourceManager;
