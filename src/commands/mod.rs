//! Plain async command functions over `AppState`, organized by domain.
//!
//! - `discovery`: LAN scans and the known-device list
//! - `traffic`: flow accounting, analysis summary, events, indicators
//! - `rules`: block / throttle / redirect / modify and rule management
//! - `system`: optimization control and event subscription
//! - `logic`: Pure input handling (unit-testable)
//! - `state`: Shared `AppState` definition

pub mod discovery;
pub mod logic;
pub mod rules;
mod state;
pub mod system;
pub mod traffic;

pub use logic::FlowObservation;
pub use state::AppState;
