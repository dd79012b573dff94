//! LAN discovery commands.

use crate::discovery::Device;
use crate::error::CoreResult;

use super::state::AppState;

/// Scan a /24 and seed the flow tracker with what was found.
pub async fn scan_devices(state: &AppState, subnet: &str, quick: bool) -> CoreResult<Vec<Device>> {
    let devices = state.scanner.scan(subnet, quick).await?;
    state.tracker.seed_devices(&devices);
    tracing::info!("Scan of {subnet} found {} devices", devices.len());
    Ok(devices)
}

/// Devices the tracker currently knows about.
pub fn known_devices(state: &AppState) -> Vec<Device> {
    state.tracker.known_devices()
}
