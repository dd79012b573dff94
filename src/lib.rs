pub mod commands;
pub mod config;
pub mod core;
pub mod db;
pub mod discovery;
pub mod enforcement;
pub mod error;
pub mod optimizer;
pub mod services;

use tokio::sync::broadcast::error::RecvError;

use commands::AppState;
use config::CoreConfig;

pub use error::{CoreError, CoreResult};

/// Process entry point: logging, runtime, core services until Ctrl-C.
pub fn run() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("PANIC in LanWard: {info}");
        default_hook(info);
    }));

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lanward=info".into()),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve(CoreConfig::from_env())) {
        tracing::error!("LanWard stopped: {e}");
        std::process::exit(1);
    }
}

async fn serve(config: CoreConfig) -> CoreResult<()> {
    let state = AppState::new(config).await?;
    match state.local_address {
        Some(addr) => tracing::info!("LanWard core started on {addr}"),
        None => tracing::warn!("LanWard core started without a detectable LAN address"),
    }

    let mut events = commands::system::subscribe_events(&state);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    tracing::debug!("event: {}", serde_json::to_string(&event).unwrap_or_default())
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event log lagged, skipped {skipped} events")
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    state.close().await;
    Ok(())
}
