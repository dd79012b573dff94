//! Shared service state behind every command.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::CoreConfig;
use crate::core::analyzer::TrafficAnalyzer;
use crate::core::events::EventBus;
use crate::core::flows::FlowTracker;
use crate::core::resources::ResourceManager;
use crate::db::Database;
use crate::discovery::{detect_local_address, Scanner};
use crate::enforcement::{CommandRunner, ManipulationEngine, SystemCommandRunner};
use crate::error::CoreResult;
use crate::optimizer::{OptimizationController, SystemSampler};
use crate::services::BackgroundServices;

/// Every long-lived component, composed once at startup.
pub struct AppState {
    pub config: CoreConfig,
    pub database: Arc<Database>,
    pub bus: EventBus,
    pub resources: Arc<ResourceManager>,
    pub scanner: Scanner,
    pub tracker: Arc<FlowTracker>,
    pub analyzer: Arc<TrafficAnalyzer>,
    pub engine: Arc<ManipulationEngine>,
    pub optimizer: Arc<OptimizationController>,
    /// This host's LAN address, when one could be detected.
    pub local_address: Option<Ipv4Addr>,
    services: Mutex<Option<BackgroundServices>>,
}

impl AppState {
    /// Compose the core against the real OS and start the background loops.
    pub async fn new(config: CoreConfig) -> CoreResult<Self> {
        let local = detect_local_address().await;
        Self::with_runner(config, Arc::new(SystemCommandRunner), local).await
    }

    /// Same as [`AppState::new`] with an explicit command runner and local address.
    pub async fn with_runner(
        config: CoreConfig,
        runner: Arc<dyn CommandRunner>,
        local_address: Option<Ipv4Addr>,
    ) -> CoreResult<Self> {
        let database = Arc::new(match &config.database_path {
            Some(path) => {
                let db = Database::open(path)?;
                tracing::info!("Database opened at {}", path.display());
                db
            }
            None => Database::open_in_memory()?,
        });
        let bus = EventBus::new();

        let resources = Arc::new(ResourceManager::new(config.resources.clone()));
        let mut scanner = Scanner::new(
            Arc::clone(&resources),
            config.scan.clone(),
            Arc::clone(&runner),
        )
        .with_event_bus(bus.clone());
        if let Some(local) = local_address {
            scanner = scanner.with_local_address(local);
        }

        let tracker = Arc::new(FlowTracker::new(&config.detection));
        let analyzer = Arc::new(TrafficAnalyzer::new(
            Arc::clone(&tracker),
            config.detection.clone(),
            Some(Arc::clone(&database)),
            bus.clone(),
        ));

        let engine = Arc::new(ManipulationEngine::system(
            config.enforcement.clone(),
            runner,
            local_address,
            Some(Arc::clone(&database)),
            bus.clone(),
        ));
        let restored = engine.load().await?;
        if restored > 0 {
            tracing::info!("Restored {restored} persisted rules");
        }

        let sampler = Arc::new(SystemSampler::new(Arc::clone(&resources), &config.optimizer));
        let optimizer = Arc::new(OptimizationController::new(
            config.optimizer.clone(),
            Arc::clone(&engine),
            Arc::clone(&tracker),
            sampler,
            local_address,
            bus.clone(),
        ));

        let services = BackgroundServices::start(&analyzer, Some(&optimizer), &config.detection);

        Ok(Self {
            config,
            database,
            bus,
            resources,
            scanner,
            tracker,
            analyzer,
            engine,
            optimizer,
            local_address,
            services: Mutex::new(Some(services)),
        })
    }

    /// Stop the loops and in-process tasks, then release pooled resources.
    /// Persisted rules stay in the database. Calling it twice is harmless.
    pub async fn close(&self) {
        if let Some(mut services) = self.services.lock().await.take() {
            services.stop().await;
        }
        self.engine.close().await;
        self.resources.close();
        tracing::info!("Core closed");
    }
}
