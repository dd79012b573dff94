//! Background service lifecycle management.
//!
//! `BackgroundServices` owns the periodic tasks spawned when the core starts
//! and provides cooperative shutdown: every loop checks the shared running
//! flag each iteration, and `stop` wakes sleeping loops so they exit promptly.
//! A loop that is mid-iteration (for example waiting on an OS command)
//! finishes that iteration first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::DetectionConfig;
use crate::core::analyzer::TrafficAnalyzer;
use crate::optimizer::{OptimizationController, OptimizationOutcome};

/// Periodic tasks, started in dependency order:
/// 1. Detection cycle (flow checks, events, indicators)
/// 2. Cleanup (idle flows, bounded history, event retention)
/// 3. Optimizer sampling (latency/bandwidth, prioritization under cooldown)
pub struct BackgroundServices {
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundServices {
    pub fn start(
        analyzer: &Arc<TrafficAnalyzer>,
        optimizer: Option<&Arc<OptimizationController>>,
        detection: &DetectionConfig,
    ) -> Self {
        let mut services = Self {
            running: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Notify::new()),
            handles: Vec::new(),
        };

        let a = Arc::clone(analyzer);
        services.spawn_loop(
            "detection",
            Duration::from_secs(detection.interval_secs.max(1)),
            move || {
                let a = Arc::clone(&a);
                async move {
                    a.run_detection_cycle();
                }
            },
        );

        let a = Arc::clone(analyzer);
        services.spawn_loop(
            "cleanup",
            Duration::from_secs(detection.cleanup_interval_secs.max(1)),
            move || {
                let a = Arc::clone(&a);
                async move {
                    let report = a.cleanup();
                    tracing::debug!("Cleanup: {report:?}");
                }
            },
        );

        if let Some(optimizer) = optimizer {
            let interval = Duration::from_secs(optimizer.config().sample_interval_secs.max(1));
            let o = Arc::clone(optimizer);
            services.spawn_loop("optimizer", interval, move || {
                let o = Arc::clone(&o);
                async move {
                    match o.sample_and_act().await {
                        Ok(Some(OptimizationOutcome::Applied(record))) => {
                            tracing::info!("Automatic optimization: {}", record.reason)
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("Optimizer iteration failed: {e}"),
                    }
                }
            });
        }

        tracing::info!("Started {} background services", services.handles.len());
        services
    }

    fn spawn_loop<F, Fut>(&mut self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let running = Arc::clone(&self.running);
        let shutdown = Arc::clone(&self.shutdown);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so work starts one period in.
            interval.tick().await;

            while running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.notified() => break,
                }
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                // A panicking iteration is logged and the loop continues.
                if let Err(e) = tokio::spawn(tick()).await {
                    tracing::error!("{name} iteration panicked: {e}");
                }
            }
            tracing::debug!("{name} service stopped");
        });
        self.handles.push((name, handle));
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signal every loop to exit and wait for them.
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        for (name, handle) in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::warn!("{name} service ended abnormally: {e}");
            }
        }
        tracing::info!("Background services stopped");
    }
}

impl Drop for BackgroundServices {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        for (_, handle) in &self.handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::EventBus;
    use crate::core::flows::tests::key;
    use crate::core::flows::FlowTracker;

    fn analyzer(config: &DetectionConfig) -> Arc<TrafficAnalyzer> {
        let tracker = Arc::new(FlowTracker::new(config));
        Arc::new(TrafficAnalyzer::new(tracker, config.clone(), None, EventBus::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_detection_runs_on_interval_and_stops() {
        let config = DetectionConfig {
            interval_secs: 30,
            cleanup_interval_secs: 60,
            ..DetectionConfig::default()
        };
        let analyzer = analyzer(&config);
        analyzer
            .tracker()
            .observe(key([192, 168, 1, 5], 40000, [192, 168, 1, 9], 22), 10, 10, 1, 1);

        let mut services = BackgroundServices::start(&analyzer, None, &config);
        assert!(services.is_running());
        assert!(analyzer.recent_events(10).unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(analyzer.recent_events(10).unwrap().len(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(analyzer.recent_events(10).unwrap().len(), 2);

        services.stop().await;
        assert!(!services.is_running());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(analyzer.recent_events(10).unwrap().len(), 2);
    }
}
