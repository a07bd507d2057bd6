//! Worker lifecycle: health pings, signal handling, graceful shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

use guardian_queue::StreamBroker;

use crate::worker::InferenceWorker;

/// Cooperative shutdown flag with prompt wake-up.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    triggered: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    pub async fn notified(&self) {
        if self.is_triggered() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Runner configuration.
pub struct WorkerRunnerConfig {
    pub name: String,
    /// Interval between health pings.
    pub health_interval: Duration,
}

impl Default for WorkerRunnerConfig {
    fn default() -> Self {
        Self {
            name: "safety-worker".to_string(),
            health_interval: Duration::from_secs(30),
        }
    }
}

/// Runs an [`InferenceWorker`] with periodic health pings and
/// SIGINT-driven graceful shutdown.
pub struct WorkerRunner;

impl WorkerRunner {
    /// Block until shutdown. The worker drains its in-flight message before
    /// this returns.
    pub async fn run(
        worker: Arc<InferenceWorker>,
        broker: Arc<dyn StreamBroker>,
        config: WorkerRunnerConfig,
        shutdown: Arc<ShutdownSignal>,
    ) {
        info!(worker = %config.name, "starting worker runner");

        let health_shutdown = Arc::clone(&shutdown);
        let health_name = config.name.clone();
        let health_interval = config.health_interval;
        let health_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(health_interval);
            loop {
                tokio::select! {
                    _ = health_shutdown.notified() => break,
                    _ = ticker.tick() => {
                        match broker.health_check().await {
                            Ok(health) => info!(worker = %health_name, %health, "worker health ping"),
                            Err(e) => warn!(worker = %health_name, error = %e, "queue health check failed"),
                        }
                    }
                }
            }
        });

        let signal_shutdown = Arc::clone(&shutdown);
        let signal_name = config.name.clone();
        let signal_handle = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(worker = %signal_name, "shutdown signal received");
                signal_shutdown.trigger();
            }
        });

        worker.run(Arc::clone(&shutdown)).await;

        health_handle.abort();
        signal_handle.abort();
        info!(worker = %config.name, "worker runner exited cleanly");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_signal_wakes_waiters() {
        let signal = Arc::new(ShutdownSignal::new());
        let waiter = Arc::clone(&signal);
        let handle = tokio::spawn(async move {
            waiter.notified().await;
            waiter.is_triggered()
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.trigger();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_notified_returns_immediately_when_triggered() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        // Must not hang.
        tokio::time::timeout(Duration::from_millis(50), signal.notified())
            .await
            .unwrap();
    }
}
