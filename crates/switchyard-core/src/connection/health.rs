use super::ConnectionHolder;
use crate::metrics;
use std::{sync::Arc, time::Duration};
use tokio::{sync::broadcast, time::interval};
use tracing::{debug, info};

/// Periodically evicts dead connections from one consumer's holder.
///
/// Evicted endpoints are not redialed here; the next call that selects them dials again.
pub struct ConnectionHealthChecker {
    consumer_id: Arc<str>,
    holder: Arc<dyn ConnectionHolder>,
    check_interval: Duration,
}

impl ConnectionHealthChecker {
    #[must_use]
    pub fn new(consumer_id: &str, holder: Arc<dyn ConnectionHolder>, check_interval: Duration) -> Self {
        Self { consumer_id: Arc::from(consumer_id), holder, check_interval }
    }

    #[must_use]
    pub fn start_with_shutdown(
        &self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let holder = Arc::clone(&self.holder);
        let consumer_id = Arc::clone(&self.consumer_id);
        let check_interval = self.check_interval;

        tokio::spawn(async move {
            let mut interval = interval(check_interval);
            // The first tick completes immediately; nothing is connected yet.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = holder.check_health().await;
                        metrics::record_active_connections(&consumer_id, holder.active_count());
                        if report.evicted > 0 {
                            info!(
                                consumer = %consumer_id,
                                checked = report.checked,
                                evicted = report.evicted,
                                "connection health check evicted dead connections"
                            );
                        } else {
                            debug!(consumer = %consumer_id, checked = report.checked, "connection health check");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!(consumer = %consumer_id, "connection health checker shutting down");
                        break;
                    }
                }
            }
        })
    }
}
