//! Background eviction of idle label sets.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::registry::CollectorRegistry;

/// Periodic sweep task; one cycle every `ttl`.
///
/// Cycles run one at a time on a single task. A stop request is observed
/// between cycles, never in the middle of one.
pub struct Janitor {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Janitor {
    pub fn spawn(registry: Arc<CollectorRegistry>, ttl: Duration, runtime: &Handle) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(ttl);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {
                        let evicted = registry.sweep(ttl);
                        debug!(evicted, "cache sweep finished");
                    }
                }
            }
            debug!("cache janitor stopped");
        });
        info!(ttl_ms = ttl.as_millis() as u64, "cache janitor started");
        Self { stop, handle }
    }

    /// Ask the task to stop without waiting for it.
    pub fn signal_stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Signal the task and wait for it to finish its current cycle.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "cache janitor task ended abnormally");
        }
    }
}
