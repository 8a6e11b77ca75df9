use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::ConnectionRegistry;

/// Periodically drops connections that no longer carry any subscription.
pub struct IdleReaper {
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
}

impl IdleReaper {
    pub fn new(registry: Arc<ConnectionRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    pub async fn run(self, token: CancellationToken) {
        info!("Idle reaper started, sweeping every {:?}.", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.registry.cleanup_idle_connections().await;
                    debug!("Idle sweep removed {} connection(s).", removed);
                }
            }
        }
        info!("Idle reaper stopped.");
    }
}
