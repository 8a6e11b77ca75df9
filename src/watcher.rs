//! Periodic poll of the config store for changed broker configs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::Result;
use crate::models::{unix_now, ConnectionFingerprint};
use crate::registry::ConnectionRegistry;
use crate::store::ConfigStore;
use crate::subscriptions::apply_user_subscriptions;

pub struct ConfigWatcher {
    store: Arc<dyn ConfigStore>,
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    last_checked: f64,
    snapshot: HashMap<String, ConnectionFingerprint>,
}

impl ConfigWatcher {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        registry: Arc<ConnectionRegistry>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            interval,
            last_checked: 0.0,
            snapshot: HashMap::new(),
        }
    }

    pub fn last_checked(&self) -> f64 {
        self.last_checked
    }

    /// One poll. Returns the ids of configs that were re-applied.
    ///
    /// The checkpoint only moves once every changed config was handled, so a
    /// failing query is retried from the same point on the next tick.
    pub async fn tick(&mut self) -> Result<Vec<String>> {
        let started = unix_now();
        let changed = self.store.changed_since(self.last_checked).await?;

        let mut applied = Vec::new();
        for config in changed {
            let fingerprint = config.fingerprint();
            if self.snapshot.get(&config.id) == Some(&fingerprint) {
                continue;
            }
            self.snapshot.insert(config.id.clone(), fingerprint);

            match apply_user_subscriptions(self.store.as_ref(), &self.registry, &config.id).await {
                Ok(count) => {
                    info!("[{}] Config updated, {} subscription(s) applied.", config.id, count);
                }
                Err(e) => error!("[{}] Applying updated config failed: {}", config.id, e),
            }
            applied.push(config.id);
        }

        self.last_checked = started;
        Ok(applied)
    }

    pub async fn run(mut self, token: CancellationToken) {
        info!("Config watcher started, polling every {:?}.", self.interval);
        loop {
            if let Err(e) = self.tick().await {
                error!("Config watcher error: {}", e);
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("Config watcher stopped.");
    }
}
