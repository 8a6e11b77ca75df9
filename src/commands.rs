//! Control plane: subscribe / unsubscribe / reload commands popped from the
//! command queue.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{GatewayError, Result};
use crate::models::{BrokerConfig, Command};
use crate::registry::ConnectionRegistry;
use crate::store::{CommandQueue, ConfigStore};
use crate::subscriptions::apply_user_subscriptions;

const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub struct CommandListener {
    queue: Arc<dyn CommandQueue>,
    store: Arc<dyn ConfigStore>,
    registry: Arc<ConnectionRegistry>,
    pop_timeout: Duration,
}

impl CommandListener {
    pub fn new(
        queue: Arc<dyn CommandQueue>,
        store: Arc<dyn ConfigStore>,
        registry: Arc<ConnectionRegistry>,
        pop_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            store,
            registry,
            pop_timeout,
        }
    }

    async fn load_config(&self, config_id: &str) -> Result<BrokerConfig> {
        self.store
            .get_config(config_id)
            .await?
            .ok_or_else(|| GatewayError::UnknownConfig(config_id.to_string()))
    }

    /// Parse and execute one raw command payload.
    pub async fn handle_payload(&self, payload: &str) -> Result<Command> {
        let command = Command::parse(payload)?;
        match &command {
            Command::Reload { config_id } => {
                apply_user_subscriptions(self.store.as_ref(), &self.registry, config_id).await?;
                info!("[{}] Manual reload finished.", config_id);
            }
            Command::Subscribe {
                config_id,
                user_id,
                topics,
                qos,
            } => {
                let config = self.load_config(config_id).await?;
                self.registry.subscribe(&config, topics, *qos, user_id).await?;
                info!("[{}] {} subscribed to {:?}.", config_id, user_id, topics);
            }
            Command::Unsubscribe {
                config_id,
                user_id,
                topics,
            } => {
                let config = self.load_config(config_id).await?;
                self.registry.unsubscribe(&config, topics, user_id).await?;
                info!("[{}] {} unsubscribed from {:?}.", config_id, user_id, topics);
            }
        }
        Ok(command)
    }

    pub async fn run(self, token: CancellationToken) {
        info!("Command listener started.");
        loop {
            let popped = tokio::select! {
                _ = token.cancelled() => break,
                popped = self.queue.pop(self.pop_timeout) => popped,
            };

            match popped {
                Ok(Some(payload)) => {
                    if let Err(e) = self.handle_payload(&payload).await {
                        error!("Dropping command {}: {}", payload, e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Command queue error: {}", e);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(QUEUE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        info!("Command listener stopped.");
    }
}
