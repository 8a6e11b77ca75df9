//! Pool of broker connections keyed by address.

use std::collections::HashMap;
use std::sync::Arc;

use rumqttc::QoS;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::connection::{BrokerConnection, ConnectionSettings, DeliveryContext};
use crate::directory::ConfigDirectory;
use crate::error::{GatewayError, Result};
use crate::models::{
    normalize_topics, BrokerAddress, BrokerConfig, Credentials, GatewayStatus, StatusRecord,
};
use crate::transport::Connector;

/// Created once at startup and shared by handle with every task.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<BrokerAddress, Arc<BrokerConnection>>>,
    // Held shared by subscribe/unsubscribe and exclusively by sweeps, so a
    // connection is never swept between lookup and its first subscribe.
    sweep_lock: RwLock<()>,
    delivery: DeliveryContext,
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
}

impl ConnectionRegistry {
    pub fn new(
        connector: Arc<dyn Connector>,
        delivery: DeliveryContext,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            sweep_lock: RwLock::new(()),
            delivery,
            connector,
            settings,
        }
    }

    pub fn directory(&self) -> &Arc<ConfigDirectory> {
        &self.delivery.directory
    }

    /// Return the connection for `address`, creating it on first use.
    /// Credentials of an existing connection are refreshed for its next connect.
    pub async fn get_or_create_connection(
        &self,
        address: &BrokerAddress,
        credentials: &Credentials,
    ) -> Arc<BrokerConnection> {
        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(address) {
            existing.set_credentials(credentials.clone()).await;
            return existing.clone();
        }

        info!("[{}] Creating shared connection.", address);
        let connection = BrokerConnection::new(
            address.clone(),
            credentials.clone(),
            self.connector.clone(),
            self.delivery.clone(),
            self.settings.clone(),
        );
        connections.insert(address.clone(), connection.clone());
        connection
    }

    pub async fn connection(&self, address: &BrokerAddress) -> Option<Arc<BrokerConnection>> {
        self.connections.lock().await.get(address).cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Subscribe `subscriber_id` to `topics` through `config`. Every topic is
    /// attempted; the last failure is returned.
    pub async fn subscribe(
        &self,
        config: &BrokerConfig,
        topics: &[String],
        qos: QoS,
        subscriber_id: &str,
    ) -> Result<()> {
        let topics = normalize_topics(topics);
        if topics.is_empty() {
            warn!("[{}] Subscribe for {} without topics.", config.id, subscriber_id);
            return Ok(());
        }

        let _op = self.sweep_lock.read().await;
        self.delivery.directory.record_config(config).await;
        let connection = self
            .get_or_create_connection(&config.address(), &config.credentials())
            .await;
        self.delivery
            .directory
            .bind(&config.id, subscriber_id, &topics)
            .await;

        let mut failure: Option<GatewayError> = None;
        for topic in &topics {
            if let Err(e) = connection.subscribe(topic, qos, subscriber_id).await {
                error!(
                    "[{}] Subscribing {} to '{}' failed: {}",
                    config.id, subscriber_id, topic, e
                );
                self.delivery
                    .directory
                    .unbind(&config.id, subscriber_id, std::slice::from_ref(topic))
                    .await;
                failure = Some(e);
            }
        }

        self.publish_status(config, failure.as_ref()).await;
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn unsubscribe(
        &self,
        config: &BrokerConfig,
        topics: &[String],
        subscriber_id: &str,
    ) -> Result<()> {
        let topics = normalize_topics(topics);
        let _op = self.sweep_lock.read().await;
        self.delivery.directory.record_config(config).await;

        let Some(connection) = self.connection(&config.address()).await else {
            return Ok(());
        };
        connection.unsubscribe(&topics, subscriber_id).await?;
        self.delivery
            .directory
            .unbind(&config.id, subscriber_id, &topics)
            .await;
        Ok(())
    }

    /// Config ids sharing the connection at `address`.
    pub async fn get_configs_by_connection(&self, address: &BrokerAddress) -> Vec<String> {
        self.delivery.directory.configs_on(address).await
    }

    /// Tear down and forget every connection without subscriptions.
    /// Returns how many were removed.
    pub async fn cleanup_idle_connections(&self) -> usize {
        let _sweep = self.sweep_lock.write().await;
        let mut connections = self.connections.lock().await;
        let mut idle = Vec::new();
        for (address, connection) in connections.iter() {
            if connection.check_idle().await {
                idle.push(address.clone());
            }
        }
        for address in &idle {
            connections.remove(address);
        }
        if !idle.is_empty() {
            info!("Removed {} idle connection(s).", idle.len());
        }
        idle.len()
    }

    pub async fn close_all(&self) {
        let _sweep = self.sweep_lock.write().await;
        let drained: Vec<Arc<BrokerConnection>> = {
            let mut connections = self.connections.lock().await;
            connections.drain().map(|(_, c)| c).collect()
        };
        for connection in drained {
            connection.teardown().await;
        }
        info!("All broker connections closed.");
    }

    /// Write a `disconnected` status for every config seen so far.
    pub async fn mark_all_disconnected(&self, reason: &str) {
        for config_id in self.delivery.directory.config_ids().await {
            let Some(config) = self.delivery.directory.config(&config_id).await else {
                continue;
            };
            let mut record = StatusRecord::for_config(&config, GatewayStatus::Disconnected);
            record.last_error = reason.to_string();
            if let Err(e) = self.delivery.status.record_status(&config_id, &record).await {
                warn!("[{}] Failed to update status: {}", config_id, e);
            }
        }
    }

    async fn publish_status(&self, config: &BrokerConfig, failure: Option<&GatewayError>) {
        let status = match failure {
            None => GatewayStatus::Connected,
            Some(_) => GatewayStatus::Error,
        };
        let mut record = StatusRecord::for_config(config, status);
        record.subscribed_topics = self.delivery.directory.topics_for_config(&config.id).await;
        if let Some(e) = failure {
            record.last_error = e.to_string();
        }
        if let Err(e) = self.delivery.status.record_status(&config.id, &record).await {
            warn!("[{}] Failed to update status: {}", config.id, e);
        }
    }
}
