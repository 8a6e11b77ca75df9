//! Bookkeeping of which configs live on which connection.
//!
//! Shared between the registry, which writes it on subscribe/unsubscribe, and
//! every connection's inbound loop, which reads it to find destination
//! streams for a message.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

use crate::models::{BrokerAddress, BrokerConfig};

/// A stream that should receive a message on behalf of one config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub config_id: String,
    pub stream_name: String,
}

#[derive(Default)]
struct DirectoryState {
    configs: HashMap<String, BrokerConfig>,
    config_to_address: HashMap<String, BrokerAddress>,
    // (config id, subscriber id) -> topic filters subscribed through that config
    bindings: HashMap<(String, String), HashSet<String>>,
}

pub struct ConfigDirectory {
    state: RwLock<DirectoryState>,
    default_stream: String,
}

impl ConfigDirectory {
    pub fn new(default_stream: impl Into<String>) -> Self {
        Self {
            state: RwLock::new(DirectoryState::default()),
            default_stream: default_stream.into(),
        }
    }

    pub fn default_stream(&self) -> &str {
        &self.default_stream
    }

    /// Store the latest copy of `config` and the address it maps to.
    pub async fn record_config(&self, config: &BrokerConfig) {
        let mut state = self.state.write().await;
        state
            .config_to_address
            .insert(config.id.clone(), config.address());
        state.configs.insert(config.id.clone(), config.clone());
    }

    pub async fn config(&self, config_id: &str) -> Option<BrokerConfig> {
        self.state.read().await.configs.get(config_id).cloned()
    }

    pub async fn config_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.read().await.configs.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn address_of(&self, config_id: &str) -> Option<BrokerAddress> {
        self.state
            .read()
            .await
            .config_to_address
            .get(config_id)
            .cloned()
    }

    pub async fn bind(&self, config_id: &str, subscriber_id: &str, topics: &[String]) {
        let mut state = self.state.write().await;
        state
            .bindings
            .entry((config_id.to_string(), subscriber_id.to_string()))
            .or_default()
            .extend(topics.iter().cloned());
    }

    pub async fn unbind(&self, config_id: &str, subscriber_id: &str, topics: &[String]) {
        let mut state = self.state.write().await;
        let key = (config_id.to_string(), subscriber_id.to_string());
        if let Some(bound) = state.bindings.get_mut(&key) {
            for topic in topics {
                bound.remove(topic);
            }
            if bound.is_empty() {
                state.bindings.remove(&key);
            }
        }
    }

    /// Every config id currently mapped to `address`.
    pub async fn configs_on(&self, address: &BrokerAddress) -> Vec<String> {
        let state = self.state.read().await;
        let mut ids: Vec<String> = state
            .config_to_address
            .iter()
            .filter(|(_, a)| *a == address)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Streams to append to for a message matched by `subscriber_id` on the
    /// connection at `address`.
    pub async fn destinations(
        &self,
        address: &BrokerAddress,
        subscriber_id: &str,
    ) -> Vec<Destination> {
        let state = self.state.read().await;
        let mut out: Vec<Destination> = state
            .config_to_address
            .iter()
            .filter(|(config_id, a)| {
                *a == address
                    && state
                        .bindings
                        .contains_key(&((*config_id).clone(), subscriber_id.to_string()))
            })
            .map(|(config_id, _)| Destination {
                config_id: config_id.clone(),
                stream_name: self.stream_name_in(&state, config_id),
            })
            .collect();
        out.sort_by(|a, b| a.config_id.cmp(&b.config_id));
        out
    }

    pub async fn stream_name(&self, config_id: &str) -> String {
        let state = self.state.read().await;
        self.stream_name_in(&state, config_id)
    }

    /// The default stream plus every configured stream name, deduplicated.
    pub async fn stream_names(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut names: Vec<String> = state
            .configs
            .keys()
            .map(|id| self.stream_name_in(&state, id))
            .collect();
        names.push(self.default_stream.clone());
        names.sort();
        names.dedup();
        names
    }

    /// Topic filters bound through `config_id`, across all subscribers.
    pub async fn topics_for_config(&self, config_id: &str) -> Vec<String> {
        let state = self.state.read().await;
        let mut topics: Vec<String> = state
            .bindings
            .iter()
            .filter(|((id, _), _)| id == config_id)
            .flat_map(|(_, topics)| topics.iter().cloned())
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    fn stream_name_in(&self, state: &DirectoryState, config_id: &str) -> String {
        state
            .configs
            .get(config_id)
            .and_then(|c| c.stream_name.clone())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.default_stream.clone())
    }
}
