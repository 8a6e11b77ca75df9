use tracing::{error, info, warn};

use crate::error::{GatewayError, Result};
use crate::models::{normalize_topics, qos_from_level, BrokerConfig};
use crate::registry::ConnectionRegistry;
use crate::store::ConfigStore;

/// Re-read a config and its durable subscriptions and subscribe each entry
/// through the registry, then sweep idle connections.
///
/// Subscribing is idempotent per subscriber, so running this twice for the
/// same config is harmless. Returns how many entries were applied.
pub async fn apply_user_subscriptions(
    store: &dyn ConfigStore,
    registry: &ConnectionRegistry,
    config_id: &str,
) -> Result<usize> {
    let config = store
        .get_config(config_id)
        .await?
        .ok_or_else(|| GatewayError::UnknownConfig(config_id.to_string()))?;
    info!(
        "[{}] Broker config loaded: {}:{}",
        config_id, config.hostname, config.port
    );

    let mut applied = apply_initial_topics(registry, &config).await;

    let subscriptions = store.subscriptions_for(config_id).await?;
    if subscriptions.is_empty() && applied == 0 {
        info!("[{}] No user subscriptions, nothing to connect.", config_id);
    }

    for subscription in subscriptions {
        let topics = normalize_topics(&subscription.topics);
        if subscription.user_id.is_empty() || topics.is_empty() {
            warn!(
                "[{}] Subscription entry without user or topic, skipping.",
                config_id
            );
            continue;
        }
        let Some(qos) = qos_from_level(subscription.qos) else {
            warn!(
                "[{}] Subscription for {} has invalid qos {}, skipping.",
                config_id, subscription.user_id, subscription.qos
            );
            continue;
        };

        match registry
            .subscribe(&config, &topics, qos, &subscription.user_id)
            .await
        {
            Ok(()) => applied += 1,
            Err(e) => error!(
                "[{}] Failed to apply subscription of {} to {:?}: {}",
                config_id, subscription.user_id, topics, e
            ),
        }
    }

    registry.cleanup_idle_connections().await;
    Ok(applied)
}

async fn apply_initial_topics(registry: &ConnectionRegistry, config: &BrokerConfig) -> usize {
    let Some(owner) = config.owner_id.as_deref().filter(|o| !o.is_empty()) else {
        return 0;
    };
    let topics = normalize_topics(&config.initial_topics);
    if topics.is_empty() {
        return 0;
    }
    match registry
        .subscribe(config, &topics, rumqttc::QoS::AtMostOnce, owner)
        .await
    {
        Ok(()) => 1,
        Err(e) => {
            error!("[{}] Failed to apply initial topics: {}", config.id, e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::memory::MemoryConfigStore;
    use crate::models::{BrokerAddress, UserSubscription};
    use crate::testing::{delivery, fast_settings, MockConnector};

    fn setup(connector: &MockConnector) -> ConnectionRegistry {
        let (context, _, _) = delivery();
        ConnectionRegistry::new(Arc::new(connector.clone()), context, fast_settings())
    }

    fn subscription(config_id: &str, user_id: &str, topics: &[&str], qos: u8) -> UserSubscription {
        UserSubscription {
            config_id: config_id.to_string(),
            user_id: user_id.to_string(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            qos,
        }
    }

    #[tokio::test]
    async fn test_applies_valid_entries_and_skips_broken_ones() {
        let connector = MockConnector::new();
        let registry = setup(&connector);
        let store = MemoryConfigStore::new();
        let mut config = BrokerConfig::new("c1", "h", 1883);
        config.owner_id = Some("owner".into());
        config.initial_topics = vec!["init/#".into()];
        store.upsert_config(config).await;
        store.add_subscription(subscription("c1", "u1", &["a", "b"], 1)).await;
        store.add_subscription(subscription("c1", "", &["x"], 0)).await;
        store.add_subscription(subscription("c1", "u2", &[], 0)).await;
        store.add_subscription(subscription("c1", "u3", &["y"], 9)).await;
        store.add_subscription(subscription("c2", "u9", &["z"], 0)).await;

        let applied = apply_user_subscriptions(&store, &registry, "c1").await.unwrap();
        assert_eq!(applied, 2);

        let connection = registry
            .connection(&BrokerAddress::new("h", 1883))
            .await
            .unwrap();
        assert_eq!(connection.subscribed_topics().await, vec!["a", "b", "init/#"]);
        assert_eq!(connection.subscribers_of("init/#").await, vec!["owner"]);
    }

    #[tokio::test]
    async fn test_unknown_config_is_an_error() {
        let connector = MockConnector::new();
        let registry = setup(&connector);
        let store = MemoryConfigStore::new();
        let err = apply_user_subscriptions(&store, &registry, "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnknownConfig(_)));
    }

    #[tokio::test]
    async fn test_reapplying_is_idempotent() {
        let connector = MockConnector::new();
        let registry = setup(&connector);
        let store = MemoryConfigStore::new();
        store.upsert_config(BrokerConfig::new("c1", "h", 1883)).await;
        store.add_subscription(subscription("c1", "u1", &["a"], 0)).await;

        apply_user_subscriptions(&store, &registry, "c1").await.unwrap();
        apply_user_subscriptions(&store, &registry, "c1").await.unwrap();

        let connection = registry
            .connection(&BrokerAddress::new("h", 1883))
            .await
            .unwrap();
        assert_eq!(connection.subscribers_of("a").await, vec!["u1"]);
        assert_eq!(connector.subscribes(), vec!["a"]);
    }
}
