//! One shared physical connection per broker address.
//!
//! A [`BrokerConnection`] owns the topic -> subscriber table for its broker,
//! a single inbound task that fans messages out to delivery streams, and a
//! reconnect supervisor. State transitions are published on a
//! `tokio::sync::watch` channel so callers can wait for readiness or observe
//! drops.

use std::cmp::min;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rumqttc::QoS;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::directory::ConfigDirectory;
use crate::error::{GatewayError, Result};
use crate::models::{encode_payload, unix_now, BrokerAddress, Credentials, DeliveryRecord};
use crate::store::{DeliveryStream, StatusStore};
use crate::topic::{matching_subscribers, SubscriptionTable, TopicEntry};
use crate::transport::{BrokerTransport, Connector, InboundMessage, Session};

const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub retry_interval: Duration,
    pub max_retry_interval: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
            max_retry_interval: Duration::from_secs(60),
        }
    }
}

/// Everything the inbound loop needs to hand a message on.
#[derive(Clone)]
pub struct DeliveryContext {
    pub directory: Arc<ConfigDirectory>,
    pub streams: Arc<dyn DeliveryStream>,
    pub status: Arc<dyn StatusStore>,
}

#[derive(Default)]
struct Link {
    transport: Option<Arc<dyn BrokerTransport>>,
    inbound_task: Option<JoinHandle<()>>,
}

pub struct BrokerConnection {
    address: BrokerAddress,
    credentials: Mutex<Credentials>,
    connector: Arc<dyn Connector>,
    delivery: DeliveryContext,
    settings: ConnectionSettings,
    subscriptions: Mutex<SubscriptionTable>,
    connect_lock: Mutex<()>,
    link: Mutex<Link>,
    state_tx: watch::Sender<ConnectionState>,
    backoff: Mutex<Duration>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    // One stored permit per unhandled drop, so a drop during a reconnect
    // is picked up by the same supervisor afterwards.
    reconnect_wanted: Notify,
    last_activity: Mutex<Instant>,
}

impl BrokerConnection {
    pub fn new(
        address: BrokerAddress,
        credentials: Credentials,
        connector: Arc<dyn Connector>,
        delivery: DeliveryContext,
        settings: ConnectionSettings,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let backoff = settings.retry_interval;
        Arc::new(Self {
            address,
            credentials: Mutex::new(credentials),
            connector,
            delivery,
            settings,
            subscriptions: Mutex::new(SubscriptionTable::new()),
            connect_lock: Mutex::new(()),
            link: Mutex::new(Link::default()),
            state_tx,
            backoff: Mutex::new(backoff),
            reconnect_task: Mutex::new(None),
            reconnect_wanted: Notify::new(),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    pub fn address(&self) -> &BrokerAddress {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Receiver that observes every state transition of this connection.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Credentials used by the next connect attempt.
    pub async fn set_credentials(&self, credentials: Credentials) {
        *self.credentials.lock().await = credentials;
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_activity.lock().await.elapsed()
    }

    pub async fn has_subscriptions(&self) -> bool {
        !self.subscriptions.lock().await.is_empty()
    }

    /// Topics with at least one subscriber, sorted.
    pub async fn subscribed_topics(&self) -> Vec<String> {
        let table = self.subscriptions.lock().await;
        let mut topics: Vec<String> = table
            .iter()
            .filter(|(_, entry)| !entry.subscribers.is_empty())
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    pub async fn subscribers_of(&self, topic: &str) -> Vec<String> {
        let table = self.subscriptions.lock().await;
        let mut subscribers: Vec<String> = table
            .get(topic)
            .map(|entry| entry.subscribers.iter().cloned().collect())
            .unwrap_or_default();
        subscribers.sort();
        subscribers
    }

    async fn transport(&self) -> Option<Arc<dyn BrokerTransport>> {
        self.link.lock().await.transport.clone()
    }

    async fn is_healthy(&self) -> bool {
        let link = self.link.lock().await;
        self.is_connected()
            && link.transport.is_some()
            && link
                .inbound_task
                .as_ref()
                .is_some_and(|task| !task.is_finished())
    }

    /// Connect if not already connected. Concurrent callers serialize on the
    /// connect lock, so a cold connection sees a single connect attempt.
    ///
    /// On timeout the background connect is left running and may still
    /// complete later.
    pub async fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_healthy().await {
            return Ok(());
        }

        self.close_link().await;

        self.state_tx.send_replace(ConnectionState::Connecting);
        let mut ready = self.state_tx.subscribe();
        {
            let mut link = self.link.lock().await;
            link.inbound_task = Some(tokio::spawn(self.clone().inbound_loop()));
        }

        let outcome = timeout(self.settings.connect_timeout, async {
            ready
                .wait_for(|state| *state != ConnectionState::Connecting)
                .await
                .map(|state| *state)
        })
        .await;

        match outcome {
            Ok(Ok(ConnectionState::Connected)) => {}
            Ok(_) => return Err(GatewayError::ConnectFailed(self.address.clone())),
            Err(_) => {
                error!(
                    "[{}] Timed out after {:?} waiting for the connection.",
                    self.address, self.settings.connect_timeout
                );
                return Err(GatewayError::ConnectTimeout(
                    self.address.clone(),
                    self.settings.connect_timeout,
                ));
            }
        }

        *self.backoff.lock().await = self.settings.retry_interval;
        info!("[{}] Connection established.", self.address);
        self.resubscribe_all().await;
        Ok(())
    }

    /// Boxed so the connect -> inbound -> reconnect -> connect cycle has a
    /// nameable future type.
    fn inbound_loop(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move { self.run_inbound().await })
    }

    async fn run_inbound(self: Arc<Self>) {
        let credentials = self.credentials.lock().await.clone();
        let Session {
            transport,
            mut inbound,
        } = match self.connector.connect(&self.address, &credentials).await {
            Ok(session) => session,
            Err(e) => {
                error!("[{}] Failed to connect to MQTT broker: {}", self.address, e);
                self.state_tx.send_replace(ConnectionState::Disconnected);
                return;
            }
        };

        self.link.lock().await.transport = Some(transport);
        *self.last_activity.lock().await = Instant::now();
        self.state_tx.send_replace(ConnectionState::Connected);

        loop {
            match inbound.recv().await {
                Ok(Some(message)) => {
                    if !self.has_subscriptions().await {
                        info!(
                            "[{}] No active subscriptions, stopping message handling.",
                            self.address
                        );
                        self.state_tx.send_replace(ConnectionState::Disconnected);
                        return;
                    }
                    self.dispatch(message).await;
                }
                Ok(None) => {
                    if self.is_closing().await {
                        debug!("[{}] Session closed.", self.address);
                        return;
                    }
                    warn!("[{}] Session closed by broker.", self.address);
                    break;
                }
                Err(e) => {
                    if self.is_closing().await {
                        debug!("[{}] Session ended during close: {}", self.address, e);
                        return;
                    }
                    error!("[{}] Error in MQTT event loop: {}", self.address, e);
                    break;
                }
            }
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.schedule_reconnect().await;
    }

    /// The transport is taken out of the link before a deliberate close.
    async fn is_closing(&self) -> bool {
        self.link.lock().await.transport.is_none()
    }

    async fn dispatch(&self, message: InboundMessage) {
        *self.last_activity.lock().await = Instant::now();

        let subscribers = {
            let table = self.subscriptions.lock().await;
            matching_subscribers(&table, &message.topic)
        };
        if subscribers.is_empty() {
            debug!("[{}] No subscriber for topic '{}'.", self.address, message.topic);
            return;
        }

        let (payload, payload_encoding) = encode_payload(&message.payload);
        let received_ts = unix_now();
        let mut subscribers: Vec<String> = subscribers.into_iter().collect();
        subscribers.sort();

        for subscriber_id in subscribers {
            let destinations = self
                .delivery
                .directory
                .destinations(&self.address, &subscriber_id)
                .await;
            for destination in destinations {
                let record = DeliveryRecord {
                    subscriber_id: subscriber_id.clone(),
                    config_id: destination.config_id.clone(),
                    topic: message.topic.clone(),
                    payload: payload.clone(),
                    payload_encoding,
                    received_ts,
                };
                let data = match serde_json::to_string(&record) {
                    Ok(data) => data,
                    Err(e) => {
                        error!("[{}] Failed to encode delivery record: {}", self.address, e);
                        continue;
                    }
                };
                match self
                    .delivery
                    .streams
                    .append(&destination.stream_name, &data)
                    .await
                {
                    Ok(_) => {
                        if let Err(e) = self
                            .delivery
                            .status
                            .mark_active(
                                &destination.config_id,
                                &subscriber_id,
                                &message.topic,
                                received_ts,
                            )
                            .await
                        {
                            warn!("[{}] Failed to update activity marker: {}", self.address, e);
                        }
                    }
                    Err(e) => error!(
                        "[{}] Failed to forward '{}' to stream '{}': {}",
                        self.address, message.topic, destination.stream_name, e
                    ),
                }
            }
        }
    }

    /// Request a reconnect. The supervisor task is started on first use and
    /// handles every request, including ones raised while it is reconnecting.
    async fn schedule_reconnect(self: &Arc<Self>) {
        self.reconnect_wanted.notify_one();
        let mut slot = self.reconnect_task.lock().await;
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let this = self.clone();
        *slot = Some(tokio::spawn(async move { this.reconnect_loop().await }));
    }

    async fn next_backoff(&self) -> Duration {
        let mut backoff = self.backoff.lock().await;
        let current = *backoff;
        *backoff = min(current * 2, self.settings.max_retry_interval);
        current
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            self.reconnect_wanted.notified().await;
            loop {
                let delay = self.next_backoff().await;
                warn!(
                    "[{}] Lost connection to MQTT broker. Retrying in {:?}...",
                    self.address, delay
                );
                sleep(delay).await;

                if !self.has_subscriptions().await {
                    info!("[{}] No subscriptions left, not reconnecting.", self.address);
                    return;
                }
                match self.ensure_connected().await {
                    Ok(()) => {
                        info!("[{}] Reconnected.", self.address);
                        break;
                    }
                    Err(e) => warn!("[{}] Reconnect attempt failed: {}", self.address, e),
                }
            }
        }
    }

    /// Add `subscriber_id` to `topic`. The first subscriber of a topic
    /// triggers a connect and a broker-level SUBSCRIBE; a failed SUBSCRIBE is
    /// logged and the subscriber is recorded anyway.
    pub async fn subscribe(
        self: &Arc<Self>,
        topic: &str,
        qos: QoS,
        subscriber_id: &str,
    ) -> Result<()> {
        let first = self
            .subscriptions
            .lock()
            .await
            .get(topic)
            .map_or(true, |entry| entry.subscribers.is_empty());

        if first {
            self.ensure_connected().await?;
            match self.transport().await {
                Some(transport) => match transport.subscribe(topic, qos).await {
                    Ok(()) => info!("[{}] Subscribed to topic '{}'.", self.address, topic),
                    Err(e) => error!(
                        "[{}] Failed to subscribe to topic '{}': {}",
                        self.address, topic, e
                    ),
                },
                None => warn!(
                    "[{}] No transport after connect, '{}' is only recorded locally.",
                    self.address, topic
                ),
            }
        }

        self.subscriptions
            .lock()
            .await
            .entry(topic.to_string())
            .or_insert_with(|| TopicEntry::new(qos))
            .subscribers
            .insert(subscriber_id.to_string());
        Ok(())
    }

    /// Remove `subscriber_id` from each of `topics`. A topic losing its last
    /// subscriber is unsubscribed at the broker; an empty table tears the
    /// connection down.
    pub async fn unsubscribe(&self, topics: &[String], subscriber_id: &str) -> Result<()> {
        let (released, now_empty) = {
            let mut table = self.subscriptions.lock().await;
            let mut released = Vec::new();
            for topic in topics {
                let Some(entry) = table.get_mut(topic) else {
                    continue;
                };
                let had_subscribers = !entry.subscribers.is_empty();
                entry.subscribers.remove(subscriber_id);
                if entry.subscribers.is_empty() {
                    table.remove(topic);
                    if had_subscribers {
                        released.push(topic.clone());
                    }
                }
            }
            table.retain(|_, entry| !entry.subscribers.is_empty());
            (released, table.is_empty())
        };

        if !released.is_empty() && self.is_connected() {
            if let Some(transport) = self.transport().await {
                for topic in &released {
                    match transport.unsubscribe(topic).await {
                        Ok(()) => info!("[{}] Unsubscribed from topic '{}'.", self.address, topic),
                        Err(e) => error!(
                            "[{}] Failed to unsubscribe from topic '{}': {}",
                            self.address, topic, e
                        ),
                    }
                }
            }
        }

        if now_empty {
            info!("[{}] No active subscriptions, closing connection.", self.address);
            self.teardown().await;
        }
        Ok(())
    }

    /// Re-issue SUBSCRIBE for every topic that still has subscribers.
    /// Returns the number of topics the broker accepted.
    pub async fn resubscribe_all(&self) -> usize {
        if !self.is_connected() {
            return 0;
        }
        let Some(transport) = self.transport().await else {
            return 0;
        };

        let mut topics: Vec<(String, QoS)> = {
            let table = self.subscriptions.lock().await;
            table
                .iter()
                .filter(|(_, entry)| !entry.subscribers.is_empty())
                .map(|(topic, entry)| (topic.clone(), entry.qos))
                .collect()
        };
        topics.sort_by(|a, b| a.0.cmp(&b.0));

        let mut accepted = 0;
        for (topic, qos) in topics {
            match transport.subscribe(&topic, qos).await {
                Ok(()) => {
                    accepted += 1;
                    info!("[{}] Resubscribed to topic '{}'.", self.address, topic);
                }
                Err(e) => error!(
                    "[{}] Failed to resubscribe to topic '{}': {}",
                    self.address, topic, e
                ),
            }
        }
        accepted
    }

    /// Tear down when no subscriptions remain. Returns whether it did.
    pub async fn check_idle(&self) -> bool {
        if self.has_subscriptions().await {
            return false;
        }
        info!("[{}] Idle connection, closing.", self.address);
        self.teardown().await;
        true
    }

    /// Stop reconnecting, cancel the inbound task and close the transport.
    /// The subscription table is kept so a later connect restores interest.
    pub async fn teardown(&self) {
        let reconnect = self.reconnect_task.lock().await.take();
        if let Some(task) = reconnect {
            task.abort();
            let _ = task.await;
        }

        let _guard = self.connect_lock.lock().await;
        self.close_link().await;
    }

    /// Send DISCONNECT while the inbound task still drives the session, give
    /// it a moment to flush, then stop the task.
    async fn close_link(&self) {
        let (transport, task) = {
            let mut link = self.link.lock().await;
            (link.transport.take(), link.inbound_task.take())
        };

        let disconnected = match transport {
            Some(transport) => match transport.disconnect().await {
                Ok(()) => true,
                Err(e) => {
                    debug!("[{}] Disconnect failed: {}", self.address, e);
                    false
                }
            },
            None => false,
        };

        if let Some(mut task) = task {
            let finished = disconnected
                && !task.is_finished()
                && timeout(DISCONNECT_GRACE, &mut task).await.is_ok();
            if !finished {
                task.abort();
                match task.await {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => {
                        debug!("[{}] Inbound task cancelled.", self.address)
                    }
                    Err(e) => error!("[{}] Inbound task failed: {}", self.address, e),
                }
            }
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);
    }
}
