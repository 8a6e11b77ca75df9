//! Scripted broker and fixtures shared by unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::QoS;
use tokio::sync::mpsc;

use crate::connection::{ConnectionSettings, DeliveryContext};
use crate::directory::ConfigDirectory;
use crate::error::{GatewayError, Result};
use crate::memory::{MemoryStatus, MemoryStreams};
use crate::models::{BrokerAddress, Credentials};
use crate::transport::{BrokerTransport, Connector, InboundMessage, InboundStream, Session};

/// Poll an expression until it holds, failing the test after ~3s.
macro_rules! eventually {
    ($cond:expr) => {{
        let mut reached = false;
        for _ in 0..300 {
            if $cond {
                reached = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(reached, "condition not reached: {}", stringify!($cond));
    }};
}

#[derive(Default)]
pub struct MockBroker {
    pub connects: usize,
    pub disconnects: usize,
    /// (session number, topic)
    pub subscribes: Vec<(usize, String)>,
    pub unsubscribes: Vec<(usize, String)>,
    pub fail_connect: bool,
    pub fail_subscribe: bool,
    pub connect_delay: Duration,
    /// Fail this session while it handles a SUBSCRIBE.
    pub drop_during_subscribe: Option<usize>,
    /// Sessions whose receive side saw the close instead of being aborted.
    pub clean_closes: usize,
    // Index is session number - 1; `None` once the client disconnected.
    sessions: Vec<Option<mpsc::UnboundedSender<Result<InboundMessage>>>>,
}

impl MockBroker {
    fn latest_session(&self) -> Option<&mpsc::UnboundedSender<Result<InboundMessage>>> {
        self.sessions.last().and_then(Option::as_ref)
    }

    fn fail_session(&self, session: usize) {
        if let Some(Some(tx)) = self.sessions.get(session - 1) {
            let _ = tx.send(Err(GatewayError::Transport("connection reset".to_string())));
        }
    }
}

#[derive(Clone, Default)]
pub struct MockConnector {
    broker: Arc<Mutex<MockBroker>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockBroker) -> R) -> R {
        let mut broker = self.broker.lock().unwrap();
        f(&mut broker)
    }

    pub fn connects(&self) -> usize {
        self.with(|b| b.connects)
    }

    pub fn subscribes(&self) -> Vec<String> {
        self.with(|b| b.subscribes.iter().map(|(_, t)| t.clone()).collect())
    }

    pub fn subscribes_in(&self, session: usize) -> Vec<String> {
        self.with(|b| {
            b.subscribes
                .iter()
                .filter(|(s, _)| *s == session)
                .map(|(_, t)| t.clone())
                .collect()
        })
    }

    pub fn unsubscribes(&self) -> Vec<String> {
        self.with(|b| b.unsubscribes.iter().map(|(_, t)| t.clone()).collect())
    }

    /// Deliver a message on the most recent session.
    pub fn publish(&self, topic: &str, payload: &[u8]) {
        self.with(|b| {
            if let Some(tx) = b.latest_session() {
                let _ = tx.send(Ok(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                }));
            }
        });
    }

    /// Fail the most recent session as if the socket was reset.
    pub fn drop_connection(&self) {
        self.with(|b| {
            if !b.sessions.is_empty() {
                b.fail_session(b.sessions.len());
            }
        });
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _address: &BrokerAddress, _credentials: &Credentials) -> Result<Session> {
        let delay = self.with(|b| b.connect_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.with(|b| {
            if b.fail_connect {
                return Err(GatewayError::Transport("connection refused".to_string()));
            }
            b.connects += 1;
            let (tx, rx) = mpsc::unbounded_channel();
            b.sessions.push(Some(tx));
            Ok(Session {
                transport: Arc::new(MockTransport {
                    session: b.connects,
                    broker: self.broker.clone(),
                }),
                inbound: Box::new(MockInbound {
                    rx,
                    broker: self.broker.clone(),
                }),
            })
        })
    }
}

struct MockTransport {
    session: usize,
    broker: Arc<Mutex<MockBroker>>,
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<()> {
        let dropped = {
            let mut broker = self.broker.lock().unwrap();
            if broker.fail_subscribe {
                return Err(GatewayError::Transport("subscribe rejected".to_string()));
            }
            broker.subscribes.push((self.session, topic.to_string()));
            if broker.drop_during_subscribe == Some(self.session) {
                broker.drop_during_subscribe = None;
                broker.fail_session(self.session);
                true
            } else {
                false
            }
        };
        if dropped {
            // Let the receive side observe the failure before SUBACK.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let mut broker = self.broker.lock().unwrap();
        broker.unsubscribes.push((self.session, topic.to_string()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut broker = self.broker.lock().unwrap();
        broker.disconnects += 1;
        // Closing the sender ends the session's receive side.
        if let Some(slot) = broker.sessions.get_mut(self.session - 1) {
            slot.take();
        }
        Ok(())
    }
}

struct MockInbound {
    rx: mpsc::UnboundedReceiver<Result<InboundMessage>>,
    broker: Arc<Mutex<MockBroker>>,
}

#[async_trait]
impl InboundStream for MockInbound {
    async fn recv(&mut self) -> Result<Option<InboundMessage>> {
        match self.rx.recv().await {
            Some(message) => message.map(Some),
            None => {
                self.broker.lock().unwrap().clean_closes += 1;
                Ok(None)
            }
        }
    }
}

pub fn fast_settings() -> ConnectionSettings {
    ConnectionSettings {
        connect_timeout: Duration::from_secs(1),
        retry_interval: Duration::from_millis(10),
        max_retry_interval: Duration::from_millis(40),
    }
}

pub fn delivery() -> (DeliveryContext, Arc<MemoryStreams>, Arc<MemoryStatus>) {
    let streams = Arc::new(MemoryStreams::new());
    let status = Arc::new(MemoryStatus::new());
    let context = DeliveryContext {
        directory: Arc::new(ConfigDirectory::new("mqtt_stream_default")),
        streams: streams.clone(),
        status: status.clone(),
    };
    (context, streams, status)
}
