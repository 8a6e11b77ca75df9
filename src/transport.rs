//! Broker transport seam.
//!
//! A [`Connector`] opens one physical session to a broker and hands back the
//! command side ([`BrokerTransport`]) and the receive side ([`InboundStream`])
//! separately, so the receive side can be owned by a single inbound task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{BrokerAddress, Credentials};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;

    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

#[async_trait]
pub trait InboundStream: Send {
    /// Next application message. `Ok(None)` means the broker closed the session.
    async fn recv(&mut self) -> Result<Option<InboundMessage>>;
}

pub struct Session {
    pub transport: Arc<dyn BrokerTransport>,
    pub inbound: Box<dyn InboundStream>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session and return once the broker has accepted it.
    async fn connect(&self, address: &BrokerAddress, credentials: &Credentials) -> Result<Session>;
}

/// Connector backed by `rumqttc`.
pub struct MqttConnector {
    client_id_prefix: String,
    keep_alive: Duration,
}

impl MqttConnector {
    pub fn new(client_id_prefix: impl Into<String>, keep_alive: Duration) -> Self {
        Self {
            client_id_prefix: client_id_prefix.into(),
            keep_alive,
        }
    }

    fn options(&self, address: &BrokerAddress, credentials: &Credentials) -> MqttOptions {
        let client_id = format!("{}_{}", self.client_id_prefix, Uuid::new_v4());
        let mut mqtt_options = MqttOptions::new(client_id, address.host.clone(), address.port);
        mqtt_options.set_keep_alive(self.keep_alive);
        mqtt_options.set_clean_session(true);

        if let Some(username) = credentials.username.as_deref().filter(|u| !u.is_empty()) {
            mqtt_options.set_credentials(
                username,
                credentials.password.clone().unwrap_or_default(),
            );
        }
        mqtt_options
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, address: &BrokerAddress, credentials: &Credentials) -> Result<Session> {
        debug!("[{}] Configuring MQTT client...", address);
        let (client, mut eventloop) = AsyncClient::new(self.options(address, credentials), 64);

        // Nothing is sent until the event loop is polled, so drive it until CONNACK.
        loop {
            match eventloop.poll().await? {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    info!("[{}] Connected to MQTT broker ({:?}).", address, ack.code);
                    break;
                }
                event => debug!("[{}] Event before CONNACK: {:?}", address, event),
            }
        }

        Ok(Session {
            transport: Arc::new(MqttTransport { client }),
            inbound: Box::new(MqttInbound { eventloop }),
        })
    }
}

struct MqttTransport {
    client: AsyncClient,
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        self.client.subscribe(topic, qos).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.client.unsubscribe(topic).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await?;
        Ok(())
    }
}

struct MqttInbound {
    eventloop: EventLoop,
}

#[async_trait]
impl InboundStream for MqttInbound {
    async fn recv(&mut self) -> Result<Option<InboundMessage>> {
        loop {
            match self.eventloop.poll().await? {
                Event::Incoming(Packet::Publish(publish)) => {
                    return Ok(Some(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    }));
                }
                Event::Incoming(Packet::Disconnect) => return Ok(None),
                Event::Outgoing(_) => {}
                event => debug!("Unhandled event: {:?}", event),
            }
        }
    }
}

