use std::fmt;

use base64::Engine;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{GatewayError, Result};

/// Physical broker endpoint. Connections are shared per address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Canonical `host:port` key.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

fn default_port() -> u16 {
    1883
}

/// Broker binding owned by a user, as stored in the config store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub id: String,
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub initial_topics: Vec<String>,
    #[serde(default)]
    pub stream_name: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub updated_at: f64,
}

impl BrokerConfig {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            port,
            username: None,
            password: None,
            initial_topics: Vec::new(),
            stream_name: None,
            owner_id: None,
            updated_at: 0.0,
        }
    }

    pub fn address(&self) -> BrokerAddress {
        BrokerAddress::new(self.hostname.clone(), self.port)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    /// The fields whose change requires re-applying subscriptions.
    pub fn fingerprint(&self) -> ConnectionFingerprint {
        ConnectionFingerprint {
            hostname: self.hostname.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionFingerprint {
    pub hostname: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Durable per-user subscription entry belonging to a config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSubscription {
    pub config_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub qos: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadEncoding {
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "base64")]
    Base64,
}

/// UTF-8 payloads pass through, anything else is base64 encoded.
pub fn encode_payload(payload: &[u8]) -> (String, PayloadEncoding) {
    match std::str::from_utf8(payload) {
        Ok(text) => (text.to_string(), PayloadEncoding::Utf8),
        Err(_) => (
            base64::engine::general_purpose::STANDARD.encode(payload),
            PayloadEncoding::Base64,
        ),
    }
}

/// Envelope appended to a config's delivery stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub subscriber_id: String,
    pub config_id: String,
    pub topic: String,
    pub payload: String,
    pub payload_encoding: PayloadEncoding,
    pub received_ts: f64,
}

/// Document written to long-term storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedMessage {
    #[serde(flatten)]
    pub record: DeliveryRecord,
    pub stream_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Connected,
    Disconnected,
    Error,
}

/// Last-writer-wins status row for one config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: GatewayStatus,
    pub last_update_ts: f64,
    pub last_update_readable: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub subscribed_topics: Vec<String>,
    pub last_error: String,
    pub pid: u32,
}

impl StatusRecord {
    pub fn for_config(config: &BrokerConfig, status: GatewayStatus) -> Self {
        Self {
            status,
            last_update_ts: unix_now(),
            last_update_readable: readable_now(),
            hostname: config.hostname.clone(),
            port: config.port,
            username: config.username.clone().unwrap_or_default(),
            subscribed_topics: Vec::new(),
            last_error: String::new(),
            pid: std::process::id(),
        }
    }
}

/// Seconds since the unix epoch, with sub-second precision.
pub fn unix_now() -> f64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1_000_000_000.0
}

pub fn readable_now() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// A topic field that producers may send either as one string or a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TopicField {
    One(String),
    Many(Vec<String>),
}

/// Normalises topic input into a list, dropping blank entries.
pub fn normalize_topics<I, S>(topics: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for topic in topics {
        let topic = topic.as_ref().trim();
        if !topic.is_empty() && !out.iter().any(|t| t == topic) {
            out.push(topic.to_string());
        }
    }
    out
}

impl TopicField {
    fn into_topics(self) -> Vec<String> {
        match self {
            TopicField::One(topic) => normalize_topics([topic]),
            TopicField::Many(topics) => normalize_topics(topics),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommandPayload {
    action: Option<String>,
    config_id: Option<String>,
    user_id: Option<String>,
    topic: Option<TopicField>,
    qos: Option<u8>,
}

/// Control-plane command popped from the command queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Subscribe {
        config_id: String,
        user_id: String,
        topics: Vec<String>,
        qos: QoS,
    },
    Unsubscribe {
        config_id: String,
        user_id: String,
        topics: Vec<String>,
    },
    Reload {
        config_id: String,
    },
}

fn required(field: Option<String>, name: &str) -> Result<String> {
    match field {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(GatewayError::InvalidCommand(format!("missing {}", name))),
    }
}

impl Command {
    pub fn parse(payload: &str) -> Result<Self> {
        let raw: CommandPayload = serde_json::from_str(payload)
            .map_err(|e| GatewayError::InvalidCommand(format!("malformed payload: {}", e)))?;

        let action = required(raw.action, "action")?;
        let config_id = required(raw.config_id, "config_id")?;

        match action.as_str() {
            "reload" => Ok(Command::Reload { config_id }),
            "subscribe" | "unsubscribe" => {
                let user_id = required(raw.user_id, "user_id")?;
                let topics = raw.topic.map(TopicField::into_topics).unwrap_or_default();
                if topics.is_empty() {
                    return Err(GatewayError::InvalidCommand("missing topic".to_string()));
                }
                if action == "unsubscribe" {
                    return Ok(Command::Unsubscribe {
                        config_id,
                        user_id,
                        topics,
                    });
                }
                let level = raw.qos.unwrap_or(0);
                let qos = qos_from_level(level).ok_or_else(|| {
                    GatewayError::InvalidCommand(format!("qos {} out of range", level))
                })?;
                Ok(Command::Subscribe {
                    config_id,
                    user_id,
                    topics,
                    qos,
                })
            }
            other => Err(GatewayError::InvalidCommand(format!(
                "unknown action '{}'",
                other
            ))),
        }
    }

    pub fn config_id(&self) -> &str {
        match self {
            Command::Subscribe { config_id, .. }
            | Command::Unsubscribe { config_id, .. }
            | Command::Reload { config_id } => config_id,
        }
    }
}
