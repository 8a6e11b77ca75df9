use std::time::Duration;

use thiserror::Error;

use crate::models::BrokerAddress;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Connecting to {0} timed out after {1:?}")]
    ConnectTimeout(BrokerAddress, Duration),
    #[error("Connecting to {0} failed")]
    ConnectFailed(BrokerAddress),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    #[error("Unknown config: {0}")]
    UnknownConfig(String),
    #[error("Consumer group {group} does not exist on stream {stream}")]
    NoGroup { stream: String, group: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl From<rusqlite::Error> for GatewayError {
    fn from(err: rusqlite::Error) -> Self {
        GatewayError::Storage(err.to_string())
    }
}

impl From<r2d2::Error> for GatewayError {
    fn from(err: r2d2::Error) -> Self {
        GatewayError::Storage(format!("connection pool: {}", err))
    }
}

impl From<tokio::task::JoinError> for GatewayError {
    fn from(err: tokio::task::JoinError) -> Self {
        GatewayError::Storage(format!("blocking task failed: {}", err))
    }
}

impl From<rumqttc::ClientError> for GatewayError {
    fn from(err: rumqttc::ClientError) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

impl From<rumqttc::ConnectionError> for GatewayError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        GatewayError::Transport(err.to_string())
    }
}
