//! Storage traits for the collaborators the gateway reads from and writes to.
//!
//! [`crate::db::DatabaseService`] implements all of them on SQLite.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ArchivedMessage, BrokerConfig, StatusRecord, UserSubscription};

/// Source of broker configs and their durable user subscriptions.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Configs created or updated strictly after `since` (unix seconds).
    async fn changed_since(&self, since: f64) -> Result<Vec<BrokerConfig>>;

    async fn get_config(&self, config_id: &str) -> Result<Option<BrokerConfig>>;

    async fn subscriptions_for(&self, config_id: &str) -> Result<Vec<UserSubscription>>;

    async fn all_configs(&self) -> Result<Vec<BrokerConfig>>;
}

/// One entry read from a delivery stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub data: String,
}

/// Where a group read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// Entries already delivered to this consumer but not yet acknowledged.
    Pending,
    /// Entries never delivered to the group.
    New,
}

/// Durable append-only stream with consumer groups.
#[async_trait]
pub trait DeliveryStream: Send + Sync {
    async fn append(&self, stream: &str, data: &str) -> Result<String>;

    /// Create a group starting after `start_id` (`"0"` for the beginning,
    /// `"$"` for the current tail). Returns `false` if it already existed.
    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> Result<bool>;

    /// Read up to `count` entries, waiting up to `block` when nothing new is
    /// available. Delivered entries become pending for `consumer`.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize>;

    async fn delete(&self, stream: &str, ids: &[String]) -> Result<usize>;
}

/// FIFO queue of control commands fed by external producers.
#[async_trait]
pub trait CommandQueue: Send + Sync {
    /// Pop the oldest payload, waiting at most `timeout`.
    async fn pop(&self, timeout: Duration) -> Result<Option<String>>;
}

/// Long-term storage for archived messages. No uniqueness is enforced.
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    async fn insert_many(&self, docs: &[ArchivedMessage]) -> Result<usize>;
}

/// Per-config status surface and subscription activity markers.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn record_status(&self, config_id: &str, status: &StatusRecord) -> Result<()>;

    async fn mark_active(
        &self,
        config_id: &str,
        subscriber_id: &str,
        topic: &str,
        at: f64,
    ) -> Result<()>;
}
