//! In-process implementations of the storage traits for unit tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::{GatewayError, Result};
use crate::models::{ArchivedMessage, BrokerConfig, DeliveryRecord, StatusRecord, UserSubscription};
use crate::store::{
    ArchiveSink, CommandQueue, ConfigStore, DeliveryStream, ReadFrom, StatusStore, StreamEntry,
};

#[derive(Default)]
struct ConfigState {
    configs: HashMap<String, BrokerConfig>,
    subscriptions: Vec<UserSubscription>,
}

#[derive(Default)]
pub struct MemoryConfigStore {
    state: Mutex<ConfigState>,
    fail_queries: AtomicBool,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_config(&self, config: BrokerConfig) {
        self.state
            .lock()
            .await
            .configs
            .insert(config.id.clone(), config);
    }

    pub async fn add_subscription(&self, subscription: UserSubscription) {
        self.state.lock().await.subscriptions.push(subscription);
    }

    /// Make every query fail until reset.
    pub fn set_fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(GatewayError::Storage("config store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn changed_since(&self, since: f64) -> Result<Vec<BrokerConfig>> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut changed: Vec<BrokerConfig> = state
            .configs
            .values()
            .filter(|c| c.updated_at > since)
            .cloned()
            .collect();
        changed.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(changed)
    }

    async fn get_config(&self, config_id: &str) -> Result<Option<BrokerConfig>> {
        self.check_available()?;
        Ok(self.state.lock().await.configs.get(config_id).cloned())
    }

    async fn subscriptions_for(&self, config_id: &str) -> Result<Vec<UserSubscription>> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .iter()
            .filter(|s| s.config_id == config_id)
            .cloned()
            .collect())
    }

    async fn all_configs(&self) -> Result<Vec<BrokerConfig>> {
        self.check_available()?;
        let mut configs: Vec<BrokerConfig> =
            self.state.lock().await.configs.values().cloned().collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(configs)
    }
}

#[derive(Default)]
struct MemGroup {
    last_delivered: u64,
    pending: BTreeMap<u64, String>,
}

#[derive(Default)]
struct MemStream {
    next_id: u64,
    entries: BTreeMap<u64, String>,
    groups: HashMap<String, MemGroup>,
}

#[derive(Default)]
pub struct MemoryStreams {
    streams: Mutex<HashMap<String, MemStream>>,
    appended: Notify,
    fail_ack: AtomicBool,
}

fn parse_ids(ids: &[String]) -> Vec<u64> {
    ids.iter().filter_map(|id| id.parse().ok()).collect()
}

impl MemoryStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        self.streams
            .lock()
            .await
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(id, data)| StreamEntry {
                        id: id.to_string(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Decoded delivery records currently held by `stream`.
    pub async fn records(&self, stream: &str) -> Vec<DeliveryRecord> {
        self.entries(stream)
            .await
            .iter()
            .filter_map(|e| serde_json::from_str(&e.data).ok())
            .collect()
    }

    pub async fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.streams
            .lock()
            .await
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    /// Make acknowledgements fail, as if the process died before acking.
    pub fn set_fail_ack(&self, fail: bool) {
        self.fail_ack.store(fail, Ordering::SeqCst);
    }

    async fn try_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut streams = self.streams.lock().await;
        let no_group = || GatewayError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
        let state = streams.get_mut(stream).ok_or_else(no_group)?;
        let group_state = state.groups.get_mut(group).ok_or_else(no_group)?;

        let ids: Vec<u64> = match from {
            ReadFrom::Pending => group_state
                .pending
                .iter()
                .filter(|(id, owner)| owner.as_str() == consumer && state.entries.contains_key(*id))
                .map(|(id, _)| *id)
                .take(count)
                .collect(),
            ReadFrom::New => state
                .entries
                .range(group_state.last_delivered + 1..)
                .map(|(id, _)| *id)
                .take(count)
                .collect(),
        };

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if from == ReadFrom::New {
                group_state.last_delivered = id;
                group_state.pending.insert(id, consumer.to_string());
            }
            if let Some(data) = state.entries.get(&id) {
                out.push(StreamEntry {
                    id: id.to_string(),
                    data: data.clone(),
                });
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl DeliveryStream for MemoryStreams {
    async fn append(&self, stream: &str, data: &str) -> Result<String> {
        let id = {
            let mut streams = self.streams.lock().await;
            let state = streams.entry(stream.to_string()).or_default();
            state.next_id += 1;
            state.entries.insert(state.next_id, data.to_string());
            state.next_id
        };
        self.appended.notify_waiters();
        Ok(id.to_string())
    }

    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> Result<bool> {
        let mut streams = self.streams.lock().await;
        let state = streams.entry(stream.to_string()).or_default();
        if state.groups.contains_key(group) {
            return Ok(false);
        }
        let last_delivered = match start_id {
            "$" => state.next_id,
            other => other.parse().unwrap_or(0),
        };
        state.groups.insert(
            group.to_string(),
            MemGroup {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(true)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            let entries = self.try_read(stream, group, consumer, from, count).await?;
            if !entries.is_empty() || from == ReadFrom::Pending {
                return Ok(entries);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(entries);
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize> {
        if self.fail_ack.load(Ordering::SeqCst) {
            return Err(GatewayError::Storage("ack rejected".to_string()));
        }
        let mut streams = self.streams.lock().await;
        let Some(group_state) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(0);
        };
        Ok(parse_ids(ids)
            .into_iter()
            .filter(|id| group_state.pending.remove(id).is_some())
            .count())
    }

    async fn delete(&self, stream: &str, ids: &[String]) -> Result<usize> {
        let mut streams = self.streams.lock().await;
        let Some(state) = streams.get_mut(stream) else {
            return Ok(0);
        };
        Ok(parse_ids(ids)
            .into_iter()
            .filter(|id| state.entries.remove(id).is_some())
            .count())
    }
}

#[derive(Default)]
pub struct MemoryCommandQueue {
    queue: Mutex<VecDeque<String>>,
    pushed: Notify,
}

impl MemoryCommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, payload: impl Into<String>) {
        self.queue.lock().await.push_back(payload.into());
        self.pushed.notify_one();
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }
}

#[async_trait]
impl CommandQueue for MemoryCommandQueue {
    async fn pop(&self, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(payload) = self.queue.lock().await.pop_front() {
                return Ok(Some(payload));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || tokio::time::timeout(remaining, self.pushed.notified())
                    .await
                    .is_err()
            {
                return Ok(None);
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryArchive {
    docs: Mutex<Vec<ArchivedMessage>>,
    fail_inserts: AtomicBool,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn docs(&self) -> Vec<ArchivedMessage> {
        self.docs.lock().await.clone()
    }

    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ArchiveSink for MemoryArchive {
    async fn insert_many(&self, docs: &[ArchivedMessage]) -> Result<usize> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(GatewayError::Storage("archive unavailable".to_string()));
        }
        self.docs.lock().await.extend_from_slice(docs);
        Ok(docs.len())
    }
}

#[derive(Default)]
pub struct MemoryStatus {
    statuses: Mutex<HashMap<String, StatusRecord>>,
    activity: Mutex<HashMap<(String, String, String), f64>>,
}

impl MemoryStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn status(&self, config_id: &str) -> Option<StatusRecord> {
        self.statuses.lock().await.get(config_id).cloned()
    }

    pub async fn last_active(&self, config_id: &str, subscriber_id: &str, topic: &str) -> Option<f64> {
        self.activity
            .lock()
            .await
            .get(&(
                config_id.to_string(),
                subscriber_id.to_string(),
                topic.to_string(),
            ))
            .copied()
    }
}

#[async_trait]
impl StatusStore for MemoryStatus {
    async fn record_status(&self, config_id: &str, status: &StatusRecord) -> Result<()> {
        self.statuses
            .lock()
            .await
            .insert(config_id.to_string(), status.clone());
        Ok(())
    }

    async fn mark_active(
        &self,
        config_id: &str,
        subscriber_id: &str,
        topic: &str,
        at: f64,
    ) -> Result<()> {
        self.activity.lock().await.insert(
            (
                config_id.to_string(),
                subscriber_id.to_string(),
                topic.to_string(),
            ),
            at,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_group_read_tracks_pending_per_consumer() {
        let streams = MemoryStreams::new();
        assert!(streams.create_group("s", "g", "0").await.unwrap());
        assert!(!streams.create_group("s", "g", "0").await.unwrap());

        streams.append("s", "one").await.unwrap();
        streams.append("s", "two").await.unwrap();

        let read = streams
            .read_group("s", "g", "w1", ReadFrom::New, 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(read.len(), 2);

        let again = streams
            .read_group("s", "g", "w1", ReadFrom::New, 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(again.is_empty());

        let pending = streams
            .read_group("s", "g", "w1", ReadFrom::Pending, 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(pending, read);

        let other = streams
            .read_group("s", "g", "w2", ReadFrom::Pending, 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(other.is_empty());

        let ids: Vec<String> = read.iter().map(|e| e.id.clone()).collect();
        assert_eq!(streams.ack("s", "g", &ids).await.unwrap(), 2);
        assert_eq!(streams.delete("s", &ids).await.unwrap(), 2);
        assert_eq!(streams.pending_count("s", "g").await, 0);
        assert!(streams.entries("s").await.is_empty());
    }

    #[tokio::test]
    async fn test_group_read_without_group_fails() {
        let streams = MemoryStreams::new();
        streams.append("s", "x").await.unwrap();
        let err = streams
            .read_group("s", "missing", "w", ReadFrom::New, 1, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoGroup { .. }));
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let streams = std::sync::Arc::new(MemoryStreams::new());
        streams.create_group("s", "g", "$").await.unwrap();

        let writer = streams.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("s", "late").await.unwrap();
        });

        let read = streams
            .read_group("s", "g", "w", ReadFrom::New, 5, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].data, "late");
    }

    #[tokio::test]
    async fn test_command_queue_is_fifo() {
        let queue = MemoryCommandQueue::new();
        queue.push("a").await;
        queue.push("b").await;
        assert_eq!(queue.pop(Duration::ZERO).await.unwrap().as_deref(), Some("a"));
        assert_eq!(queue.pop(Duration::ZERO).await.unwrap().as_deref(), Some("b"));
        assert_eq!(
            queue.pop(Duration::from_millis(10)).await.unwrap(),
            None
        );
    }
}
