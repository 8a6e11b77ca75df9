//! Drains delivery streams into long-term storage through a consumer group.
//!
//! Entries are acknowledged and deleted only after the batch insert
//! succeeded. Anything read but not acknowledged stays pending for this
//! consumer and is read again, before new entries, on the next pass. That
//! makes delivery into the archive at-least-once: a crash between insert and
//! ack produces duplicates, never gaps.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::directory::ConfigDirectory;
use crate::error::{GatewayError, Result};
use crate::models::{ArchivedMessage, DeliveryRecord};
use crate::store::{ArchiveSink, ConfigStore, DeliveryStream, ReadFrom, StreamEntry};

#[derive(Debug, Clone)]
pub struct ArchiverSettings {
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    pub block: Duration,
    pub interval: Duration,
}

impl Default for ArchiverSettings {
    fn default() -> Self {
        Self {
            group: "archive_consumers".to_string(),
            consumer: "archive_worker".to_string(),
            batch_size: 1000,
            block: Duration::from_millis(1000),
            interval: Duration::from_secs(10),
        }
    }
}

pub struct StreamArchiver {
    streams: Arc<dyn DeliveryStream>,
    sink: Arc<dyn ArchiveSink>,
    directory: Arc<ConfigDirectory>,
    configs: Arc<dyn ConfigStore>,
    settings: ArchiverSettings,
    groups_ready: HashSet<String>,
}

impl StreamArchiver {
    pub fn new(
        streams: Arc<dyn DeliveryStream>,
        sink: Arc<dyn ArchiveSink>,
        directory: Arc<ConfigDirectory>,
        configs: Arc<dyn ConfigStore>,
        settings: ArchiverSettings,
    ) -> Self {
        Self {
            streams,
            sink,
            directory,
            configs,
            settings,
            groups_ready: HashSet::new(),
        }
    }

    async fn ensure_group(&mut self, stream: &str) -> Result<()> {
        if self.groups_ready.contains(stream) {
            return Ok(());
        }
        let created = self
            .streams
            .create_group(stream, &self.settings.group, "0")
            .await?;
        if created {
            info!("[{}] Created consumer group {}.", stream, self.settings.group);
        }
        self.groups_ready.insert(stream.to_string());
        Ok(())
    }

    async fn read_batch(&self, stream: &str) -> Result<Vec<StreamEntry>> {
        let pending = self
            .streams
            .read_group(
                stream,
                &self.settings.group,
                &self.settings.consumer,
                ReadFrom::Pending,
                self.settings.batch_size,
                Duration::ZERO,
            )
            .await?;
        if !pending.is_empty() {
            debug!("[{}] Retrying {} pending entries.", stream, pending.len());
            return Ok(pending);
        }
        self.streams
            .read_group(
                stream,
                &self.settings.group,
                &self.settings.consumer,
                ReadFrom::New,
                self.settings.batch_size,
                self.settings.block,
            )
            .await
    }

    async fn settle(&self, stream: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.streams.ack(stream, &self.settings.group, ids).await?;
        self.streams.delete(stream, ids).await?;
        Ok(())
    }

    /// Archive one batch from `stream`. Returns how many documents were written.
    pub async fn drain_stream(&mut self, stream: &str) -> Result<usize> {
        self.ensure_group(stream).await?;

        let entries = match self.read_batch(stream).await {
            Err(e @ GatewayError::NoGroup { .. }) => {
                self.groups_ready.remove(stream);
                return Err(e);
            }
            other => other?,
        };
        if entries.is_empty() {
            return Ok(0);
        }

        let mut docs = Vec::with_capacity(entries.len());
        let mut ids = Vec::with_capacity(entries.len());
        let mut malformed = Vec::new();
        for entry in entries {
            match serde_json::from_str::<DeliveryRecord>(&entry.data) {
                Ok(record) => {
                    ids.push(entry.id.clone());
                    docs.push(ArchivedMessage {
                        record,
                        stream_id: entry.id,
                    });
                }
                Err(e) => {
                    warn!("[{}] Dropping malformed entry {}: {}", stream, entry.id, e);
                    malformed.push(entry.id);
                }
            }
        }
        self.settle(stream, &malformed).await?;

        if docs.is_empty() {
            return Ok(0);
        }
        let written = self.sink.insert_many(&docs).await?;
        info!("[{}] Archived {} message(s).", stream, written);
        self.settle(stream, &ids).await?;
        Ok(written)
    }

    /// Streams known to this process plus every stream named by a stored
    /// config, so entries written by other gateway instances are drained too.
    async fn stream_names(&self) -> Vec<String> {
        let mut names = self.directory.stream_names().await;
        match self.configs.all_configs().await {
            Ok(configs) => names.extend(configs.into_iter().map(|c| {
                c.stream_name
                    .filter(|name| !name.is_empty())
                    .unwrap_or_else(|| self.directory.default_stream().to_string())
            })),
            Err(e) => warn!("Could not list stored configs, archiving known streams only: {}", e),
        }
        names.sort();
        names.dedup();
        names
    }

    /// One pass over the default stream and every configured stream.
    pub async fn drain_once(&mut self) -> usize {
        let mut total = 0;
        for stream in self.stream_names().await {
            match self.drain_stream(&stream).await {
                Ok(written) => total += written,
                Err(e) => error!("[{}] Archiving failed, entries kept for retry: {}", stream, e),
            }
        }
        total
    }

    pub async fn run(mut self, token: CancellationToken) {
        info!(
            "Stream archiver started (group {}, consumer {}).",
            self.settings.group, self.settings.consumer
        );
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.drain_once() => {}
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }
        info!("Stream archiver stopped.");
    }
}
