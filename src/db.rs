use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::time::{sleep, Instant};
use tracing::{error, info};

use crate::error::{GatewayError, Result};
use crate::models::{
    readable_now, ArchivedMessage, BrokerConfig, StatusRecord, UserSubscription,
};
use crate::store::{
    ArchiveSink, CommandQueue, ConfigStore, DeliveryStream, ReadFrom, StatusStore, StreamEntry,
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// SQLite persistence for configs, delivery streams, the command queue,
/// archived messages and status rows.
#[derive(Clone)]
pub struct DatabaseService {
    pool: Pool<SqliteConnectionManager>,
}

impl DatabaseService {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|c| {
            c.busy_timeout(Duration::from_secs(5))?;
            c.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            Ok(())
        });
        let pool = Pool::builder().max_size(8).build(manager)?;
        Ok(Self { pool })
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> Result<()> {
        let conn = self.pool.get()?;
        info!("Initializing database schema...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS broker_configs (
            id TEXT PRIMARY KEY,
            hostname TEXT NOT NULL,
            port INTEGER NOT NULL DEFAULT 1883,
            username TEXT,
            password TEXT,
            initial_topics TEXT NOT NULL DEFAULT '[]',
            stream_name TEXT,
            owner_id TEXT,
            updated_at REAL NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS user_subscriptions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            config_id TEXT NOT NULL,
            user_id TEXT NOT NULL DEFAULT '',
            topics TEXT NOT NULL DEFAULT '[]',
            qos INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_user_subscriptions_config
            ON user_subscriptions (config_id);

        CREATE TABLE IF NOT EXISTS stream_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            stream TEXT NOT NULL,
            data TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_stream_entries_stream
            ON stream_entries (stream, id);

        CREATE TABLE IF NOT EXISTS stream_groups (
            stream TEXT NOT NULL,
            grp TEXT NOT NULL,
            last_delivered INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (stream, grp)
        );

        CREATE TABLE IF NOT EXISTS stream_pending (
            stream TEXT NOT NULL,
            grp TEXT NOT NULL,
            entry_id INTEGER NOT NULL,
            consumer TEXT NOT NULL,
            PRIMARY KEY (stream, grp, entry_id)
        );

        CREATE TABLE IF NOT EXISTS command_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            payload TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS archived_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            stream_id TEXT NOT NULL,
            subscriber_id TEXT NOT NULL,
            config_id TEXT NOT NULL,
            topic TEXT NOT NULL,
            payload TEXT NOT NULL,
            payload_encoding TEXT NOT NULL,
            received_ts REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS gateway_status (
            config_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            last_update_ts REAL NOT NULL,
            record TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS subscription_activity (
            config_id TEXT NOT NULL,
            subscriber_id TEXT NOT NULL,
            topic TEXT NOT NULL,
            last_active REAL NOT NULL,
            last_active_readable TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (config_id, subscriber_id, topic)
        );
        "#,
        ) {
            Ok(_) => {
                info!("Database schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize database schema: {:?}", e);
                Err(e.into())
            }
        }
    }

    /// Run `f` on a pooled connection off the async runtime.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }

    /// Adds or updates a broker config.
    pub async fn upsert_config(&self, config: &BrokerConfig) -> Result<()> {
        let config = config.clone();
        let initial_topics = serde_json::to_string(&config.initial_topics)?;
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO broker_configs
                    (id, hostname, port, username, password, initial_topics, stream_name, owner_id, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(id) DO UPDATE SET
                    hostname = excluded.hostname,
                    port = excluded.port,
                    username = excluded.username,
                    password = excluded.password,
                    initial_topics = excluded.initial_topics,
                    stream_name = excluded.stream_name,
                    owner_id = excluded.owner_id,
                    updated_at = excluded.updated_at
                "#,
                params![
                    config.id,
                    config.hostname,
                    config.port,
                    config.username,
                    config.password,
                    initial_topics,
                    config.stream_name,
                    config.owner_id,
                    config.updated_at
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn add_subscription(&self, subscription: &UserSubscription) -> Result<()> {
        let subscription = subscription.clone();
        let topics = serde_json::to_string(&subscription.topics)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO user_subscriptions (config_id, user_id, topics, qos) VALUES (?1, ?2, ?3, ?4)",
                params![subscription.config_id, subscription.user_id, topics, subscription.qos],
            )?;
            Ok(())
        })
        .await
    }

    /// Enqueue a raw command payload, as an external producer would.
    pub async fn push_command(&self, payload: &str) -> Result<()> {
        let payload = payload.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO command_queue (payload) VALUES (?1)",
                params![payload],
            )?;
            Ok(())
        })
        .await
    }

    /// Retrieves every archived message in insertion order.
    pub async fn archived_messages(&self) -> Result<Vec<ArchivedMessage>> {
        let rows: Vec<(String, String, String, String, String, String, f64)> = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT stream_id, subscriber_id, config_id, topic, payload, payload_encoding, received_ts
                     FROM archived_messages ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(
                |(stream_id, subscriber_id, config_id, topic, payload, encoding, received_ts)| {
                    let value = serde_json::json!({
                        "stream_id": stream_id,
                        "subscriber_id": subscriber_id,
                        "config_id": config_id,
                        "topic": topic,
                        "payload": payload,
                        "payload_encoding": encoding,
                        "received_ts": received_ts,
                    });
                    Ok(serde_json::from_value(value)?)
                },
            )
            .collect()
    }

    pub async fn status(&self, config_id: &str) -> Result<Option<StatusRecord>> {
        let config_id = config_id.to_string();
        let record: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT record FROM gateway_status WHERE config_id = ?1",
                        params![config_id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        match record {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn last_active(
        &self,
        config_id: &str,
        subscriber_id: &str,
        topic: &str,
    ) -> Result<Option<f64>> {
        let key = (
            config_id.to_string(),
            subscriber_id.to_string(),
            topic.to_string(),
        );
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT last_active FROM subscription_activity
                     WHERE config_id = ?1 AND subscriber_id = ?2 AND topic = ?3",
                    params![key.0, key.1, key.2],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn try_pop_command(&self) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let next: Option<(i64, String)> = tx
                .query_row(
                    "SELECT id, payload FROM command_queue ORDER BY id LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if let Some((id, _)) = &next {
                tx.execute("DELETE FROM command_queue WHERE id = ?1", params![id])?;
            }
            tx.commit()?;
            Ok(next.map(|(_, payload)| payload))
        })
        .await
    }

    async fn try_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let (stream, group, consumer) = (stream.to_string(), group.to_string(), consumer.to_string());
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let last_delivered: Option<i64> = tx
                .query_row(
                    "SELECT last_delivered FROM stream_groups WHERE stream = ?1 AND grp = ?2",
                    params![stream, group],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(last_delivered) = last_delivered else {
                return Err(GatewayError::NoGroup { stream, group });
            };

            let entries: Vec<(i64, String)> = match from {
                ReadFrom::Pending => {
                    let mut stmt = tx.prepare(
                        "SELECT e.id, e.data FROM stream_pending p
                         JOIN stream_entries e ON e.id = p.entry_id
                         WHERE p.stream = ?1 AND p.grp = ?2 AND p.consumer = ?3
                         ORDER BY e.id LIMIT ?4",
                    )?;
                    let rows = stmt
                        .query_map(params![stream, group, consumer, count as i64], entry_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
                ReadFrom::New => {
                    let rows = {
                        let mut stmt = tx.prepare(
                            "SELECT id, data FROM stream_entries
                             WHERE stream = ?1 AND id > ?2
                             ORDER BY id LIMIT ?3",
                        )?;
                        let rows = stmt
                            .query_map(params![stream, last_delivered, count as i64], entry_row)?
                            .collect::<rusqlite::Result<Vec<_>>>()?;
                        rows
                    };
                    if let Some((last, _)) = rows.last() {
                        tx.execute(
                            "UPDATE stream_groups SET last_delivered = ?3 WHERE stream = ?1 AND grp = ?2",
                            params![stream, group, last],
                        )?;
                    }
                    for (id, _) in &rows {
                        tx.execute(
                            "INSERT OR REPLACE INTO stream_pending (stream, grp, entry_id, consumer)
                             VALUES (?1, ?2, ?3, ?4)",
                            params![stream, group, id, consumer],
                        )?;
                    }
                    rows
                }
            };
            tx.commit()?;

            Ok(entries
                .into_iter()
                .map(|(id, data)| StreamEntry {
                    id: id.to_string(),
                    data,
                })
                .collect())
        })
        .await
    }
}

fn entry_row(row: &Row<'_>) -> rusqlite::Result<(i64, String)> {
    Ok((row.get(0)?, row.get(1)?))
}

fn parse_ids(ids: &[String]) -> Vec<i64> {
    ids.iter().filter_map(|id| id.parse().ok()).collect()
}

fn config_from_row(row: &Row<'_>) -> rusqlite::Result<BrokerConfig> {
    let initial_topics: String = row.get(5)?;
    Ok(BrokerConfig {
        id: row.get(0)?,
        hostname: row.get(1)?,
        port: row.get(2)?,
        username: row.get(3)?,
        password: row.get(4)?,
        initial_topics: serde_json::from_str(&initial_topics).unwrap_or_default(),
        stream_name: row.get(6)?,
        owner_id: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

const CONFIG_COLUMNS: &str =
    "id, hostname, port, username, password, initial_topics, stream_name, owner_id, updated_at";

#[async_trait]
impl ConfigStore for DatabaseService {
    async fn changed_since(&self, since: f64) -> Result<Vec<BrokerConfig>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM broker_configs WHERE updated_at > ?1 ORDER BY id",
                CONFIG_COLUMNS
            ))?;
            let configs = stmt
                .query_map(params![since], config_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(configs)
        })
        .await
    }

    async fn get_config(&self, config_id: &str) -> Result<Option<BrokerConfig>> {
        let config_id = config_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM broker_configs WHERE id = ?1", CONFIG_COLUMNS),
                    params![config_id],
                    config_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn all_configs(&self) -> Result<Vec<BrokerConfig>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM broker_configs ORDER BY id",
                CONFIG_COLUMNS
            ))?;
            let configs = stmt
                .query_map([], config_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(configs)
        })
        .await
    }

    async fn subscriptions_for(&self, config_id: &str) -> Result<Vec<UserSubscription>> {
        let config_id = config_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT config_id, user_id, topics, qos FROM user_subscriptions
                 WHERE config_id = ?1 ORDER BY id",
            )?;
            let subscriptions = stmt
                .query_map(params![config_id], |row| {
                    let topics: String = row.get(2)?;
                    Ok(UserSubscription {
                        config_id: row.get(0)?,
                        user_id: row.get(1)?,
                        topics: serde_json::from_str(&topics).unwrap_or_default(),
                        qos: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(subscriptions)
        })
        .await
    }
}

#[async_trait]
impl DeliveryStream for DatabaseService {
    async fn append(&self, stream: &str, data: &str) -> Result<String> {
        let (stream, data) = (stream.to_string(), data.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO stream_entries (stream, data) VALUES (?1, ?2)",
                params![stream, data],
            )?;
            Ok(conn.last_insert_rowid().to_string())
        })
        .await
    }

    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> Result<bool> {
        let (stream, group, start_id) = (stream.to_string(), group.to_string(), start_id.to_string());
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let last_delivered: i64 = match start_id.as_str() {
                "$" => tx.query_row(
                    "SELECT COALESCE(MAX(id), 0) FROM stream_entries WHERE stream = ?1",
                    params![stream],
                    |row| row.get(0),
                )?,
                other => other.parse().unwrap_or(0),
            };
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO stream_groups (stream, grp, last_delivered) VALUES (?1, ?2, ?3)",
                params![stream, group, last_delivered],
            )?;
            tx.commit()?;
            Ok(inserted == 1)
        })
        .await
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
            let entries = self.try_read_group(stream, group, consumer, from, count).await?;
            if !entries.is_empty() || from == ReadFrom::Pending {
                return Ok(entries);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(entries);
            }
            sleep(remaining.min(POLL_INTERVAL)).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize> {
        let (stream, group, ids) = (stream.to_string(), group.to_string(), parse_ids(ids));
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut acked = 0;
            for id in ids {
                acked += tx.execute(
                    "DELETE FROM stream_pending WHERE stream = ?1 AND grp = ?2 AND entry_id = ?3",
                    params![stream, group, id],
                )?;
            }
            tx.commit()?;
            Ok(acked)
        })
        .await
    }

    async fn delete(&self, stream: &str, ids: &[String]) -> Result<usize> {
        let (stream, ids) = (stream.to_string(), parse_ids(ids));
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut deleted = 0;
            for id in ids {
                deleted += tx.execute(
                    "DELETE FROM stream_entries WHERE stream = ?1 AND id = ?2",
                    params![stream, id],
                )?;
            }
            tx.commit()?;
            Ok(deleted)
        })
        .await
    }
}

#[async_trait]
impl CommandQueue for DatabaseService {
    async fn pop(&self, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(payload) = self.try_pop_command().await? {
                return Ok(Some(payload));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            sleep(remaining.min(POLL_INTERVAL)).await;
        }
    }
}

#[async_trait]
impl ArchiveSink for DatabaseService {
    async fn insert_many(&self, docs: &[ArchivedMessage]) -> Result<usize> {
        let docs = docs.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO archived_messages
                        (stream_id, subscriber_id, config_id, topic, payload, payload_encoding, received_ts)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for doc in &docs {
                    let record = &doc.record;
                    let encoding = serde_json::to_value(record.payload_encoding)?;
                    stmt.execute(params![
                        doc.stream_id,
                        record.subscriber_id,
                        record.config_id,
                        record.topic,
                        record.payload,
                        encoding.as_str().unwrap_or_default(),
                        record.received_ts
                    ])?;
                }
            }
            tx.commit()?;
            Ok(docs.len())
        })
        .await
    }
}

#[async_trait]
impl StatusStore for DatabaseService {
    async fn record_status(&self, config_id: &str, status: &StatusRecord) -> Result<()> {
        let config_id = config_id.to_string();
        let state = serde_json::to_value(status.status)?;
        let state = state.as_str().unwrap_or_default().to_string();
        let last_update_ts = status.last_update_ts;
        let record = serde_json::to_string(status)?;
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO gateway_status (config_id, status, last_update_ts, record)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(config_id) DO UPDATE SET
                    status = excluded.status,
                    last_update_ts = excluded.last_update_ts,
                    record = excluded.record
                "#,
                params![config_id, state, last_update_ts, record],
            )?;
            Ok(())
        })
        .await
    }

    async fn mark_active(
        &self,
        config_id: &str,
        subscriber_id: &str,
        topic: &str,
        at: f64,
    ) -> Result<()> {
        let key = (
            config_id.to_string(),
            subscriber_id.to_string(),
            topic.to_string(),
        );
        let readable = readable_now();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO subscription_activity
                    (config_id, subscriber_id, topic, last_active, last_active_readable)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(config_id, subscriber_id, topic) DO UPDATE SET
                    last_active = excluded.last_active,
                    last_active_readable = excluded.last_active_readable
                "#,
                params![key.0, key.1, key.2, at, readable],
            )?;
            Ok(())
        })
        .await
    }
}
