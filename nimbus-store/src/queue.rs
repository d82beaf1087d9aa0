//! Queue snapshot persistence.
//!
//! The queue emulator keeps live messages in memory; on `flush()` the full
//! queue contents replace the on-disk snapshot, and on start the snapshot is
//! loaded back with in-flight visibility reset so nothing stays invisible
//! across a restart. Each queue gets its own database file.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use nimbus_core::EmulatorError;

/// One queued message, in memory and on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub message_id: String,
    pub body: String,
    /// System attributes (SentTimestamp and friends).
    pub attributes: HashMap<String, String>,
    /// User message attributes, kept as raw JSON.
    pub message_attributes: serde_json::Value,
    pub receipt_handle: Option<String>,
    /// Delivery counter; incremented on every receive.
    pub receive_count: u32,
    /// Epoch milliseconds.
    pub sent_at: i64,
    /// Epoch milliseconds of the first delivery, zero before that.
    pub first_received_at: i64,
    /// Message is invisible until this epoch-millisecond instant.
    pub invisible_until: i64,
    pub group_id: Option<String>,
    pub dedup_id: Option<String>,
}

impl QueueMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            body: body.into(),
            attributes: HashMap::new(),
            message_attributes: serde_json::Value::Object(Default::default()),
            receipt_handle: None,
            receive_count: 0,
            sent_at: chrono::Utc::now().timestamp_millis(),
            first_received_at: 0,
            invisible_until: 0,
            group_id: None,
            dedup_id: None,
        }
    }

    pub fn is_visible(&self, now_millis: i64) -> bool {
        self.invisible_until <= now_millis
    }
}

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS messages (
    message_id TEXT PRIMARY KEY,
    body TEXT NOT NULL,
    attributes TEXT NOT NULL DEFAULT '{}',
    message_attributes TEXT NOT NULL DEFAULT '{}',
    receipt_handle TEXT,
    receive_count INTEGER NOT NULL DEFAULT 0,
    sent_at INTEGER NOT NULL DEFAULT 0,
    first_received_at INTEGER NOT NULL DEFAULT 0,
    invisible_until INTEGER NOT NULL DEFAULT 0,
    group_id TEXT,
    dedup_id TEXT
)";

fn db_error(err: sqlx::Error) -> EmulatorError {
    EmulatorError::Internal(format!("queue store: {err}"))
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// SQLite-backed snapshot store for queue state.
pub struct QueueSnapshotStore {
    dir: PathBuf,
}

impl QueueSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn db_path(&self, queue_name: &str) -> PathBuf {
        self.dir.join(format!("{}.db", sanitize(queue_name)))
    }

    async fn connect(&self, queue_name: &str) -> Result<SqlitePool, EmulatorError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let options = SqliteConnectOptions::new()
            .filename(self.db_path(queue_name))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db_error)?;
        sqlx::query(CREATE_TABLE_SQL)
            .execute(&pool)
            .await
            .map_err(db_error)?;
        Ok(pool)
    }

    /// Replace the persisted snapshot with the given messages.
    pub async fn save(
        &self,
        queue_name: &str,
        messages: &[QueueMessage],
    ) -> Result<(), EmulatorError> {
        let pool = self.connect(queue_name).await?;
        sqlx::query("DELETE FROM messages")
            .execute(&pool)
            .await
            .map_err(db_error)?;

        for msg in messages {
            sqlx::query(
                "INSERT INTO messages (message_id, body, attributes, message_attributes,
                 receipt_handle, receive_count, sent_at, first_received_at, invisible_until,
                 group_id, dedup_id) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&msg.message_id)
            .bind(&msg.body)
            .bind(serde_json::to_string(&msg.attributes)?)
            .bind(msg.message_attributes.to_string())
            .bind(&msg.receipt_handle)
            .bind(msg.receive_count as i64)
            .bind(msg.sent_at)
            .bind(msg.first_received_at)
            .bind(msg.invisible_until)
            .bind(&msg.group_id)
            .bind(&msg.dedup_id)
            .execute(&pool)
            .await
            .map_err(db_error)?;
        }
        pool.close().await;
        tracing::debug!(queue = queue_name, count = messages.len(), "queue snapshot saved");
        Ok(())
    }

    /// Load the persisted snapshot. In-flight messages come back immediately
    /// visible.
    pub async fn load(&self, queue_name: &str) -> Result<Vec<QueueMessage>, EmulatorError> {
        if !self.db_path(queue_name).exists() {
            return Ok(Vec::new());
        }
        let pool = self.connect(queue_name).await?;
        let rows = sqlx::query("SELECT * FROM messages ORDER BY sent_at")
            .fetch_all(&pool)
            .await
            .map_err(db_error)?;
        pool.close().await;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let attributes: String = row.get("attributes");
            let message_attributes: String = row.get("message_attributes");
            messages.push(QueueMessage {
                message_id: row.get("message_id"),
                body: row.get("body"),
                attributes: serde_json::from_str(&attributes).unwrap_or_default(),
                message_attributes: serde_json::from_str(&message_attributes)
                    .unwrap_or(serde_json::Value::Null),
                receipt_handle: row.get("receipt_handle"),
                receive_count: row.get::<i64, _>("receive_count") as u32,
                sent_at: row.get("sent_at"),
                first_received_at: row.get("first_received_at"),
                invisible_until: 0,
                group_id: row.get("group_id"),
                dedup_id: row.get("dedup_id"),
            });
        }
        tracing::debug!(queue = queue_name, count = messages.len(), "queue snapshot loaded");
        Ok(messages)
    }

    /// Delete the persisted state for one queue.
    pub async fn reset(&self, queue_name: &str) -> Result<(), EmulatorError> {
        let path = self.db_path(queue_name);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
            tracing::info!(queue = queue_name, "queue snapshot deleted");
        }
        Ok(())
    }

    /// Delete every queue snapshot.
    pub async fn reset_all(&self) -> Result<(), EmulatorError> {
        if !self.dir.exists() {
            return Ok(());
        }
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "db") {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }
}
