//! Embedded SQL provider backed by `rusqlite`.
//!
//! One connection serves the whole store. The writer task is the only
//! writer; `get` and `delete` borrow the connection briefly under its lock.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::queue::{self, QueueHandle, WriteRequest, WRITE_QUEUE_CAPACITY};
use crate::{AckReceiver, Storage, StorageError, StorageResult};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS topics (
    key TEXT NOT NULL PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
)";

const UPSERT: &str = "INSERT INTO topics (key, value, updated_at) VALUES (?1, ?2, ?3)
    ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at";

pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
    queue: QueueHandle,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl SqliteStorage {
    /// Open or create the database file at `path` and start the writer task.
    pub fn open(path: &str, shutdown: CancellationToken) -> StorageResult<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Open(e.to_string()))?;
            }
        }

        let conn = Connection::open(path).map_err(|e| StorageError::Open(e.to_string()))?;
        conn.execute(SCHEMA, [])
            .map_err(|e| StorageError::Open(e.to_string()))?;
        let conn = Arc::new(Mutex::new(conn));

        let (tx, rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let writer_conn = conn.clone();
        let writer = queue::spawn_writer(rx, shutdown, move |request| {
            put(&writer_conn, request)
        });

        Ok(Self {
            conn,
            queue: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        })
    }
}

fn put(conn: &Mutex<Connection>, request: &WriteRequest) -> Result<(), StorageError> {
    let text = serde_json::to_string(&request.value)?;
    let nanos = request.timestamp.timestamp_nanos_opt().unwrap_or(i64::MAX);
    conn.lock()
        .unwrap()
        .execute(UPSERT, params![request.key, text, nanos])?;
    Ok(())
}

#[async_trait]
impl Storage for SqliteStorage {
    fn async_put(
        &self,
        key: &str,
        value: &Map<String, Value>,
        timestamp: DateTime<Utc>,
        deadline: Instant,
    ) -> AckReceiver {
        queue::enqueue(
            &self.queue,
            key,
            Value::Object(value.clone()),
            timestamp,
            deadline,
        )
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Map<String, Value>>> {
        let text: Option<String> = self
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT value FROM topics WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;

        match text {
            None => Ok(None),
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.conn
            .lock()
            .unwrap()
            .execute("DELETE FROM topics WHERE key = ?1", params![key])?;
        Ok(())
    }

    async fn close(&self) {
        let tx = self.queue.lock().unwrap().take();
        if tx.is_none() {
            return; // already closed
        }
        drop(tx);

        let writer = self.writer.lock().unwrap().take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }
}

impl fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("conn", &"rusqlite::Connection")
            .finish()
    }
}
