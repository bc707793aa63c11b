//! Embedded key-value provider backed by `sled`.
//!
//! Each topic maps to one record: a JSON envelope holding the latest
//! published value and its nanosecond UTC stamp. Writes are applied by the
//! store's writer task; reads go straight to the tree.

use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::queue::{self, QueueHandle, WriteRequest, WRITE_QUEUE_CAPACITY};
use crate::{AckReceiver, Storage, StorageError, StorageResult};

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    value: Map<String, Value>,
    /// Nanoseconds since the UNIX epoch, UTC.
    ts: i64,
}

#[derive(Debug)]
pub struct SledStorage {
    db: sled::Db,
    queue: QueueHandle,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl SledStorage {
    /// Open or create the tree at `path` and start the writer task.
    pub fn open(path: &str, shutdown: CancellationToken) -> StorageResult<Self> {
        let db = sled::open(path).map_err(|e| StorageError::Open(e.to_string()))?;

        let (tx, rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let writer_db = db.clone();
        let writer = queue::spawn_writer(rx, shutdown, move |request| {
            put(&writer_db, request)
        });

        Ok(Self {
            db,
            queue: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        })
    }
}

fn put(db: &sled::Db, request: &WriteRequest) -> Result<(), StorageError> {
    let record = StoredRecord {
        value: request
            .value
            .as_object()
            .cloned()
            .unwrap_or_default(),
        ts: request.timestamp.timestamp_nanos_opt().unwrap_or(i64::MAX),
    };
    let bytes = serde_json::to_vec(&record)?;
    db.insert(request.key.as_bytes(), bytes)?;
    Ok(())
}

#[async_trait]
impl Storage for SledStorage {
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
        match self.db.get(key.as_bytes())? {
            None => Ok(None),
            Some(bytes) => {
                let record: StoredRecord = serde_json::from_slice(&bytes)?;
                Ok(Some(record.value))
            }
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.db.remove(key.as_bytes())?;
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

        if let Err(e) = self.db.flush_async().await {
            debug!(error = %e, "flush on close failed");
        }
    }
}
