//! skein_storage
//!
//! Persistence port for the broker: a narrow async key-to-value interface
//! holding one record per topic (the canonical JSON of the most recently
//! published value plus a nanosecond UTC timestamp).
//!
//! Writes go through a bounded queue drained by a single writer task per
//! store, so concurrent publishers never race on the backend connection and
//! a slow backend pushes back by filling the queue instead of blocking the
//! fan-out path. Enqueueing never blocks: a full queue or a closed store is
//! reported immediately on the returned acknowledgment channel.

pub mod null_store;
pub mod sled_store;
pub mod sqlite_store;

mod queue;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use skein_config::StorageKind;

pub use null_store::NullStorage;
pub use sled_store::SledStorage;
pub use sqlite_store::SqliteStorage;

/// Receives exactly one write outcome. A receiver that resolves to a
/// channel-closed error means the writer went away before acknowledging;
/// callers should treat that as `StorageError::Cancelled`.
pub type AckReceiver = oneshot::Receiver<Result<(), StorageError>>;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("could not open storage backend: {0}")]
    Open(String),
    #[error("storage is closed")]
    Closed,
    #[error("write queue is full")]
    QueueFull,
    #[error("write was cancelled before it ran")]
    Cancelled,
    #[error(transparent)]
    Kv(#[from] sled::Error),
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
    #[error("stored value is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// The capability set the broker holds. Providers differ only in where the
/// bytes land.
#[async_trait]
pub trait Storage: Debug + Send + Sync {
    /// Queue a write of `value` under `key`, stamped with `timestamp`.
    ///
    /// Never blocks. The returned channel yields exactly one outcome: `Ok`
    /// once the backend acknowledged the write, `QueueFull` when the queue
    /// had no room, `Closed` after `close`, or `Cancelled` when `deadline`
    /// passed before the writer reached the request.
    fn async_put(
        &self,
        key: &str,
        value: &Map<String, Value>,
        timestamp: DateTime<Utc>,
        deadline: Instant,
    ) -> AckReceiver;

    /// The most recent value for `key`; absence is `Ok(None)`.
    async fn get(&self, key: &str) -> StorageResult<Option<Map<String, Value>>>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Close the queue, wait for the writer to drain its acknowledgments,
    /// and close the backing store. Idempotent.
    async fn close(&self);
}

/// Open the provider selected by configuration. The writer task of the
/// returned store shuts down when `shutdown` is cancelled or the store is
/// closed, whichever comes first.
pub async fn open_storage(
    kind: StorageKind,
    path: &str,
    shutdown: CancellationToken,
) -> StorageResult<Arc<dyn Storage>> {
    match kind {
        StorageKind::Sled => Ok(Arc::new(SledStorage::open(path, shutdown)?)),
        StorageKind::Sqlite => Ok(Arc::new(SqliteStorage::open(path, shutdown)?)),
        StorageKind::None => Ok(Arc::new(NullStorage::new())),
    }
}
