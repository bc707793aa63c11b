//! No-op provider: every write succeeds immediately, every read is empty.

use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::debug;

use crate::{AckReceiver, Storage, StorageResult};

#[derive(Debug, Default)]
pub struct NullStorage;

impl NullStorage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Storage for NullStorage {
    fn async_put(
        &self,
        key: &str,
        _value: &Map<String, Value>,
        timestamp: DateTime<Utc>,
        _deadline: Instant,
    ) -> AckReceiver {
        debug!(%key, %timestamp, "discarding write");
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(()));
        rx
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Map<String, Value>>> {
        debug!(%key, "get on null storage");
        Ok(None)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        debug!(%key, "delete on null storage");
        Ok(())
    }

    async fn close(&self) {}
}
