//! The topic manager: owner of the topic registry.
//!
//! Locking discipline: the registry lock is coarse and short-lived, and is
//! never held while a topic's own lock is taken. Operations clone the
//! topic's `Arc` out of the registry, release the registry lock, then work
//! against the topic. `unsubscribe_all` snapshots the topic list for the
//! same reason.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use skein_session::Session;
use skein_storage::{AckReceiver, Storage, StorageError};

use crate::error::{BrokerError, PersistError};
use crate::message::{Delivery, Request};
use crate::schema::shapes_match;
use crate::topic::Topic;

/// How many failed-peer events may be queued before new ones are dropped
/// with a warning. The cleanup loop drains this continuously.
pub const FAILED_PEER_QUEUE: usize = 100;

/// How long a publish waits for the storage acknowledgment before the
/// outcome is reported as a timeout.
pub const PERSIST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct TopicManager {
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    store: Arc<dyn Storage>,
    failed_peers: mpsc::Sender<Arc<Session>>,
    exclude_sender: bool,
}

impl TopicManager {
    /// A manager that delivers publishes to every subscriber, the sender
    /// included. The returned receiver yields sessions whose sockets died
    /// mid-delivery; the server's cleanup loop consumes it.
    pub fn new(store: Arc<dyn Storage>) -> (Arc<Self>, mpsc::Receiver<Arc<Session>>) {
        Self::with_sender_exclusion(store, false)
    }

    /// Like `new`, but when `exclude_sender` is true the publishing session
    /// does not receive its own deliveries.
    pub fn with_sender_exclusion(
        store: Arc<dyn Storage>,
        exclude_sender: bool,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<Session>>) {
        let (failed_peers, failed_rx) = mpsc::channel(FAILED_PEER_QUEUE);
        let manager = Arc::new(Self {
            topics: RwLock::new(HashMap::new()),
            store,
            failed_peers,
            exclude_sender,
        });
        (manager, failed_rx)
    }

    fn lookup(&self, name: &str) -> Result<Arc<Topic>, BrokerError> {
        self.topics
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::TopicNotFound(name.to_string()))
    }

    /// Register `name` with `schema` as its version-0 schema.
    ///
    /// Registering an existing topic with a structurally identical schema is
    /// idempotent. A differing schema is a conflict, unless the topic's
    /// latest schema is unreadable, in which case the offered schema is
    /// installed as a new version (recovery path).
    pub fn register_topic(
        &self,
        name: &str,
        schema: Map<String, Value>,
    ) -> Result<Arc<Topic>, BrokerError> {
        if let Some(existing) = self.topics.read().unwrap().get(name).cloned() {
            return self.reconcile_existing(existing, schema);
        }

        let mut topics = self.topics.write().unwrap();
        match topics.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                // Lost a race with another register; reconcile against the
                // winner outside the registry lock.
                let existing = entry.get().clone();
                drop(topics);
                self.reconcile_existing(existing, schema)
            }
            Entry::Vacant(entry) => {
                let topic = Arc::new(Topic::new(name, schema));
                entry.insert(topic.clone());
                info!(topic = name, "registered topic");
                Ok(topic)
            }
        }
    }

    fn reconcile_existing(
        &self,
        topic: Arc<Topic>,
        schema: Map<String, Value>,
    ) -> Result<Arc<Topic>, BrokerError> {
        match topic.latest_schema() {
            Ok(current) => {
                if shapes_match(&current.schema, &schema) {
                    Ok(topic)
                } else {
                    Err(BrokerError::SchemaConflict(topic.name().to_string()))
                }
            }
            Err(_) => {
                // The latest schema could not be read; recover by installing
                // the offered one.
                topic.update_schema(schema);
                Ok(topic)
            }
        }
    }

    pub fn subscribe(&self, name: &str, session: Arc<Session>) -> Result<(), BrokerError> {
        let topic = self.lookup(name)?;
        topic.subscribe(session);
        Ok(())
    }

    pub fn unsubscribe(&self, name: &str, session: &Session) -> Result<(), BrokerError> {
        let topic = self.lookup(name)?;
        topic.unsubscribe(session)
    }

    /// Remove `session` from every topic. The registry lock is released
    /// before any topic lock is taken.
    pub fn unsubscribe_all(&self, session: &Session) {
        let topics: Vec<Arc<Topic>> = self.topics.read().unwrap().values().cloned().collect();
        for topic in topics {
            if topic.unsubscribe(session).is_ok() {
                debug!(client = %session.id(), topic = %topic.name(), "unsubscribed");
            }
        }
    }

    pub fn list_topics(&self) -> Vec<Arc<Topic>> {
        self.topics.read().unwrap().values().cloned().collect()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().unwrap().len()
    }

    /// Publish `value` on the request's topic, persisting it as the topic's
    /// latest value. The persistence outcome arrives on `err_tx` (or the
    /// channel closes without a value on success) within `PERSIST_TIMEOUT`.
    pub async fn publish(
        &self,
        request: &Request,
        sender: &Session,
        value: Map<String, Value>,
        err_tx: Option<oneshot::Sender<PersistError>>,
    ) -> Result<(), BrokerError> {
        self.send_topic(request, sender, value, true, err_tx).await
    }

    /// Publish without writing through to storage.
    pub async fn send_without_save(
        &self,
        request: &Request,
        sender: &Session,
        value: Map<String, Value>,
        err_tx: Option<oneshot::Sender<PersistError>>,
    ) -> Result<(), BrokerError> {
        self.send_topic(request, sender, value, false, err_tx).await
    }

    async fn send_topic(
        &self,
        request: &Request,
        sender: &Session,
        value: Map<String, Value>,
        persist: bool,
        err_tx: Option<oneshot::Sender<PersistError>>,
    ) -> Result<(), BrokerError> {
        let topic = self.lookup(&request.topic)?;

        let db_ack = if persist {
            let now = Utc::now();
            info!(
                sender_id = %sender.id(),
                action = %request.action,
                message_id = %request.id,
                topic = %request.topic,
                time = %now,
                "persisting message"
            );
            Some(self.store.async_put(
                &request.topic,
                &value,
                now,
                Instant::now() + PERSIST_TIMEOUT,
            ))
        } else {
            None
        };

        let delivery = Delivery {
            id: request.id.clone(),
            action: request.action.clone(),
            topic: request.topic.clone(),
            data: Value::Object(value),
        };

        let exclude = self.exclude_sender.then(|| sender.id());
        for failed in topic.publish(&delivery, exclude) {
            self.mark_peer_failed(failed);
        }

        match (db_ack, err_tx) {
            (Some(ack), Some(err_tx)) => spawn_persist_watcher(ack, err_tx),
            // Persisting with nobody listening: the write still runs, its
            // outcome is simply dropped.
            (Some(_), None) => {}
            // Not persisting: close the channel right away so the caller's
            // watcher sees a clean success.
            (None, Some(err_tx)) => drop(err_tx),
            (None, None) => {}
        }

        Ok(())
    }

    fn mark_peer_failed(&self, session: Arc<Session>) {
        if let Err(e) = self.failed_peers.try_send(session) {
            warn!(error = %e, "failed-peer queue is full; dropping event");
        }
    }

    /// The last persisted value for `name`, or `None` if nothing has been
    /// published since the topic was registered (or it was unregistered).
    pub async fn get(&self, name: &str) -> Result<Option<Map<String, Value>>, BrokerError> {
        let topic = self.lookup(name)?;
        Ok(self.store.get(topic.name()).await?)
    }

    /// Remove the topic and its persisted value. The in-memory removal
    /// stands even when the storage delete fails; that partial outcome is
    /// reported as `StoragePartial`.
    pub async fn unregister_topic(&self, name: &str) -> Result<(), BrokerError> {
        let removed = self.topics.write().unwrap().remove(name);
        if removed.is_none() {
            return Err(BrokerError::TopicNotFound(name.to_string()));
        }

        if let Err(e) = self.store.delete(name).await {
            return Err(BrokerError::StoragePartial(name.to_string(), e));
        }
        Ok(())
    }

    pub fn update_schema(&self, name: &str, schema: Map<String, Value>) -> Result<u32, BrokerError> {
        let topic = self.lookup(name)?;
        Ok(topic.update_schema(schema))
    }

    /// Whether `value` structurally matches the topic's latest schema.
    /// `Ok(false)` is an unambiguous mismatch; `Err` means the topic (or
    /// its schema history) is missing.
    pub fn is_schema_match(
        &self,
        name: &str,
        value: &Map<String, Value>,
    ) -> Result<bool, BrokerError> {
        let topic = self.lookup(name)?;
        let current = topic.latest_schema()?;
        Ok(shapes_match(&current.schema, value))
    }
}

/// Wait up to `PERSIST_TIMEOUT` for the storage acknowledgment and convert
/// the outcome: forward the error, synthesize `Timeout`, or just close the
/// channel on success.
fn spawn_persist_watcher(ack: AckReceiver, err_tx: oneshot::Sender<PersistError>) {
    tokio::spawn(async move {
        let outcome = match timeout(PERSIST_TIMEOUT, ack).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(PersistError::Storage(e)),
            // The writer dropped the ack without answering.
            Ok(Err(_)) => Some(PersistError::Storage(StorageError::Cancelled)),
            Err(_) => Some(PersistError::Timeout),
        };

        if let Some(error) = outcome {
            let _ = err_tx.send(error);
        }
    });
}
