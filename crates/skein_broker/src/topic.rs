//! Per-topic state: the schema history and the subscriber set.
//!
//! A topic is the metadata around one named channel; the schema history
//! says what published values should look like, and the subscribers are
//! the sessions that care. Each topic guards its own state with a
//! reader-writer lock, independent of the registry that owns it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};
use tracing::warn;

use skein_session::{SendError, Session};

use crate::error::BrokerError;
use crate::message::Delivery;
use crate::schema::{SchemaDescriptor, TopicDescriptor};

#[derive(Debug)]
pub struct Topic {
    name: String,
    state: RwLock<TopicState>,
}

#[derive(Debug)]
struct TopicState {
    subscribers: HashMap<String, Arc<Session>>,
    schemas: BTreeMap<u32, SchemaDescriptor>,
    latest_version: u32,
}

impl Topic {
    /// A new topic whose initial schema becomes version 0.
    pub fn new(name: &str, schema: Map<String, Value>) -> Self {
        let mut schemas = BTreeMap::new();
        schemas.insert(0, SchemaDescriptor { version: 0, schema });

        Self {
            name: name.to_string(),
            state: RwLock::new(TopicState {
                subscribers: HashMap::new(),
                schemas,
                latest_version: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a session to the subscriber set. Duplicate adds are a no-op.
    pub fn subscribe(&self, session: Arc<Session>) {
        let mut state = self.state.write().unwrap();
        state
            .subscribers
            .insert(session.id().to_string(), session);
    }

    /// Remove a session from the subscriber set.
    pub fn unsubscribe(&self, session: &Session) -> Result<(), BrokerError> {
        let mut state = self.state.write().unwrap();
        if state.subscribers.remove(session.id()).is_none() {
            return Err(BrokerError::NotSubscribed {
                topic: self.name.clone(),
                client: session.id().to_string(),
            });
        }
        Ok(())
    }

    pub fn is_subscribed(&self, session: &Session) -> bool {
        self.state
            .read()
            .unwrap()
            .subscribers
            .contains_key(session.id())
    }

    /// Snapshot of the current subscribers.
    pub fn subscribers(&self) -> Vec<Arc<Session>> {
        self.state
            .read()
            .unwrap()
            .subscribers
            .values()
            .cloned()
            .collect()
    }

    /// Install a new schema under the next version number. Older versions
    /// stay available. Returns the new latest version.
    pub fn update_schema(&self, schema: Map<String, Value>) -> u32 {
        let mut state = self.state.write().unwrap();
        state.latest_version += 1;
        let version = state.latest_version;
        state
            .schemas
            .insert(version, SchemaDescriptor { version, schema });
        version
    }

    pub fn latest_version(&self) -> u32 {
        self.state.read().unwrap().latest_version
    }

    /// The schema at the latest version.
    ///
    /// If the cached latest version has no entry but the history is
    /// non-empty, the cache is reseated to the true maximum and that entry
    /// returned. Fails with `NoSchema` only when the history is empty.
    pub fn latest_schema(&self) -> Result<SchemaDescriptor, BrokerError> {
        let mut state = self.state.write().unwrap();
        if let Some(schema) = state.schemas.get(&state.latest_version) {
            return Ok(schema.clone());
        }

        match state
            .schemas
            .iter()
            .next_back()
            .map(|(version, schema)| (*version, schema.clone()))
        {
            Some((version, schema)) => {
                warn!(
                    topic = %self.name,
                    version,
                    "latest schema version was stale; reseated to the highest stored version"
                );
                state.latest_version = version;
                Ok(schema)
            }
            None => Err(BrokerError::NoSchema(self.name.clone())),
        }
    }

    pub fn schema_by_version(&self, version: u32) -> Result<SchemaDescriptor, BrokerError> {
        self.state
            .read()
            .unwrap()
            .schemas
            .get(&version)
            .cloned()
            .ok_or(BrokerError::NoSuchVersion {
                topic: self.name.clone(),
                version,
            })
    }

    /// The topic as a client sees it: name plus latest schema.
    pub fn describe(&self) -> Result<TopicDescriptor, BrokerError> {
        Ok(TopicDescriptor {
            name: self.name.clone(),
            schema: self.latest_schema()?,
        })
    }

    /// Fan `delivery` out to every subscriber, skipping `exclude` when the
    /// manager's policy asks for it. Returns the sessions whose send
    /// observed a closed peer so they can be surfaced for cleanup.
    pub fn publish(&self, delivery: &Delivery, exclude: Option<&str>) -> Vec<Arc<Session>> {
        let state = self.state.read().unwrap();
        let mut failed = Vec::new();

        for session in state.subscribers.values() {
            if exclude == Some(session.id()) {
                continue;
            }
            match session.send_json(delivery) {
                Ok(()) => {}
                Err(SendError::Closed(_)) => failed.push(session.clone()),
                Err(e) => {
                    warn!(topic = %self.name, client = %session.id(), error = %e, "could not deliver frame");
                }
            }
        }

        failed
    }
}
