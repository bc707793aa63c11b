use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::session::Session;

/// Process-wide set of live sessions, unique by client id.
///
/// Duplicate ids are rejected before a session is constructed (the upgrade
/// path answers 409), so `add` is a plain insert.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: Arc<Session>) {
        self.sessions
            .write()
            .unwrap()
            .insert(session.id().to_string(), session);
    }

    pub fn remove(&self, id: &str) {
        self.sessions.write().unwrap().remove(id);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
