use skein_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("topic doesn't exist: {0}")]
    TopicNotFound(String),
    #[error("cannot register topic {0}, topic already exists with different schema. Try updating schema")]
    SchemaConflict(String),
    #[error("client {client} is not subscribed to topic {topic}")]
    NotSubscribed { topic: String, client: String },
    #[error("no schemas found for topic {0}. update schema")]
    NoSchema(String),
    #[error("schema version {version} doesn't exist for topic {topic}")]
    NoSuchVersion { topic: String, version: u32 },
    #[error("topic {0} was removed but its stored value could not be deleted: {1}")]
    StoragePartial(String, StorageError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Outcome of one publish's persistence attempt, delivered on the caller's
/// error channel by the persist watcher.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("database error: {0}")]
    Storage(#[from] StorageError),
    #[error("timeout waiting for database ack")]
    Timeout,
}
