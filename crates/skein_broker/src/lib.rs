//! skein_broker
//!
//! The broker crate owns the topic registry and everything that happens
//! between an accepted request and the frames it produces: schema
//! versioning and structural matching, subscriber fan-out, write-through
//! persistence with a bounded acknowledgment window, and surfacing of
//! peers whose sockets died mid-delivery.
//!
//! Public types:
//! - `TopicManager`: registry of topics, mediates every topic operation.
//! - `Topic`: one named channel with a schema history and subscriber set.
//! - `Request` / `Response` / `Delivery`: the JSON wire shapes.
//!
//! This crate is used by the transport crate (WebSocket server) and by
//! binary crates that wire together network, configuration and storage.

pub mod error;
pub mod manager;
pub mod message;
pub mod schema;
pub mod topic;

pub use error::{BrokerError, PersistError};
pub use manager::TopicManager;
pub use message::{Delivery, Request, Response};
pub use schema::{SchemaDescriptor, TopicDescriptor};
pub use topic::Topic;

#[cfg(test)]
mod tests;
