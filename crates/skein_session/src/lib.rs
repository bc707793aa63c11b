//! skein_session
//!
//! Server-side session handles and the process-wide session registry.
//!
//! A `Session` wraps one connected client: its identity plus the sending
//! half of the channel feeding that socket's writer task. The reading side
//! of a connection is owned exclusively by its read loop and never appears
//! here.

pub mod registry;
pub mod session;

pub use registry::SessionRegistry;
pub use session::{SendError, Session};
