//! skein_transport
//!
//! The WebSocket face of the broker: HTTP upgrade with the auth and
//! client-id gates, one read loop per session, the action dispatch table
//! with its decorator chains, ack shaping, and the failed-peer cleanup
//! loop.

pub mod decorators;
pub mod handlers;
pub mod websocket;

pub use skein_broker::message::{Delivery, Request, Response};
pub use websocket::{start_websocket_server, WebSocketServer};
