use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tungstenite::protocol::Message as WsMessage;

/// One connected client.
///
/// Outbound frames are handed to the session's writer task through an
/// ordered channel, so every frame reaches the socket in exactly the order
/// `send_json` was called, no matter how many tasks are publishing into the
/// same session concurrently. Ordering across different sessions is
/// undefined.
#[derive(Debug)]
pub struct Session {
    id: String,
    outbound: UnboundedSender<WsMessage>,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The session's writer task is gone: the socket is closed or closing.
    #[error("session {0} is closed")]
    Closed(String),
    #[error("could not encode outbound frame: {0}")]
    Encode(#[from] serde_json::Error),
}

impl Session {
    pub fn new(id: impl Into<String>, outbound: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: id.into(),
            outbound,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Serialize `value` and queue it as one text frame.
    pub fn send_json<T: Serialize>(&self, value: &T) -> Result<(), SendError> {
        let text = serde_json::to_string(value)?;
        self.outbound
            .send(WsMessage::text(text))
            .map_err(|_| SendError::Closed(self.id.clone()))
    }

    /// Ask the writer task to emit a Close frame and stop. Safe to call on
    /// an already-closed session.
    pub fn close(&self) {
        let _ = self.outbound.send(WsMessage::Close(None));
    }
}
