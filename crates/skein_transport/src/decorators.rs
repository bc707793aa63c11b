//! Handler decorators: middleware-like pre-hooks wrapped around the
//! action handlers. A chain is listed outermost first at registration and
//! folded from the right, so the first decorator runs first.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::info;

use crate::handlers::{Handler, HandlerFuture};

/// Times the wrapped handler and emits one event with the duration, the
/// client id and the action.
pub(crate) fn metrics(next: Handler) -> Handler {
    Arc::new(move |server, session, request| -> HandlerFuture {
        let next = next.clone();
        Box::pin(async move {
            let started = Instant::now();
            let client = session.id().to_string();
            let action = request.action.clone();

            next(server, session, request).await;

            info!(
                client = %client,
                action = %action,
                elapsed = ?started.elapsed(),
                "handled request"
            );
        })
    })
}

/// Rejects with 400 when the request has no usable topic.
pub(crate) fn require_topic(next: Handler) -> Handler {
    Arc::new(move |server, session, request| -> HandlerFuture {
        let next = next.clone();
        Box::pin(async move {
            if request.topic.trim().is_empty() {
                server.ack_bad_request(&session, &request, "topic was null or empty");
                return;
            }
            next(server, session, request).await;
        })
    })
}

/// Rejects with 400 when `data` is absent or empty; otherwise parses it as
/// a JSON object and attaches the result for downstream handlers.
pub(crate) fn require_data(next: Handler) -> Handler {
    Arc::new(move |server, session, mut request| -> HandlerFuture {
        let next = next.clone();
        Box::pin(async move {
            let data = match request.data.as_ref() {
                None | Some(Value::Null) => {
                    server.ack_bad_request(&session, &request, "message data was null or empty");
                    return;
                }
                Some(data) => data,
            };

            let Some(object) = data.as_object() else {
                server.ack_bad_request(&session, &request, "data payload could not be parsed");
                return;
            };

            request.parsed_data = Some(object.clone());
            next(server, session, request).await;
        })
    })
}

/// Overwrites any client-supplied `senderId` with the server-known session
/// id, so downstream policy (sender exclusion) cannot be spoofed.
pub(crate) fn inject_sender_id(next: Handler) -> Handler {
    Arc::new(move |server, session, mut request| -> HandlerFuture {
        let next = next.clone();
        Box::pin(async move {
            request.sender_id = Some(session.id().to_string());
            next(server, session, request).await;
        })
    })
}
