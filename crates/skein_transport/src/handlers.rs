//! Action handlers and the dispatch table.
//!
//! Every recognized action maps to one handler wrapped in its decorator
//! chain. Ack shaping follows three rules: success without payload is sent
//! only when the request asked for an ack, success with payload is always
//! sent (the payload is the response), and errors are always sent.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use skein_broker::manager::PERSIST_TIMEOUT;
use skein_broker::message::Request;
use skein_broker::PersistError;
use skein_broker::schema::{SchemaDescriptor, TopicDescriptor};
use skein_session::Session;

use crate::decorators::{inject_sender_id, metrics, require_data, require_topic};
use crate::websocket::WebSocketServer;

/// Deadline for the storage-touching request handlers (`get`,
/// `unregisterTopic`) and for the publish-side persistence watcher.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub(crate) type Handler =
    Arc<dyn Fn(Arc<WebSocketServer>, Arc<Session>, Request) -> HandlerFuture + Send + Sync>;

fn boxed<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<WebSocketServer>, Arc<Session>, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |server, session, request| -> HandlerFuture {
        Box::pin(f(server, session, request))
    })
}

fn register(
    table: &mut HashMap<&'static str, Handler>,
    action: &'static str,
    handler: Handler,
    decorators: &[fn(Handler) -> Handler],
) {
    debug!(action, "registering handler");

    // Decorators are listed outermost first; fold from the right so the
    // first one listed runs first.
    let mut wrapped = handler;
    for decorate in decorators.iter().rev() {
        wrapped = decorate(wrapped);
    }
    table.insert(action, wrapped);
}

pub(crate) fn handler_table() -> HashMap<&'static str, Handler> {
    let mut table = HashMap::new();

    register(&mut table, "subscribe", boxed(subscribe), &[metrics, require_topic]);
    register(&mut table, "unsubscribe", boxed(unsubscribe), &[metrics, require_topic]);
    register(&mut table, "unsubscribeAll", boxed(unsubscribe_all), &[metrics]);
    register(
        &mut table,
        "publish",
        boxed(publish),
        &[metrics, inject_sender_id, require_data, require_topic],
    );
    register(
        &mut table,
        "sendWithoutSave",
        boxed(send_without_save),
        &[metrics, inject_sender_id, require_topic, require_data],
    );
    register(&mut table, "get", boxed(get), &[metrics, require_topic]);
    register(
        &mut table,
        "registerTopic",
        boxed(register_topic),
        &[metrics, require_data, require_topic],
    );
    register(
        &mut table,
        "unregisterTopic",
        boxed(unregister_topic),
        &[metrics, require_topic],
    );
    register(&mut table, "listTopics", boxed(list_topics), &[metrics]);
    register(
        &mut table,
        "updateSchema",
        boxed(update_schema),
        &[metrics, require_topic, require_data],
    );

    table
}

async fn subscribe(server: Arc<WebSocketServer>, session: Arc<Session>, request: Request) {
    match server.manager().subscribe(&request.topic, session.clone()) {
        Ok(()) => server.ack_success(&session, &request),
        Err(e) => server.ack_error(&session, &request, &e.to_string()),
    }
}

async fn unsubscribe(server: Arc<WebSocketServer>, session: Arc<Session>, request: Request) {
    match server.manager().unsubscribe(&request.topic, &session) {
        Ok(()) => server.ack_success(&session, &request),
        Err(e) => server.ack_error(&session, &request, &e.to_string()),
    }
}

async fn unsubscribe_all(server: Arc<WebSocketServer>, session: Arc<Session>, request: Request) {
    server.manager().unsubscribe_all(&session);
    server.ack_success(&session, &request);
}

async fn publish(server: Arc<WebSocketServer>, session: Arc<Session>, request: Request) {
    publish_inner(server, session, request, true).await;
}

async fn send_without_save(server: Arc<WebSocketServer>, session: Arc<Session>, request: Request) {
    publish_inner(server, session, request, false).await;
}

async fn publish_inner(
    server: Arc<WebSocketServer>,
    session: Arc<Session>,
    request: Request,
    persist: bool,
) {
    let Some(value) = request.parsed_data.clone() else {
        server.ack_bad_request(&session, &request, "data payload could not be parsed");
        return;
    };

    match server.manager().is_schema_match(&request.topic, &value) {
        Ok(true) => {}
        Ok(false) => {
            server.ack_bad_request(
                &session,
                &request,
                "schema doesn't match topics current schema",
            );
            return;
        }
        Err(e) => {
            server.ack_bad_request(&session, &request, &e.to_string());
            return;
        }
    }

    // Persistence failures arrive out of band on this channel; the watcher
    // turns them into a separate persist-error frame so the fan-out ack and
    // the storage outcome stay independent.
    let (err_tx, err_rx) = oneshot::channel::<PersistError>();
    {
        let server = server.clone();
        let session = session.clone();
        let request = request.clone();
        tokio::spawn(async move {
            match timeout(PERSIST_TIMEOUT, err_rx).await {
                Ok(Ok(error)) => {
                    server.ack_persist_error(&session, &request, &error.to_string());
                }
                // Channel closed without a value: persistence succeeded or
                // was not requested.
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(
                        topic = %request.topic,
                        client = %session.id(),
                        "timed out waiting for the persistence outcome"
                    );
                    server.ack_persist_error(&session, &request, "timeout when persisting");
                }
            }
        });
    }

    let manager = server.manager();
    let result = if persist {
        manager.publish(&request, &session, value, Some(err_tx)).await
    } else {
        manager
            .send_without_save(&request, &session, value, Some(err_tx))
            .await
    };

    match result {
        Ok(()) => server.ack_success(&session, &request),
        Err(e) => server.ack_error(&session, &request, &e.to_string()),
    }
}

async fn get(server: Arc<WebSocketServer>, session: Arc<Session>, request: Request) {
    match timeout(REQUEST_TIMEOUT, server.manager().get(&request.topic)).await {
        Err(_) => server.ack_error(&session, &request, "timed out getting value for topic"),
        Ok(Err(e)) => server.ack_error(&session, &request, &e.to_string()),
        Ok(Ok(value)) => {
            // The payload is the response, so it is sent even without an
            // ack request; an unwritten topic reads as null.
            let data = value.map(Value::Object).unwrap_or(Value::Null);
            server.ack_success_with_data(&session, &request, &data);
        }
    }
}

async fn register_topic(server: Arc<WebSocketServer>, session: Arc<Session>, request: Request) {
    let Some(schema) = request.parsed_data.clone() else {
        server.ack_bad_request(&session, &request, "data payload could not be parsed");
        return;
    };

    match server.manager().register_topic(&request.topic, schema) {
        Err(e) => server.ack_error(&session, &request, &e.to_string()),
        Ok(topic) => {
            // Explicit requireAck check: the descriptor response is opt-in.
            if request.require_ack {
                match topic.describe() {
                    Ok(descriptor) => {
                        server.ack_success_with_data(&session, &request, &descriptor)
                    }
                    Err(e) => server.ack_error(&session, &request, &e.to_string()),
                }
            }
        }
    }
}

async fn unregister_topic(server: Arc<WebSocketServer>, session: Arc<Session>, request: Request) {
    match timeout(REQUEST_TIMEOUT, server.manager().unregister_topic(&request.topic)).await {
        Err(_) => server.ack_error(&session, &request, "timed out unregistering topic"),
        Ok(Err(e)) => server.ack_error(&session, &request, &e.to_string()),
        Ok(Ok(())) => server.ack_success(&session, &request),
    }
}

async fn list_topics(server: Arc<WebSocketServer>, session: Arc<Session>, request: Request) {
    let topics = server.manager().list_topics();
    let mut descriptors = Vec::with_capacity(topics.len());

    for topic in topics {
        match topic.describe() {
            Ok(descriptor) => descriptors.push(descriptor),
            Err(e) => {
                // One unreadable schema must not fail the whole listing.
                warn!(topic = %topic.name(), error = %e, "could not read schema while listing topics");
                descriptors.push(TopicDescriptor {
                    name: topic.name().to_string(),
                    schema: SchemaDescriptor::default(),
                });
            }
        }
    }

    server.ack_success_with_data(&session, &request, &descriptors);
}

async fn update_schema(server: Arc<WebSocketServer>, session: Arc<Session>, request: Request) {
    let Some(schema) = request.parsed_data.clone() else {
        server.ack_bad_request(&session, &request, "data payload could not be parsed");
        return;
    };

    match server.manager().update_schema(&request.topic, schema) {
        Err(e) => server.ack_error(&session, &request, &e.to_string()),
        Ok(_) => server.ack_success(&session, &request),
    }
}
