use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tempfile::tempdir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tungstenite::protocol::Message as WsMessage;

use skein_session::Session;
use skein_storage::{
    AckReceiver, NullStorage, SledStorage, Storage, StorageError, StorageResult,
};

use crate::error::{BrokerError, PersistError};
use crate::message::{Delivery, Request};
use crate::schema::shapes_match;
use crate::topic::Topic;
use crate::TopicManager;

fn object(json: Value) -> Map<String, Value> {
    json.as_object().cloned().expect("test shape must be an object")
}

fn session(id: &str) -> (Arc<Session>, UnboundedReceiver<WsMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Session::new(id, tx)), rx)
}

fn request(id: &str, action: &str, topic: &str) -> Request {
    Request {
        id: id.to_string(),
        sender_id: None,
        action: action.to_string(),
        topic: topic.to_string(),
        data: None,
        require_ack: false,
        parsed_data: None,
    }
}

fn null_manager() -> (Arc<TopicManager>, mpsc::Receiver<Arc<Session>>) {
    TopicManager::new(Arc::new(NullStorage::new()))
}

fn recv_delivery(rx: &mut UnboundedReceiver<WsMessage>) -> Delivery {
    let frame = rx.try_recv().expect("expected a delivery frame");
    let WsMessage::Text(text) = frame else {
        panic!("expected a text frame");
    };
    serde_json::from_str(text.as_str()).expect("delivery should decode")
}

// --- schema matching ---

#[test]
fn shapes_match_ignores_scalar_values() {
    let a = object(json!({"m": "", "n": 0}));
    let b = object(json!({"m": "hello", "n": 42.5}));
    assert!(shapes_match(&a, &b));
}

#[test]
fn shapes_match_requires_same_property_names() {
    let a = object(json!({"m": ""}));
    let b = object(json!({"n": ""}));
    assert!(!shapes_match(&a, &b));

    let superset = object(json!({"m": "", "extra": 1}));
    assert!(!shapes_match(&a, &superset));
}

#[test]
fn shapes_match_recurses_into_objects() {
    let a = object(json!({"outer": {"inner": 0}}));
    let b = object(json!({"outer": {"inner": "text"}}));
    assert!(shapes_match(&a, &b));

    let different_inner = object(json!({"outer": {"other": 0}}));
    assert!(!shapes_match(&a, &different_inner));

    let scalar_outer = object(json!({"outer": 3}));
    assert!(!shapes_match(&a, &scalar_outer));
}

#[test]
fn shapes_match_treats_arrays_by_presence() {
    let a = object(json!({"items": [1, 2, 3]}));
    let b = object(json!({"items": ["strings", "now"]}));
    assert!(shapes_match(&a, &b));
}

// --- topic ---

#[test]
fn topic_starts_at_schema_version_zero() {
    let topic = Topic::new("sensors", object(json!({"x": 0})));
    assert_eq!(topic.latest_version(), 0);
    let schema = topic.latest_schema().unwrap();
    assert_eq!(schema.version, 0);
    assert_eq!(schema.schema, object(json!({"x": 0})));
}

#[test]
fn update_schema_is_monotone_and_keeps_history() {
    let topic = Topic::new("sensors", object(json!({"x": 0})));

    for i in 1..=3u32 {
        let version = topic.update_schema(object(json!({ "x": 0, "rev": i })));
        assert_eq!(version, i);
    }

    assert_eq!(topic.latest_version(), 3);
    for version in 0..=3 {
        assert_eq!(topic.schema_by_version(version).unwrap().version, version);
    }
    assert!(matches!(
        topic.schema_by_version(4),
        Err(BrokerError::NoSuchVersion { version: 4, .. })
    ));
}

#[test]
fn subscribe_is_idempotent_and_unsubscribe_of_non_member_fails() {
    let topic = Topic::new("sensors", object(json!({"x": 0})));
    let (s1, _rx) = session("c1");

    topic.subscribe(s1.clone());
    topic.subscribe(s1.clone());
    assert_eq!(topic.subscribers().len(), 1);

    topic.unsubscribe(&s1).unwrap();
    assert!(matches!(
        topic.unsubscribe(&s1),
        Err(BrokerError::NotSubscribed { .. })
    ));
    assert!(!topic.is_subscribed(&s1));
}

#[test]
fn publish_reports_closed_peers() {
    let topic = Topic::new("sensors", object(json!({"x": 0})));
    let (live, mut live_rx) = session("live");
    let (dead, dead_rx) = session("dead");
    topic.subscribe(live.clone());
    topic.subscribe(dead.clone());
    drop(dead_rx);

    let delivery = Delivery {
        id: "p1".to_string(),
        action: "publish".to_string(),
        topic: "sensors".to_string(),
        data: json!({"x": 1}),
    };
    let failed = topic.publish(&delivery, None);

    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id(), "dead");
    assert_eq!(recv_delivery(&mut live_rx).id, "p1");
}

// --- manager: registration ---

#[test]
fn register_topic_is_idempotent_for_matching_shapes() {
    let (manager, _failed) = null_manager();

    manager.register_topic("chat", object(json!({"m": ""}))).unwrap();
    let again = manager
        .register_topic("chat", object(json!({"m": "different scalar"})))
        .unwrap();

    assert_eq!(again.latest_version(), 0);
    assert_eq!(manager.topic_count(), 1);
}

#[test]
fn register_topic_rejects_differing_shapes() {
    let (manager, _failed) = null_manager();

    manager.register_topic("chat", object(json!({"m": ""}))).unwrap();
    assert!(matches!(
        manager.register_topic("chat", object(json!({"other": ""}))),
        Err(BrokerError::SchemaConflict(_))
    ));
}

#[tokio::test]
async fn register_unregister_register_roundtrips_to_version_zero() {
    let (manager, _failed) = null_manager();
    let shape = object(json!({"m": ""}));

    manager.register_topic("chat", shape.clone()).unwrap();
    manager.update_schema("chat", shape.clone()).unwrap();
    manager.unregister_topic("chat").await.unwrap();

    let topic = manager.register_topic("chat", shape).unwrap();
    assert_eq!(topic.latest_version(), 0);
}

#[tokio::test]
async fn unregister_unknown_topic_fails() {
    let (manager, _failed) = null_manager();
    assert!(matches!(
        manager.unregister_topic("ghost").await,
        Err(BrokerError::TopicNotFound(_))
    ));
}

// --- manager: subscriptions ---

#[test]
fn subscribe_requires_a_registered_topic() {
    let (manager, _failed) = null_manager();
    let (s1, _rx) = session("c1");
    assert!(matches!(
        manager.subscribe("ghost", s1),
        Err(BrokerError::TopicNotFound(_))
    ));
}

#[test]
fn unsubscribe_all_removes_session_from_every_topic() {
    let (manager, _failed) = null_manager();
    let (s1, _rx) = session("c1");

    for name in ["a", "b", "c"] {
        manager.register_topic(name, object(json!({"x": 0}))).unwrap();
        manager.subscribe(name, s1.clone()).unwrap();
    }
    manager.unsubscribe_all(&s1);

    for topic in manager.list_topics() {
        assert!(!topic.is_subscribed(&s1));
    }

    // A second pass is a no-op rather than an error.
    manager.unsubscribe_all(&s1);
}

#[test]
fn unsubscribe_twice_reports_not_subscribed() {
    let (manager, _failed) = null_manager();
    let (s1, _rx) = session("c1");

    manager.register_topic("chat", object(json!({"m": ""}))).unwrap();
    manager.subscribe("chat", s1.clone()).unwrap();
    manager.unsubscribe("chat", &s1).unwrap();
    assert!(matches!(
        manager.unsubscribe("chat", &s1),
        Err(BrokerError::NotSubscribed { .. })
    ));
}

// --- manager: publish ---

#[tokio::test]
async fn publish_fans_out_to_all_subscribers_including_sender() {
    let (manager, _failed) = null_manager();
    let (sender, mut sender_rx) = session("c1");
    let (subscriber, mut subscriber_rx) = session("c2");

    manager.register_topic("chat", object(json!({"m": ""}))).unwrap();
    manager.subscribe("chat", sender.clone()).unwrap();
    manager.subscribe("chat", subscriber.clone()).unwrap();

    let req = request("p1", "publish", "chat");
    manager
        .publish(&req, &sender, object(json!({"m": "hi"})), None)
        .await
        .unwrap();

    for rx in [&mut sender_rx, &mut subscriber_rx] {
        let delivery = recv_delivery(rx);
        assert_eq!(delivery.id, "p1");
        assert_eq!(delivery.action, "publish");
        assert_eq!(delivery.topic, "chat");
        assert_eq!(delivery.data, json!({"m": "hi"}));
    }
}

#[tokio::test]
async fn sender_exclusion_skips_the_publisher() {
    let (manager, _failed) =
        TopicManager::with_sender_exclusion(Arc::new(NullStorage::new()), true);
    let (sender, mut sender_rx) = session("c1");
    let (subscriber, mut subscriber_rx) = session("c2");

    manager.register_topic("chat", object(json!({"m": ""}))).unwrap();
    manager.subscribe("chat", sender.clone()).unwrap();
    manager.subscribe("chat", subscriber.clone()).unwrap();

    let req = request("p1", "publish", "chat");
    manager
        .publish(&req, &sender, object(json!({"m": "hi"})), None)
        .await
        .unwrap();

    assert!(sender_rx.try_recv().is_err());
    assert_eq!(recv_delivery(&mut subscriber_rx).id, "p1");
}

#[tokio::test]
async fn publish_to_unknown_topic_fails() {
    let (manager, _failed) = null_manager();
    let (sender, _rx) = session("c1");
    let req = request("p1", "publish", "ghost");
    assert!(matches!(
        manager.publish(&req, &sender, object(json!({"m": "hi"})), None).await,
        Err(BrokerError::TopicNotFound(_))
    ));
}

#[tokio::test]
async fn failed_subscribers_are_surfaced_on_the_failed_peer_channel() {
    let (manager, mut failed_rx) = null_manager();
    let (sender, _sender_rx) = session("c1");
    let (dead, dead_rx) = session("dead");

    manager.register_topic("chat", object(json!({"m": ""}))).unwrap();
    manager.subscribe("chat", dead.clone()).unwrap();
    drop(dead_rx);

    let req = request("p1", "publish", "chat");
    manager
        .publish(&req, &sender, object(json!({"m": "hi"})), None)
        .await
        .unwrap();

    let failed = failed_rx.try_recv().expect("expected a failed peer event");
    assert_eq!(failed.id(), "dead");
}

// --- manager: persistence ---

#[tokio::test]
async fn publish_then_get_roundtrips_through_storage() {
    let dir = tempdir().unwrap();
    let store = Arc::new(
        SledStorage::open(dir.path().to_str().unwrap(), CancellationToken::new()).unwrap(),
    );
    let (manager, _failed) = TopicManager::new(store);
    let (sender, _rx) = session("c1");

    manager.register_topic("chat", object(json!({"m": ""}))).unwrap();

    let (err_tx, err_rx) = oneshot::channel();
    let req = request("p1", "publish", "chat");
    manager
        .publish(&req, &sender, object(json!({"m": "hi"})), Some(err_tx))
        .await
        .unwrap();

    // The channel closing without a value is the success signal.
    assert!(err_rx.await.is_err());

    let value = manager.get("chat").await.unwrap().expect("value missing");
    assert_eq!(value, object(json!({"m": "hi"})));
}

#[tokio::test]
async fn get_on_never_published_topic_is_none() {
    let (manager, _failed) = null_manager();
    manager.register_topic("chat", object(json!({"m": ""}))).unwrap();
    assert!(manager.get("chat").await.unwrap().is_none());
}

#[tokio::test]
async fn get_on_unknown_topic_fails() {
    let (manager, _failed) = null_manager();
    assert!(matches!(
        manager.get("ghost").await,
        Err(BrokerError::TopicNotFound(_))
    ));
}

#[tokio::test]
async fn send_without_save_skips_storage_and_closes_the_error_channel() {
    // RefusingStorage fails every write, so a clean close of the error
    // channel proves the write path was never taken.
    let (manager, _failed) = TopicManager::new(Arc::new(RefusingStorage));
    let (sender, _sender_rx) = session("c1");
    let (subscriber, mut subscriber_rx) = session("c2");

    manager.register_topic("chat", object(json!({"m": ""}))).unwrap();
    manager.subscribe("chat", subscriber.clone()).unwrap();

    let (err_tx, err_rx) = oneshot::channel();
    let req = request("p1", "sendWithoutSave", "chat");
    manager
        .send_without_save(&req, &sender, object(json!({"m": "hi"})), Some(err_tx))
        .await
        .unwrap();

    assert!(err_rx.await.is_err());
    assert_eq!(recv_delivery(&mut subscriber_rx).action, "sendWithoutSave");
}

// --- test doubles for the persistence edge cases ---

/// Acknowledges every write with `QueueFull` and fails deletes.
#[derive(Debug)]
struct RefusingStorage;

#[async_trait]
impl Storage for RefusingStorage {
    fn async_put(
        &self,
        _key: &str,
        _value: &Map<String, Value>,
        _timestamp: DateTime<Utc>,
        _deadline: Instant,
    ) -> AckReceiver {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(StorageError::QueueFull));
        rx
    }

    async fn get(&self, _key: &str) -> StorageResult<Option<Map<String, Value>>> {
        Ok(None)
    }

    async fn delete(&self, _key: &str) -> StorageResult<()> {
        Err(StorageError::Closed)
    }

    async fn close(&self) {}
}

/// Holds every acknowledgment long past the persistence window.
#[derive(Debug)]
struct StuckStorage;

#[async_trait]
impl Storage for StuckStorage {
    fn async_put(
        &self,
        _key: &str,
        _value: &Map<String, Value>,
        _timestamp: DateTime<Utc>,
        _deadline: Instant,
    ) -> AckReceiver {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            let _ = tx.send(Ok(()));
        });
        rx
    }

    async fn get(&self, _key: &str) -> StorageResult<Option<Map<String, Value>>> {
        Ok(None)
    }

    async fn delete(&self, _key: &str) -> StorageResult<()> {
        Ok(())
    }

    async fn close(&self) {}
}

#[tokio::test]
async fn queue_full_is_forwarded_on_the_error_channel() {
    let (manager, _failed) = TopicManager::new(Arc::new(RefusingStorage));
    let (sender, _rx) = session("c1");
    manager.register_topic("chat", object(json!({"m": ""}))).unwrap();

    let (err_tx, err_rx) = oneshot::channel();
    let req = request("p1", "publish", "chat");
    manager
        .publish(&req, &sender, object(json!({"m": "hi"})), Some(err_tx))
        .await
        .unwrap();

    let err = err_rx.await.expect("expected a persistence error");
    assert!(matches!(err, PersistError::Storage(StorageError::QueueFull)));
}

#[tokio::test]
async fn slow_storage_reports_a_persist_timeout() {
    let (manager, _failed) = TopicManager::new(Arc::new(StuckStorage));
    let (sender, _rx) = session("c1");
    manager.register_topic("chat", object(json!({"m": ""}))).unwrap();

    let (err_tx, err_rx) = oneshot::channel();
    let req = request("p1", "publish", "chat");
    manager
        .publish(&req, &sender, object(json!({"m": "hi"})), Some(err_tx))
        .await
        .unwrap();

    let err = err_rx.await.expect("expected a persistence error");
    assert!(matches!(err, PersistError::Timeout));
}

#[tokio::test]
async fn failed_storage_delete_reports_a_partial_unregister() {
    let (manager, _failed) = TopicManager::new(Arc::new(RefusingStorage));
    manager.register_topic("chat", object(json!({"m": ""}))).unwrap();

    assert!(matches!(
        manager.unregister_topic("chat").await,
        Err(BrokerError::StoragePartial(_, _))
    ));
    // The in-memory removal stands.
    assert_eq!(manager.topic_count(), 0);
}

// --- manager: schema matching ---

#[test]
fn is_schema_match_checks_the_latest_schema() {
    let (manager, _failed) = null_manager();
    manager.register_topic("chat", object(json!({"m": ""}))).unwrap();

    assert!(manager.is_schema_match("chat", &object(json!({"m": "hi"}))).unwrap());
    assert!(!manager.is_schema_match("chat", &object(json!({"n": "no"}))).unwrap());

    manager.update_schema("chat", object(json!({"m": "", "tag": ""}))).unwrap();
    assert!(!manager.is_schema_match("chat", &object(json!({"m": "hi"}))).unwrap());
    assert!(manager
        .is_schema_match("chat", &object(json!({"m": "hi", "tag": "x"})))
        .unwrap());

    assert!(manager.is_schema_match("ghost", &object(json!({}))).is_err());
}
