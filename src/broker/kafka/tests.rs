use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc as tokio_mpsc;

use super::*;
use crate::broker::dead_letter::{FAILURE_REASON_HEADER, ORIGINAL_TOPIC_HEADER, RETRY_COUNT_HEADER};
use crate::broker::memory::MemoryLog;
use crate::message::HandlerError;

fn policy() -> ConnectionPolicy {
    ConnectionPolicy {
        max_retries: 3,
        retry_interval_ms: 10,
        timeout_ms: 1_000,
    }
}

fn adapter(log: &MemoryLog) -> Arc<KafkaAdapter<MemoryLog>> {
    Arc::new(KafkaAdapter::new(KafkaConfig::default(), policy(), log.clone()))
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

fn recording(topic: &str, seen: Arc<StdMutex<Vec<Value>>>) -> MessageSubscription {
    MessageSubscription::new(topic, move |msg: EventMessage<Value>| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push(msg.value);
            Ok::<(), HandlerError>(())
        }
    })
}

fn failing(topic: &str, calls: Arc<StdMutex<u32>>) -> MessageSubscription {
    MessageSubscription::new(topic, move |_msg: EventMessage<Value>| {
        let calls = calls.clone();
        async move {
            *calls.lock().unwrap() += 1;
            Err::<(), HandlerError>("handler exploded".into())
        }
    })
}

#[tokio::test]
async fn test_publish_before_connect_connects_and_delivers() {
    let log = MemoryLog::new();
    let kafka = adapter(&log);

    kafka
        .publish(EventMessage::new("orders", json!({"id": 1})))
        .await
        .unwrap();

    assert_eq!(kafka.connection_state(), ConnectionState::Connected);
    let records = log.records("orders");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].json(), Some(json!({"id": 1})));
}

#[tokio::test]
async fn test_pending_publishes_drain_in_order() {
    let log = MemoryLog::new();
    log.fail_next_connects(2);
    let kafka = adapter(&log);

    let (a, b, c) = futures::join!(
        kafka.publish(EventMessage::new("orders", json!(1))),
        kafka.publish(EventMessage::new("orders", json!(2))),
        kafka.publish(EventMessage::new("orders", json!(3))),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    let values: Vec<_> = log.records("orders").iter().filter_map(|r| r.json()).collect();
    assert_eq!(values, vec![json!(1), json!(2), json!(3)]);
    assert_eq!(kafka.pending_len(), 0);
}

#[tokio::test]
async fn test_publish_retries_transient_send_failures() {
    let log = MemoryLog::new();
    let kafka = adapter(&log);
    kafka.connect().await.unwrap();

    log.fail_next_sends(2);
    kafka
        .publish(EventMessage::new("orders", json!("x")))
        .await
        .unwrap();
    assert_eq!(log.records("orders").len(), 1);
}

#[tokio::test]
async fn test_publish_fails_after_retry_budget() {
    let log = MemoryLog::new();
    let kafka = adapter(&log);
    kafka.connect().await.unwrap();

    log.fail_next_sends(10);
    let err = kafka
        .publish(EventMessage::new("orders", json!("x")).with_retries(1))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Publish(_)));
    assert!(log.records("orders").is_empty());
}

#[tokio::test]
async fn test_disconnect_rejects_pending_publishes() {
    let log = MemoryLog::new();
    log.fail_next_connects(1_000);
    let kafka = Arc::new(KafkaAdapter::new(
        KafkaConfig::default(),
        ConnectionPolicy {
            max_retries: 1_000,
            ..policy()
        },
        log.clone(),
    ));

    let publisher = {
        let kafka = kafka.clone();
        tokio::spawn(async move { kafka.publish(EventMessage::new("orders", json!(1))).await })
    };
    eventually(|| kafka.pending_len() == 1).await;

    kafka.disconnect().await.unwrap();
    let result = publisher.await.unwrap();
    assert!(matches!(result, Err(BrokerError::Disconnected)));
    assert_eq!(kafka.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_connect_gives_up_after_max_retries() {
    let log = MemoryLog::new();
    log.fail_next_connects(100);
    let kafka = adapter(&log);

    let err = kafka.connect().await.unwrap_err();
    assert!(matches!(err, BrokerError::Connection(_)));
    assert_eq!(kafka.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_publish_fails_once_connect_gives_up() {
    let log = MemoryLog::new();
    log.fail_next_connects(1000);
    let kafka = adapter(&log);

    let outcome = tokio::time::timeout(
        Duration::from_secs(20),
        kafka.publish(EventMessage::new("orders", json!(1))),
    )
    .await
    .expect("publish must not hang");
    assert!(matches!(outcome, Err(BrokerError::Connection(_))), "got {:?}", outcome);
    assert_eq!(kafka.pending_len(), 0);
    assert!(log.records("orders").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_publish_fails_once_producer_rebuild_gives_up() {
    let log = MemoryLog::new();
    let kafka = adapter(&log);
    kafka.connect().await.unwrap();

    log.fail_next_connects(1000);
    log.drop_producer();
    eventually(|| !kafka.inner.producer_ready()).await;

    let outcome = tokio::time::timeout(
        Duration::from_secs(20),
        kafka.publish(EventMessage::new("orders", json!(1))),
    )
    .await
    .expect("publish must not hang");
    assert!(matches!(outcome, Err(BrokerError::Connection(_))), "got {:?}", outcome);
    assert_eq!(kafka.pending_len(), 0);
}

#[tokio::test]
async fn test_batch_is_all_or_nothing() {
    let log = MemoryLog::new();
    let kafka = adapter(&log);
    kafka.connect().await.unwrap();

    log.fail_transaction_after(1);
    let err = kafka
        .publish_batch(vec![
            EventMessage::new("a", json!(1)),
            EventMessage::new("b", json!(2)),
            EventMessage::new("a", json!(3)),
        ])
        .await;
    assert!(err.is_err());
    assert!(log.records("a").is_empty());
    assert!(log.records("b").is_empty());
}

#[tokio::test]
async fn test_batch_commits_every_topic() {
    let log = MemoryLog::new();
    let kafka = adapter(&log);
    kafka.connect().await.unwrap();

    kafka
        .publish_batch(vec![
            EventMessage::new("a", json!(1)),
            EventMessage::new("b", json!(2)),
            EventMessage::new("a", json!(3)),
        ])
        .await
        .unwrap();

    let a: Vec<_> = log.records("a").iter().filter_map(|r| r.json()).collect();
    assert_eq!(a, vec![json!(1), json!(3)]);
    assert_eq!(log.records("b").len(), 1);
}

#[tokio::test]
async fn test_second_group_is_rejected() {
    let log = MemoryLog::new();
    let kafka = adapter(&log);
    let seen = Arc::new(StdMutex::new(Vec::new()));

    kafka
        .subscribe(vec![recording("orders", seen.clone())], SubscribeOptions::new("g1"))
        .await
        .unwrap();
    let err = kafka
        .subscribe(vec![recording("payments", seen)], SubscribeOptions::new("g2"))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Subscribe(msg) if msg.contains("g1")));
}

#[tokio::test]
async fn test_consumed_message_is_committed() {
    let log = MemoryLog::new();
    let kafka = adapter(&log);
    let seen = Arc::new(StdMutex::new(Vec::new()));

    kafka
        .subscribe(vec![recording("orders", seen.clone())], SubscribeOptions::new("g"))
        .await
        .unwrap();
    kafka
        .publish(EventMessage::new("orders", json!({"id": 7})))
        .await
        .unwrap();

    eventually(|| log.committed("g", "orders", 0) == Some(1)).await;
    assert_eq!(*seen.lock().unwrap(), vec![json!({"id": 7})]);
    assert_eq!(kafka.committed_position("orders", 0), Some(1));
}

#[tokio::test]
async fn test_handler_failure_retries_then_dead_letters() {
    let log = MemoryLog::new();
    let kafka = adapter(&log);
    let calls = Arc::new(StdMutex::new(0));

    kafka
        .subscribe(
            vec![failing("orders", calls.clone())],
            SubscribeOptions::new("g").with_retry(2, Duration::from_millis(5)),
        )
        .await
        .unwrap();
    kafka
        .publish(EventMessage::new("orders", json!({"id": 1})).with_key("k"))
        .await
        .unwrap();

    eventually(|| log.records("g-dead-letter").len() == 1).await;

    let dead = &log.records("g-dead-letter")[0];
    assert_eq!(dead.headers[FAILURE_REASON_HEADER], "MAX_RETRIES_EXCEEDED");
    assert_eq!(dead.headers[ORIGINAL_TOPIC_HEADER], "orders");
    assert_eq!(dead.headers[RETRY_COUNT_HEADER], "2");
    assert_eq!(dead.key.as_deref(), Some("k"));
    assert_eq!(dead.json(), Some(json!({"id": 1})));

    // Original plus two redeliveries on the same topic.
    let counts: Vec<_> = log
        .records("orders")
        .iter()
        .map(|r| r.headers.get(RETRY_COUNT_HEADER).cloned())
        .collect();
    assert_eq!(counts, vec![None, Some("1".into()), Some("2".into())]);
    assert_eq!(*calls.lock().unwrap(), 3);
    eventually(|| log.committed("g", "orders", 0) == Some(3)).await;
}

#[tokio::test]
async fn test_unparseable_payload_never_reaches_handler() {
    let log = MemoryLog::new();
    let kafka = adapter(&log);
    let calls = Arc::new(StdMutex::new(0));

    kafka
        .subscribe(
            vec![failing("orders", calls.clone())],
            SubscribeOptions::new("g").with_retry(3, Duration::from_millis(5)),
        )
        .await
        .unwrap();

    let (faults, _rx) = tokio_mpsc::unbounded_channel();
    let producer = log.producer(faults).await.unwrap();
    producer
        .send(&OutboundRecord {
            topic: "orders".to_string(),
            key: None,
            payload: b"{not json".to_vec(),
            headers: Default::default(),
            partition: None,
            timestamp: None,
        })
        .await
        .unwrap();

    eventually(|| log.records("g-dead-letter").len() == 1).await;
    let dead = &log.records("g-dead-letter")[0];
    assert_eq!(dead.headers[FAILURE_REASON_HEADER], "PARSE_ERROR");
    assert_eq!(dead.payload, b"{not json".to_vec());
    assert_eq!(*calls.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_consumer_crash_is_rebuilt_from_committed_position() {
    let log = MemoryLog::new();
    let kafka = adapter(&log);
    let seen = Arc::new(StdMutex::new(Vec::new()));

    kafka
        .subscribe(vec![recording("orders", seen.clone())], SubscribeOptions::new("g"))
        .await
        .unwrap();
    kafka.publish(EventMessage::new("orders", json!(1))).await.unwrap();
    eventually(|| log.committed("g", "orders", 0) == Some(1)).await;

    log.crash_consumer();
    eventually(|| log.consumers_created() == 2).await;
    eventually(|| kafka.component_states().2 == ComponentState::Connected).await;

    kafka.publish(EventMessage::new("orders", json!(2))).await.unwrap();
    eventually(|| seen.lock().unwrap().len() == 2).await;
    assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2)]);
}

#[tokio::test]
async fn test_producer_fault_reconnects() {
    let log = MemoryLog::new();
    let kafka = adapter(&log);
    kafka.connect().await.unwrap();

    log.drop_producer();
    eventually(|| kafka.component_states().0 == ComponentState::Connected && kafka.inner.producer_ready()).await;

    kafka.publish(EventMessage::new("orders", json!(1))).await.unwrap();
    assert_eq!(log.records("orders").len(), 1);
}

#[tokio::test]
async fn test_unsubscribe_pauses_and_resubscribe_resumes() {
    let log = MemoryLog::new();
    let kafka = adapter(&log);
    let seen = Arc::new(StdMutex::new(Vec::new()));

    kafka
        .subscribe(vec![recording("orders", seen.clone())], SubscribeOptions::new("g"))
        .await
        .unwrap();
    kafka.unsubscribe(&[Topic::new("orders")]).await.unwrap();
    kafka.publish(EventMessage::new("orders", json!(1))).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(seen.lock().unwrap().is_empty());

    kafka.resubscribe(&[Topic::new("orders")]).await.unwrap();
    eventually(|| seen.lock().unwrap().len() == 1).await;
}

#[tokio::test]
async fn test_manual_acknowledge_is_monotonic() {
    let log = MemoryLog::new();
    let kafka = adapter(&log);
    let received = Arc::new(StdMutex::new(Vec::new()));

    let sink = received.clone();
    let sub = MessageSubscription::new("orders", move |msg: EventMessage<Value>| {
        let sink = sink.clone();
        async move {
            if let Some(meta) = msg.metadata {
                sink.lock().unwrap().push(meta);
            }
            Ok::<(), HandlerError>(())
        }
    });
    kafka
        .subscribe(vec![sub], SubscribeOptions::new("g").with_auto_commit(false))
        .await
        .unwrap();
    kafka.publish(EventMessage::new("orders", json!(1))).await.unwrap();
    kafka.publish(EventMessage::new("orders", json!(2))).await.unwrap();
    eventually(|| received.lock().unwrap().len() == 2).await;
    assert_eq!(log.committed("g", "orders", 0), None);

    let metas = received.lock().unwrap().clone();
    kafka.acknowledge(&metas[1]).await.unwrap();
    kafka.acknowledge(&metas[0]).await.unwrap();
    assert_eq!(log.committed("g", "orders", 0), Some(2));
    assert_eq!(kafka.committed_position("orders", 0), Some(2));
}

#[tokio::test]
async fn test_stale_acknowledge_after_reconnect_keeps_position() {
    let log = MemoryLog::new();
    let kafka = adapter(&log);
    let received = Arc::new(StdMutex::new(Vec::new()));

    let sink = received.clone();
    let handler = move |msg: EventMessage<Value>| {
        let sink = sink.clone();
        async move {
            if let Some(meta) = msg.metadata {
                sink.lock().unwrap().push(meta);
            }
            Ok::<(), HandlerError>(())
        }
    };
    let options = SubscribeOptions::new("g").with_auto_commit(false);
    kafka
        .subscribe(
            vec![MessageSubscription::new("orders", handler.clone())],
            options.clone(),
        )
        .await
        .unwrap();
    for i in 0..10 {
        kafka.publish(EventMessage::new("orders", json!(i))).await.unwrap();
    }
    eventually(|| received.lock().unwrap().len() == 10).await;

    let metas = received.lock().unwrap().clone();
    kafka.acknowledge(&metas[9]).await.unwrap();
    assert_eq!(log.committed("g", "orders", 0), Some(10));

    kafka.disconnect().await.unwrap();
    kafka
        .subscribe(vec![MessageSubscription::new("orders", handler)], options)
        .await
        .unwrap();

    kafka.acknowledge(&metas[2]).await.unwrap();
    assert_eq!(log.committed("g", "orders", 0), Some(10));
    assert_eq!(kafka.committed_position("orders", 0), Some(10));
}

#[tokio::test]
async fn test_acknowledge_rejects_non_numeric_offset() {
    let log = MemoryLog::new();
    let kafka = adapter(&log);
    let err = kafka
        .acknowledge(&EventMessageMetadata::new("orders", 0, "nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidOffset(_)));
}

#[tokio::test]
async fn test_create_topics_is_idempotent() {
    let log = MemoryLog::new();
    let kafka = adapter(&log);
    let topic = Topic::new("orders").with_config(crate::message::TopicConfig {
        num_partitions: Some(3),
        ..Default::default()
    });

    kafka.create_topics(&[topic.clone()]).await.unwrap();
    kafka.create_topics(&[topic]).await.unwrap();
    assert_eq!(log.topic_names(), vec!["orders".to_string()]);
    assert_eq!(log.topic_config("orders").unwrap().num_partitions, Some(3));

    kafka.delete_topics(&[Topic::new("orders")]).await.unwrap();
    assert!(log.topic_names().is_empty());
}

#[tokio::test]
async fn test_health_tracks_connection() {
    let log = MemoryLog::new();
    let kafka = adapter(&log);
    assert!(!kafka.health_check().await);

    kafka.connect().await.unwrap();
    assert!(kafka.health_check().await);

    kafka.disconnect().await.unwrap();
    assert!(!kafka.health_check().await);
}
