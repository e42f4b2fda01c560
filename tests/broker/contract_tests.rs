//! BrokerDriver contract tests.
//!
//! These tests verify the behaviour every adapter promises regardless of
//! transport. Each test uses its own topic and group names.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use switchyard::broker::dead_letter::{FAILURE_REASON_HEADER, ORIGINAL_TOPIC_HEADER};
use switchyard::{
    BrokerError, EventMessage, EventMessageMetadata, HandlerError, MessageSubscription,
    SubscribeOptions, Topic,
};

use super::{eventually, BrokerHarness};

fn recording(topic: &str, seen: Arc<Mutex<Vec<Value>>>) -> MessageSubscription {
    MessageSubscription::new(topic, move |msg: EventMessage<Value>| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push(msg.value);
            Ok::<(), HandlerError>(())
        }
    })
}

/// Fails the first `failures` calls, then succeeds.
fn flaky(topic: &str, failures: usize, calls: Arc<Mutex<usize>>) -> MessageSubscription {
    MessageSubscription::new(topic, move |_msg: EventMessage<Value>| {
        let calls = calls.clone();
        async move {
            let mut calls = calls.lock().unwrap();
            *calls += 1;
            if *calls <= failures {
                Err::<(), HandlerError>(format!("failure {}", *calls).into())
            } else {
                Ok(())
            }
        }
    })
}

// =============================================================================
// Publishing
// =============================================================================

/// Publishes issued while disconnected reach the transport in issue order.
pub async fn test_pending_publishes_drain_in_order<H: BrokerHarness>(harness: &H) {
    let broker = harness.broker();
    harness.refuse_connections(2);

    let (a, b, c) = futures::join!(
        broker.publish(EventMessage::new("contract.fifo", json!(1))),
        broker.publish(EventMessage::new("contract.fifo", json!(2))),
        broker.publish(EventMessage::new("contract.fifo", json!(3))),
    );
    a.expect("first publish");
    b.expect("second publish");
    c.expect("third publish");

    assert_eq!(
        harness.published("contract.fifo"),
        vec![json!(1), json!(2), json!(3)],
        "pending publishes must drain FIFO"
    );
    broker.disconnect().await.unwrap();
}

/// A failed batch leaves nothing visible on a log transport. A queue
/// transport only guarantees the outcome at confirm time: messages confirmed
/// before the failure stay published.
pub async fn test_failed_batch_visibility<H: BrokerHarness>(harness: &H) {
    let broker = harness.broker();
    broker.connect().await.unwrap();
    broker
        .create_topics(&[Topic::new("contract.batch.a"), Topic::new("contract.batch.b")])
        .await
        .unwrap();

    harness.fail_next_batch();
    let batch: Vec<_> = (0..5)
        .map(|i| {
            let topic = if i % 2 == 0 { "contract.batch.a" } else { "contract.batch.b" };
            EventMessage::new(topic, json!(i))
        })
        .collect();

    let err = broker.publish_batch(batch).await.unwrap_err();
    assert!(matches!(err, BrokerError::Publish(_)), "got {:?}", err);

    let visible =
        harness.published("contract.batch.a").len() + harness.published("contract.batch.b").len();
    if harness.atomic_batches() {
        assert_eq!(visible, 0, "transactional batch must be all-or-nothing");
    } else {
        assert_eq!(visible, 2, "messages confirmed before the failure stay published");
    }
    broker.disconnect().await.unwrap();
}

// =============================================================================
// Consuming
// =============================================================================

/// A handler that fails twice then succeeds is called exactly three times
/// and nothing is dead-lettered.
pub async fn test_retry_then_success<H: BrokerHarness>(harness: &H) {
    let broker = harness.broker();
    let calls = Arc::new(Mutex::new(0));

    broker
        .subscribe(
            vec![flaky("contract.retry", 2, calls.clone())],
            SubscribeOptions::new("contract-retry").with_retry(2, Duration::from_millis(100)),
        )
        .await
        .unwrap();
    broker
        .publish(EventMessage::new("contract.retry", json!({"n": 1})))
        .await
        .unwrap();

    eventually("three handler calls", || *calls.lock().unwrap() == 3).await;
    eventually("final settle", || harness.settled("contract-retry", "contract.retry")).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(*calls.lock().unwrap(), 3);
    assert!(harness.dead_letters("contract-retry").is_empty());
    broker.disconnect().await.unwrap();
}

/// A handler that always fails is called `1 + max_retries` times, then the
/// message is dead-lettered exactly once.
pub async fn test_exhausted_retries_dead_letter<H: BrokerHarness>(harness: &H) {
    let broker = harness.broker();
    let calls = Arc::new(Mutex::new(0));

    broker
        .subscribe(
            vec![flaky("contract.dead", usize::MAX, calls.clone())],
            SubscribeOptions::new("contract-dead").with_retry(2, Duration::from_millis(100)),
        )
        .await
        .unwrap();
    broker
        .publish(EventMessage::new("contract.dead", json!({"n": 1})))
        .await
        .unwrap();

    eventually("dead letter", || harness.dead_letters("contract-dead").len() == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(*calls.lock().unwrap(), 3);
    let dead = harness.dead_letters("contract-dead");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0][FAILURE_REASON_HEADER], "MAX_RETRIES_EXCEEDED");
    assert_eq!(dead[0][ORIGINAL_TOPIC_HEADER], "contract.dead");
    broker.disconnect().await.unwrap();
}

/// A malformed payload never reaches the handler and is dead-lettered on
/// its first delivery.
pub async fn test_parse_errors_skip_handler<H: BrokerHarness>(harness: &H) {
    let broker = harness.broker();
    let calls = Arc::new(Mutex::new(0));

    broker
        .subscribe(
            vec![flaky("contract.parse", 0, calls.clone())],
            SubscribeOptions::new("contract-parse").with_retry(3, Duration::from_millis(10)),
        )
        .await
        .unwrap();
    harness.inject_raw("contract.parse", b"{not json").await;

    eventually("parse dead letter", || harness.dead_letters("contract-parse").len() == 1).await;
    assert_eq!(harness.dead_letters("contract-parse")[0][FAILURE_REASON_HEADER], "PARSE_ERROR");
    assert_eq!(*calls.lock().unwrap(), 0);
    broker.disconnect().await.unwrap();
}

/// With auto-commit off, messages are settled only by `acknowledge`.
pub async fn test_manual_acknowledge<H: BrokerHarness>(harness: &H) {
    let broker = harness.broker();
    let received = Arc::new(Mutex::new(Vec::<EventMessageMetadata>::new()));

    let sink = received.clone();
    let sub = MessageSubscription::new("contract.ack", move |msg: EventMessage<Value>| {
        let sink = sink.clone();
        async move {
            if let Some(metadata) = msg.metadata {
                sink.lock().unwrap().push(metadata);
            }
            Ok::<(), HandlerError>(())
        }
    });
    broker
        .subscribe(vec![sub], SubscribeOptions::new("contract-ack").with_auto_commit(false))
        .await
        .unwrap();

    for i in 0..2 {
        broker
            .publish(EventMessage::new("contract.ack", json!(i)))
            .await
            .unwrap();
    }

    for i in 0..2 {
        eventually("delivery", || received.lock().unwrap().len() > i).await;
        assert!(!harness.settled("contract-ack", "contract.ack"));
        let metadata = received.lock().unwrap()[i].clone();
        assert_eq!(metadata.topic, "contract.ack");
        broker.acknowledge_msg(&metadata).await.unwrap();
    }

    eventually("settled", || harness.settled("contract-ack", "contract.ack")).await;
    broker.disconnect().await.unwrap();
}

pub async fn test_acknowledge_rejects_garbage_offset<H: BrokerHarness>(harness: &H) {
    let broker = harness.broker();
    broker.connect().await.unwrap();

    let err = broker
        .acknowledge_msg(&EventMessageMetadata::new("contract.ack", 0, "not-a-number"))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidOffset(_)), "got {:?}", err);
    broker.disconnect().await.unwrap();
}

/// Unsubscribed topics stop delivering; resubscribing resumes them without
/// losing what was published in between.
pub async fn test_unsubscribe_and_resubscribe<H: BrokerHarness>(harness: &H) {
    let broker = harness.broker();
    let seen = Arc::new(Mutex::new(Vec::new()));

    broker
        .subscribe(
            vec![recording("contract.pause", seen.clone())],
            SubscribeOptions::new("contract-pause"),
        )
        .await
        .unwrap();
    broker.unsubscribe("contract.pause").await.unwrap();
    broker
        .publish(EventMessage::new("contract.pause", json!("parked")))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(seen.lock().unwrap().is_empty(), "paused topic must not deliver");

    broker.re_subscribe("contract.pause").await.unwrap();
    eventually("resumed delivery", || seen.lock().unwrap().len() == 1).await;
    assert_eq!(seen.lock().unwrap()[0], json!("parked"));
    broker.disconnect().await.unwrap();
}

// =============================================================================
// Administration
// =============================================================================

pub async fn test_create_topics_is_idempotent<H: BrokerHarness>(harness: &H) {
    let broker = harness.broker();
    let topics = [Topic::new("contract.admin")];

    broker.create_topics(&topics).await.unwrap();
    broker.create_topics(&topics).await.unwrap();
    assert!(harness.topic_exists("contract.admin"));

    broker.delete_topics(&topics).await.unwrap();
    assert!(!harness.topic_exists("contract.admin"));
    broker.disconnect().await.unwrap();
}

pub async fn test_health_follows_connection<H: BrokerHarness>(harness: &H) {
    let broker = harness.broker();
    assert!(!broker.health_check().await, "unhealthy before connect");

    broker.connect().await.unwrap();
    assert!(broker.is_connected());
    assert!(broker.health_check().await, "healthy once connected");

    broker.disconnect().await.unwrap();
    assert!(!broker.health_check().await, "unhealthy after disconnect");
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run every contract test, each against a fresh harness built by `$make`.
#[macro_export]
macro_rules! run_broker_contract_tests {
    ($make:expr) => {
        use $crate::broker::contract_tests::*;

        test_pending_publishes_drain_in_order(&$make).await;
        println!("  test_pending_publishes_drain_in_order: PASSED");

        test_failed_batch_visibility(&$make).await;
        println!("  test_failed_batch_visibility: PASSED");

        test_retry_then_success(&$make).await;
        println!("  test_retry_then_success: PASSED");

        test_exhausted_retries_dead_letter(&$make).await;
        println!("  test_exhausted_retries_dead_letter: PASSED");

        test_parse_errors_skip_handler(&$make).await;
        println!("  test_parse_errors_skip_handler: PASSED");

        test_manual_acknowledge(&$make).await;
        println!("  test_manual_acknowledge: PASSED");

        test_acknowledge_rejects_garbage_offset(&$make).await;
        println!("  test_acknowledge_rejects_garbage_offset: PASSED");

        test_unsubscribe_and_resubscribe(&$make).await;
        println!("  test_unsubscribe_and_resubscribe: PASSED");

        test_create_topics_is_idempotent(&$make).await;
        println!("  test_create_topics_is_idempotent: PASSED");

        test_health_follows_connection(&$make).await;
        println!("  test_health_follows_connection: PASSED");
    };
}
