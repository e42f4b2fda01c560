//! Kafka adapter integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_kafka --features kafka -- --ignored --nocapture
//!
//! Uses Redpanda, which speaks the Kafka protocol and starts in seconds.

#![cfg(feature = "kafka")]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use testcontainers::{
    core::{ContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

use switchyard::broker::dead_letter::{FAILURE_REASON_HEADER, ORIGINAL_TOPIC_HEADER};
use switchyard::{
    create_broker, BrokerConfig, BrokerKind, ConnectionPolicy, DynBroker, EventMessage,
    EventMessageMetadata, HandlerError, KafkaConfig, MessageSubscription, SubscribeOptions, Topic,
    TopicConfig,
};

/// Pick a host port in 29000-29999 from the thread id and clock.
fn generate_test_port() -> u16 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos()
        .hash(&mut hasher);

    29000 + (hasher.finish() % 1000) as u16
}

/// Start Redpanda with a fixed port mapping.
///
/// Clients follow the advertised address from metadata, so the advertised
/// listener must match the host port.
async fn start_kafka() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let host_port = generate_test_port();
    let advertised_addr = format!("localhost:{}", host_port);

    // with_wait_for must come before with_mapped_port
    let image = GenericImage::new("redpandadata/redpanda", "v24.1.1")
        .with_wait_for(WaitFor::message_on_stderr("Successfully started Redpanda"));

    let container = image
        .with_mapped_port(host_port, ContainerPort::Tcp(9092))
        .with_cmd([
            "redpanda",
            "start",
            "--mode",
            "dev-container",
            "--smp",
            "1",
            "--memory",
            "512M",
            "--overprovisioned",
            "--kafka-addr",
            "0.0.0.0:9092",
            "--advertise-kafka-addr",
            &advertised_addr,
        ])
        .with_startup_timeout(Duration::from_secs(120))
        .start()
        .await
        .expect("Failed to start Redpanda container");

    tokio::time::sleep(Duration::from_secs(3)).await;

    let bootstrap_servers = format!("localhost:{}", host_port);
    println!("Kafka available at: {}", bootstrap_servers);

    (container, bootstrap_servers)
}

fn kafka_broker(bootstrap: &str, client_id: &str) -> DynBroker {
    let config = BrokerConfig {
        kind: BrokerKind::Kafka,
        kafka: KafkaConfig {
            brokers: vec![bootstrap.to_string()],
            client_id: client_id.to_string(),
            ..Default::default()
        },
        connection: ConnectionPolicy {
            max_retries: 5,
            retry_interval_ms: 500,
            timeout_ms: 10_000,
        },
        ..Default::default()
    };
    create_broker(&config).expect("kafka broker")
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn collecting(
    topic: &str,
    sink: Arc<Mutex<Vec<EventMessage<Value>>>>,
) -> MessageSubscription {
    MessageSubscription::new(topic, move |msg: EventMessage<Value>| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(msg);
            Ok::<(), HandlerError>(())
        }
    })
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_kafka_keyed_messages_keep_order() {
    let (_container, bootstrap) = start_kafka().await;
    let broker = kafka_broker(&bootstrap, "ordering");
    let seen = Arc::new(Mutex::new(Vec::new()));

    broker
        .create_topics(&[Topic::new("orders").with_config(TopicConfig {
            num_partitions: Some(3),
            ..Default::default()
        })])
        .await
        .expect("create topic");
    broker
        .subscribe(
            vec![collecting("orders", seen.clone())],
            SubscribeOptions::new("fulfilment"),
        )
        .await
        .expect("subscribe");

    for i in 0..5 {
        broker
            .publish(EventMessage::new("orders", json!(i)).with_key("customer-42"))
            .await
            .expect("publish");
    }

    wait_for("five deliveries", || seen.lock().unwrap().len() == 5).await;
    let values: Vec<Value> = seen.lock().unwrap().iter().map(|m| m.value.clone()).collect();
    assert_eq!(values, (0..5).map(|i| json!(i)).collect::<Vec<_>>());
    assert!(seen
        .lock()
        .unwrap()
        .iter()
        .all(|m| m.key() == Some("customer-42")));

    broker.disconnect().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_kafka_batch_spans_topics() {
    let (_container, bootstrap) = start_kafka().await;
    let broker = kafka_broker(&bootstrap, "batching");
    let audit = Arc::new(Mutex::new(Vec::new()));
    let metrics = Arc::new(Mutex::new(Vec::new()));

    broker
        .create_topics(&[Topic::new("audit"), Topic::new("metrics")])
        .await
        .expect("create topics");
    broker
        .subscribe(
            vec![
                collecting("audit", audit.clone()),
                collecting("metrics", metrics.clone()),
            ],
            SubscribeOptions::new("reporting"),
        )
        .await
        .expect("subscribe");

    broker
        .publish_batch(vec![
            EventMessage::new("audit", json!("login")),
            EventMessage::new("metrics", json!({"logins": 1})),
            EventMessage::new("audit", json!("logout")),
        ])
        .await
        .expect("batch");

    wait_for("audit records", || audit.lock().unwrap().len() == 2).await;
    wait_for("metric records", || metrics.lock().unwrap().len() == 1).await;

    broker.disconnect().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_kafka_exhausted_retries_reach_dead_letter_topic() {
    let (_container, bootstrap) = start_kafka().await;
    let broker = kafka_broker(&bootstrap, "dead-letters");
    let calls = Arc::new(Mutex::new(0));
    let dead = Arc::new(Mutex::new(Vec::new()));

    let counter = calls.clone();
    let failing = MessageSubscription::new("invoices", move |_msg: EventMessage<Value>| {
        let counter = counter.clone();
        async move {
            *counter.lock().unwrap() += 1;
            Err::<(), HandlerError>("ledger unavailable".into())
        }
    });
    broker
        .subscribe(
            vec![failing],
            SubscribeOptions::new("billing").with_retry(2, Duration::from_millis(200)),
        )
        .await
        .expect("subscribe");
    // One consumer group per adapter: the dead-letter reader gets its own.
    let ops = kafka_broker(&bootstrap, "ops");
    ops.subscribe(
        vec![collecting("billing-dead-letter", dead.clone())],
        SubscribeOptions::new("ops"),
    )
    .await
    .expect("subscribe dead letters");

    broker
        .publish(EventMessage::new("invoices", json!({"invoice": 7})))
        .await
        .expect("publish");

    wait_for("dead letter", || !dead.lock().unwrap().is_empty()).await;
    assert_eq!(*calls.lock().unwrap(), 3);

    let envelope = dead.lock().unwrap()[0].clone();
    let headers = envelope.headers().cloned().unwrap_or_default();
    assert_eq!(headers[FAILURE_REASON_HEADER], "MAX_RETRIES_EXCEEDED");
    assert_eq!(headers[ORIGINAL_TOPIC_HEADER], "invoices");

    ops.disconnect().await.unwrap();
    broker.disconnect().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_kafka_manual_acknowledge_resumes_after_restart() {
    let (_container, bootstrap) = start_kafka().await;
    let received = Arc::new(Mutex::new(Vec::<EventMessageMetadata>::new()));

    let first = kafka_broker(&bootstrap, "first-run");
    let sink = received.clone();
    let sub = MessageSubscription::new("shipments", move |msg: EventMessage<Value>| {
        let sink = sink.clone();
        async move {
            if let Some(metadata) = msg.metadata {
                sink.lock().unwrap().push(metadata);
            }
            Ok::<(), HandlerError>(())
        }
    });
    first
        .subscribe(vec![sub], SubscribeOptions::new("dispatch").with_auto_commit(false))
        .await
        .expect("subscribe");
    for i in 0..2 {
        first
            .publish(EventMessage::new("shipments", json!(i)))
            .await
            .expect("publish");
    }
    wait_for("two deliveries", || received.lock().unwrap().len() == 2).await;

    // Only the first is acknowledged.
    let metadata = received.lock().unwrap()[0].clone();
    first.acknowledge_msg(&metadata).await.expect("ack");
    first.disconnect().await.unwrap();

    let replayed = Arc::new(Mutex::new(Vec::new()));
    let second = kafka_broker(&bootstrap, "second-run");
    second
        .subscribe(
            vec![collecting("shipments", replayed.clone())],
            SubscribeOptions::new("dispatch"),
        )
        .await
        .expect("resubscribe");

    wait_for("replay", || !replayed.lock().unwrap().is_empty()).await;
    assert_eq!(replayed.lock().unwrap()[0].value, json!(1));

    second.disconnect().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_kafka_admin_and_health() {
    let (_container, bootstrap) = start_kafka().await;
    let broker = kafka_broker(&bootstrap, "admin");

    assert!(!broker.health_check().await);
    broker.connect().await.expect("connect");
    assert!(broker.health_check().await);

    let topics = [Topic::new("inventory"), Topic::new("pricing")];
    broker.create_topics(&topics).await.expect("create");
    broker.create_topics(&topics).await.expect("create again");
    broker.delete_topics(&topics).await.expect("delete");

    broker.disconnect().await.unwrap();
    assert!(!broker.health_check().await);
}
