//! librdkafka-backed log transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::ClientContext;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, Headers as _, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::sync::OnceCell;
use tracing::{debug, error, warn};

use super::transport::{
    ConsumerSettings, FaultSender, LogAdmin, LogConsumer, LogFault, LogProducer, LogTransaction,
    LogTransport, OutboundRecord,
};
use crate::broker::processing::InboundMessage;
use crate::broker::{BrokerError, Result};
use crate::config::{ConnectionPolicy, KafkaConfig};
use crate::message::{EventMessageMetadata, Headers, StartPosition, Topic};

/// Log transport over librdkafka.
pub struct RdKafkaTransport {
    config: KafkaConfig,
    timeout: Duration,
}

impl RdKafkaTransport {
    pub fn new(config: KafkaConfig, policy: &ConnectionPolicy) -> Self {
        Self {
            config,
            timeout: policy.timeout(),
        }
    }

    fn base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", self.config.bootstrap_servers());
        config.set("client.id", &self.config.client_id);

        if let Some(ref protocol) = self.config.security_protocol {
            config.set("security.protocol", protocol);
        }
        if let Some(ref mechanism) = self.config.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }
        if let Some(ref username) = self.config.sasl_username {
            config.set("sasl.username", username);
        }
        if let Some(ref password) = self.config.sasl_password {
            config.set("sasl.password", password);
        }
        if let Some(ref ca_location) = self.config.ssl_ca_location {
            config.set("ssl.ca.location", ca_location);
        }
        config
    }

    fn producer_config(&self) -> ClientConfig {
        let mut config = self.base_config();
        config.set("message.timeout.ms", self.timeout.as_millis().to_string());
        config.set("acks", "all");
        config.set("enable.idempotence", "true");
        config
    }
}

// ============================================================================
// Client context
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Component {
    Producer,
    Admin,
    Consumer,
}

/// Forwards fatal client errors to the adapter's fault channel.
struct FaultContext {
    component: Component,
    faults: FaultSender,
    fatal: AtomicBool,
}

impl FaultContext {
    fn new(component: Component, faults: FaultSender) -> Self {
        Self {
            component,
            faults,
            fatal: AtomicBool::new(false),
        }
    }

    fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }
}

impl ClientContext for FaultContext {
    fn error(&self, error: KafkaError, reason: &str) {
        match error.rdkafka_error_code() {
            Some(RDKafkaErrorCode::AllBrokersDown) | Some(RDKafkaErrorCode::Fatal) => {
                error!(component = ?self.component, error = %error, reason, "Fatal Kafka client error");
                self.fatal.store(true, Ordering::SeqCst);
                let reason = format!("{}: {}", error, reason);
                let fault = match self.component {
                    Component::Producer => LogFault::Producer(reason),
                    Component::Admin => LogFault::Admin(reason),
                    Component::Consumer => LogFault::Consumer(reason),
                };
                let _ = self.faults.send(fault);
            }
            _ => warn!(component = ?self.component, error = %error, reason, "Kafka client error"),
        }
    }
}

impl ConsumerContext for FaultContext {}

fn kafka_err(context: &str, e: KafkaError) -> BrokerError {
    BrokerError::Transport(format!("{}: {}", context, e))
}

fn owned_headers(headers: &Headers) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |acc, (key, value)| {
            acc.insert(Header {
                key,
                value: Some(value.as_str()),
            })
        })
}

async fn send_record(
    producer: &FutureProducer<FaultContext>,
    record: &OutboundRecord,
    timeout: Duration,
) -> Result<()> {
    let mut future_record: FutureRecord<'_, str, Vec<u8>> =
        FutureRecord::to(&record.topic).payload(&record.payload);
    if let Some(ref key) = record.key {
        future_record = future_record.key(key.as_str());
    }
    if !record.headers.is_empty() {
        future_record = future_record.headers(owned_headers(&record.headers));
    }
    if let Some(partition) = record.partition {
        future_record = future_record.partition(partition);
    }
    if let Some(timestamp) = record.timestamp {
        future_record = future_record.timestamp(timestamp);
    }

    producer
        .send(future_record, timeout)
        .await
        .map(|_| ())
        .map_err(|(e, _)| BrokerError::Publish(format!("Failed to publish: {}", e)))
}

// ============================================================================
// Producer
// ============================================================================

struct RdKafkaProducer {
    producer: FutureProducer<FaultContext>,
    transactional_config: ClientConfig,
    transactional: OnceCell<FutureProducer<FaultContext>>,
    faults: FaultSender,
    timeout: Duration,
}

impl RdKafkaProducer {
    async fn transactional(&self) -> Result<FutureProducer<FaultContext>> {
        let producer = self
            .transactional
            .get_or_try_init(|| async {
                let producer: FutureProducer<FaultContext> = self
                    .transactional_config
                    .create_with_context(FaultContext::new(Component::Producer, self.faults.clone()))
                    .map_err(|e| kafka_err("Failed to create transactional producer", e))?;

                let init = producer.clone();
                let timeout = self.timeout;
                tokio::task::spawn_blocking(move || init.init_transactions(timeout))
                    .await
                    .map_err(|e| BrokerError::Transport(e.to_string()))?
                    .map_err(|e| kafka_err("Failed to init transactions", e))?;
                Ok::<_, BrokerError>(producer)
            })
            .await?;
        Ok(producer.clone())
    }
}

#[async_trait]
impl LogProducer for RdKafkaProducer {
    async fn send(&self, record: &OutboundRecord) -> Result<()> {
        send_record(&self.producer, record, self.timeout).await
    }

    async fn begin(&self) -> Result<Box<dyn LogTransaction>> {
        let producer = self.transactional().await?;
        let begin = producer.clone();
        tokio::task::spawn_blocking(move || begin.begin_transaction())
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?
            .map_err(|e| kafka_err("Failed to begin transaction", e))?;

        Ok(Box::new(RdKafkaTransaction {
            producer,
            timeout: self.timeout,
        }))
    }

    async fn close(&self) {
        let mut producers = vec![self.producer.clone()];
        producers.extend(self.transactional.get().cloned());
        let timeout = self.timeout;
        let _ = tokio::task::spawn_blocking(move || {
            for producer in producers {
                if let Err(e) = producer.flush(timeout) {
                    warn!(error = %e, "Failed to flush Kafka producer on close");
                }
            }
        })
        .await;
    }
}

struct RdKafkaTransaction {
    producer: FutureProducer<FaultContext>,
    timeout: Duration,
}

#[async_trait]
impl LogTransaction for RdKafkaTransaction {
    async fn send(&mut self, topic: &str, records: Vec<OutboundRecord>) -> Result<()> {
        for record in &records {
            send_record(&self.producer, record, self.timeout).await?;
        }
        debug!(topic, count = records.len(), "Sent records in transaction");
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let producer = self.producer.clone();
        let timeout = self.timeout;
        let committed = tokio::task::spawn_blocking(move || producer.commit_transaction(timeout))
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        if let Err(e) = committed {
            warn!(error = %e, "Kafka transaction commit failed, aborting");
            self.abort().await?;
            return Err(BrokerError::Publish(format!("Transaction commit failed: {}", e)));
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let producer = self.producer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || producer.abort_transaction(timeout))
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?
            .map_err(|e| kafka_err("Failed to abort transaction", e))
    }
}

// ============================================================================
// Admin
// ============================================================================

struct RdKafkaAdmin {
    admin: Arc<AdminClient<FaultContext>>,
    timeout: Duration,
}

#[async_trait]
impl LogAdmin for RdKafkaAdmin {
    async fn list_topics(&self) -> Result<Vec<String>> {
        let admin = self.admin.clone();
        let timeout = self.timeout;
        let metadata = tokio::task::spawn_blocking(move || admin.inner().fetch_metadata(None, timeout))
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?
            .map_err(|e| BrokerError::Admin(format!("Failed to list topics: {}", e)))?;

        Ok(metadata
            .topics()
            .iter()
            .map(|t| t.name().to_string())
            .collect())
    }

    async fn create_topics(&self, topics: &[Topic]) -> Result<()> {
        let retention: Vec<Option<String>> = topics
            .iter()
            .map(|t| t.config.as_ref().and_then(|c| c.retention_ms).map(|ms| ms.to_string()))
            .collect();

        let new_topics: Vec<NewTopic<'_>> = topics
            .iter()
            .zip(&retention)
            .map(|(topic, retention)| {
                let new_topic = NewTopic::new(
                    &topic.name,
                    topic.partitions(),
                    TopicReplication::Fixed(topic.replication_factor()),
                );
                match retention {
                    Some(ms) => new_topic.set("retention.ms", ms),
                    None => new_topic,
                }
            })
            .collect();

        let options = AdminOptions::new().operation_timeout(Some(self.timeout));
        let results = self
            .admin
            .create_topics(&new_topics, &options)
            .await
            .map_err(|e| BrokerError::Admin(format!("Failed to create topics: {}", e)))?;

        for result in results {
            match result {
                Ok(name) => debug!(topic = %name, "Created Kafka topic"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "Kafka topic already exists")
                }
                Err((name, code)) => {
                    return Err(BrokerError::Admin(format!(
                        "Failed to create topic {}: {}",
                        name, code
                    )))
                }
            }
        }
        Ok(())
    }

    async fn delete_topics(&self, names: &[String]) -> Result<()> {
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let options = AdminOptions::new().operation_timeout(Some(self.timeout));
        let results = self
            .admin
            .delete_topics(&names, &options)
            .await
            .map_err(|e| BrokerError::Admin(format!("Failed to delete topics: {}", e)))?;

        for result in results {
            match result {
                Ok(name) => debug!(topic = %name, "Deleted Kafka topic"),
                Err((name, RDKafkaErrorCode::UnknownTopicOrPartition)) => {
                    debug!(topic = %name, "Kafka topic already absent")
                }
                Err((name, code)) => {
                    return Err(BrokerError::Admin(format!(
                        "Failed to delete topic {}: {}",
                        name, code
                    )))
                }
            }
        }
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        if self.admin.inner().context().is_fatal() {
            return false;
        }
        self.list_topics().await.is_ok()
    }

    async fn close(&self) {}
}

// ============================================================================
// Consumer
// ============================================================================

struct RdKafkaConsumer {
    consumer: Arc<StreamConsumer<FaultContext>>,
}

impl RdKafkaConsumer {
    fn is_fatal(&self) -> bool {
        self.consumer.context().is_fatal()
    }
}

#[async_trait]
impl LogConsumer for RdKafkaConsumer {
    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&topics)
            .map_err(|e| BrokerError::Subscribe(format!("Failed to subscribe to topics: {}", e)))
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.consumer.unsubscribe();
        Ok(())
    }

    async fn recv(&self) -> Result<InboundMessage> {
        loop {
            match self.consumer.recv().await {
                Ok(message) => {
                    let headers = message
                        .headers()
                        .map(|headers| {
                            headers
                                .iter()
                                .filter_map(|h| {
                                    let value = std::str::from_utf8(h.value?).ok()?;
                                    Some((h.key.to_string(), value.to_string()))
                                })
                                .collect()
                        })
                        .unwrap_or_default();

                    return Ok(InboundMessage {
                        topic: message.topic().to_string(),
                        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                        key: message
                            .key()
                            .and_then(|k| std::str::from_utf8(k).ok())
                            .map(str::to_string),
                        headers,
                        timestamp: message.timestamp().to_millis(),
                        metadata: EventMessageMetadata::new(
                            message.topic(),
                            message.partition(),
                            message.offset(),
                        ),
                    });
                }
                Err(e) if self.is_fatal() => {
                    return Err(kafka_err("Kafka consumer failed", e));
                }
                Err(e) => warn!(error = %e, "Kafka consumer error"),
            }
        }
    }

    async fn commit(&self, topic: &str, partition: i32, position: i64) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(topic, partition, Offset::Offset(position))
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))?;

        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&offsets, CommitMode::Sync))
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?
            .map_err(|e| BrokerError::Acknowledge(format!("Failed to commit offset: {}", e)))
    }

    async fn is_member(&self) -> bool {
        !self.is_fatal() && self.consumer.assignment().is_ok()
    }

    async fn close(&self) {
        self.consumer.unsubscribe();
    }
}

// ============================================================================
// Transport
// ============================================================================

#[async_trait]
impl LogTransport for RdKafkaTransport {
    async fn producer(&self, faults: FaultSender) -> Result<Arc<dyn LogProducer>> {
        let producer: FutureProducer<FaultContext> = self
            .producer_config()
            .create_with_context(FaultContext::new(Component::Producer, faults.clone()))
            .map_err(|e| BrokerError::Connection(format!("Failed to create Kafka producer: {}", e)))?;

        // Creation is lazy in librdkafka; fail fast when the cluster is unreachable.
        let client = producer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || client.client().fetch_metadata(None, timeout))
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?
            .map_err(|e| BrokerError::Connection(format!("Kafka cluster unreachable: {}", e)))?;

        let mut transactional_config = self.producer_config();
        transactional_config.set("transactional.id", self.config.transactional_id());

        Ok(Arc::new(RdKafkaProducer {
            producer,
            transactional_config,
            transactional: OnceCell::new(),
            faults,
            timeout: self.timeout,
        }))
    }

    async fn admin(&self, faults: FaultSender) -> Result<Arc<dyn LogAdmin>> {
        let admin: AdminClient<FaultContext> = self
            .base_config()
            .create_with_context(FaultContext::new(Component::Admin, faults))
            .map_err(|e| BrokerError::Connection(format!("Failed to create Kafka admin: {}", e)))?;

        Ok(Arc::new(RdKafkaAdmin {
            admin: Arc::new(admin),
            timeout: self.timeout,
        }))
    }

    async fn consumer(
        &self,
        settings: ConsumerSettings,
        faults: FaultSender,
    ) -> Result<Arc<dyn LogConsumer>> {
        let mut config = self.base_config();
        config.set("group.id", &settings.group_id);
        config.set("enable.auto.commit", "false");
        config.set(
            "auto.offset.reset",
            match settings.start {
                StartPosition::Earliest => "earliest",
                StartPosition::Latest => "latest",
            },
        );
        if let Some(prefetch) = settings.prefetch {
            config.set("queued.min.messages", prefetch.to_string());
        }

        let consumer: StreamConsumer<FaultContext> = config
            .create_with_context(FaultContext::new(Component::Consumer, faults))
            .map_err(|e| BrokerError::Connection(format!("Failed to create Kafka consumer: {}", e)))?;

        Ok(Arc::new(RdKafkaConsumer {
            consumer: Arc::new(consumer),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_producer_config_is_idempotent() {
        let transport = RdKafkaTransport::new(
            KafkaConfig::new(["k1:9092", "k2:9092"]).with_client_id("svc"),
            &ConnectionPolicy::default(),
        );
        let config = transport.producer_config();
        assert_eq!(config.get("bootstrap.servers"), Some("k1:9092,k2:9092"));
        assert_eq!(config.get("client.id"), Some("svc"));
        assert_eq!(config.get("enable.idempotence"), Some("true"));
        assert_eq!(config.get("acks"), Some("all"));
        assert_eq!(config.get("message.timeout.ms"), Some("30000"));
    }

    #[test]
    fn test_security_settings_are_applied() {
        let transport = RdKafkaTransport::new(
            KafkaConfig::new(["k:9092"])
                .with_sasl("user", "pass", "SCRAM-SHA-256")
                .with_ssl_ca("/etc/ca.pem"),
            &ConnectionPolicy::default(),
        );
        let config = transport.base_config();
        assert_eq!(config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(config.get("sasl.mechanism"), Some("SCRAM-SHA-256"));
        assert_eq!(config.get("sasl.username"), Some("user"));
        assert_eq!(config.get("ssl.ca.location"), Some("/etc/ca.pem"));
    }
}
