//! Logging advice over any `BrokerDriver`.
//!
//! `Broker` is the caller-facing surface. It logs every operation with its
//! transport and elapsed time, and on failure logs and returns the driver's
//! error untouched. It never retries and never repairs state; resilience is
//! the adapter's job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info};

use super::{BrokerDriver, Result};
use crate::message::{EventMessage, EventMessageMetadata, MessageSubscription, SubscribeOptions, Topic, Topics};

/// Wrapper that adds structured logging to any broker driver.
///
/// # Example
///
/// ```ignore
/// let adapter = KafkaAdapter::new(kafka, policy, transport);
/// let broker = Broker::new(adapter);
/// broker.connect().await?;
/// broker.publish(EventMessage::new("orders", order)).await?;
/// ```
pub struct Broker<D> {
    inner: D,
    connected: AtomicBool,
}

impl<D: BrokerDriver> Broker<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            connected: AtomicBool::new(false),
        }
    }

    /// Get a reference to the wrapped driver.
    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// Consume the wrapper and return the driver.
    pub fn into_inner(self) -> D {
        self.inner
    }

    pub fn transport_name(&self) -> &'static str {
        self.inner.name()
    }

    /// Whether the last `connect()` succeeded and no `disconnect()` followed.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn connect(&self) -> Result<()> {
        let start = Instant::now();
        info!(transport = self.transport_name(), "Connecting to broker");

        match self.inner.connect().await {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                info!(
                    transport = self.transport_name(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Connected to broker"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    transport = self.transport_name(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    error = %e,
                    "Failed to connect to broker"
                );
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self) -> Result<()> {
        info!(transport = self.transport_name(), "Disconnecting from broker");

        let result = self.inner.disconnect().await;
        self.connected.store(false, Ordering::SeqCst);

        match &result {
            Ok(()) => info!(transport = self.transport_name(), "Disconnected from broker"),
            Err(e) => error!(
                transport = self.transport_name(),
                error = %e,
                "Error while disconnecting from broker"
            ),
        }
        result
    }

    /// Serialize the payload to JSON and publish it.
    pub async fn publish<T: Serialize>(&self, message: EventMessage<T>) -> Result<()> {
        let start = Instant::now();
        let topic = message.topic.clone();

        let message = message.to_json().inspect_err(|e| {
            error!(
                transport = self.transport_name(),
                topic = %topic,
                error = %e,
                "Failed to serialize message"
            )
        })?;

        let result = self.inner.publish(message).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => debug!(
                transport = self.transport_name(),
                topic = %topic,
                elapsed_ms,
                "Published message"
            ),
            Err(e) => error!(
                transport = self.transport_name(),
                topic = %topic,
                elapsed_ms,
                error = %e,
                "Failed to publish message"
            ),
        }
        result
    }

    /// Serialize and publish a batch. Atomicity is adapter-defined.
    pub async fn publish_batch<T: Serialize>(&self, messages: Vec<EventMessage<T>>) -> Result<()> {
        let start = Instant::now();
        let count = messages.len();

        let messages = messages
            .into_iter()
            .map(EventMessage::to_json)
            .collect::<Result<Vec<_>>>()
            .inspect_err(|e| {
                error!(
                    transport = self.transport_name(),
                    count,
                    error = %e,
                    "Failed to serialize batch"
                )
            })?;

        let result = self.inner.publish_batch(messages).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => debug!(
                transport = self.transport_name(),
                count,
                elapsed_ms,
                "Published batch"
            ),
            Err(e) => error!(
                transport = self.transport_name(),
                count,
                elapsed_ms,
                error = %e,
                "Failed to publish batch"
            ),
        }
        result
    }

    pub async fn subscribe(
        &self,
        subscriptions: Vec<MessageSubscription>,
        options: SubscribeOptions,
    ) -> Result<()> {
        let topics: Vec<String> = subscriptions.iter().map(|s| s.topic.name.clone()).collect();
        let group_id = options.group_id.clone();

        let result = self.inner.subscribe(subscriptions, options).await;

        match &result {
            Ok(()) => info!(
                transport = self.transport_name(),
                group_id = %group_id,
                topics = ?topics,
                "Subscribed"
            ),
            Err(e) => error!(
                transport = self.transport_name(),
                group_id = %group_id,
                topics = ?topics,
                error = %e,
                "Failed to subscribe"
            ),
        }
        result
    }

    /// Acknowledge a received message, committing `offset + 1`.
    pub async fn acknowledge_msg(&self, metadata: &EventMessageMetadata) -> Result<()> {
        let result = self.inner.acknowledge(metadata).await;

        match &result {
            Ok(()) => debug!(
                transport = self.transport_name(),
                topic = %metadata.topic,
                partition = metadata.partition,
                offset = %metadata.offset,
                "Acknowledged message"
            ),
            Err(e) => error!(
                transport = self.transport_name(),
                topic = %metadata.topic,
                partition = metadata.partition,
                offset = %metadata.offset,
                error = %e,
                "Failed to acknowledge message"
            ),
        }
        result
    }

    pub async fn unsubscribe(&self, topics: impl Into<Topics>) -> Result<()> {
        let topics = topics.into();
        let result = self.inner.unsubscribe(topics.as_slice()).await;
        self.log_outcome("unsubscribe", &topics, &result);
        result
    }

    pub async fn re_subscribe(&self, topics: impl Into<Topics>) -> Result<()> {
        let topics = topics.into();
        let result = self.inner.resubscribe(topics.as_slice()).await;
        self.log_outcome("resubscribe", &topics, &result);
        result
    }

    pub async fn create_topics(&self, topics: &[Topic]) -> Result<()> {
        let topics = Topics::from(topics.to_vec());
        let result = self.inner.create_topics(topics.as_slice()).await;
        self.log_outcome("create_topics", &topics, &result);
        result
    }

    pub async fn delete_topics(&self, topics: &[Topic]) -> Result<()> {
        let topics = Topics::from(topics.to_vec());
        let result = self.inner.delete_topics(topics.as_slice()).await;
        self.log_outcome("delete_topics", &topics, &result);
        result
    }

    pub async fn health_check(&self) -> bool {
        let healthy = self.inner.health_check().await;
        debug!(transport = self.transport_name(), healthy, "Health check");
        healthy
    }

    fn log_outcome(&self, operation: &'static str, topics: &Topics, result: &Result<()>) {
        match result {
            Ok(()) => info!(
                transport = self.transport_name(),
                operation,
                topics = ?topics.names(),
                "Broker operation completed"
            ),
            Err(e) => error!(
                transport = self.transport_name(),
                operation,
                topics = ?topics.names(),
                error = %e,
                "Broker operation failed"
            ),
        }
    }
}
