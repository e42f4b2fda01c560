//! Message broker abstraction.
//!
//! This module contains:
//! - `BrokerDriver` trait: the capability contract every transport satisfies
//! - `Broker`: logging/error-shaping decorator over any driver
//! - Shared adapter machinery: retry, pending queue, offsets, dead-letter,
//!   per-message processing
//! - Implementations: Kafka (partitioned log), AMQP (exchange/queue), Mock
//! - In-memory transports for both adapters

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::config::{BrokerConfig, BrokerKind};
use crate::message::{EventMessage, EventMessageMetadata, MessageSubscription, SubscribeOptions, Topic};

pub mod amqp;
pub mod dead_letter;
pub mod instrumented;
pub mod kafka;
#[cfg(feature = "memory")]
pub mod memory;
pub mod mock;
pub mod offsets;
pub mod pending;
pub mod processing;
pub mod retry;

// Re-exports
pub use amqp::RabbitMqAdapter;
pub use dead_letter::{dead_letter_name, DeadLetterEnvelope, DeadLetterReason};
pub use instrumented::Broker;
pub use kafka::KafkaAdapter;
pub use mock::MockDriver;

// ============================================================================
// Errors
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors surfaced by broker operations.
///
/// Adapter-internal recoveries (reconnects, channel and consumer rebuilds)
/// never produce these; only terminal per-operation failures do.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Broker is not connected")]
    NotConnected,

    #[error("Broker was disconnected before the operation completed")]
    Disconnected,

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledge failed: {0}")]
    Acknowledge(String),

    #[error("Admin operation failed: {0}")]
    Admin(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid offset: {0}")]
    InvalidOffset(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    /// Whether the failure indicates the underlying link is gone.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_) | BrokerError::NotConnected | BrokerError::Transport(_)
        )
    }
}

// ============================================================================
// Driver contract
// ============================================================================

/// Capability contract every transport adapter satisfies.
///
/// Payloads cross this seam as JSON values; the `Broker` wrapper offers the
/// typed `publish<T: Serialize>` surface on top.
#[async_trait]
pub trait BrokerDriver: Send + Sync {
    /// Short transport label used in logs.
    fn name(&self) -> &'static str;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Publish one message. Resolves only once the transport accepted it, or
    /// with the terminal error after the retry budget is spent.
    async fn publish(&self, message: EventMessage<Value>) -> Result<()>;

    async fn publish_batch(&self, messages: Vec<EventMessage<Value>>) -> Result<()>;

    async fn subscribe(
        &self,
        subscriptions: Vec<MessageSubscription>,
        options: SubscribeOptions,
    ) -> Result<()>;

    async fn acknowledge(&self, metadata: &EventMessageMetadata) -> Result<()>;

    async fn unsubscribe(&self, topics: &[Topic]) -> Result<()>;

    async fn resubscribe(&self, topics: &[Topic]) -> Result<()>;

    async fn create_topics(&self, topics: &[Topic]) -> Result<()>;

    async fn delete_topics(&self, topics: &[Topic]) -> Result<()>;

    async fn health_check(&self) -> bool;
}

#[async_trait]
impl<D: BrokerDriver + ?Sized> BrokerDriver for Arc<D> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn connect(&self) -> Result<()> {
        (**self).connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        (**self).disconnect().await
    }

    async fn publish(&self, message: EventMessage<Value>) -> Result<()> {
        (**self).publish(message).await
    }

    async fn publish_batch(&self, messages: Vec<EventMessage<Value>>) -> Result<()> {
        (**self).publish_batch(messages).await
    }

    async fn subscribe(
        &self,
        subscriptions: Vec<MessageSubscription>,
        options: SubscribeOptions,
    ) -> Result<()> {
        (**self).subscribe(subscriptions, options).await
    }

    async fn acknowledge(&self, metadata: &EventMessageMetadata) -> Result<()> {
        (**self).acknowledge(metadata).await
    }

    async fn unsubscribe(&self, topics: &[Topic]) -> Result<()> {
        (**self).unsubscribe(topics).await
    }

    async fn resubscribe(&self, topics: &[Topic]) -> Result<()> {
        (**self).resubscribe(topics).await
    }

    async fn create_topics(&self, topics: &[Topic]) -> Result<()> {
        (**self).create_topics(topics).await
    }

    async fn delete_topics(&self, topics: &[Topic]) -> Result<()> {
        (**self).delete_topics(topics).await
    }

    async fn health_check(&self) -> bool {
        (**self).health_check().await
    }
}

/// Connection lifecycle of an adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Lifecycle of one logical resource (producer, admin, consumer, channel).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ComponentState {
    #[default]
    Disconnected,
    Reconnecting,
    Connected,
}

// ============================================================================
// Factory
// ============================================================================

/// A broker over a type-erased driver.
pub type DynBroker = Broker<Arc<dyn BrokerDriver>>;

/// Build the broker selected by configuration.
///
/// Requires the corresponding feature:
/// - Kafka: `--features kafka`
/// - AMQP: `--features amqp`
pub fn create_broker(config: &BrokerConfig) -> Result<DynBroker> {
    match config.kind {
        BrokerKind::Kafka => {
            #[cfg(feature = "kafka")]
            {
                let transport = kafka::RdKafkaTransport::new(config.kafka.clone(), &config.connection);
                let adapter = KafkaAdapter::new(config.kafka.clone(), config.connection.clone(), transport);
                info!(broker_kind = "kafka", "Broker initialized");
                Ok(Broker::new(Arc::new(adapter) as Arc<dyn BrokerDriver>))
            }

            #[cfg(not(feature = "kafka"))]
            {
                Err(BrokerError::Config(
                    "Kafka support requires the 'kafka' feature. Rebuild with --features kafka"
                        .to_string(),
                ))
            }
        }
        BrokerKind::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let transport = amqp::LapinTransport::new(config.amqp.clone(), &config.connection);
                let adapter = RabbitMqAdapter::new(config.amqp.clone(), config.connection.clone(), transport);
                info!(broker_kind = "amqp", "Broker initialized");
                Ok(Broker::new(Arc::new(adapter) as Arc<dyn BrokerDriver>))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err(BrokerError::Config(
                    "AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                        .to_string(),
                ))
            }
        }
    }
}

/// Build the selected adapter over the in-process transports.
///
/// Returns the transport handle as well so callers can inspect or inject
/// faults.
#[cfg(feature = "memory")]
pub fn create_memory_broker(config: &BrokerConfig) -> (DynBroker, memory::MemoryHandle) {
    match config.kind {
        BrokerKind::Kafka => {
            let log = memory::MemoryLog::new();
            let adapter = KafkaAdapter::new(config.kafka.clone(), config.connection.clone(), log.clone());
            info!(broker_kind = "kafka", transport = "memory", "Broker initialized");
            (
                Broker::new(Arc::new(adapter) as Arc<dyn BrokerDriver>),
                memory::MemoryHandle::Log(log),
            )
        }
        BrokerKind::Amqp => {
            let queue = memory::MemoryQueue::new();
            let adapter =
                RabbitMqAdapter::new(config.amqp.clone(), config.connection.clone(), queue.clone());
            info!(broker_kind = "amqp", transport = "memory", "Broker initialized");
            (
                Broker::new(Arc::new(adapter) as Arc<dyn BrokerDriver>),
                memory::MemoryHandle::Queue(queue),
            )
        }
    }
}
