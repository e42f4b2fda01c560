//! Switchyard - one publish/subscribe contract over Kafka and RabbitMQ.
//!
//! Application code talks to a [`Broker`], which wraps a transport adapter
//! implementing [`BrokerDriver`]. Both adapters buffer publishes while
//! disconnected, recover their connections on their own, redeliver failed
//! messages with exponential backoff and dead-letter what cannot be handled.
//!
//! ```no_run
//! use serde_json::json;
//! use switchyard::{create_broker, BrokerConfig, EventMessage};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BrokerConfig::load(None)?;
//! let broker = create_broker(&config)?;
//! broker.connect().await?;
//! broker
//!     .publish(EventMessage::new("orders", json!({"id": 1})).with_key("eu"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod broker;
pub mod config;
pub mod message;

pub use bootstrap::init_tracing;
#[cfg(feature = "memory")]
pub use broker::create_memory_broker;
pub use broker::{
    create_broker, Broker, BrokerDriver, BrokerError, ComponentState, ConnectionState, DynBroker,
};
pub use config::{AmqpConfig, BrokerConfig, BrokerKind, ConnectionPolicy, ExchangeType, KafkaConfig};
pub use message::{
    EventMessage, EventMessageMetadata, HandlerError, Headers, MessageConfig, MessageHandler,
    MessageSubscription, RetryPolicy, StartPosition, SubscribeOptions, SubscriptionConfig, Topic,
    TopicConfig, Topics,
};
