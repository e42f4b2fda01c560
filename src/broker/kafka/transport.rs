//! Partitioned-log transport seam.
//!
//! The adapter drives these traits; `RdKafkaTransport` implements them over
//! librdkafka and `MemoryLog` in-process. Components report asynchronous
//! failures (broker loss, fencing, crashed consumer) on the `LogFault`
//! channel handed to them at creation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::broker::processing::InboundMessage;
use crate::broker::Result;
use crate::message::{Headers, StartPosition, Topic};

/// A record to append to a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub partition: Option<i32>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: Option<i64>,
}

/// Asynchronous failure of one client component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFault {
    Producer(String),
    Admin(String),
    Consumer(String),
}

pub type FaultSender = mpsc::UnboundedSender<LogFault>;

/// Consumer creation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub group_id: String,
    pub start: StartPosition,
    /// Local prefetch depth.
    pub prefetch: Option<usize>,
}

/// Factory for producer, admin and consumer clients.
#[async_trait]
pub trait LogTransport: Send + Sync + 'static {
    async fn producer(&self, faults: FaultSender) -> Result<Arc<dyn LogProducer>>;

    async fn admin(&self, faults: FaultSender) -> Result<Arc<dyn LogAdmin>>;

    async fn consumer(
        &self,
        settings: ConsumerSettings,
        faults: FaultSender,
    ) -> Result<Arc<dyn LogConsumer>>;
}

#[async_trait]
pub trait LogProducer: Send + Sync {
    /// Append one record, resolving once the log acknowledged it.
    async fn send(&self, record: &OutboundRecord) -> Result<()>;

    /// Open a transaction. Only one may be open at a time.
    async fn begin(&self) -> Result<Box<dyn LogTransaction>>;

    async fn close(&self);
}

/// Records sent inside a transaction become visible together on commit.
#[async_trait]
pub trait LogTransaction: Send {
    async fn send(&mut self, topic: &str, records: Vec<OutboundRecord>) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn abort(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait LogAdmin: Send + Sync {
    async fn list_topics(&self) -> Result<Vec<String>>;

    /// Create topics. Topics that already exist are left untouched.
    async fn create_topics(&self, topics: &[Topic]) -> Result<()>;

    async fn delete_topics(&self, names: &[String]) -> Result<()>;

    async fn is_alive(&self) -> bool;

    async fn close(&self);
}

#[async_trait]
pub trait LogConsumer: Send + Sync {
    /// Replace the subscribed topic list.
    async fn subscribe(&self, topics: &[String]) -> Result<()>;

    async fn unsubscribe(&self) -> Result<()>;

    /// Next record. An error means the consumer is unusable and must be
    /// rebuilt.
    async fn recv(&self) -> Result<InboundMessage>;

    /// Commit the next position to read for `(topic, partition)`.
    async fn commit(&self, topic: &str, partition: i32, position: i64) -> Result<()>;

    /// Whether the consumer still holds valid group membership.
    async fn is_member(&self) -> bool;

    async fn close(&self);
}
