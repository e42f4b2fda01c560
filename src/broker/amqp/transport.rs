//! Exchange/queue transport seam.
//!
//! `LapinTransport` implements it over a real AMQP 0-9-1 connection and
//! `MemoryQueue` in-process. The connection and its channels report
//! asynchronous closure on the `QueueFault` channel handed to them.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::broker::Result;
use crate::config::ExchangeType;
use crate::message::Headers;

/// A message to publish on an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundDelivery {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

/// A message handed to a consumer. `tag` is only valid on the channel that
/// delivered it.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub redelivered: bool,
}

/// Asynchronous closure of the connection or of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueFault {
    Connection(String),
    Channel(String),
}

pub type QueueFaultSender = mpsc::UnboundedSender<QueueFault>;

/// Stream of deliveries for one consumer tag. Ends when the consumer is
/// cancelled or its channel closes.
pub type DeliveryStream = BoxStream<'static, Delivery>;

#[async_trait]
pub trait QueueTransport: Send + Sync + 'static {
    async fn connect(&self, faults: QueueFaultSender) -> Result<Arc<dyn QueueConnection>>;
}

#[async_trait]
pub trait QueueConnection: Send + Sync {
    /// Open a channel in publisher-confirm mode with a prefetch of one.
    async fn open_channel(&self, faults: QueueFaultSender) -> Result<Arc<dyn QueueChannel>>;

    fn is_connected(&self) -> bool;

    async fn close(&self);
}

#[async_trait]
pub trait QueueChannel: Send + Sync {
    /// Declare a durable exchange. Redeclaring with the same type is a no-op.
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> Result<()>;

    async fn delete_exchange(&self, name: &str) -> Result<()>;

    /// Declare a durable queue, optionally dead-lettering to an exchange.
    async fn declare_queue(&self, name: &str, dead_letter_exchange: Option<&str>) -> Result<()>;

    /// Declare an exclusive, auto-deleted queue. It goes away with the
    /// connection that declared it.
    async fn declare_transient_queue(&self, name: &str) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()>;

    /// Publish one persistent message and wait for the broker's confirm.
    async fn publish(&self, delivery: &OutboundDelivery) -> Result<()>;

    /// Publish every message, then wait once for all confirms.
    async fn publish_batch(&self, deliveries: &[OutboundDelivery]) -> Result<()>;

    /// Start a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    fn is_open(&self) -> bool;

    async fn close(&self);
}
