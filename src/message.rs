//! Transport-agnostic message, topic and subscription types.
//!
//! Adapters translate these to and from native wire structures; nothing in
//! here knows about partitions-vs-queues beyond the `EventMessageMetadata`
//! position triple.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::{BrokerError, Result};

/// Message headers. Values are UTF-8 on both transports.
pub type Headers = BTreeMap<String, String>;

/// Error returned by subscription handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

// ============================================================================
// Topics
// ============================================================================

/// Creation-time configuration for a topic (log transport) or exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TopicConfig {
    pub num_partitions: Option<i32>,
    pub replication_factor: Option<i32>,
    pub retention_ms: Option<i64>,
}

/// Logical channel. Identity is the name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    #[serde(default)]
    pub config: Option<TopicConfig>,
}

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: None,
        }
    }

    pub fn with_config(mut self, config: TopicConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn partitions(&self) -> i32 {
        self.config
            .as_ref()
            .and_then(|c| c.num_partitions)
            .unwrap_or(1)
    }

    pub fn replication_factor(&self) -> i32 {
        self.config
            .as_ref()
            .and_then(|c| c.replication_factor)
            .unwrap_or(1)
    }
}

impl PartialEq for Topic {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Topic {}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Topic::new(name)
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Topic::new(name)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// One or many topics, normalised to a list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topics(pub Vec<Topic>);

impl Topics {
    pub fn as_slice(&self) -> &[Topic] {
        &self.0
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|t| t.name.as_str()).collect()
    }
}

impl From<Topic> for Topics {
    fn from(topic: Topic) -> Self {
        Topics(vec![topic])
    }
}

impl From<&str> for Topics {
    fn from(name: &str) -> Self {
        Topics(vec![Topic::new(name)])
    }
}

impl From<Vec<Topic>> for Topics {
    fn from(topics: Vec<Topic>) -> Self {
        Topics(topics)
    }
}

impl From<Vec<&str>> for Topics {
    fn from(names: Vec<&str>) -> Self {
        Topics(names.into_iter().map(Topic::new).collect())
    }
}

impl From<&[&str]> for Topics {
    fn from(names: &[&str]) -> Self {
        Topics(names.iter().copied().map(Topic::new).collect())
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Per-message publish options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageConfig {
    pub partition: Option<i32>,
    pub key: Option<String>,
    pub headers: Option<Headers>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: Option<i64>,
    /// Publish retry budget; falls back to the connection's `max_retries`.
    pub retries: Option<u32>,
}

/// Durable position of a received message.
///
/// `offset` is a string so 64-bit log offsets and queue delivery tags both
/// survive any serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: String,
}

impl EventMessageMetadata {
    pub fn new(topic: impl Into<String>, partition: i32, offset: impl ToString) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset: offset.to_string(),
        }
    }

    /// The numeric offset carried by this metadata.
    pub fn offset_value(&self) -> Result<i64> {
        self.offset
            .parse::<i64>()
            .map_err(|_| BrokerError::InvalidOffset(self.offset.clone()))
    }

    /// Position to commit when acknowledging: `offset + 1`.
    pub fn next_position(&self) -> Result<i64> {
        let offset = self.offset_value()?;
        offset
            .checked_add(1)
            .ok_or_else(|| BrokerError::InvalidOffset(self.offset.clone()))
    }
}

/// An application message. `metadata` is only populated on the consumer side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage<T> {
    pub topic: String,
    pub value: T,
    #[serde(default)]
    pub config: Option<MessageConfig>,
    #[serde(default)]
    pub metadata: Option<EventMessageMetadata>,
}

impl<T> EventMessage<T> {
    pub fn new(topic: impl Into<String>, value: T) -> Self {
        Self {
            topic: topic.into(),
            value,
            config: None,
            metadata: None,
        }
    }

    fn config_mut(&mut self) -> &mut MessageConfig {
        self.config.get_or_insert_with(MessageConfig::default)
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.config_mut().key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.config_mut().partition = Some(partition);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config_mut()
            .headers
            .get_or_insert_with(Headers::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.config_mut().retries = Some(retries);
        self
    }

    pub fn key(&self) -> Option<&str> {
        self.config.as_ref().and_then(|c| c.key.as_deref())
    }

    pub fn headers(&self) -> Option<&Headers> {
        self.config.as_ref().and_then(|c| c.headers.as_ref())
    }

    pub fn retries(&self) -> Option<u32> {
        self.config.as_ref().and_then(|c| c.retries)
    }

    /// Swap the payload, keeping routing information.
    pub fn map<U>(self, value: U) -> EventMessage<U> {
        EventMessage {
            topic: self.topic,
            value,
            config: self.config,
            metadata: self.metadata,
        }
    }
}

impl<T: Serialize> EventMessage<T> {
    /// Serialize the payload into a JSON value.
    pub fn to_json(self) -> Result<EventMessage<Value>> {
        let value = serde_json::to_value(&self.value)?;
        Ok(self.map(value))
    }
}

impl EventMessage<Value> {
    /// Deserialize a received JSON payload into a concrete type.
    pub fn decode<U: DeserializeOwned>(self) -> std::result::Result<EventMessage<U>, serde_json::Error> {
        let value = serde_json::from_value(self.value.clone())?;
        Ok(self.map(value))
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Handler invoked for each received message.
pub trait MessageHandler: Send + Sync {
    fn handle(
        &self,
        message: EventMessage<Value>,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(EventMessage<Value>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    fn handle(
        &self,
        message: EventMessage<Value>,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        Box::pin(self(message))
    }
}

/// Where a new consumer cohort starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPosition {
    #[default]
    Earliest,
    Latest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionConfig {
    pub start: StartPosition,
    /// Local prefetch hint for the log transport. The queue transport always
    /// prefetches a single message.
    pub batch_size: Option<usize>,
}

/// A handler bound to a topic.
#[derive(Clone)]
pub struct MessageSubscription {
    pub topic: Topic,
    pub handler: Arc<dyn MessageHandler>,
    pub config: SubscriptionConfig,
}

impl MessageSubscription {
    pub fn new(topic: impl Into<Topic>, handler: impl MessageHandler + 'static) -> Self {
        Self {
            topic: topic.into(),
            handler: Arc::new(handler),
            config: SubscriptionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SubscriptionConfig) -> Self {
        self.config = config;
        self
    }
}

impl fmt::Debug for MessageSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSubscription")
            .field("topic", &self.topic.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Redelivery policy for handler failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Consumer cohort: consumer group (log) or queue-name prefix (queue).
    pub group_id: String,
    /// `Some(false)` leaves acknowledgement to the caller.
    pub auto_commit: Option<bool>,
    pub retry: Option<RetryPolicy>,
}

impl SubscribeOptions {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            auto_commit: None,
            retry: None,
        }
    }

    pub fn with_retry(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.retry = Some(RetryPolicy::new(max_retries, backoff));
        self
    }

    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = Some(auto_commit);
        self
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit != Some(false)
    }

    /// True when a dead-letter destination must exist for this cohort.
    pub fn dead_letters_enabled(&self) -> bool {
        self.retry.map(|r| r.max_retries > 0).unwrap_or(false)
    }
}
