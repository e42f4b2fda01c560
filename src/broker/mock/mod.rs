//! Mock broker driver for testing.
//!
//! Records every call and can be switched to fail individual operations.
//! Clones share state, so a test can keep a handle after wrapping the driver.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use super::{BrokerDriver, BrokerError, Result};
use crate::message::{EventMessage, EventMessageMetadata, MessageSubscription, SubscribeOptions, Topic};

/// A call observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Connect,
    Disconnect,
    Publish(String),
    PublishBatch(usize),
    Subscribe { group_id: String, topics: Vec<String> },
    Acknowledge(EventMessageMetadata),
    Unsubscribe(Vec<String>),
    Resubscribe(Vec<String>),
    CreateTopics(Vec<String>),
    DeleteTopics(Vec<String>),
}

#[derive(Default)]
struct MockState {
    calls: Vec<MockCall>,
    published: Vec<EventMessage<Value>>,
    subscriptions: Vec<MessageSubscription>,
    fail_connect: bool,
    fail_disconnect: bool,
    fail_publish: bool,
    unhealthy: bool,
}

/// Mock driver for testing.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    pub fn fail_disconnect(&self, fail: bool) {
        self.state().fail_disconnect = fail;
    }

    pub fn fail_publish(&self, fail: bool) {
        self.state().fail_publish = fail;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state().unhealthy = !healthy;
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn published(&self) -> Vec<EventMessage<Value>> {
        self.state().published.clone()
    }

    /// Deliver a message to every registered subscription on its topic.
    pub async fn deliver(&self, message: EventMessage<Value>) -> usize {
        let handlers: Vec<_> = self
            .state()
            .subscriptions
            .iter()
            .filter(|s| s.topic.name == message.topic)
            .map(|s| s.handler.clone())
            .collect();

        let mut delivered = 0;
        for handler in handlers {
            if handler.handle(message.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn record(&self, call: MockCall) {
        self.state().calls.push(call);
    }
}

fn names(topics: &[Topic]) -> Vec<String> {
    topics.iter().map(|t| t.name.clone()).collect()
}

#[async_trait]
impl BrokerDriver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn connect(&self) -> Result<()> {
        self.record(MockCall::Connect);
        if self.state().fail_connect {
            return Err(BrokerError::Connection("mock connect failure".to_string()));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.record(MockCall::Disconnect);
        if self.state().fail_disconnect {
            return Err(BrokerError::Transport("mock disconnect failure".to_string()));
        }
        Ok(())
    }

    async fn publish(&self, message: EventMessage<Value>) -> Result<()> {
        self.record(MockCall::Publish(message.topic.clone()));
        let mut state = self.state();
        if state.fail_publish {
            return Err(BrokerError::Publish("mock publish failure".to_string()));
        }
        state.published.push(message);
        Ok(())
    }

    async fn publish_batch(&self, messages: Vec<EventMessage<Value>>) -> Result<()> {
        self.record(MockCall::PublishBatch(messages.len()));
        let mut state = self.state();
        if state.fail_publish {
            return Err(BrokerError::Publish("mock publish failure".to_string()));
        }
        state.published.extend(messages);
        Ok(())
    }

    async fn subscribe(
        &self,
        subscriptions: Vec<MessageSubscription>,
        options: SubscribeOptions,
    ) -> Result<()> {
        self.record(MockCall::Subscribe {
            group_id: options.group_id,
            topics: subscriptions.iter().map(|s| s.topic.name.clone()).collect(),
        });
        self.state().subscriptions.extend(subscriptions);
        Ok(())
    }

    async fn acknowledge(&self, metadata: &EventMessageMetadata) -> Result<()> {
        self.record(MockCall::Acknowledge(metadata.clone()));
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[Topic]) -> Result<()> {
        self.record(MockCall::Unsubscribe(names(topics)));
        Ok(())
    }

    async fn resubscribe(&self, topics: &[Topic]) -> Result<()> {
        self.record(MockCall::Resubscribe(names(topics)));
        Ok(())
    }

    async fn create_topics(&self, topics: &[Topic]) -> Result<()> {
        self.record(MockCall::CreateTopics(names(topics)));
        Ok(())
    }

    async fn delete_topics(&self, topics: &[Topic]) -> Result<()> {
        self.record(MockCall::DeleteTopics(names(topics)));
        Ok(())
    }

    async fn health_check(&self) -> bool {
        !self.state().unhealthy
    }
}
