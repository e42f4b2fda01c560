//! Per-message consume pipeline shared by both adapters.
//!
//! The adapter hands over raw bytes plus position; `process` decodes them,
//! runs the handler and decides what must happen next. Executing the
//! decision (republish, dead-letter, commit/ack) stays transport-specific.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, warn};

use super::dead_letter::{retry_count, DeadLetterEnvelope, DeadLetterReason};
use super::retry::RetryConfig;
use crate::message::{
    EventMessage, EventMessageMetadata, Headers, MessageConfig, MessageSubscription,
    SubscribeOptions,
};

/// A delivery as read off the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub key: Option<String>,
    pub headers: Headers,
    /// Milliseconds since the Unix epoch.
    pub timestamp: Option<i64>,
    pub metadata: EventMessageMetadata,
}

impl InboundMessage {
    fn to_event(&self, value: Value) -> EventMessage<Value> {
        EventMessage {
            topic: self.topic.clone(),
            value,
            config: Some(MessageConfig {
                partition: Some(self.metadata.partition),
                key: self.key.clone(),
                headers: Some(self.headers.clone()),
                timestamp: self.timestamp,
                retries: None,
            }),
            metadata: Some(self.metadata.clone()),
        }
    }

    /// Dead-letter this delivery.
    pub fn dead_letter(
        &self,
        reason: DeadLetterReason,
        error: &(dyn std::error::Error + 'static),
    ) -> DeadLetterEnvelope {
        DeadLetterEnvelope::new(
            self.topic.clone(),
            reason,
            error,
            self.payload.clone(),
            self.headers.clone(),
        )
        .with_key(self.key.clone())
    }
}

/// What the adapter must do with a delivery after processing.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Handler succeeded.
    Handled,
    /// Republish after `delay` with `retryCount = attempt`, then settle.
    Retry {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// Publish to the cohort's dead-letter destination, then settle.
    DeadLetter(DeadLetterEnvelope),
    /// Drop the delivery, then settle.
    Discard { reason: String },
}

impl Disposition {
    /// Whether the adapter acknowledges the delivery on its own.
    ///
    /// Only a successful handler run defers to `auto_commit`; every failure
    /// path is settled so the position keeps moving.
    pub fn settle_after(&self, options: &SubscribeOptions) -> bool {
        match self {
            Disposition::Handled => options.auto_commit(),
            _ => true,
        }
    }
}

/// Decode and handle one delivery.
pub async fn process(
    subscription: &MessageSubscription,
    options: &SubscribeOptions,
    inbound: &InboundMessage,
) -> Disposition {
    let value: Value = match serde_json::from_slice(&inbound.payload) {
        Ok(value) => value,
        Err(e) => {
            if options.dead_letters_enabled() {
                warn!(
                    topic = %inbound.topic,
                    offset = %inbound.metadata.offset,
                    error = %e,
                    "Unparseable payload, dead-lettering"
                );
                return Disposition::DeadLetter(inbound.dead_letter(DeadLetterReason::ParseError, &e));
            }
            error!(
                topic = %inbound.topic,
                offset = %inbound.metadata.offset,
                error = %e,
                "Unparseable payload, discarding"
            );
            return Disposition::Discard {
                reason: e.to_string(),
            };
        }
    };

    let result = subscription.handler.handle(inbound.to_event(value)).await;
    let err = match result {
        Ok(()) => {
            debug!(
                topic = %inbound.topic,
                partition = inbound.metadata.partition,
                offset = %inbound.metadata.offset,
                "Message handled"
            );
            return Disposition::Handled;
        }
        Err(e) => e,
    };

    let policy = match options.retry {
        Some(policy) if policy.max_retries > 0 => policy,
        _ => {
            error!(
                topic = %inbound.topic,
                offset = %inbound.metadata.offset,
                error = %err,
                "Handler failed with no retry policy, discarding"
            );
            return Disposition::Discard {
                reason: err.to_string(),
            };
        }
    };

    let count = retry_count(&inbound.headers);
    let schedule = RetryConfig::redelivery(policy.backoff, policy.max_retries);
    if schedule.should_retry(count) {
        let delay = schedule.delay_for_attempt(count);
        warn!(
            topic = %inbound.topic,
            offset = %inbound.metadata.offset,
            attempt = count + 1,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Handler failed, scheduling redelivery"
        );
        return Disposition::Retry {
            attempt: count + 1,
            delay,
            error: err.to_string(),
        };
    }

    error!(
        topic = %inbound.topic,
        offset = %inbound.metadata.offset,
        retries = count,
        error = %err,
        "Handler failed after all redeliveries, dead-lettering"
    );
    Disposition::DeadLetter(inbound.dead_letter(DeadLetterReason::MaxRetriesExceeded, &*err))
}
