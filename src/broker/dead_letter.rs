//! Dead-letter envelopes and retry headers.
//!
//! ## Naming
//!
//! Each consumer cohort gets one dead-letter destination:
//! `{group_id}-dead-letter`. On the log transport it is a topic; on the
//! queue transport it is a fanout exchange with a queue of the same name.
//!
//! ## Headers
//!
//! A dead-lettered message keeps its original bytes and headers and gains
//! `originalTopic`, `failureReason`, `errorMessage`, `errorStack` and
//! `failureTimestamp`. A redelivered message gains `retryCount`,
//! `errorMessage` and `lastRetryTimestamp`.

use std::error::Error;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::message::Headers;

pub const ORIGINAL_TOPIC_HEADER: &str = "originalTopic";
pub const FAILURE_REASON_HEADER: &str = "failureReason";
pub const ERROR_MESSAGE_HEADER: &str = "errorMessage";
pub const ERROR_STACK_HEADER: &str = "errorStack";
pub const FAILURE_TIMESTAMP_HEADER: &str = "failureTimestamp";
pub const RETRY_COUNT_HEADER: &str = "retryCount";
pub const LAST_RETRY_TIMESTAMP_HEADER: &str = "lastRetryTimestamp";

const DEAD_LETTER_SUFFIX: &str = "-dead-letter";

/// Dead-letter destination for a consumer cohort.
pub fn dead_letter_name(group_id: &str) -> String {
    format!("{}{}", group_id, DEAD_LETTER_SUFFIX)
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadLetterReason {
    /// Payload could not be deserialized. Never retried.
    ParseError,
    /// Scheduling the redelivery itself failed.
    RetryFailed,
    /// The handler kept failing after every redelivery.
    MaxRetriesExceeded,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::ParseError => "PARSE_ERROR",
            DeadLetterReason::RetryFailed => "RETRY_FAILED",
            DeadLetterReason::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeadLetterReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PARSE_ERROR" => Ok(DeadLetterReason::ParseError),
            "RETRY_FAILED" => Ok(DeadLetterReason::RetryFailed),
            "MAX_RETRIES_EXCEEDED" => Ok(DeadLetterReason::MaxRetriesExceeded),
            other => Err(format!("unknown dead-letter reason: {}", other)),
        }
    }
}

/// A failed message on its way to the dead-letter destination.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterEnvelope {
    pub original_topic: String,
    pub reason: DeadLetterReason,
    pub error_message: String,
    pub error_stack: String,
    pub failure_timestamp: DateTime<Utc>,
    /// Original bytes, untouched.
    pub payload: Vec<u8>,
    pub key: Option<String>,
    /// Original headers.
    pub headers: Headers,
}

impl DeadLetterEnvelope {
    pub fn new(
        original_topic: impl Into<String>,
        reason: DeadLetterReason,
        error: &(dyn Error + 'static),
        payload: Vec<u8>,
        headers: Headers,
    ) -> Self {
        Self {
            original_topic: original_topic.into(),
            reason,
            error_message: error.to_string(),
            error_stack: error_chain(error),
            failure_timestamp: Utc::now(),
            payload,
            key: None,
            headers,
        }
    }

    pub fn with_key(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }

    /// Original headers augmented with the failure description.
    pub fn wire_headers(&self) -> Headers {
        let mut headers = self.headers.clone();
        headers.insert(ORIGINAL_TOPIC_HEADER.to_string(), self.original_topic.clone());
        headers.insert(FAILURE_REASON_HEADER.to_string(), self.reason.to_string());
        headers.insert(ERROR_MESSAGE_HEADER.to_string(), self.error_message.clone());
        headers.insert(ERROR_STACK_HEADER.to_string(), self.error_stack.clone());
        headers.insert(
            FAILURE_TIMESTAMP_HEADER.to_string(),
            rfc3339(self.failure_timestamp),
        );
        headers
    }
}

/// Render an error with its `source()` chain, one cause per line.
pub fn error_chain(error: &(dyn Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str("\ncaused by: ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

/// Redelivery count carried in the headers. Missing or garbled means zero.
pub fn retry_count(headers: &Headers) -> u32 {
    headers
        .get(RETRY_COUNT_HEADER)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Headers for a redelivered copy: original headers with the retry counter
/// set to `attempt` and the failure that caused it.
pub fn retry_headers(headers: &Headers, attempt: u32, error_message: &str) -> Headers {
    let mut next = headers.clone();
    next.insert(RETRY_COUNT_HEADER.to_string(), attempt.to_string());
    next.insert(ERROR_MESSAGE_HEADER.to_string(), error_message.to_string());
    next.insert(LAST_RETRY_TIMESTAMP_HEADER.to_string(), rfc3339(Utc::now()));
    next
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Outer(std::io::Error);

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "handler failed")
        }
    }

    impl Error for Outer {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_dead_letter_name() {
        assert_eq!(dead_letter_name("billing"), "billing-dead-letter");
    }

    #[test]
    fn test_reason_wire_strings() {
        for reason in [
            DeadLetterReason::ParseError,
            DeadLetterReason::RetryFailed,
            DeadLetterReason::MaxRetriesExceeded,
        ] {
            assert_eq!(reason.as_str().parse::<DeadLetterReason>(), Ok(reason));
        }
        assert_eq!(
            DeadLetterReason::MaxRetriesExceeded.to_string(),
            "MAX_RETRIES_EXCEEDED"
        );
        assert!("NOPE".parse::<DeadLetterReason>().is_err());
    }

    #[test]
    fn test_envelope_headers_keep_originals() {
        let mut original = Headers::new();
        original.insert("trace".into(), "abc".into());

        let err = Outer(std::io::Error::other("disk full"));
        let envelope = DeadLetterEnvelope::new(
            "orders",
            DeadLetterReason::MaxRetriesExceeded,
            &err,
            b"{}".to_vec(),
            original,
        );

        let headers = envelope.wire_headers();
        assert_eq!(headers["trace"], "abc");
        assert_eq!(headers[ORIGINAL_TOPIC_HEADER], "orders");
        assert_eq!(headers[FAILURE_REASON_HEADER], "MAX_RETRIES_EXCEEDED");
        assert_eq!(headers[ERROR_MESSAGE_HEADER], "handler failed");
        assert_eq!(
            headers[ERROR_STACK_HEADER],
            "handler failed\ncaused by: disk full"
        );
        assert!(DateTime::parse_from_rfc3339(&headers[FAILURE_TIMESTAMP_HEADER]).is_ok());
    }

    #[test]
    fn test_retry_headers_increment() {
        let headers = Headers::new();
        assert_eq!(retry_count(&headers), 0);

        let once = retry_headers(&headers, 1, "boom");
        assert_eq!(retry_count(&once), 1);
        assert_eq!(once[ERROR_MESSAGE_HEADER], "boom");
        assert!(once.contains_key(LAST_RETRY_TIMESTAMP_HEADER));

        let twice = retry_headers(&once, retry_count(&once) + 1, "boom again");
        assert_eq!(retry_count(&twice), 2);
    }

    #[test]
    fn test_garbled_retry_count_is_zero() {
        let mut headers = Headers::new();
        headers.insert(RETRY_COUNT_HEADER.into(), "many".into());
        assert_eq!(retry_count(&headers), 0);
    }
}
