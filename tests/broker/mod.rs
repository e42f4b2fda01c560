//! Shared broker integration tests.
//!
//! Tests the `BrokerDriver` contract against every adapter. Each transport
//! provides a `BrokerHarness` that can inspect and sabotage its transport,
//! then runs the shared functions through `run_broker_contract_tests!`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use switchyard::{ConnectionPolicy, DynBroker, Headers};

pub mod contract_tests;

/// Access to a broker and the transport behind it.
#[async_trait]
pub trait BrokerHarness: Send + Sync {
    fn broker(&self) -> &DynBroker;

    /// Refuse the next `n` connection attempts.
    fn refuse_connections(&self, n: u32);

    /// JSON payloads accepted on `topic`, in publish order.
    fn published(&self, topic: &str) -> Vec<Value>;

    /// Write raw bytes onto an existing `topic`, bypassing the adapter.
    async fn inject_raw(&self, topic: &str, payload: &[u8]);

    /// Headers of every message dead-lettered for `group`.
    fn dead_letters(&self, group: &str) -> Vec<Headers>;

    /// Whether every message `group` received from `topic` was settled.
    fn settled(&self, group: &str, topic: &str) -> bool;

    fn topic_exists(&self, topic: &str) -> bool;

    /// Make the next batch fail partway through. A non-atomic transport
    /// must let exactly two messages through before failing.
    fn fail_next_batch(&self);

    /// Whether a failed batch leaves nothing visible.
    fn atomic_batches(&self) -> bool;
}

/// Fast retries so recovery paths finish quickly.
pub fn test_policy() -> ConnectionPolicy {
    ConnectionPolicy {
        max_retries: 3,
        retry_interval_ms: 10,
        timeout_ms: 1_000,
    }
}

/// Poll `cond` every 10ms for up to 5s.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
