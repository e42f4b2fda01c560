//! Committed-position bookkeeping for the log transport.
//!
//! Acknowledging `{topic, partition, offset}` commits `offset + 1`. Positions
//! only move forward: acknowledging an older offset after a newer one was
//! committed is a no-op.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct OffsetTracker {
    committed: Mutex<HashMap<(String, i32), i64>>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether committing `position` would advance `(topic, partition)`.
    pub fn would_advance(&self, topic: &str, partition: i32, position: i64) -> bool {
        match self.committed(topic, partition) {
            Some(current) => position > current,
            None => true,
        }
    }

    /// Record `position` as committed if it advances. Returns whether it did.
    pub fn advance(&self, topic: &str, partition: i32, position: i64) -> bool {
        let mut committed = self
            .committed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = committed.entry((topic.to_string(), partition));
        match entry {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                if position > *slot.get() {
                    slot.insert(position);
                    true
                } else {
                    false
                }
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(position);
                true
            }
        }
    }

    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.committed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(topic.to_string(), partition))
            .copied()
    }

    pub fn clear(&self) {
        self.committed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}
