//! In-process transports.
//!
//! `MemoryLog` stands in for a Kafka cluster and `MemoryQueue` for a
//! RabbitMQ broker. Both implement the same transport seams as the native
//! clients, so the adapters run unchanged on top of them.

mod log;
mod queue;

pub use log::{MemoryLog, StoredRecord};
pub use queue::{topic_matches, MemoryQueue, QueuedMessage};

/// Handle to the transport behind a memory-backed broker.
#[derive(Clone)]
pub enum MemoryHandle {
    Log(MemoryLog),
    Queue(MemoryQueue),
}

impl MemoryHandle {
    pub fn as_log(&self) -> Option<&MemoryLog> {
        match self {
            MemoryHandle::Log(log) => Some(log),
            MemoryHandle::Queue(_) => None,
        }
    }

    pub fn as_queue(&self) -> Option<&MemoryQueue> {
        match self {
            MemoryHandle::Queue(queue) => Some(queue),
            MemoryHandle::Log(_) => None,
        }
    }
}
