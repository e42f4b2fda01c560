//! In-process partitioned log.
//!
//! Topics hold partitions of append-only records. Consumer groups track
//! committed positions; a new consumer for a group resumes from them.
//! Transactions buffer records until commit. Fault injection lets tests
//! drive every recovery path of the Kafka adapter.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::broker::kafka::{
    ConsumerSettings, FaultSender, LogAdmin, LogConsumer, LogFault, LogProducer, LogTransaction,
    LogTransport, OutboundRecord,
};
use crate::broker::processing::InboundMessage;
use crate::broker::{BrokerError, Result};
use crate::message::{EventMessageMetadata, Headers, StartPosition, Topic, TopicConfig};

/// A record as stored in a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub timestamp: Option<i64>,
}

impl StoredRecord {
    /// Payload parsed as JSON, if it is JSON.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

struct TopicLog {
    config: TopicConfig,
    partitions: Vec<Vec<StoredRecord>>,
    next_partition: usize,
}

#[derive(Default)]
struct LogState {
    topics: BTreeMap<String, TopicLog>,
    committed: HashMap<(String, String, i32), i64>,
    fail_next_connects: u32,
    fail_next_sends: u32,
    fail_transaction_after: Option<usize>,
    producer_epoch: u64,
    consumer_epoch: u64,
    fault_senders: Vec<FaultSender>,
    created_consumers: usize,
}

impl LogState {
    fn append(&mut self, record: &OutboundRecord) -> Result<()> {
        let log = self
            .topics
            .get_mut(&record.topic)
            .ok_or_else(|| BrokerError::Publish(format!("unknown topic {}", record.topic)))?;

        let count = log.partitions.len();
        let partition = match (record.partition, &record.key) {
            (Some(p), _) if (p as usize) < count => p as usize,
            (Some(p), _) => {
                return Err(BrokerError::Publish(format!(
                    "partition {} out of range for {}",
                    p, record.topic
                )))
            }
            (None, Some(key)) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % count as u64) as usize
            }
            (None, None) => {
                let p = log.next_partition % count;
                log.next_partition += 1;
                p
            }
        };

        let records = &mut log.partitions[partition];
        records.push(StoredRecord {
            topic: record.topic.clone(),
            partition: partition as i32,
            offset: records.len() as i64,
            key: record.key.clone(),
            payload: record.payload.clone(),
            headers: record.headers.clone(),
            timestamp: record.timestamp,
        });
        Ok(())
    }

    fn take_connect_failure(&mut self) -> bool {
        if self.fail_next_connects > 0 {
            self.fail_next_connects -= 1;
            return true;
        }
        false
    }
}

/// In-process log transport. Clones share the same log.
#[derive(Clone, Default)]
pub struct MemoryLog {
    state: Arc<Mutex<LogState>>,
    appended: Arc<Notify>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ---- fault injection ----

    /// Fail the next `n` client creations (producer, admin or consumer).
    pub fn fail_next_connects(&self, n: u32) {
        self.state().fail_next_connects = n;
    }

    /// Fail the next `n` single-record sends.
    pub fn fail_next_sends(&self, n: u32) {
        self.state().fail_next_sends = n;
    }

    /// Let transactions send `n` record sets, then fail the next one.
    pub fn fail_transaction_after(&self, n: usize) {
        self.state().fail_transaction_after = Some(n);
    }

    /// Kill every live consumer.
    pub fn crash_consumer(&self) {
        let senders = {
            let mut state = self.state();
            state.consumer_epoch += 1;
            state.fault_senders.retain(|tx| !tx.is_closed());
            state.fault_senders.clone()
        };
        for tx in senders {
            let _ = tx.send(LogFault::Consumer("consumer crashed".to_string()));
        }
        self.appended.notify_waiters();
    }

    /// Fence every live producer.
    pub fn drop_producer(&self) {
        let senders = {
            let mut state = self.state();
            state.producer_epoch += 1;
            state.fault_senders.retain(|tx| !tx.is_closed());
            state.fault_senders.clone()
        };
        for tx in senders {
            let _ = tx.send(LogFault::Producer("producer fenced".to_string()));
        }
    }

    // ---- inspection ----

    /// Every record of `topic`, partition by partition.
    pub fn records(&self, topic: &str) -> Vec<StoredRecord> {
        self.state()
            .topics
            .get(topic)
            .map(|log| log.partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    pub fn topic_names(&self) -> Vec<String> {
        self.state().topics.keys().cloned().collect()
    }

    pub fn topic_config(&self, topic: &str) -> Option<TopicConfig> {
        self.state().topics.get(topic).map(|log| log.config.clone())
    }

    /// How many consumers were ever created.
    pub fn consumers_created(&self) -> usize {
        self.state().created_consumers
    }

    fn register(&self, faults: &FaultSender) {
        let mut state = self.state();
        if !state.fault_senders.iter().any(|tx| tx.same_channel(faults)) {
            state.fault_senders.push(faults.clone());
        }
    }
}

// ============================================================================
// Producer
// ============================================================================

struct MemoryProducer {
    log: MemoryLog,
    epoch: u64,
    closed: AtomicBool,
}

impl MemoryProducer {
    fn check_live(&self, state: &LogState) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport("producer closed".to_string()));
        }
        if state.producer_epoch != self.epoch {
            return Err(BrokerError::Transport("producer fenced".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LogProducer for MemoryProducer {
    async fn send(&self, record: &OutboundRecord) -> Result<()> {
        {
            let mut state = self.log.state();
            self.check_live(&state)?;
            if state.fail_next_sends > 0 {
                state.fail_next_sends -= 1;
                return Err(BrokerError::Publish("injected send failure".to_string()));
            }
            state.append(record)?;
        }
        self.log.appended.notify_waiters();
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn LogTransaction>> {
        self.check_live(&self.log.state())?;
        Ok(Box::new(MemoryTransaction {
            log: self.log.clone(),
            buffered: Vec::new(),
            sets_sent: 0,
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MemoryTransaction {
    log: MemoryLog,
    buffered: Vec<OutboundRecord>,
    sets_sent: usize,
}

#[async_trait]
impl LogTransaction for MemoryTransaction {
    async fn send(&mut self, topic: &str, records: Vec<OutboundRecord>) -> Result<()> {
        let state = self.log.state();
        if state.fail_transaction_after == Some(self.sets_sent) {
            return Err(BrokerError::Publish(format!(
                "injected transaction failure on {}",
                topic
            )));
        }
        if !state.topics.contains_key(topic) {
            return Err(BrokerError::Publish(format!("unknown topic {}", topic)));
        }
        drop(state);

        self.buffered.extend(records);
        self.sets_sent += 1;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        {
            let mut state = self.log.state();
            for record in &self.buffered {
                state.append(record)?;
            }
        }
        self.log.appended.notify_waiters();
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Admin
// ============================================================================

struct MemoryAdmin {
    log: MemoryLog,
    closed: AtomicBool,
}

#[async_trait]
impl LogAdmin for MemoryAdmin {
    async fn list_topics(&self) -> Result<Vec<String>> {
        Ok(self.log.topic_names())
    }

    async fn create_topics(&self, topics: &[Topic]) -> Result<()> {
        let mut state = self.log.state();
        for topic in topics {
            if state.topics.contains_key(&topic.name) {
                continue;
            }
            let partitions = topic.partitions().max(1) as usize;
            state.topics.insert(
                topic.name.clone(),
                TopicLog {
                    config: topic.config.clone().unwrap_or_default(),
                    partitions: vec![Vec::new(); partitions],
                    next_partition: 0,
                },
            );
        }
        Ok(())
    }

    async fn delete_topics(&self, names: &[String]) -> Result<()> {
        let mut state = self.log.state();
        for name in names {
            state.topics.remove(name);
        }
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Consumer
// ============================================================================

struct MemoryConsumer {
    log: MemoryLog,
    settings: ConsumerSettings,
    epoch: u64,
    closed: AtomicBool,
    topics: Mutex<Vec<String>>,
    /// Next position to read per (topic, partition).
    positions: Mutex<HashMap<(String, i32), i64>>,
}

impl MemoryConsumer {
    fn is_live(&self, state: &LogState) -> bool {
        !self.closed.load(Ordering::SeqCst) && state.consumer_epoch == self.epoch
    }

    /// Committed position of the group, else the configured start.
    fn initial_position(&self, state: &LogState, topic: &str, partition: i32, len: usize) -> i64 {
        let committed = state
            .committed
            .get(&(self.settings.group_id.clone(), topic.to_string(), partition));
        match (committed, self.settings.start) {
            (Some(position), _) => *position,
            (None, StartPosition::Earliest) => 0,
            (None, StartPosition::Latest) => len as i64,
        }
    }

    fn next_record(&self, state: &LogState) -> Option<StoredRecord> {
        let topics = self.topics.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let mut positions = self.positions.lock().unwrap_or_else(|p| p.into_inner());

        for topic in &topics {
            let Some(log) = state.topics.get(topic) else {
                continue;
            };
            for (partition, records) in log.partitions.iter().enumerate() {
                let partition = partition as i32;
                let position = *positions
                    .entry((topic.clone(), partition))
                    .or_insert_with(|| self.initial_position(state, topic, partition, records.len()));

                if let Some(record) = records.get(position as usize) {
                    positions.insert((topic.clone(), partition), position + 1);
                    return Some(record.clone());
                }
            }
        }
        None
    }
}

#[async_trait]
impl LogConsumer for MemoryConsumer {
    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        *self.topics.lock().unwrap_or_else(|p| p.into_inner()) = topics.to_vec();

        // Pin start positions now so `Latest` means "from subscribe time".
        let state = self.log.state();
        if self.is_live(&state) {
            let mut positions = self.positions.lock().unwrap_or_else(|p| p.into_inner());
            for topic in topics {
                let Some(log) = state.topics.get(topic) else {
                    continue;
                };
                for (partition, records) in log.partitions.iter().enumerate() {
                    let partition = partition as i32;
                    positions
                        .entry((topic.clone(), partition))
                        .or_insert_with(|| self.initial_position(&state, topic, partition, records.len()));
                }
            }
        }
        drop(state);
        self.log.appended.notify_waiters();
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.topics.lock().unwrap_or_else(|p| p.into_inner()).clear();
        Ok(())
    }

    async fn recv(&self) -> Result<InboundMessage> {
        loop {
            let appended = self.log.appended.notified();
            {
                let state = self.log.state();
                if !self.is_live(&state) {
                    return Err(BrokerError::Transport("consumer crashed".to_string()));
                }
                if let Some(record) = self.next_record(&state) {
                    return Ok(InboundMessage {
                        metadata: EventMessageMetadata::new(
                            record.topic.clone(),
                            record.partition,
                            record.offset,
                        ),
                        topic: record.topic,
                        payload: record.payload,
                        key: record.key,
                        headers: record.headers,
                        timestamp: record.timestamp,
                    });
                }
            }
            appended.await;
        }
    }

    async fn commit(&self, topic: &str, partition: i32, position: i64) -> Result<()> {
        let mut state = self.log.state();
        if !self.is_live(&state) {
            return Err(BrokerError::Transport("consumer crashed".to_string()));
        }
        state.committed.insert(
            (self.settings.group_id.clone(), topic.to_string(), partition),
            position,
        );
        Ok(())
    }

    async fn is_member(&self) -> bool {
        self.is_live(&self.log.state())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.log.appended.notify_waiters();
    }
}

// ============================================================================
// Transport
// ============================================================================

#[async_trait]
impl LogTransport for MemoryLog {
    async fn producer(&self, faults: FaultSender) -> Result<Arc<dyn LogProducer>> {
        let epoch = {
            let mut state = self.state();
            if state.take_connect_failure() {
                return Err(BrokerError::Connection("injected connect failure".to_string()));
            }
            state.producer_epoch
        };
        self.register(&faults);
        Ok(Arc::new(MemoryProducer {
            log: self.clone(),
            epoch,
            closed: AtomicBool::new(false),
        }))
    }

    async fn admin(&self, faults: FaultSender) -> Result<Arc<dyn LogAdmin>> {
        if self.state().take_connect_failure() {
            return Err(BrokerError::Connection("injected connect failure".to_string()));
        }
        self.register(&faults);
        Ok(Arc::new(MemoryAdmin {
            log: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn consumer(
        &self,
        settings: ConsumerSettings,
        faults: FaultSender,
    ) -> Result<Arc<dyn LogConsumer>> {
        let epoch = {
            let mut state = self.state();
            if state.take_connect_failure() {
                return Err(BrokerError::Connection("injected connect failure".to_string()));
            }
            state.created_consumers += 1;
            state.consumer_epoch
        };
        self.register(&faults);
        Ok(Arc::new(MemoryConsumer {
            log: self.clone(),
            settings,
            epoch,
            closed: AtomicBool::new(false),
            topics: Mutex::new(Vec::new()),
            positions: Mutex::new(HashMap::new()),
        }))
    }
}
