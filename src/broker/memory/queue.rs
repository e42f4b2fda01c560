//! In-process exchange/queue broker.
//!
//! Exchanges route to bound queues (topic patterns with `*` and `#`, fanout,
//! direct). Each consumer holds at most one unacknowledged delivery. A
//! rejected delivery without requeue is routed to the queue's dead-letter
//! exchange; closing a channel requeues everything it had in flight.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::StreamExt;

use crate::broker::amqp::{
    Delivery, DeliveryStream, OutboundDelivery, QueueChannel, QueueConnection, QueueFault,
    QueueFaultSender, QueueTransport,
};
use crate::broker::{BrokerError, Result};
use crate::config::ExchangeType;
use crate::message::Headers;

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub redelivered: bool,
}

impl QueuedMessage {
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Topic-exchange pattern match: `*` is exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

struct Consumer {
    tag: String,
    channel: u64,
    tx: fmpsc::UnboundedSender<Delivery>,
    busy: bool,
}

#[derive(Default)]
struct QueueState {
    dead_letter_exchange: Option<String>,
    /// Connection owning an exclusive queue.
    owner: Option<u64>,
    ready: VecDeque<QueuedMessage>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

struct Binding {
    queue: String,
    exchange: String,
    pattern: String,
}

struct Unacked {
    queue: String,
    consumer: String,
    message: QueuedMessage,
}

struct ChannelState {
    connection: u64,
    open: bool,
    next_tag: u64,
    faults: QueueFaultSender,
}

struct ConnectionState {
    open: bool,
    faults: QueueFaultSender,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeType>,
    bindings: Vec<Binding>,
    queues: BTreeMap<String, QueueState>,
    unacked: HashMap<(u64, u64), Unacked>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    published: Vec<OutboundDelivery>,
    next_id: u64,
    fail_next_connects: u32,
    fail_next_publishes: u32,
    fail_batch_after: Option<usize>,
    connections_opened: usize,
    channels_opened: usize,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn route(&mut self, exchange: &str, routing_key: &str, message: QueuedMessage) -> Result<()> {
        let kind = *self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::Publish(format!("no exchange '{}'", exchange)))?;

        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match kind {
                ExchangeType::Fanout => true,
                ExchangeType::Direct => b.pattern == routing_key,
                ExchangeType::Topic => topic_matches(&b.pattern, routing_key),
            })
            .map(|b| b.queue.clone())
            .collect();

        for queue in targets {
            if let Some(state) = self.queues.get_mut(&queue) {
                state.ready.push_back(message.clone());
            }
            self.dispatch(&queue);
        }
        Ok(())
    }

    fn publish(&mut self, delivery: &OutboundDelivery) -> Result<()> {
        let message = QueuedMessage {
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            payload: delivery.payload.clone(),
            headers: delivery.headers.clone(),
            redelivered: false,
        };
        self.route(&delivery.exchange, &delivery.routing_key, message)?;
        self.published.push(delivery.clone());
        Ok(())
    }

    /// Hand ready messages to idle consumers, round robin.
    fn dispatch(&mut self, queue: &str) {
        loop {
            let Some(state) = self.queues.get_mut(queue) else {
                return;
            };
            state.consumers.retain(|c| !c.tx.is_closed());
            if state.ready.is_empty() || state.consumers.is_empty() {
                return;
            }

            let count = state.consumers.len();
            let Some(index) = (0..count)
                .map(|i| (state.next_consumer + i) % count)
                .find(|&i| !state.consumers[i].busy)
            else {
                return;
            };
            state.next_consumer = (index + 1) % count;

            let Some(message) = state.ready.pop_front() else {
                return;
            };
            let consumer = &mut state.consumers[index];
            consumer.busy = true;
            let channel_id = consumer.channel;
            let consumer_tag = consumer.tag.clone();
            let tx = consumer.tx.clone();

            let Some(channel) = self.channels.get_mut(&channel_id) else {
                return;
            };
            channel.next_tag += 1;
            let tag = channel.next_tag;

            let delivery = Delivery {
                tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                payload: message.payload.clone(),
                headers: message.headers.clone(),
                redelivered: message.redelivered,
            };
            self.unacked.insert(
                (channel_id, tag),
                Unacked {
                    queue: queue.to_string(),
                    consumer: consumer_tag,
                    message,
                },
            );
            if tx.unbounded_send(delivery).is_err() {
                // Consumer vanished; put it back for the next one.
                if let Some(unacked) = self.unacked.remove(&(channel_id, tag)) {
                    self.requeue(unacked);
                }
            }
        }
    }

    fn settle(&mut self, channel: u64, tag: u64) -> Result<Unacked> {
        let unacked = self
            .unacked
            .remove(&(channel, tag))
            .ok_or_else(|| BrokerError::Acknowledge(format!("unknown delivery tag {}", tag)))?;
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            if let Some(consumer) = queue.consumers.iter_mut().find(|c| c.tag == unacked.consumer) {
                consumer.busy = false;
            }
        }
        Ok(unacked)
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.ready.push_front(message);
        }
    }

    /// Close a channel: drop its consumers and requeue its deliveries.
    fn close_channel(&mut self, channel: u64) -> Option<QueueFaultSender> {
        let state = self.channels.get_mut(&channel)?;
        if !state.open {
            return None;
        }
        state.open = false;
        let faults = state.faults.clone();

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != channel);
        }
        let tags: Vec<(u64, u64)> = self
            .unacked
            .keys()
            .filter(|(ch, _)| *ch == channel)
            .copied()
            .collect();
        for key in tags {
            if let Some(unacked) = self.unacked.remove(&key) {
                self.requeue(unacked);
            }
        }
        let queues: Vec<String> = self.queues.keys().cloned().collect();
        for queue in queues {
            self.dispatch(&queue);
        }
        Some(faults)
    }

    /// Delete the exclusive queues of a closed connection.
    fn drop_exclusive_queues(&mut self, connection: u64) {
        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            self.queues.remove(&name);
            self.bindings.retain(|b| b.queue != name);
        }
    }

    fn channel_open(&self, channel: u64) -> bool {
        self.channels.get(&channel).map(|c| c.open).unwrap_or(false)
    }
}

/// In-process queue broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ---- fault injection ----

    /// Fail the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.state().fail_next_connects = n;
    }

    /// Nack the next `n` single publishes.
    pub fn fail_next_publishes(&self, n: u32) {
        self.state().fail_next_publishes = n;
    }

    /// Make the next batch route `after` messages, then fail its confirm.
    pub fn fail_batch(&self, after: usize) {
        self.state().fail_batch_after = Some(after);
    }

    /// Close every open channel, as a channel-level protocol error would.
    pub fn kill_channel(&self) {
        let faults: Vec<QueueFaultSender> = {
            let mut state = self.state();
            let open: Vec<u64> = state
                .channels
                .iter()
                .filter(|(_, c)| c.open)
                .map(|(id, _)| *id)
                .collect();
            let faults = open
                .into_iter()
                .filter_map(|id| state.close_channel(id))
                .collect();
            faults
        };
        for tx in faults {
            let _ = tx.send(QueueFault::Channel("channel closed by broker".to_string()));
        }
    }

    /// Drop every connection and its channels.
    pub fn kill_connection(&self) {
        let faults: Vec<QueueFaultSender> = {
            let mut state = self.state();
            let channels: Vec<u64> = state.channels.keys().copied().collect();
            for id in channels {
                state.close_channel(id);
            }
            let mut closed = Vec::new();
            let faults: Vec<QueueFaultSender> = state
                .connections
                .iter_mut()
                .filter(|(_, c)| c.open)
                .map(|(id, c)| {
                    c.open = false;
                    closed.push(*id);
                    c.faults.clone()
                })
                .collect();
            for id in closed {
                state.drop_exclusive_queues(id);
            }
            faults
        };
        for tx in faults {
            let _ = tx.send(QueueFault::Connection("connection reset".to_string()));
        }
    }

    // ---- inspection ----

    /// Messages waiting in `queue`, not yet delivered.
    pub fn queue_messages(&self, queue: &str) -> Vec<QueuedMessage> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliveries handed out from `queue` and not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state()
            .unacked
            .values()
            .filter(|u| u.queue == queue)
            .count()
    }

    /// Every message accepted on `exchange`, in publish order.
    pub fn published(&self, exchange: &str) -> Vec<OutboundDelivery> {
        self.state()
            .published
            .iter()
            .filter(|d| d.exchange == exchange)
            .cloned()
            .collect()
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeType> {
        self.state().exchanges.get(exchange).copied()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.state().queues.keys().cloned().collect()
    }

    pub fn dead_letter_exchange(&self, queue: &str) -> Option<String> {
        self.state()
            .queues
            .get(queue)
            .and_then(|q| q.dead_letter_exchange.clone())
    }

    /// `(exchange, pattern)` bindings of `queue`.
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.state()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| (b.exchange.clone(), b.pattern.clone()))
            .collect()
    }

    pub fn connections_opened(&self) -> usize {
        self.state().connections_opened
    }

    pub fn channels_opened(&self) -> usize {
        self.state().channels_opened
    }
}

// ============================================================================
// Connection
// ============================================================================

struct MemoryConnection {
    broker: MemoryQueue,
    id: u64,
}

#[async_trait]
impl QueueConnection for MemoryConnection {
    async fn open_channel(&self, faults: QueueFaultSender) -> Result<Arc<dyn QueueChannel>> {
        let mut state = self.broker.state();
        let open = state.connections.get(&self.id).map(|c| c.open).unwrap_or(false);
        if !open {
            return Err(BrokerError::Transport("connection closed".to_string()));
        }

        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                open: true,
                next_tag: 0,
                faults,
            },
        );
        state.channels_opened += 1;
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    fn is_connected(&self) -> bool {
        self.broker
            .state()
            .connections
            .get(&self.id)
            .map(|c| c.open)
            .unwrap_or(false)
    }

    async fn close(&self) {
        let mut state = self.broker.state();
        let channels: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, c)| c.connection == self.id)
            .map(|(id, _)| *id)
            .collect();
        for id in channels {
            state.close_channel(id);
        }
        if let Some(connection) = state.connections.get_mut(&self.id) {
            connection.open = false;
        }
        state.drop_exclusive_queues(self.id);
    }
}

// ============================================================================
// Channel
// ============================================================================

struct MemoryChannel {
    broker: MemoryQueue,
    id: u64,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = self.broker.state();
        if !state.channel_open(self.id) {
            return Err(BrokerError::Transport("channel closed".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl QueueChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> Result<()> {
        let mut state = self.open_state()?;
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BrokerError::Admin(format!(
                "exchange '{}' exists as {}, not {}",
                name,
                existing.as_str(),
                kind.as_str()
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn delete_exchange(&self, name: &str) -> Result<()> {
        let mut state = self.open_state()?;
        state.exchanges.remove(name);
        state.bindings.retain(|b| b.exchange != name);
        Ok(())
    }

    async fn declare_queue(&self, name: &str, dead_letter_exchange: Option<&str>) -> Result<()> {
        let mut state = self.open_state()?;
        let queue = state.queues.entry(name.to_string()).or_default();
        if queue.dead_letter_exchange.is_none() {
            queue.dead_letter_exchange = dead_letter_exchange.map(str::to_string);
        }
        Ok(())
    }

    async fn declare_transient_queue(&self, name: &str) -> Result<()> {
        let mut state = self.open_state()?;
        let connection = state.channels.get(&self.id).map(|c| c.connection);
        let queue = state.queues.entry(name.to_string()).or_default();
        match queue.owner {
            None if !queue.ready.is_empty() || !queue.consumers.is_empty() => Err(
                BrokerError::Admin(format!("queue '{}' exists and is not exclusive", name)),
            ),
            Some(owner) if Some(owner) != connection => Err(BrokerError::Admin(format!(
                "queue '{}' is locked by another connection",
                name
            ))),
            _ => {
                queue.owner = connection;
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Admin(format!("no queue '{}'", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::Admin(format!("no exchange '{}'", exchange)));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == pattern);
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                pattern: pattern.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(&self, delivery: &OutboundDelivery) -> Result<()> {
        let mut state = self.open_state()?;
        if state.fail_next_publishes > 0 {
            state.fail_next_publishes -= 1;
            return Err(BrokerError::Publish("publish nacked".to_string()));
        }
        state.publish(delivery)
    }

    async fn publish_batch(&self, deliveries: &[OutboundDelivery]) -> Result<()> {
        let mut state = self.open_state()?;
        let fail_after = state.fail_batch_after.take();
        for (index, delivery) in deliveries.iter().enumerate() {
            if fail_after == Some(index) {
                return Err(BrokerError::Publish(format!(
                    "batch nacked after {} of {}",
                    index,
                    deliveries.len()
                )));
            }
            state.publish(delivery)?;
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.open_state()?;
        let (tx, rx) = fmpsc::unbounded();
        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::Subscribe(format!("no queue '{}'", queue)))?;
        target.consumers.push(Consumer {
            tag: consumer_tag.to_string(),
            channel: self.id,
            tx,
            busy: false,
        });
        state.dispatch(queue);
        Ok(rx.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.open_state()?;
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.channel == self.id && c.tag == consumer_tag));
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.open_state()?;
        let unacked = state.settle(self.id, delivery_tag)?;
        state.dispatch(&unacked.queue);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.open_state()?;
        let unacked = state.settle(self.id, delivery_tag)?;
        let queue = unacked.queue.clone();

        if requeue {
            state.requeue(unacked);
        } else {
            let dlx = state
                .queues
                .get(&queue)
                .and_then(|q| q.dead_letter_exchange.clone());
            if let Some(dlx) = dlx {
                let routing_key = unacked.message.routing_key.clone();
                let mut message = unacked.message;
                message.redelivered = false;
                // Unroutable dead letters are dropped, as the broker does.
                let _ = state.route(&dlx, &routing_key, message);
            }
        }
        state.dispatch(&queue);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.state().channel_open(self.id)
    }

    async fn close(&self) {
        self.broker.state().close_channel(self.id);
    }
}

// ============================================================================
// Transport
// ============================================================================

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn connect(&self, faults: QueueFaultSender) -> Result<Arc<dyn QueueConnection>> {
        let mut state = self.state();
        if state.fail_next_connects > 0 {
            state.fail_next_connects -= 1;
            return Err(BrokerError::Connection("connection refused".to_string()));
        }
        let id = state.next_id();
        state
            .connections
            .insert(id, ConnectionState { open: true, faults });
        state.connections_opened += 1;
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}
