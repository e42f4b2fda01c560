//! Kafka broker adapter.
//!
//! Publishes through an idempotent producer, batches through a transactional
//! one, and consumes with a single consumer-group member per adapter with
//! manual offset commits.
//!
//! ## Recovery
//!
//! - Producer/admin faults: capped exponential reconnect bounded by
//!   `max_retries`, then idle until the next `connect()`.
//! - Consumer crash: rebuild with a fixed `retry_interval` until it succeeds
//!   or the adapter is disconnected. The rebuilt consumer resumes from the
//!   group's committed positions.
//!
//! Every background loop observes the adapter's cancellation token, so
//! `disconnect()` stops all of them.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use backon::Retryable;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dead_letter::{dead_letter_name, retry_headers, DeadLetterEnvelope, DeadLetterReason};
use super::offsets::OffsetTracker;
use super::pending::{await_outcome, PendingQueue};
use super::processing::{self, Disposition, InboundMessage};
use super::retry::{reconnect_backoff, sleep_or_cancel, RetryConfig};
use super::{BrokerDriver, BrokerError, ComponentState, ConnectionState, Result};
use crate::config::{ConnectionPolicy, KafkaConfig};
use crate::message::{
    EventMessage, EventMessageMetadata, MessageSubscription, SubscribeOptions, Topic,
};

pub mod transport;

#[cfg(feature = "kafka")]
mod native;

#[cfg(feature = "kafka")]
pub use native::RdKafkaTransport;
pub use transport::{
    ConsumerSettings, FaultSender, LogAdmin, LogConsumer, LogFault, LogProducer, LogTransaction,
    LogTransport, OutboundRecord,
};

// ============================================================================
// State
// ============================================================================

#[derive(Default)]
struct Links {
    state: ConnectionState,
    producer: Option<Arc<dyn LogProducer>>,
    producer_state: ComponentState,
    admin: Option<Arc<dyn LogAdmin>>,
    admin_state: ComponentState,
    consumer: Option<Arc<dyn LogConsumer>>,
    consumer_state: ComponentState,
    /// Stops the poll task of the current consumer.
    poll_cancel: Option<CancellationToken>,
    faults: Option<FaultSender>,
}

struct Tracked {
    subscription: MessageSubscription,
    active: bool,
}

#[derive(Default)]
struct Registry {
    options: Option<SubscribeOptions>,
    entries: Vec<Tracked>,
}

impl Registry {
    fn active_topics(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|t| t.active)
            .map(|t| t.subscription.topic.name.clone())
            .collect()
    }

    fn find(&self, topic: &str) -> Option<&Tracked> {
        self.entries.iter().find(|t| t.subscription.topic.name == topic)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct KafkaInner<T> {
    config: KafkaConfig,
    policy: ConnectionPolicy,
    transport: T,
    links: Mutex<Links>,
    registry: Mutex<Registry>,
    known_topics: Mutex<HashSet<String>>,
    pending: PendingQueue<OutboundRecord>,
    offsets: OffsetTracker,
    /// Group whose positions `offsets` holds. Survives disconnects.
    offsets_group: Mutex<Option<String>>,
    cancel: Mutex<CancellationToken>,
    connect_lock: Arc<tokio::sync::Mutex<()>>,
    batch_lock: tokio::sync::Mutex<()>,
    commit_lock: tokio::sync::Mutex<()>,
}

/// Kafka implementation of `BrokerDriver`, generic over its transport.
pub struct KafkaAdapter<T: LogTransport> {
    inner: Arc<KafkaInner<T>>,
}

impl<T: LogTransport> KafkaAdapter<T> {
    pub fn new(config: KafkaConfig, policy: ConnectionPolicy, transport: T) -> Self {
        Self {
            inner: Arc::new(KafkaInner {
                config,
                policy,
                transport,
                links: Mutex::new(Links::default()),
                registry: Mutex::new(Registry::default()),
                known_topics: Mutex::new(HashSet::new()),
                pending: PendingQueue::new(),
                offsets: OffsetTracker::new(),
                offsets_group: Mutex::new(None),
                cancel: Mutex::new(CancellationToken::new()),
                connect_lock: Arc::new(tokio::sync::Mutex::new(())),
                batch_lock: tokio::sync::Mutex::new(()),
                commit_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.inner.links).state
    }

    /// Producer, admin and consumer states, in that order.
    pub fn component_states(&self) -> (ComponentState, ComponentState, ComponentState) {
        let links = lock(&self.inner.links);
        (links.producer_state, links.admin_state, links.consumer_state)
    }

    /// Number of publishes waiting for the producer.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.len()
    }

    /// Highest position this adapter committed for `(topic, partition)`.
    pub fn committed_position(&self, topic: &str, partition: i32) -> Option<i64> {
        self.inner.offsets.committed(topic, partition)
    }
}

// ============================================================================
// Connection lifecycle
// ============================================================================

impl<T: LogTransport> KafkaInner<T> {
    fn token(&self) -> CancellationToken {
        lock(&self.cancel).clone()
    }

    /// Token for a new connection lifetime; reuses the live one if any.
    fn renew_token(&self) -> CancellationToken {
        let mut cancel = lock(&self.cancel);
        if cancel.is_cancelled() {
            *cancel = CancellationToken::new();
        }
        cancel.clone()
    }

    fn producer(&self) -> Option<Arc<dyn LogProducer>> {
        lock(&self.links).producer.clone()
    }

    fn admin(&self) -> Result<Arc<dyn LogAdmin>> {
        lock(&self.links).admin.clone().ok_or(BrokerError::NotConnected)
    }

    fn consumer(&self) -> Option<Arc<dyn LogConsumer>> {
        lock(&self.links).consumer.clone()
    }

    fn producer_ready(&self) -> bool {
        let links = lock(&self.links);
        links.producer.is_some() && links.producer_state == ComponentState::Connected
    }

    fn fully_connected(&self) -> bool {
        let links = lock(&self.links);
        links.state == ConnectionState::Connected
            && links.producer.is_some()
            && links.admin.is_some()
    }

    /// Fault sender for the current connection lifetime, spawning the
    /// supervisor on first use.
    fn fault_sender(self: &Arc<Self>, cancel: &CancellationToken) -> FaultSender {
        let mut links = lock(&self.links);
        if let Some(tx) = links.faults.as_ref().filter(|tx| !tx.is_closed()) {
            return tx.clone();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        links.faults = Some(tx.clone());
        drop(links);

        tokio::spawn(self.clone().supervise(rx, cancel.clone()));
        tx
    }

    async fn supervise(self: Arc<Self>, mut faults: mpsc::UnboundedReceiver<LogFault>, cancel: CancellationToken) {
        loop {
            let fault = tokio::select! {
                _ = cancel.cancelled() => return,
                fault = faults.recv() => match fault {
                    Some(fault) => fault,
                    None => return,
                },
            };

            match fault {
                LogFault::Producer(reason) => self.on_producer_fault(&reason),
                LogFault::Admin(reason) => self.on_admin_fault(&reason),
                LogFault::Consumer(reason) => self.schedule_consumer_rebuild(&reason),
            }
        }
    }

    /// Retry `make` with capped exponential backoff, aborting on cancellation.
    async fn with_backoff<R, F, Fut>(
        &self,
        component: &'static str,
        cancel: &CancellationToken,
        make: F,
    ) -> Result<R>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let attempts = make
            .retry(reconnect_backoff(&self.policy))
            .notify(|err: &BrokerError, dur| {
                warn!(component, error = %err, delay = ?dur, "Kafka client creation failed, retrying");
            });

        tokio::select! {
            result = attempts => result,
            _ = cancel.cancelled() => Err(BrokerError::Disconnected),
        }
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        let result = {
            let _guard = self.connect_lock.lock().await;
            self.connect_locked().await
        };
        if let Err(e) = &result {
            self.reject_pending(e).await;
        }
        result
    }

    /// Fail every parked publish once connecting has been given up.
    async fn reject_pending(&self, cause: &BrokerError) {
        // disconnect() answers parked publishes itself.
        if matches!(cause, BrokerError::Disconnected) {
            return;
        }
        let reason = cause.to_string();
        let rejected = self
            .pending
            .reject_all(|| BrokerError::Connection(reason.clone()))
            .await;
        if rejected > 0 {
            warn!(rejected, error = %reason, "Rejected pending publishes, Kafka unreachable");
        }
    }

    /// Create whatever client is missing. Caller holds `connect_lock`.
    async fn connect_locked(self: &Arc<Self>) -> Result<()> {
        if self.fully_connected() {
            return Ok(());
        }

        {
            let mut links = lock(&self.links);
            if links.state == ConnectionState::Disconnected {
                links.state = ConnectionState::Connecting;
            }
        }

        let cancel = self.renew_token();
        let faults = self.fault_sender(&cancel);

        if self.producer().is_none() {
            let created = self
                .with_backoff("producer", &cancel, || self.transport.producer(faults.clone()))
                .await;
            match created {
                Ok(producer) => {
                    let mut links = lock(&self.links);
                    links.producer = Some(producer);
                    links.producer_state = ComponentState::Connected;
                }
                Err(e) => {
                    self.mark_failed_connect();
                    error!(brokers = %self.config.bootstrap_servers(), error = %e, "Failed to create Kafka producer");
                    return Err(into_connection_error(e));
                }
            }
        }

        if lock(&self.links).admin.is_none() {
            let created = self
                .with_backoff("admin", &cancel, || self.transport.admin(faults.clone()))
                .await;
            match created {
                Ok(admin) => {
                    let mut links = lock(&self.links);
                    links.admin = Some(admin);
                    links.admin_state = ComponentState::Connected;
                }
                Err(e) => {
                    self.mark_failed_connect();
                    error!(brokers = %self.config.bootstrap_servers(), error = %e, "Failed to create Kafka admin client");
                    return Err(into_connection_error(e));
                }
            }
        }

        lock(&self.links).state = ConnectionState::Connected;
        info!(
            brokers = %self.config.bootstrap_servers(),
            client_id = %self.config.client_id,
            "Connected to Kafka"
        );

        self.spawn_drain();
        Ok(())
    }

    fn mark_failed_connect(&self) {
        let mut links = lock(&self.links);
        if links.producer.is_none() && links.admin.is_none() {
            links.state = ConnectionState::Disconnected;
        }
    }

    /// Kick a connect in the background unless one is already running.
    fn spawn_connect_if_idle(self: &Arc<Self>) {
        let Ok(guard) = self.connect_lock.clone().try_lock_owned() else {
            debug!("Kafka connect already in flight");
            return;
        };

        let inner = self.clone();
        tokio::spawn(async move {
            let result = {
                let _guard = guard;
                inner.connect_locked().await
            };
            if let Err(e) = result {
                warn!(error = %e, "Opportunistic Kafka connect failed");
                inner.reject_pending(&e).await;
            }
        });
    }

    fn on_producer_fault(self: &Arc<Self>, reason: &str) {
        let stale = {
            let mut links = lock(&self.links);
            if links.state != ConnectionState::Connected
                || links.producer_state == ComponentState::Reconnecting
            {
                return;
            }
            links.producer_state = ComponentState::Reconnecting;
            links.producer.take()
        };
        warn!(reason, "Kafka producer lost, reconnecting");

        let inner = self.clone();
        let cancel = self.token();
        tokio::spawn(async move {
            if let Some(stale) = stale {
                stale.close().await;
            }
            inner.reconnect_producer(cancel).await;
        });
    }

    async fn reconnect_producer(self: Arc<Self>, cancel: CancellationToken) {
        let faults = self.fault_sender(&cancel);
        let created = self
            .with_backoff("producer", &cancel, || {
                let inner = self.clone();
                let faults = faults.clone();
                async move {
                    let _guard = inner.connect_lock.lock().await;
                    if let Some(existing) = inner.producer() {
                        return Ok(existing);
                    }
                    inner.transport.producer(faults).await
                }
            })
            .await;

        match created {
            Ok(producer) => {
                {
                    let mut links = lock(&self.links);
                    links.producer = Some(producer);
                    links.producer_state = ComponentState::Connected;
                }
                info!("Kafka producer reconnected");
                self.drain_pending().await;
            }
            Err(BrokerError::Disconnected) => {}
            Err(e) => {
                lock(&self.links).producer_state = ComponentState::Disconnected;
                error!(error = %e, "Kafka producer reconnect exhausted, waiting for connect()");
                self.reject_pending(&e).await;
            }
        }
    }

    fn on_admin_fault(self: &Arc<Self>, reason: &str) {
        let stale = {
            let mut links = lock(&self.links);
            if links.state != ConnectionState::Connected
                || links.admin_state == ComponentState::Reconnecting
            {
                return;
            }
            links.admin_state = ComponentState::Reconnecting;
            links.admin.take()
        };
        warn!(reason, "Kafka admin client lost, reconnecting");

        let inner = self.clone();
        let cancel = self.token();
        tokio::spawn(async move {
            if let Some(stale) = stale {
                stale.close().await;
            }
            inner.reconnect_admin(cancel).await;
        });
    }

    async fn reconnect_admin(self: Arc<Self>, cancel: CancellationToken) {
        let faults = self.fault_sender(&cancel);
        let created = self
            .with_backoff("admin", &cancel, || {
                let inner = self.clone();
                let faults = faults.clone();
                async move {
                    let _guard = inner.connect_lock.lock().await;
                    if let Ok(existing) = inner.admin() {
                        return Ok(existing);
                    }
                    inner.transport.admin(faults).await
                }
            })
            .await;

        match created {
            Ok(admin) => {
                let mut links = lock(&self.links);
                links.admin = Some(admin);
                links.admin_state = ComponentState::Connected;
                info!("Kafka admin client reconnected");
            }
            Err(BrokerError::Disconnected) => {}
            Err(e) => {
                lock(&self.links).admin_state = ComponentState::Disconnected;
                error!(error = %e, "Kafka admin reconnect exhausted, waiting for connect()");
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.token().cancel();

        let rejected = self.pending.reject_all(|| BrokerError::Disconnected).await;
        if rejected > 0 {
            warn!(rejected, "Rejected pending publishes on disconnect");
        }

        let (producer, admin, consumer) = {
            let mut links = lock(&self.links);
            if let Some(poll) = links.poll_cancel.take() {
                poll.cancel();
            }
            links.faults = None;
            links.state = ConnectionState::Disconnected;
            links.producer_state = ComponentState::Disconnected;
            links.admin_state = ComponentState::Disconnected;
            links.consumer_state = ComponentState::Disconnected;
            (links.producer.take(), links.admin.take(), links.consumer.take())
        };

        if let Some(consumer) = consumer {
            consumer.close().await;
        }
        if let Some(producer) = producer {
            producer.close().await;
        }
        if let Some(admin) = admin {
            admin.close().await;
        }

        lock(&self.known_topics).clear();
        *lock(&self.registry) = Registry::default();

        info!("Disconnected from Kafka");
        Ok(())
    }

    async fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        if self.fully_connected() {
            return Ok(());
        }
        self.connect().await
    }
}

fn into_connection_error(e: BrokerError) -> BrokerError {
    match e {
        BrokerError::Connection(_) | BrokerError::Disconnected => e,
        other => BrokerError::Connection(other.to_string()),
    }
}

// ============================================================================
// Topics
// ============================================================================

impl<T: LogTransport> KafkaInner<T> {
    /// Make sure `topic` exists, creating it on first use.
    async fn ensure_topic(&self, topic: &Topic) -> Result<()> {
        if lock(&self.known_topics).contains(&topic.name) {
            return Ok(());
        }

        let admin = self.admin()?;
        let existing = admin.list_topics().await?;
        if !existing.iter().any(|name| name == &topic.name) {
            admin.create_topics(std::slice::from_ref(topic)).await?;
            info!(
                topic = %topic.name,
                partitions = topic.partitions(),
                "Created Kafka topic"
            );
        }

        lock(&self.known_topics).insert(topic.name.clone());
        Ok(())
    }

    async fn create_topics(&self, topics: &[Topic]) -> Result<()> {
        let admin = self.admin()?;
        let existing = admin.list_topics().await?;

        let missing: Vec<Topic> = topics
            .iter()
            .filter(|t| !existing.contains(&t.name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            admin.create_topics(&missing).await?;
        }

        let mut known = lock(&self.known_topics);
        known.extend(topics.iter().map(|t| t.name.clone()));
        Ok(())
    }

    async fn delete_topics(&self, topics: &[Topic]) -> Result<()> {
        let admin = self.admin()?;
        let names: Vec<String> = topics.iter().map(|t| t.name.clone()).collect();
        admin.delete_topics(&names).await?;

        let mut known = lock(&self.known_topics);
        for name in &names {
            known.remove(name);
        }
        Ok(())
    }
}

// ============================================================================
// Publish
// ============================================================================

fn to_record(message: EventMessage<Value>) -> Result<OutboundRecord> {
    let payload = serde_json::to_vec(&message.value)?;
    let config = message.config.unwrap_or_default();
    Ok(OutboundRecord {
        topic: message.topic,
        key: config.key,
        payload,
        headers: config.headers.unwrap_or_default(),
        partition: config.partition,
        timestamp: config.timestamp,
    })
}

impl<T: LogTransport> KafkaInner<T> {
    fn retry_budget(&self, message: &EventMessage<Value>) -> u32 {
        message.retries().unwrap_or(self.policy.max_retries)
    }

    /// Queue a record and wait until it is accepted or rejected for good.
    ///
    /// Records always pass through the pending queue so that a publish made
    /// while others are still waiting never overtakes them.
    async fn publish_record(self: &Arc<Self>, record: OutboundRecord, retries: u32) -> Result<()> {
        let outcome = self.pending.enqueue(record, retries);

        if self.producer_ready() {
            self.drain_pending().await;
        } else {
            debug!(pending = self.pending.len(), "Kafka producer not ready, message queued");
            self.spawn_connect_if_idle();
        }

        await_outcome(outcome).await
    }

    fn spawn_drain(self: &Arc<Self>) {
        if self.pending.is_empty() {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move { inner.drain_pending().await });
    }

    async fn drain_pending(&self) {
        if !self.producer_ready() {
            return;
        }
        let drained = self
            .pending
            .drain(|record, retries| self.deliver(record, retries))
            .await;
        if drained > 0 {
            debug!(drained, "Drained pending Kafka publishes");
        }
    }

    /// Ensure the topic and send with `min(100 * 2^n, 5000)` ms backoff.
    async fn deliver(&self, record: OutboundRecord, retries: u32) -> Result<()> {
        let schedule = RetryConfig::log_publish(retries);
        let cancel = self.token();
        let topic = Topic::new(record.topic.clone());
        let mut attempt = 0;

        loop {
            let result = match self.ensure_topic(&topic).await {
                Ok(()) => match self.producer() {
                    Some(producer) => producer.send(&record).await,
                    None => Err(BrokerError::NotConnected),
                },
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    debug!(topic = %record.topic, key = ?record.key, "Published to Kafka");
                    return Ok(());
                }
                Err(e) if schedule.should_retry(attempt) => {
                    let delay = schedule.delay_for_attempt(attempt);
                    warn!(
                        topic = %record.topic,
                        attempt = attempt + 1,
                        max_retries = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Kafka publish failed, retrying"
                    );
                    if !sleep_or_cancel(delay, &cancel).await {
                        return Err(BrokerError::Disconnected);
                    }
                    attempt += 1;
                }
                Err(e) => {
                    error!(topic = %record.topic, attempts = attempt + 1, error = %e, "Kafka publish failed");
                    return Err(match e {
                        BrokerError::Publish(_) | BrokerError::Disconnected => e,
                        other => BrokerError::Publish(other.to_string()),
                    });
                }
            }
        }
    }

    /// Send a batch inside one transaction: all records or none.
    async fn publish_batch(self: &Arc<Self>, messages: Vec<EventMessage<Value>>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        if !self.producer_ready() {
            self.connect().await?;
        }

        let mut groups: Vec<(String, Vec<OutboundRecord>)> = Vec::new();
        for message in messages {
            let record = to_record(message)?;
            match groups.iter_mut().find(|(topic, _)| *topic == record.topic) {
                Some((_, records)) => records.push(record),
                None => groups.push((record.topic.clone(), vec![record])),
            }
        }

        let _batch = self.batch_lock.lock().await;
        for (topic, _) in &groups {
            self.ensure_topic(&Topic::new(topic.clone())).await?;
        }

        let producer = self.producer().ok_or(BrokerError::NotConnected)?;
        let mut transaction = producer.begin().await?;
        let count: usize = groups.iter().map(|(_, records)| records.len()).sum();

        for (topic, records) in groups {
            if let Err(e) = transaction.send(&topic, records).await {
                warn!(topic = %topic, error = %e, "Kafka batch failed, aborting transaction");
                if let Err(abort_err) = transaction.abort().await {
                    error!(error = %abort_err, "Failed to abort Kafka transaction");
                }
                return Err(e);
            }
        }

        transaction.commit().await?;
        debug!(count, "Committed Kafka batch");
        Ok(())
    }
}

// ============================================================================
// Subscribe
// ============================================================================

impl<T: LogTransport> KafkaInner<T> {
    async fn subscribe(
        self: &Arc<Self>,
        subscriptions: Vec<MessageSubscription>,
        options: SubscribeOptions,
    ) -> Result<()> {
        if subscriptions.is_empty() {
            return Ok(());
        }

        if let Some(bound) = lock(&self.registry).options.as_ref() {
            if bound.group_id != options.group_id {
                return Err(BrokerError::Subscribe(format!(
                    "consumer already bound to group '{}', cannot join '{}'",
                    bound.group_id, options.group_id
                )));
            }
        }

        self.ensure_connected().await?;

        if options.dead_letters_enabled() {
            self.ensure_topic(&Topic::new(dead_letter_name(&options.group_id)))
                .await
                .map_err(|e| BrokerError::Subscribe(format!("dead-letter topic: {}", e)))?;
        }
        for subscription in &subscriptions {
            self.ensure_topic(&subscription.topic)
                .await
                .map_err(|e| BrokerError::Subscribe(e.to_string()))?;
        }

        {
            let mut group = lock(&self.offsets_group);
            if group.as_deref() != Some(options.group_id.as_str()) {
                self.offsets.clear();
                *group = Some(options.group_id.clone());
            }
        }

        {
            let mut registry = lock(&self.registry);
            for subscription in subscriptions {
                registry
                    .entries
                    .retain(|t| t.subscription.topic != subscription.topic);
                registry.entries.push(Tracked {
                    subscription,
                    active: true,
                });
            }
            registry.options = Some(options);
        }

        let state = lock(&self.links).consumer_state;
        match (self.consumer(), state) {
            (Some(consumer), _) => self.refresh_topics(&consumer).await,
            // The running rebuild picks the new topics up.
            (None, ComponentState::Reconnecting) => Ok(()),
            (None, _) => {
                let cancel = self.token();
                self.start_consumer(&cancel)
                    .await
                    .map_err(|e| BrokerError::Subscribe(e.to_string()))
            }
        }
    }

    async fn refresh_topics(&self, consumer: &Arc<dyn LogConsumer>) -> Result<()> {
        let topics = lock(&self.registry).active_topics();
        let result = if topics.is_empty() {
            consumer.unsubscribe().await
        } else {
            consumer.subscribe(&topics).await
        };
        result.map_err(|e| BrokerError::Subscribe(e.to_string()))?;
        debug!(topics = ?topics, "Kafka consumer topic list updated");
        Ok(())
    }

    async fn set_active(&self, topics: &[Topic], active: bool) -> Result<()> {
        {
            let mut registry = lock(&self.registry);
            for topic in topics {
                match registry
                    .entries
                    .iter_mut()
                    .find(|t| t.subscription.topic == *topic)
                {
                    Some(tracked) => tracked.active = active,
                    None => warn!(topic = %topic.name, "Topic has no tracked subscription"),
                }
            }
        }

        match self.consumer() {
            Some(consumer) => self.refresh_topics(&consumer).await,
            None => Ok(()),
        }
    }

    /// Create a consumer for the registered group and start polling it.
    async fn start_consumer(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        let (settings, topics) = {
            let registry = lock(&self.registry);
            let Some(options) = registry.options.as_ref() else {
                return Err(BrokerError::Subscribe("no subscriptions registered".to_string()));
            };
            let first = registry.entries.first().map(|t| &t.subscription.config);
            (
                ConsumerSettings {
                    group_id: options.group_id.clone(),
                    start: first.map(|c| c.start).unwrap_or_default(),
                    prefetch: first.and_then(|c| c.batch_size),
                },
                registry.active_topics(),
            )
        };

        let faults = self.fault_sender(cancel);
        let consumer = self.transport.consumer(settings.clone(), faults).await?;
        if !topics.is_empty() {
            if let Err(e) = consumer.subscribe(&topics).await {
                consumer.close().await;
                return Err(e);
            }
        }

        let poll_cancel = cancel.child_token();
        {
            let mut links = lock(&self.links);
            links.consumer = Some(consumer.clone());
            links.consumer_state = ComponentState::Connected;
            links.poll_cancel = Some(poll_cancel.clone());
        }

        info!(group_id = %settings.group_id, topics = ?topics, "Kafka consumer started");
        tokio::spawn(self.clone().poll(consumer, poll_cancel));
        Ok(())
    }

    fn schedule_consumer_rebuild(self: &Arc<Self>, reason: &str) {
        let (stale, poll) = {
            let mut links = lock(&self.links);
            if links.state == ConnectionState::Disconnected
                || links.consumer_state == ComponentState::Reconnecting
            {
                return;
            }
            links.consumer_state = ComponentState::Reconnecting;
            (links.consumer.take(), links.poll_cancel.take())
        };
        warn!(reason, "Kafka consumer lost, rebuilding");

        if let Some(poll) = poll {
            poll.cancel();
        }

        let inner = self.clone();
        let cancel = self.token();
        tokio::spawn(async move {
            if let Some(stale) = stale {
                stale.close().await;
            }
            inner.rebuild_consumer(cancel).await;
        });
    }

    /// Rebuild until it works or the adapter is disconnected.
    async fn rebuild_consumer(self: Arc<Self>, cancel: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            if !sleep_or_cancel(self.policy.retry_interval(), &cancel).await {
                return;
            }
            attempt += 1;

            match self.start_consumer(&cancel).await {
                Ok(()) => {
                    info!(attempt, "Kafka consumer rebuilt");
                    return;
                }
                Err(e) => warn!(attempt, error = %e, "Kafka consumer rebuild failed"),
            }
        }
    }

    async fn poll(self: Arc<Self>, consumer: Arc<dyn LogConsumer>, cancel: CancellationToken) {
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => return,
                received = consumer.recv() => received,
            };

            let inbound = match received {
                Ok(inbound) => inbound,
                Err(e) => {
                    if !cancel.is_cancelled() {
                        self.schedule_consumer_rebuild(&e.to_string());
                    }
                    return;
                }
            };

            if !self.handle_inbound(inbound, &cancel).await {
                if !cancel.is_cancelled() {
                    // Rewind to the last committed position.
                    self.schedule_consumer_rebuild("message could not be settled");
                }
                return;
            }
        }
    }

    /// Process one record. Returns false if it could not be settled.
    async fn handle_inbound(self: &Arc<Self>, inbound: InboundMessage, cancel: &CancellationToken) -> bool {
        let (subscription, options) = {
            let registry = lock(&self.registry);
            match (registry.find(&inbound.topic), registry.options.clone()) {
                (Some(tracked), Some(options)) if tracked.active => {
                    (tracked.subscription.clone(), options)
                }
                _ => {
                    debug!(topic = %inbound.topic, "No active subscription, skipping record");
                    return true;
                }
            }
        };

        let disposition = processing::process(&subscription, &options, &inbound).await;
        let settle = disposition.settle_after(&options);

        let settled = match disposition {
            Disposition::Handled | Disposition::Discard { .. } => true,
            Disposition::Retry {
                attempt,
                delay,
                error,
            } => {
                if !sleep_or_cancel(delay, cancel).await {
                    return true;
                }
                match self.redeliver(&inbound, attempt, &error, cancel).await {
                    Ok(()) => true,
                    Err(_) if cancel.is_cancelled() => return true,
                    Err(e) => {
                        let envelope = inbound.dead_letter(DeadLetterReason::RetryFailed, &e);
                        self.dead_letter(&options.group_id, envelope, cancel).await
                    }
                }
            }
            Disposition::DeadLetter(envelope) => {
                self.dead_letter(&options.group_id, envelope, cancel).await
            }
        };

        if !settled {
            return false;
        }
        if settle {
            if let Err(e) = self.acknowledge(&inbound.metadata).await {
                error!(topic = %inbound.topic, offset = %inbound.metadata.offset, error = %e, "Failed to commit offset");
            }
        }
        true
    }

    /// Publish on behalf of the consumer. Never reconnects after cancellation.
    async fn publish_internal(
        self: &Arc<Self>,
        record: OutboundRecord,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(BrokerError::Disconnected);
        }
        self.publish_record(record, self.policy.max_retries).await
    }

    /// Republish to the same topic with an incremented retry counter.
    async fn redeliver(
        self: &Arc<Self>,
        inbound: &InboundMessage,
        attempt: u32,
        error: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let record = OutboundRecord {
            topic: inbound.topic.clone(),
            key: inbound.key.clone(),
            payload: inbound.payload.clone(),
            headers: retry_headers(&inbound.headers, attempt, error),
            partition: None,
            timestamp: None,
        };
        self.publish_internal(record, cancel).await
    }

    async fn dead_letter(
        self: &Arc<Self>,
        group_id: &str,
        envelope: DeadLetterEnvelope,
        cancel: &CancellationToken,
    ) -> bool {
        let topic = dead_letter_name(group_id);
        let record = OutboundRecord {
            topic: topic.clone(),
            key: envelope.key.clone(),
            payload: envelope.payload.clone(),
            headers: envelope.wire_headers(),
            partition: None,
            timestamp: None,
        };

        match self.publish_internal(record, cancel).await {
            Ok(()) => {
                warn!(
                    dead_letter_topic = %topic,
                    original_topic = %envelope.original_topic,
                    reason = %envelope.reason,
                    "Message dead-lettered"
                );
                true
            }
            Err(e) => {
                error!(
                    dead_letter_topic = %topic,
                    original_topic = %envelope.original_topic,
                    error = %e,
                    "Dead-letter publish failed, leaving offset uncommitted"
                );
                false
            }
        }
    }

    async fn acknowledge(&self, metadata: &EventMessageMetadata) -> Result<()> {
        let position = metadata.next_position()?;
        let _commit = self.commit_lock.lock().await;

        if !self
            .offsets
            .would_advance(&metadata.topic, metadata.partition, position)
        {
            debug!(
                topic = %metadata.topic,
                partition = metadata.partition,
                position,
                "Offset already committed, skipping"
            );
            return Ok(());
        }

        let consumer = self
            .consumer()
            .ok_or_else(|| BrokerError::Acknowledge("no active consumer".to_string()))?;
        consumer
            .commit(&metadata.topic, metadata.partition, position)
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))?;
        self.offsets
            .advance(&metadata.topic, metadata.partition, position);
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let (admin, consumer, producer_ok) = {
            let links = lock(&self.links);
            (
                links.admin.clone(),
                links.consumer.clone(),
                links.producer.is_some() && links.producer_state == ComponentState::Connected,
            )
        };

        let Some(admin) = admin else {
            return false;
        };
        if !admin.is_alive().await {
            return false;
        }
        if let Some(consumer) = consumer {
            if !consumer.is_member().await {
                return false;
            }
        }
        producer_ok
    }
}

// ============================================================================
// BrokerDriver
// ============================================================================

#[async_trait]
impl<T: LogTransport> BrokerDriver for KafkaAdapter<T> {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }

    async fn publish(&self, message: EventMessage<Value>) -> Result<()> {
        let retries = self.inner.retry_budget(&message);
        let record = to_record(message)?;
        self.inner.publish_record(record, retries).await
    }

    async fn publish_batch(&self, messages: Vec<EventMessage<Value>>) -> Result<()> {
        self.inner.publish_batch(messages).await
    }

    async fn subscribe(
        &self,
        subscriptions: Vec<MessageSubscription>,
        options: SubscribeOptions,
    ) -> Result<()> {
        self.inner.subscribe(subscriptions, options).await
    }

    async fn acknowledge(&self, metadata: &EventMessageMetadata) -> Result<()> {
        self.inner.acknowledge(metadata).await
    }

    async fn unsubscribe(&self, topics: &[Topic]) -> Result<()> {
        self.inner.set_active(topics, false).await
    }

    async fn resubscribe(&self, topics: &[Topic]) -> Result<()> {
        self.inner.set_active(topics, true).await
    }

    async fn create_topics(&self, topics: &[Topic]) -> Result<()> {
        self.inner.ensure_connected().await?;
        self.inner.create_topics(topics).await
    }

    async fn delete_topics(&self, topics: &[Topic]) -> Result<()> {
        self.inner.ensure_connected().await?;
        self.inner.delete_topics(topics).await
    }

    async fn health_check(&self) -> bool {
        self.inner.health_check().await
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests;
