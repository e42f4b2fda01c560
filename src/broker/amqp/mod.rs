//! AMQP (RabbitMQ) broker adapter.
//!
//! Topics map to durable exchanges. Each subscription gets a durable queue
//! named `{group}.{topic}` bound with `#`, consumed with manual acks and a
//! prefetch of one. One connection and one confirm channel carry all
//! publish and consume traffic.
//!
//! ## Recovery
//!
//! - Channel closed, connection alive: open a new channel and re-consume
//!   every active subscription.
//! - Connection lost: reconnect every `retry_interval`, up to
//!   `max_retries` attempts, then give up until the next `connect()`.
//!
//! Publishes made while no channel is available wait in the pending queue
//! and go out in order once one is.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use backon::Retryable;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dead_letter::{dead_letter_name, retry_headers, DeadLetterEnvelope, DeadLetterReason};
use super::pending::{await_outcome, PendingQueue};
use super::processing::{self, Disposition, InboundMessage};
use super::retry::{reconnect_interval, sleep_or_cancel, RetryConfig};
use super::{BrokerDriver, BrokerError, ComponentState, ConnectionState, Result};
use crate::config::{AmqpConfig, ConnectionPolicy, ExchangeType};
use crate::message::{
    EventMessage, EventMessageMetadata, MessageSubscription, SubscribeOptions, Topic,
};

pub mod transport;

#[cfg(feature = "amqp")]
mod native;

#[cfg(feature = "amqp")]
pub use native::LapinTransport;
pub use transport::{
    Delivery, DeliveryStream, OutboundDelivery, QueueChannel, QueueConnection, QueueFault,
    QueueFaultSender, QueueTransport,
};

/// Queue declared by the health check.
pub const HEALTH_QUEUE: &str = "switchyard.health";

/// Queue consumed for `topic` by consumer group `group_id`.
pub fn queue_name(group_id: &str, topic: &str) -> String {
    format!("{}.{}", group_id, topic)
}

// ============================================================================
// State
// ============================================================================

#[derive(Default)]
struct Links {
    state: ConnectionState,
    connection: Option<Arc<dyn QueueConnection>>,
    channel: Option<Arc<dyn QueueChannel>>,
    channel_state: ComponentState,
    faults: Option<QueueFaultSender>,
}

struct Tracked {
    subscription: MessageSubscription,
    options: SubscribeOptions,
    queue: String,
    consumer_tag: String,
    active: bool,
    reader: Option<CancellationToken>,
}

/// Snapshot of what a reader needs to process deliveries.
#[derive(Clone)]
struct ReaderContext {
    subscription: MessageSubscription,
    options: SubscribeOptions,
    queue: String,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct AmqpInner<T> {
    config: AmqpConfig,
    policy: ConnectionPolicy,
    transport: T,
    links: Mutex<Links>,
    registry: Mutex<Vec<Tracked>>,
    /// Declared exchanges, keyed `name:type`.
    exchanges: Mutex<HashSet<String>>,
    /// Unsettled deliveries by tag, with the channel that delivered them.
    outstanding: Mutex<HashMap<u64, Arc<dyn QueueChannel>>>,
    pending: PendingQueue<OutboundDelivery>,
    cancel: Mutex<CancellationToken>,
    connect_lock: Arc<tokio::sync::Mutex<()>>,
}

/// RabbitMQ implementation of `BrokerDriver`, generic over its transport.
pub struct RabbitMqAdapter<T: QueueTransport> {
    inner: Arc<AmqpInner<T>>,
}

impl<T: QueueTransport> RabbitMqAdapter<T> {
    pub fn new(config: AmqpConfig, policy: ConnectionPolicy, transport: T) -> Self {
        Self {
            inner: Arc::new(AmqpInner {
                config,
                policy,
                transport,
                links: Mutex::new(Links::default()),
                registry: Mutex::new(Vec::new()),
                exchanges: Mutex::new(HashSet::new()),
                outstanding: Mutex::new(HashMap::new()),
                pending: PendingQueue::new(),
                cancel: Mutex::new(CancellationToken::new()),
                connect_lock: Arc::new(tokio::sync::Mutex::new(())),
            }),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.inner.links).state
    }

    pub fn channel_state(&self) -> ComponentState {
        lock(&self.inner.links).channel_state
    }

    /// Number of publishes waiting for a channel.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.len()
    }
}

// ============================================================================
// Connection lifecycle
// ============================================================================

impl<T: QueueTransport> AmqpInner<T> {
    fn token(&self) -> CancellationToken {
        lock(&self.cancel).clone()
    }

    fn renew_token(&self) -> CancellationToken {
        let mut cancel = lock(&self.cancel);
        if cancel.is_cancelled() {
            *cancel = CancellationToken::new();
        }
        cancel.clone()
    }

    fn channel(&self) -> Result<Arc<dyn QueueChannel>> {
        let links = lock(&self.links);
        match (&links.channel, links.channel_state) {
            (Some(channel), ComponentState::Connected) => Ok(channel.clone()),
            _ => Err(BrokerError::NotConnected),
        }
    }

    fn channel_ready(&self) -> bool {
        self.channel().map(|c| c.is_open()).unwrap_or(false)
    }

    fn fault_sender(self: &Arc<Self>, cancel: &CancellationToken) -> QueueFaultSender {
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

    async fn supervise(
        self: Arc<Self>,
        mut faults: mpsc::UnboundedReceiver<QueueFault>,
        cancel: CancellationToken,
    ) {
        loop {
            let fault = tokio::select! {
                _ = cancel.cancelled() => return,
                fault = faults.recv() => match fault {
                    Some(fault) => fault,
                    None => return,
                },
            };

            match fault {
                QueueFault::Channel(reason) => self.on_channel_fault(&reason),
                QueueFault::Connection(reason) => self.on_connection_fault(&reason),
            }
        }
    }

    /// Retry `make` every `retry_interval`, aborting on cancellation.
    async fn with_retry<R, F, Fut>(
        &self,
        what: &'static str,
        cancel: &CancellationToken,
        make: F,
    ) -> Result<R>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let attempts = make
            .retry(reconnect_interval(&self.policy))
            .notify(|err: &BrokerError, dur| {
                warn!(what, error = %err, delay = ?dur, "AMQP setup failed, retrying");
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
            warn!(rejected, error = %reason, "Rejected pending publishes, AMQP unreachable");
        }
    }

    /// Open the connection and channel if missing. Caller holds `connect_lock`.
    async fn connect_locked(self: &Arc<Self>) -> Result<()> {
        if self.channel_ready() {
            return Ok(());
        }

        lock(&self.links).state = ConnectionState::Connecting;
        let cancel = self.renew_token();
        let faults = self.fault_sender(&cancel);

        let live = lock(&self.links)
            .connection
            .clone()
            .filter(|c| c.is_connected());
        let connection = match live {
            Some(connection) => connection,
            None => {
                let opened = self
                    .with_retry("connection", &cancel, || self.transport.connect(faults.clone()))
                    .await;
                match opened {
                    Ok(connection) => {
                        lock(&self.links).connection = Some(connection.clone());
                        connection
                    }
                    Err(e) => {
                        lock(&self.links).state = ConnectionState::Disconnected;
                        error!(url = %redact(&self.config.url), error = %e, "Failed to connect to AMQP");
                        return Err(match e {
                            BrokerError::Connection(_) | BrokerError::Disconnected => e,
                            other => BrokerError::Connection(other.to_string()),
                        });
                    }
                }
            }
        };

        let channel = self
            .with_retry("channel", &cancel, || connection.open_channel(faults.clone()))
            .await;
        match channel {
            Ok(channel) => self.install_channel(channel),
            Err(e) => {
                lock(&self.links).state = ConnectionState::Disconnected;
                error!(error = %e, "Failed to open AMQP channel");
                return Err(BrokerError::Connection(e.to_string()));
            }
        }

        lock(&self.links).state = ConnectionState::Connected;
        info!(url = %redact(&self.config.url), "Connected to AMQP");

        self.restart_readers().await;
        self.spawn_drain();
        Ok(())
    }

    fn install_channel(&self, channel: Arc<dyn QueueChannel>) {
        let stale = {
            let mut links = lock(&self.links);
            links.channel_state = ComponentState::Connected;
            links.channel.replace(channel)
        };
        // Tags from the previous channel can no longer be settled.
        lock(&self.outstanding).clear();
        if stale.is_some() {
            debug!("Replaced AMQP channel");
        }
    }

    fn spawn_connect_if_idle(self: &Arc<Self>) {
        let Ok(guard) = self.connect_lock.clone().try_lock_owned() else {
            debug!("AMQP connect already in flight");
            return;
        };

        let inner = self.clone();
        tokio::spawn(async move {
            let result = {
                let _guard = guard;
                inner.connect_locked().await
            };
            if let Err(e) = result {
                warn!(error = %e, "Opportunistic AMQP connect failed");
                inner.reject_pending(&e).await;
            }
        });
    }

    fn on_channel_fault(self: &Arc<Self>, reason: &str) {
        let connection = {
            let mut links = lock(&self.links);
            if links.state != ConnectionState::Connected
                || links.channel_state == ComponentState::Reconnecting
            {
                return;
            }
            links.channel_state = ComponentState::Reconnecting;
            links.channel = None;
            links.connection.clone()
        };

        let Some(connection) = connection.filter(|c| c.is_connected()) else {
            // The connection fault handler takes over.
            return;
        };
        warn!(reason, "AMQP channel closed, reopening");

        let inner = self.clone();
        let cancel = self.token();
        tokio::spawn(async move { inner.reopen_channel(connection, cancel).await });
    }

    async fn reopen_channel(
        self: Arc<Self>,
        connection: Arc<dyn QueueConnection>,
        cancel: CancellationToken,
    ) {
        let faults = self.fault_sender(&cancel);
        let opened = self
            .with_retry("channel", &cancel, || {
                let connection = connection.clone();
                let faults = faults.clone();
                async move { connection.open_channel(faults).await }
            })
            .await;

        match opened {
            Ok(channel) => {
                self.install_channel(channel);
                info!("AMQP channel reopened");
                self.restart_readers().await;
                self.drain_pending().await;
            }
            Err(BrokerError::Disconnected) => {}
            Err(e) => {
                lock(&self.links).channel_state = ComponentState::Disconnected;
                error!(error = %e, "AMQP channel could not be reopened");
            }
        }
    }

    fn on_connection_fault(self: &Arc<Self>, reason: &str) {
        let (connection, channel) = {
            let mut links = lock(&self.links);
            if links.state == ConnectionState::Disconnected {
                return;
            }
            links.state = ConnectionState::Connecting;
            links.channel_state = ComponentState::Reconnecting;
            (links.connection.take(), links.channel.take())
        };
        if connection.is_none() {
            // Already reconnecting.
            return;
        }
        warn!(reason, "AMQP connection lost, reconnecting");
        self.stop_readers();

        let inner = self.clone();
        let cancel = self.token();
        tokio::spawn(async move {
            if let Some(channel) = channel {
                channel.close().await;
            }
            if let Some(connection) = connection {
                connection.close().await;
            }
            inner.reconnect(cancel).await;
        });
    }

    async fn reconnect(self: Arc<Self>, cancel: CancellationToken) {
        let faults = self.fault_sender(&cancel);
        let restored = self
            .with_retry("connection", &cancel, || {
                let inner = self.clone();
                let faults = faults.clone();
                async move {
                    let _guard = inner.connect_lock.lock().await;
                    if inner.channel_ready() {
                        return Ok(());
                    }
                    let connection = inner.transport.connect(faults.clone()).await?;
                    let channel = match connection.open_channel(faults).await {
                        Ok(channel) => channel,
                        Err(e) => {
                            connection.close().await;
                            return Err(e);
                        }
                    };
                    lock(&inner.links).connection = Some(connection);
                    inner.install_channel(channel);
                    Ok(())
                }
            })
            .await;

        match restored {
            Ok(()) => {
                lock(&self.links).state = ConnectionState::Connected;
                info!("AMQP connection restored");
                self.restart_readers().await;
                self.drain_pending().await;
            }
            Err(BrokerError::Disconnected) => {}
            Err(e) => {
                {
                    let mut links = lock(&self.links);
                    links.state = ConnectionState::Disconnected;
                    links.channel_state = ComponentState::Disconnected;
                }
                error!(
                    attempts = self.policy.max_retries,
                    error = %e,
                    "AMQP reconnect failed permanently, waiting for connect()"
                );
                self.reject_pending(&e).await;
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.token().cancel();

        let rejected = self.pending.reject_all(|| BrokerError::Disconnected).await;
        if rejected > 0 {
            warn!(rejected, "Rejected pending publishes on disconnect");
        }

        self.stop_readers();
        let (connection, channel) = {
            let mut links = lock(&self.links);
            links.faults = None;
            links.state = ConnectionState::Disconnected;
            links.channel_state = ComponentState::Disconnected;
            (links.connection.take(), links.channel.take())
        };

        if let Some(channel) = channel {
            channel.close().await;
        }
        if let Some(connection) = connection {
            connection.close().await;
        }

        lock(&self.exchanges).clear();
        lock(&self.outstanding).clear();
        lock(&self.registry).clear();

        info!("Disconnected from AMQP");
        Ok(())
    }

    async fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        if self.channel_ready() {
            return Ok(());
        }
        self.connect().await
    }
}

/// Strip credentials from a connection URL for logging.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***@{}", &url[..scheme], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

// ============================================================================
// Exchanges
// ============================================================================

impl<T: QueueTransport> AmqpInner<T> {
    async fn ensure_exchange(&self, name: &str, kind: ExchangeType) -> Result<()> {
        let key = format!("{}:{}", name, kind.as_str());
        if lock(&self.exchanges).contains(&key) {
            return Ok(());
        }

        self.channel()?.declare_exchange(name, kind).await?;
        debug!(exchange = %name, kind = kind.as_str(), "Declared AMQP exchange");
        lock(&self.exchanges).insert(key);
        Ok(())
    }

    async fn delete_topics(&self, topics: &[Topic]) -> Result<()> {
        let channel = self.channel()?;
        for topic in topics {
            channel.delete_exchange(&topic.name).await?;
            let prefix = format!("{}:", topic.name);
            lock(&self.exchanges).retain(|key| !key.starts_with(&prefix));
        }
        Ok(())
    }
}

// ============================================================================
// Publish
// ============================================================================

fn to_delivery(message: EventMessage<Value>) -> Result<OutboundDelivery> {
    let payload = serde_json::to_vec(&message.value)?;
    let config = message.config.unwrap_or_default();
    Ok(OutboundDelivery {
        routing_key: config.key.unwrap_or_else(|| message.topic.clone()),
        exchange: message.topic,
        payload,
        headers: config.headers.unwrap_or_default(),
    })
}

impl<T: QueueTransport> AmqpInner<T> {
    async fn publish_delivery(
        self: &Arc<Self>,
        delivery: OutboundDelivery,
        retries: u32,
    ) -> Result<()> {
        let outcome = self.pending.enqueue(delivery, retries);

        if self.channel_ready() {
            self.drain_pending().await;
        } else {
            debug!(pending = self.pending.len(), "AMQP channel not ready, message queued");
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
        if !self.channel_ready() {
            return;
        }
        let drained = self
            .pending
            .drain(|delivery, retries| self.deliver(delivery, retries))
            .await;
        if drained > 0 {
            debug!(drained, "Drained pending AMQP publishes");
        }
    }

    /// Ensure the exchange and publish with `1000 * 2^n` ms backoff.
    async fn deliver(&self, delivery: OutboundDelivery, retries: u32) -> Result<()> {
        let schedule = RetryConfig::queue_publish(retries);
        let cancel = self.token();
        let mut attempt = 0;

        loop {
            let result = match self
                .ensure_exchange(&delivery.exchange, self.config.exchange_type)
                .await
            {
                Ok(()) => match self.channel() {
                    Ok(channel) => channel.publish(&delivery).await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    debug!(
                        exchange = %delivery.exchange,
                        routing_key = %delivery.routing_key,
                        "Published to AMQP"
                    );
                    return Ok(());
                }
                Err(e) if schedule.should_retry(attempt) => {
                    let delay = schedule.delay_for_attempt(attempt);
                    warn!(
                        exchange = %delivery.exchange,
                        attempt = attempt + 1,
                        max_retries = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "AMQP publish failed, retrying"
                    );
                    if !sleep_or_cancel(delay, &cancel).await {
                        return Err(BrokerError::Disconnected);
                    }
                    attempt += 1;
                }
                Err(e) => {
                    error!(exchange = %delivery.exchange, attempts = attempt + 1, error = %e, "AMQP publish failed");
                    return Err(match e {
                        BrokerError::Publish(_) | BrokerError::Disconnected => e,
                        other => BrokerError::Publish(other.to_string()),
                    });
                }
            }
        }
    }

    /// Publish every message, then wait once for all confirms. A failure
    /// fails the whole call, but messages confirmed before it stay published.
    async fn publish_batch(self: &Arc<Self>, messages: Vec<EventMessage<Value>>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        self.ensure_connected().await?;

        let deliveries = messages
            .into_iter()
            .map(to_delivery)
            .collect::<Result<Vec<_>>>()?;

        let mut declared = HashSet::new();
        for delivery in &deliveries {
            if declared.insert(delivery.exchange.clone()) {
                self.ensure_exchange(&delivery.exchange, self.config.exchange_type)
                    .await?;
            }
        }

        self.channel()?
            .publish_batch(&deliveries)
            .await
            .map_err(|e| match e {
                BrokerError::Publish(_) => e,
                other => BrokerError::Publish(other.to_string()),
            })?;
        debug!(count = deliveries.len(), "Published AMQP batch");
        Ok(())
    }
}

// ============================================================================
// Subscribe
// ============================================================================

impl<T: QueueTransport> AmqpInner<T> {
    async fn subscribe(
        self: &Arc<Self>,
        subscriptions: Vec<MessageSubscription>,
        options: SubscribeOptions,
    ) -> Result<()> {
        self.ensure_connected().await?;
        let channel = self.channel()?;

        let dead_letter_exchange = if options.dead_letters_enabled() {
            let dlx = dead_letter_name(&options.group_id);
            self.ensure_exchange(&dlx, ExchangeType::Fanout).await?;
            channel.declare_queue(&dlx, None).await?;
            channel.bind_queue(&dlx, &dlx, "").await?;
            Some(dlx)
        } else {
            None
        };

        for subscription in subscriptions {
            let exchange = subscription.topic.name.clone();
            let queue = queue_name(&options.group_id, &exchange);

            self.declare_queue(&channel, &exchange, &queue, dead_letter_exchange.as_deref())
                .await
                .map_err(|e| BrokerError::Subscribe(format!("{}: {}", queue, e)))?;

            let consumer_tag = format!("switchyard-{}-{}", queue, Uuid::new_v4().simple());
            {
                let mut registry = lock(&self.registry);
                if let Some(previous) = registry.iter().position(|t| t.queue == queue) {
                    let old = registry.remove(previous);
                    if let Some(reader) = old.reader {
                        reader.cancel();
                    }
                }
                registry.push(Tracked {
                    subscription,
                    options: options.clone(),
                    queue: queue.clone(),
                    consumer_tag,
                    active: true,
                    reader: None,
                });
            }

            self.start_reader(&queue)
                .await
                .map_err(|e| BrokerError::Subscribe(format!("{}: {}", queue, e)))?;
            info!(queue = %queue, exchange = %exchange, group_id = %options.group_id, "AMQP consumer started");
        }
        Ok(())
    }

    /// Declare `queue` and bind it to every routing key of `exchange`.
    async fn declare_queue(
        &self,
        channel: &Arc<dyn QueueChannel>,
        exchange: &str,
        queue: &str,
        dead_letter_exchange: Option<&str>,
    ) -> Result<()> {
        self.ensure_exchange(exchange, self.config.exchange_type).await?;
        channel.declare_queue(queue, dead_letter_exchange).await?;
        channel.bind_queue(queue, exchange, "#").await
    }

    /// Start consuming `queue` on the current channel.
    async fn start_reader(self: &Arc<Self>, queue: &str) -> Result<()> {
        let (context, consumer_tag, previous) = {
            let mut registry = lock(&self.registry);
            let Some(tracked) = registry.iter_mut().find(|t| t.queue == queue && t.active) else {
                return Ok(());
            };
            (
                ReaderContext {
                    subscription: tracked.subscription.clone(),
                    options: tracked.options.clone(),
                    queue: tracked.queue.clone(),
                },
                tracked.consumer_tag.clone(),
                tracked.reader.take(),
            )
        };
        if let Some(previous) = previous {
            previous.cancel();
        }

        let channel = self.channel()?;
        let stream = channel.consume(queue, &consumer_tag).await?;

        let reader = self.token().child_token();
        if let Some(tracked) = lock(&self.registry).iter_mut().find(|t| t.queue == queue) {
            tracked.reader = Some(reader.clone());
        }
        tokio::spawn(self.clone().read(context, channel, stream, reader));
        Ok(())
    }

    async fn restart_readers(self: &Arc<Self>) {
        let queues: Vec<String> = lock(&self.registry)
            .iter()
            .filter(|t| t.active)
            .map(|t| t.queue.clone())
            .collect();

        for queue in queues {
            if let Err(e) = self.start_reader(&queue).await {
                warn!(queue = %queue, error = %e, "Failed to restart AMQP consumer");
            }
        }
    }

    fn stop_readers(&self) {
        for tracked in lock(&self.registry).iter_mut() {
            if let Some(reader) = tracked.reader.take() {
                reader.cancel();
            }
        }
    }

    async fn set_active(self: &Arc<Self>, topics: &[Topic], active: bool) -> Result<()> {
        let names: HashSet<&str> = topics.iter().map(|t| t.name.as_str()).collect();
        let affected: Vec<(String, String, Option<CancellationToken>)> = {
            let mut registry = lock(&self.registry);
            registry
                .iter_mut()
                .filter(|t| names.contains(t.subscription.topic.name.as_str()) && t.active != active)
                .map(|t| {
                    t.active = active;
                    (t.queue.clone(), t.consumer_tag.clone(), t.reader.take())
                })
                .collect()
        };
        if affected.is_empty() {
            warn!(topics = ?names, "No tracked subscription changed state");
            return Ok(());
        }

        for (queue, consumer_tag, reader) in affected {
            if active {
                if self.channel_ready() {
                    self.start_reader(&queue).await?;
                }
                continue;
            }
            if let Some(reader) = reader {
                reader.cancel();
            }
            if let Ok(channel) = self.channel() {
                channel
                    .cancel(&consumer_tag)
                    .await
                    .map_err(|e| BrokerError::Subscribe(e.to_string()))?;
            }
            debug!(queue = %queue, "AMQP consumer paused");
        }
        Ok(())
    }

    async fn read(
        self: Arc<Self>,
        context: ReaderContext,
        channel: Arc<dyn QueueChannel>,
        mut stream: DeliveryStream,
        cancel: CancellationToken,
    ) {
        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => return,
                delivery = stream.next() => delivery,
            };
            let Some(delivery) = delivery else {
                debug!(queue = %context.queue, "AMQP delivery stream ended");
                return;
            };
            self.handle_delivery(&context, &channel, delivery, &cancel).await;
        }
    }

    async fn handle_delivery(
        self: &Arc<Self>,
        context: &ReaderContext,
        channel: &Arc<dyn QueueChannel>,
        delivery: Delivery,
        cancel: &CancellationToken,
    ) {
        let topic = context.subscription.topic.name.clone();
        let inbound = InboundMessage {
            key: (delivery.routing_key != topic).then(|| delivery.routing_key.clone()),
            metadata: EventMessageMetadata::new(topic.clone(), 0, delivery.tag),
            topic,
            payload: delivery.payload,
            headers: delivery.headers,
            timestamp: None,
        };
        lock(&self.outstanding).insert(delivery.tag, channel.clone());

        let disposition = processing::process(&context.subscription, &context.options, &inbound).await;
        let settle = disposition.settle_after(&context.options);

        let published = match disposition {
            Disposition::Handled | Disposition::Discard { .. } => true,
            Disposition::Retry {
                attempt,
                delay,
                error,
            } => {
                if !sleep_or_cancel(delay, cancel).await {
                    // Unacked; the broker redelivers once the channel closes.
                    return;
                }
                let copy = OutboundDelivery {
                    exchange: delivery.exchange.clone(),
                    routing_key: delivery.routing_key.clone(),
                    payload: inbound.payload.clone(),
                    headers: retry_headers(&inbound.headers, attempt, &error),
                };
                match self.publish_internal(copy, cancel).await {
                    Ok(()) => true,
                    Err(_) if cancel.is_cancelled() => return,
                    Err(e) => {
                        let envelope = inbound.dead_letter(DeadLetterReason::RetryFailed, &e);
                        self.dead_letter(&context.options.group_id, &delivery.routing_key, envelope, cancel)
                            .await
                    }
                }
            }
            Disposition::DeadLetter(envelope) => {
                self.dead_letter(&context.options.group_id, &delivery.routing_key, envelope, cancel)
                    .await
            }
        };

        if !published {
            lock(&self.outstanding).remove(&delivery.tag);
            if let Err(e) = channel.reject(delivery.tag, false).await {
                error!(queue = %context.queue, tag = delivery.tag, error = %e, "Failed to reject delivery");
            }
            return;
        }
        if settle {
            if let Err(e) = self.settle(channel, delivery.tag).await {
                error!(queue = %context.queue, tag = delivery.tag, error = %e, "Failed to ack delivery");
            }
        }
    }

    /// Publish on behalf of a reader. Never reconnects after cancellation.
    async fn publish_internal(
        self: &Arc<Self>,
        delivery: OutboundDelivery,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(BrokerError::Disconnected);
        }
        self.publish_delivery(delivery, self.policy.max_retries).await
    }

    /// Publish to the group's dead-letter exchange. Returns whether it was
    /// accepted.
    async fn dead_letter(
        self: &Arc<Self>,
        group_id: &str,
        routing_key: &str,
        envelope: DeadLetterEnvelope,
        cancel: &CancellationToken,
    ) -> bool {
        let exchange = dead_letter_name(group_id);
        let delivery = OutboundDelivery {
            exchange: exchange.clone(),
            routing_key: routing_key.to_string(),
            payload: envelope.payload.clone(),
            headers: envelope.wire_headers(),
        };

        if cancel.is_cancelled() {
            return false;
        }
        let published = match self.channel() {
            Ok(channel) => channel.publish(&delivery).await,
            Err(e) => Err(e),
        };
        match published {
            Ok(()) => {
                warn!(
                    dead_letter_exchange = %exchange,
                    original_topic = %envelope.original_topic,
                    reason = %envelope.reason,
                    "Message dead-lettered"
                );
                true
            }
            Err(e) => {
                error!(
                    dead_letter_exchange = %exchange,
                    original_topic = %envelope.original_topic,
                    error = %e,
                    "Dead-letter publish failed, rejecting delivery"
                );
                false
            }
        }
    }

    async fn settle(&self, channel: &Arc<dyn QueueChannel>, tag: u64) -> Result<()> {
        lock(&self.outstanding).remove(&tag);
        channel
            .ack(tag)
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }

    async fn acknowledge(&self, metadata: &EventMessageMetadata) -> Result<()> {
        let tag: u64 = metadata
            .offset
            .parse()
            .map_err(|_| BrokerError::InvalidOffset(metadata.offset.clone()))?;

        let channel = lock(&self.outstanding).get(&tag).cloned().ok_or_else(|| {
            BrokerError::Acknowledge(format!("delivery tag {} is unknown or already settled", tag))
        })?;
        self.settle(&channel, tag).await
    }

    async fn health_check(&self) -> bool {
        let (connected, channel) = {
            let links = lock(&self.links);
            (
                links.connection.as_ref().map(|c| c.is_connected()).unwrap_or(false),
                links.channel.clone(),
            )
        };
        let Some(channel) = channel.filter(|_| connected) else {
            return false;
        };
        match channel.declare_transient_queue(HEALTH_QUEUE).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "AMQP health check failed");
                false
            }
        }
    }
}

// ============================================================================
// BrokerDriver
// ============================================================================

#[async_trait]
impl<T: QueueTransport> BrokerDriver for RabbitMqAdapter<T> {
    fn name(&self) -> &'static str {
        "amqp"
    }

    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }

    async fn publish(&self, message: EventMessage<Value>) -> Result<()> {
        let retries = message.retries().unwrap_or(self.inner.policy.max_retries);
        let delivery = to_delivery(message)?;
        self.inner.publish_delivery(delivery, retries).await
    }

    async fn publish_batch(&self, messages: Vec<EventMessage<Value>>) -> Result<()> {
        self.inner.publish_batch(messages).await
    }

    async fn subscribe(
        &self,
        subscriptions: Vec<MessageSubscription>,
        options: SubscribeOptions,
    ) -> Result<()> {
        if subscriptions.is_empty() {
            return Ok(());
        }
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
        for topic in topics {
            self.inner
                .ensure_exchange(&topic.name, self.inner.config.exchange_type)
                .await?;
        }
        Ok(())
    }

    async fn delete_topics(&self, topics: &[Topic]) -> Result<()> {
        self.inner.ensure_connected().await?;
        self.inner.delete_topics(topics).await
    }

    async fn health_check(&self) -> bool {
        self.inner.health_check().await
    }
}
