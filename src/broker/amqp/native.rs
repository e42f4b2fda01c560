//! lapin-backed queue transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{future, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::{Confirmation, PublisherConfirm};
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, warn};

use super::transport::{
    Delivery, DeliveryStream, OutboundDelivery, QueueChannel, QueueConnection, QueueFault,
    QueueFaultSender, QueueTransport,
};
use crate::broker::{BrokerError, Result};
use crate::config::{AmqpConfig, ConnectionPolicy, ExchangeType};
use crate::message::Headers;

const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
const CONTENT_TYPE: &str = "application/json";
const PERSISTENT: u8 = 2;

/// Queue transport over a lapin connection.
pub struct LapinTransport {
    config: AmqpConfig,
    timeout: Duration,
}

impl LapinTransport {
    pub fn new(config: AmqpConfig, policy: &ConnectionPolicy) -> Self {
        Self {
            config,
            timeout: policy.timeout(),
        }
    }
}

fn transport_error(context: &str, e: lapin::Error) -> BrokerError {
    BrokerError::Transport(format!("{}: {}", context, e))
}

fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
    }
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            key.as_str().into(),
            AMQPValue::LongString(LongString::from(value.as_str())),
        );
    }
    table
}

fn from_field_table(properties: &BasicProperties) -> Headers {
    let Some(table) = properties.headers() else {
        return Headers::new();
    };
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                AMQPValue::LongLongInt(n) => n.to_string(),
                AMQPValue::LongInt(n) => n.to_string(),
                AMQPValue::Boolean(b) => b.to_string(),
                _ => return None,
            };
            Some((key.as_str().to_string(), text))
        })
        .collect()
}

fn to_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        headers: from_field_table(&delivery.properties),
        payload: delivery.data,
        redelivered: delivery.redelivered,
    }
}

#[async_trait]
impl QueueTransport for LapinTransport {
    async fn connect(&self, faults: QueueFaultSender) -> Result<Arc<dyn QueueConnection>> {
        let uri = self.config.connection_uri();
        let connection = tokio::time::timeout(
            self.timeout,
            Connection::connect(&uri, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| BrokerError::Connection(format!("timed out after {:?}", self.timeout)))?
        .map_err(|e| BrokerError::Connection(e.to_string()))?;

        connection.on_error(move |e| {
            warn!(error = %e, "AMQP connection error");
            let _ = faults.send(QueueFault::Connection(e.to_string()));
        });
        debug!("AMQP connection established");

        Ok(Arc::new(LapinConnection {
            connection,
            timeout: self.timeout,
        }))
    }
}

struct LapinConnection {
    connection: Connection,
    timeout: Duration,
}

#[async_trait]
impl QueueConnection for LapinConnection {
    async fn open_channel(&self, faults: QueueFaultSender) -> Result<Arc<dyn QueueChannel>> {
        let channel = tokio::time::timeout(self.timeout, self.connection.create_channel())
            .await
            .map_err(|_| BrokerError::Transport("channel open timed out".to_string()))?
            .map_err(|e| transport_error("create channel", e))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| transport_error("confirm select", e))?;
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| transport_error("basic qos", e))?;

        channel.on_error(move |e| {
            warn!(error = %e, "AMQP channel error");
            let _ = faults.send(QueueFault::Channel(e.to_string()));
        });

        Ok(Arc::new(LapinChannel { channel }))
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) {
        if let Err(e) = self.connection.close(200, "closing").await {
            debug!(error = %e, "AMQP connection close failed");
        }
    }
}

struct LapinChannel {
    channel: Channel,
}

impl LapinChannel {
    async fn start_publish(&self, delivery: &OutboundDelivery) -> Result<PublisherConfirm> {
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_delivery_mode(PERSISTENT)
            .with_headers(to_field_table(&delivery.headers));

        self.channel
            .basic_publish(
                &delivery.exchange,
                &delivery.routing_key,
                BasicPublishOptions::default(),
                &delivery.payload,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }
}

async fn confirmed(confirm: PublisherConfirm, exchange: &str) -> Result<()> {
    match confirm.await {
        Ok(Confirmation::Nack(_)) => Err(BrokerError::Publish(format!(
            "broker nacked publish to '{}'",
            exchange
        ))),
        Ok(_) => Ok(()),
        Err(e) => Err(BrokerError::Publish(format!("confirm failed: {}", e))),
    }
}

#[async_trait]
impl QueueChannel for LapinChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Admin(format!("declare exchange '{}': {}", name, e)))
    }

    async fn delete_exchange(&self, name: &str) -> Result<()> {
        self.channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(|e| BrokerError::Admin(format!("delete exchange '{}': {}", name, e)))
    }

    async fn declare_queue(&self, name: &str, dead_letter_exchange: Option<&str>) -> Result<()> {
        let mut arguments = FieldTable::default();
        if let Some(dlx) = dead_letter_exchange {
            arguments.insert(
                DEAD_LETTER_EXCHANGE_ARG.into(),
                AMQPValue::LongString(LongString::from(dlx)),
            );
        }

        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Admin(format!("declare queue '{}': {}", name, e)))
    }

    async fn declare_transient_queue(&self, name: &str) -> Result<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Admin(format!("declare queue '{}': {}", name, e)))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Admin(format!("bind '{}' to '{}': {}", queue, exchange, e)))
    }

    async fn publish(&self, delivery: &OutboundDelivery) -> Result<()> {
        let confirm = self.start_publish(delivery).await?;
        confirmed(confirm, &delivery.exchange).await
    }

    async fn publish_batch(&self, deliveries: &[OutboundDelivery]) -> Result<()> {
        let mut confirms = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            confirms.push((self.start_publish(delivery).await?, delivery.exchange.as_str()));
        }
        for (confirm, exchange) in confirms {
            confirmed(confirm, exchange).await?;
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Subscribe(format!("consume '{}': {}", queue, e)))?;

        let stream = consumer
            .take_while(|delivery| future::ready(delivery.is_ok()))
            .filter_map(|delivery| future::ready(delivery.ok().map(to_delivery)));
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| transport_error("basic cancel", e))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) {
        if let Err(e) = self.channel.close(200, "closing").await {
            debug!(error = %e, "AMQP channel close failed");
        }
    }
}
