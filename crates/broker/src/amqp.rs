//! RabbitMQ implementation of [`Broker`] using `lapin`.
//!
//! One connection and one channel per broker. Publisher confirms are enabled,
//! messages are persistent JSON, and prefetch is applied when consuming.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};

use herald_common::config::ExchangeKind;

use crate::envelope::HeaderValue;
use crate::{
    Acknowledger, Binding, Broker, BrokerError, Delivery, DeliveryStream, EnvelopeHeaders,
    ExchangeDecl, OutboundMessage, QueueArguments, QueueDecl,
};

pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
    connection_name: String,
}

impl AmqpBroker {
    /// Connect and open a channel with publisher confirms enabled.
    pub async fn connect(url: &str, connection_name: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(
            url,
            ConnectionProperties::default().with_connection_name(connection_name.into()),
        )
        .await
        .map_err(|e| BrokerError::Connection(format!("RabbitMQ connection failed: {}", e)))?;

        let channel = connection.create_channel().await.map_err(|e| {
            BrokerError::Connection(format!("RabbitMQ channel creation failed: {}", e))
        })?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                BrokerError::Connection(format!("Failed to enable publisher confirms: {}", e))
            })?;

        tracing::info!(url = %redact(url), connection_name, "Connected to RabbitMQ");

        Ok(Self {
            connection,
            channel,
            connection_name: connection_name.to_string(),
        })
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

/// Hide the password in an AMQP URL for logging.
pub fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let userinfo = &url[scheme_end + 3..at];
            let user = userinfo.split(':').next().unwrap_or_default();
            format!("{}{}:***{}", &url[..scheme_end + 3], user, &url[at..])
        }
        _ => url.to_string(),
    }
}

fn lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

/// Distinguish a PRECONDITION_FAILED channel close from other declaration errors.
fn declaration_error(entity: String, err: lapin::Error) -> BrokerError {
    let message = err.to_string();
    if message.contains("PRECONDITION_FAILED") {
        BrokerError::PreconditionFailed { entity, message }
    } else {
        BrokerError::Declaration { entity, message }
    }
}

fn queue_arguments(arguments: &QueueArguments) -> Result<FieldTable, BrokerError> {
    let mut table = FieldTable::default();
    if let Some(exchange) = &arguments.dead_letter_exchange {
        table.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.as_str().into()),
        );
    }
    if let Some(routing_key) = &arguments.dead_letter_routing_key {
        table.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(routing_key.as_str().into()),
        );
    }
    if let Some(ttl) = arguments.message_ttl {
        let millis = i32::try_from(ttl.as_millis()).map_err(|_| {
            BrokerError::declaration("queue arguments", format!("TTL {:?} is too large", ttl))
        })?;
        table.insert("x-message-ttl".into(), AMQPValue::LongInt(millis));
    }
    Ok(table)
}

fn to_field_table(headers: &EnvelopeHeaders) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in headers.to_pairs() {
        let value = match value {
            HeaderValue::Int(n) => match i32::try_from(n) {
                Ok(n) => AMQPValue::LongInt(n),
                Err(_) => AMQPValue::LongLongInt(n),
            },
            HeaderValue::Bool(b) => AMQPValue::Boolean(b),
            HeaderValue::Str(s) => AMQPValue::LongString(s.into()),
        };
        table.insert(ShortString::from(name), value);
    }
    table
}

fn header_value(value: &AMQPValue) -> Option<HeaderValue> {
    let value = match value {
        AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
        AMQPValue::ShortShortInt(n) => HeaderValue::Int(*n as i64),
        AMQPValue::ShortShortUInt(n) => HeaderValue::Int(*n as i64),
        AMQPValue::ShortInt(n) => HeaderValue::Int(*n as i64),
        AMQPValue::ShortUInt(n) => HeaderValue::Int(*n as i64),
        AMQPValue::LongInt(n) => HeaderValue::Int(*n as i64),
        AMQPValue::LongUInt(n) => HeaderValue::Int(*n as i64),
        AMQPValue::LongLongInt(n) => HeaderValue::Int(*n),
        AMQPValue::ShortString(s) => HeaderValue::Str(s.as_str().to_string()),
        AMQPValue::LongString(s) => {
            HeaderValue::Str(String::from_utf8_lossy(s.as_bytes()).into_owned())
        }
        _ => return None,
    };
    Some(value)
}

fn from_field_table(table: Option<&FieldTable>) -> EnvelopeHeaders {
    let Some(table) = table else {
        return EnvelopeHeaders::default();
    };
    EnvelopeHeaders::from_pairs(
        table
            .inner()
            .iter()
            .filter_map(|(name, value)| header_value(value).map(|v| (name.as_str(), v))),
    )
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(&self, exchange: &ExchangeDecl) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                &exchange.name,
                lapin_kind(exchange.kind),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declaration_error(format!("exchange '{}'", exchange.name), e))
    }

    async fn declare_queue(&self, queue: &QueueDecl) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                queue_arguments(&queue.arguments)?,
            )
            .await
            .map(|_| ())
            .map_err(|e| declaration_error(format!("queue '{}'", queue.name), e))
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                declaration_error(
                    format!("binding {} -> {}", binding.queue, binding.exchange),
                    e,
                )
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type("application/json".into())
                    .with_headers(to_field_table(&message.headers)),
            )
            .await
            .map_err(|e| BrokerError::publish(exchange, e))?;

        let confirmation = confirm
            .await
            .map_err(|e| BrokerError::publish(exchange, format!("confirmation failed: {}", e)))?;
        if confirmation.is_nack() {
            return Err(BrokerError::publish(exchange, "broker nacked the message"));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, BrokerError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::consume(queue, format!("failed to set QoS: {}", e)))?;

        let consumer_tag = format!("{}-{}", self.connection_name, uuid::Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::consume(queue, e))?;

        tracing::info!(queue, prefetch, consumer_tag = %consumer_tag, "Consuming");

        let queue = queue.to_string();
        let stream = consumer.map(move |next| match next {
            Ok(delivery) => {
                let headers = from_field_table(delivery.properties.headers().as_ref());
                Ok(Delivery::new(
                    delivery.data,
                    headers,
                    AmqpAcker(delivery.acker),
                ))
            }
            Err(e) => Err(BrokerError::consume(&queue, e)),
        });

        Ok(Box::pin(stream))
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    fn provider_name(&self) -> &'static str {
        "rabbitmq"
    }
}
