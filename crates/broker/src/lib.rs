//! Message broker layer.
//!
//! [`Broker`] is the seam between the worker and RabbitMQ. [`AmqpBroker`]
//! talks AMQP 0.9.1 through `lapin`; [`InMemoryBroker`] implements the same
//! routing and dead-lettering rules in process for tests.
//!
//! On top of it sit the [`TopologyManager`] (exchanges, queues and the retry
//! ladder) and the [`RetryCoordinator`] (where a failed message goes next).

pub mod amqp;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod retry;
pub mod topology;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

pub use amqp::AmqpBroker;
pub use envelope::EnvelopeHeaders;
pub use error::BrokerError;
pub use memory::InMemoryBroker;
pub use retry::{RetryCoordinator, RetryDecision, RetryMode};
pub use topology::{Binding, ExchangeDecl, QueueArguments, QueueDecl, TopologyManager};

/// A message to publish: body bytes plus envelope headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub headers: EnvelopeHeaders,
}

impl OutboundMessage {
    pub fn new(body: impl Into<Vec<u8>>, headers: EnvelopeHeaders) -> Self {
        Self {
            body: body.into(),
            headers,
        }
    }
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Reject the delivery; `requeue = false` dead-letters it per the queue's arguments.
    async fn reject(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A consumed message awaiting acknowledgement.
pub struct Delivery {
    pub body: Vec<u8>,
    pub headers: EnvelopeHeaders,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, headers: EnvelopeHeaders, acker: impl Acknowledger + 'static) -> Self {
        Self {
            body,
            headers,
            acker: Box::new(acker),
        }
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.reject(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("body_len", &self.body.len())
            .field("headers", &self.headers)
            .finish()
    }
}

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a durable exchange. Redeclaring with identical parameters is a no-op.
    async fn declare_exchange(&self, exchange: &ExchangeDecl) -> Result<(), BrokerError>;

    /// Declare a durable queue. Redeclaring with different arguments fails
    /// with [`BrokerError::PreconditionFailed`].
    async fn declare_queue(&self, queue: &QueueDecl) -> Result<(), BrokerError>;

    async fn bind_queue(&self, binding: &Binding) -> Result<(), BrokerError>;

    /// Publish persistently; returns once the broker has accepted the message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError>;

    /// Start consuming with at most `prefetch` unacknowledged deliveries.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, BrokerError>;

    fn is_connected(&self) -> bool;

    fn provider_name(&self) -> &'static str;
}
