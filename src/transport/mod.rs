//! The seam between `hutch` and the AMQP driver.
//!
//! Everything above this module talks to connections and channels through [`Transport`],
//! [`AmqpConnection`] and [`AmqpChannel`]. [`ConnectionFactory`](crate::amqp::ConnectionFactory)
//! implements them on top of [`lapin`]; tests plug in their own implementations.
//!
//! Drivers report asynchronous happenings (errors, closure, write buffer drained) through
//! [`TransportSignal`]s delivered to the listeners registered on each handle.
mod error;
mod rabbit_mq;
mod signals;

pub use error::TransportError;
pub use rabbit_mq::{RabbitMqChannel, RabbitMqConnection};
pub use signals::{ListenerId, SignalHub, SignalListener, TransportSignal};

use amq_protocol_types::{DeliveryTag, ShortString};
use futures_util::stream::BoxStream;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, ExchangeDeleteOptions,
        QueueDeclareOptions, QueueDeleteOptions,
    },
    types::FieldTable,
    BasicProperties, ExchangeKind,
};
use std::sync::Arc;

pub type ChannelId = u16;

/// The stream of deliveries for a subscription.
///
/// A subscription that the broker ends on its own yields [`DeliverySignal::Cancelled`] before
/// the stream finishes.
pub type DeliveryStream = BoxStream<'static, Result<DeliverySignal, TransportError>>;

/// Opens connections to a broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, TransportError>;
}

/// A live connection to a broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait AmqpConnection: Send + Sync + 'static {
    fn is_open(&self) -> bool;

    fn add_listener(&self, listener: SignalListener) -> ListenerId;

    fn remove_listener(&self, id: ListenerId) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, TransportError>;

    /// Open a channel in publisher-confirm mode.
    async fn create_confirm_channel(&self) -> Result<Arc<dyn AmqpChannel>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// A channel multiplexed over an [`AmqpConnection`].
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait AmqpChannel: Send + Sync + 'static {
    fn id(&self) -> ChannelId;

    fn is_open(&self) -> bool;

    fn is_confirming(&self) -> bool;

    fn add_listener(&self, listener: SignalListener) -> ListenerId;

    fn remove_listener(&self, id: ListenerId) -> bool;

    /// Hand a message over to the driver.
    ///
    /// [`WriteStatus::BufferFull`] means the message was accepted but the caller should hold
    /// off until the channel emits [`TransportSignal::Drained`].
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: BasicPublishOptions,
        properties: BasicProperties,
    ) -> Result<WriteStatus, TransportError>;

    /// Wait until the broker has confirmed every message published so far on this channel.
    async fn wait_for_confirms(&self) -> Result<(), TransportError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> Result<DeliveryStream, TransportError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<(), TransportError>;

    async fn nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError>;

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), TransportError>;

    async fn prefetch(&self, count: u16) -> Result<(), TransportError>;

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, TransportError>;

    /// Returns the number of messages deleted along with the queue.
    async fn queue_delete(
        &self,
        queue: &str,
        options: QueueDeleteOptions,
    ) -> Result<u32, TransportError>;

    /// Returns the number of messages purged.
    async fn queue_purge(&self, queue: &str) -> Result<u32, TransportError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), TransportError>;

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), TransportError>;

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), TransportError>;

    async fn exchange_delete(
        &self,
        exchange: &str,
        options: ExchangeDeleteOptions,
    ) -> Result<(), TransportError>;

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), TransportError>;

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Outcome of handing a message to [`AmqpChannel::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Written,
    BufferFull,
}

/// What a subscription stream yields.
#[derive(Debug)]
pub enum DeliverySignal {
    Delivery(Delivery),
    /// The broker ended the subscription.
    Cancelled,
}

/// One message pushed by the broker to a subscription, as the driver hands it over.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Scoped to the channel the message arrived on.
    pub delivery_tag: DeliveryTag,
    /// Empty for the default exchange.
    pub exchange: ShortString,
    pub routing_key: ShortString,
    pub redelivered: bool,
    pub properties: BasicProperties,
    /// Raw body, before any consumer middleware.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}
