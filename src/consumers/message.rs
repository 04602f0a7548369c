use super::error::AckError;
use crate::broker::Channel;
use crate::content::Content;
use crate::pipeline::MiddlewareLog;
use crate::publishers::{Publisher, PublisherError};
use crate::transport::Delivery;
use amq_protocol_types::{DeliveryTag, ShortString};
use lapin::BasicProperties;
use task_local_extensions::Extensions;
use tracing::Level;

/// Where a message comes from, as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFields {
    pub delivery_tag: DeliveryTag,
    /// May be an empty string if the default exchange is used.
    pub exchange: ShortString,
    pub routing_key: ShortString,
    pub redelivered: bool,
    pub consumer_tag: String,
}

/// Where a message stands with respect to acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    /// Delivered in automatic-ack mode: the broker considers it acknowledged already.
    NotRequired,
    /// Waiting for [`Message::ack`], [`Message::nack`] or [`Message::reject`].
    Pending,
    Acked,
    Nacked,
    Rejected,
}

/// A consumed message, as shaped by the inbound middleware.
///
/// In manual-ack mode exactly one of `ack`, `nack` or `reject` reaches the broker; every
/// later call is a no-op. Once the channel the message arrived on is closed, they all fail with
/// [`AckError::ChannelClosed`].
pub struct Message {
    pub fields: DeliveryFields,
    pub properties: BasicProperties,
    pub content: Content,
    channel: Channel,
    publisher: Option<Publisher>,
    ack_state: AckState,
    extensions: Extensions,
    log: MiddlewareLog,
}

impl Message {
    pub(crate) fn new(
        channel: Channel,
        delivery: Delivery,
        consumer_tag: &str,
        manual_ack: bool,
        publisher: Option<Publisher>,
    ) -> Self {
        Self {
            fields: DeliveryFields {
                delivery_tag: delivery.delivery_tag,
                exchange: delivery.exchange,
                routing_key: delivery.routing_key,
                redelivered: delivery.redelivered,
                consumer_tag: consumer_tag.to_owned(),
            },
            properties: delivery.properties,
            content: Content::Bytes(delivery.data),
            channel,
            publisher,
            ack_state: if manual_ack {
                AckState::Pending
            } else {
                AckState::NotRequired
            },
            extensions: Extensions::new(),
            log: MiddlewareLog::default(),
        }
    }

    /// `exchange:routing_key`
    pub fn destination(&self) -> String {
        format!("{}:{}", self.fields.exchange, self.fields.routing_key)
    }

    /// The channel the message arrived on.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn ack_state(&self) -> AckState {
        self.ack_state
    }

    /// Whether the message still has to be acked, nacked or rejected.
    pub fn needs_ack(&self) -> bool {
        self.ack_state == AckState::Pending
    }

    /// Acknowledge the message, and every earlier unacknowledged one on the channel if
    /// `multiple` is set.
    pub async fn ack(&mut self, multiple: bool) -> Result<(), AckError> {
        if !self.ready_to_ack()? {
            return Ok(());
        }
        self.channel
            .raw()
            .ack(self.fields.delivery_tag, multiple)
            .await?;
        self.ack_state = AckState::Acked;
        Ok(())
    }

    pub async fn nack(&mut self, multiple: bool, requeue: bool) -> Result<(), AckError> {
        if !self.ready_to_ack()? {
            return Ok(());
        }
        self.channel
            .raw()
            .nack(self.fields.delivery_tag, multiple, requeue)
            .await?;
        self.ack_state = AckState::Nacked;
        Ok(())
    }

    pub async fn reject(&mut self, requeue: bool) -> Result<(), AckError> {
        if !self.ready_to_ack()? {
            return Ok(());
        }
        self.channel
            .raw()
            .reject(self.fields.delivery_tag, requeue)
            .await?;
        self.ack_state = AckState::Rejected;
        Ok(())
    }

    fn ready_to_ack(&self) -> Result<bool, AckError> {
        if self.channel.is_closed() {
            return Err(AckError::ChannelClosed);
        }
        Ok(self.needs_ack())
    }

    /// Attach a value to the message, replacing any previous value of the same type.
    pub fn set<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.extensions.insert(value)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Notes left by the middleware that processed the message.
    pub fn middleware_log(&self) -> &MiddlewareLog {
        &self.log
    }

    pub fn log(&mut self, level: Level, message: impl Into<String>) {
        self.log.push(level, message);
    }

    pub fn override_content(&mut self, content: impl Into<Content>) -> &mut Self {
        self.content = content.into();
        self
    }

    /// Publish `content` to the message's `reply_to`, carrying over its `correlation_id`.
    ///
    /// Returns `Ok(None)` without publishing if the consumer has no publisher or the message
    /// has no `reply_to`.
    pub async fn reply(
        &self,
        content: impl Into<Content>,
        properties: BasicProperties,
    ) -> Result<Option<Channel>, PublisherError> {
        let (Some(publisher), Some(reply_to)) = (&self.publisher, self.properties.reply_to())
        else {
            return Ok(None);
        };
        let properties = match self.properties.correlation_id() {
            Some(correlation_id) => properties.with_correlation_id(correlation_id.clone()),
            None => properties,
        };
        let channel = publisher
            .publish(reply_to.as_str(), content, properties)
            .await?;
        Ok(Some(channel))
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("fields", &self.fields)
            .field("properties", &self.properties)
            .field("content", &self.content)
            .field("ack_state", &self.ack_state)
            .finish()
    }
}
