use super::consumer_middleware::default_middleware;
use super::error::{ConsumerError, FailedMessage};
use super::Message;
use crate::broker::{Channel, ChannelProvider};
use crate::lifecycle::node::Attachment;
use crate::lifecycle::{lock, next_instance_id, BrokerEvent, EventBus, EventKind, EventSource};
use crate::pipeline::{Middleware, Pipeline};
use crate::publishers::Publisher;
use crate::transport::{DeliverySignal, DeliveryStream, TransportError};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use lapin::options::BasicConsumeOptions;
use lapin::types::FieldTable;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not subscribed to any queue.
    Idle,
    Consuming,
    /// The subscription ended, on request or on the broker's initiative.
    Canceled,
    /// Terminal.
    Closed,
}

/// Options of a subscription, see [`Consumer::consume`].
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Let the broker consider messages acknowledged as soon as they are delivered.
    /// When unset, every message must be acked, nacked or rejected.
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub nowait: bool,
    pub arguments: FieldTable,
    /// Generated if unspecified.
    pub consumer_tag: Option<String>,
    /// Limit the unacknowledged deliveries on the consumer's channel before subscribing.
    pub prefetch: Option<u16>,
}

/// What a [`Deliveries`] stream yields.
#[derive(Debug)]
pub enum ConsumerEvent {
    /// A message that made it through the inbound middleware.
    Message(Message),
    MessageError(FailedMessage),
}

/// Subscribes to a queue and shapes every delivery with the inbound middleware.
///
/// The consumer never acknowledges messages on its own: in manual-ack mode each [`Message`]
/// must be acked, nacked or rejected by whoever receives it.
///
/// If the channel closes while consuming, the consumer goes back to
/// [`ConsumerState::Idle`] and the next call to [`Consumer::consume`] uses a fresh channel.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    id: u64,
    provider: Arc<dyn ChannelProvider>,
    publisher: Option<Publisher>,
    publisher_confirms: bool,
    pipeline: Pipeline<Message>,
    slot: Arc<Mutex<Slot>>,
    // Serializes channel acquisition and subscription.
    acquiring: tokio::sync::Mutex<()>,
    events: EventBus,
}

struct Slot {
    state: ConsumerState,
    channel: Option<HeldChannel>,
    consumer_tag: Option<String>,
}

struct HeldChannel {
    channel: Channel,
    attachment: Attachment,
}

impl Consumer {
    /// Start building a [`Consumer`] getting its channel from `provider`.
    pub fn builder(provider: impl ChannelProvider) -> ConsumerBuilder {
        ConsumerBuilder::new(Arc::new(provider))
    }

    /// Instance id, unique within the process.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> ConsumerState {
        lock(&self.inner.slot).state
    }

    /// The tag of the active subscription, if any.
    pub fn consumer_tag(&self) -> Option<String> {
        lock(&self.inner.slot).consumer_tag.clone()
    }

    /// The publisher replies go through, if any.
    pub fn publisher(&self) -> Option<&Publisher> {
        self.inner.publisher.as_ref()
    }

    /// Listen to the consumer's lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    /// Subscribe to `queue`.
    ///
    /// Fails with [`ConsumerError::AlreadyConsuming`] if a subscription is active and with
    /// [`ConsumerError::Closed`] once the consumer is closed.
    #[tracing::instrument(name = "consume", skip(self, options), fields(consumer = self.inner.id))]
    pub async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<Deliveries, ConsumerError> {
        let _acquiring = self.inner.acquiring.lock().await;
        self.check_can_consume()?;

        let channel = self.acquire_channel().await?;
        if let Some(count) = options.prefetch {
            channel.raw().prefetch(count).await?;
        }
        let consumer_tag = options
            .consumer_tag
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let basic_options = BasicConsumeOptions {
            no_local: options.no_local,
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            nowait: options.nowait,
        };
        let deliveries = channel
            .raw()
            .consume(queue, &consumer_tag, basic_options, options.arguments)
            .await?;

        {
            let mut slot = lock(&self.inner.slot);
            slot.state = ConsumerState::Consuming;
            slot.consumer_tag = Some(consumer_tag.clone());
        }
        tracing::debug!(
            consumer = self.inner.id,
            channel = channel.id(),
            consumer_tag = %consumer_tag,
            "Consumer subscribed"
        );

        Ok(Deliveries::new(DeliveryLoop {
            consumer: self.clone(),
            channel,
            deliveries,
            consumer_tag,
            manual_ack: !options.no_ack,
        }))
    }

    fn check_can_consume(&self) -> Result<(), ConsumerError> {
        let slot = lock(&self.inner.slot);
        match slot.state {
            ConsumerState::Closed => Err(ConsumerError::Closed),
            ConsumerState::Consuming => Err(ConsumerError::AlreadyConsuming(
                slot.consumer_tag.clone().unwrap_or_default(),
            )),
            ConsumerState::Idle | ConsumerState::Canceled => Ok(()),
        }
    }

    /// The channel the consumer subscribes on, preferring the paired publisher's.
    async fn acquire_channel(&self) -> Result<Channel, TransportError> {
        if let Some(channel) = self.current_channel() {
            return Ok(channel);
        }
        let channel = match &self.inner.publisher {
            Some(publisher) => publisher.channel().await?,
            None => self.inner.provider.channel(self.inner.publisher_confirms).await?,
        };

        let id = channel.id();
        let slot = Arc::clone(&self.inner.slot);
        let consumer = self.inner.id;
        let attachment = channel.observe(self.inner.events.clone(), move || {
            let mut slot = lock(&slot);
            if slot.channel.as_ref().map(|held| held.channel.id()) == Some(id) {
                slot.channel = None;
            }
            if slot.state == ConsumerState::Consuming {
                tracing::debug!(consumer, channel = id, "Channel closed while consuming");
                slot.state = ConsumerState::Idle;
                slot.consumer_tag = None;
            }
        });
        if channel.is_closed() {
            return Err(TransportError::Closed("channel"));
        }

        lock(&self.inner.slot).channel = Some(HeldChannel {
            channel: channel.clone(),
            attachment,
        });
        Ok(channel)
    }

    fn current_channel(&self) -> Option<Channel> {
        let channel = lock(&self.inner.slot)
            .channel
            .as_ref()
            .map(|held| held.channel.clone())?;
        (!channel.is_closed()).then_some(channel)
    }

    /// End the active subscription, if any.
    pub async fn cancel(&self) -> Result<(), ConsumerError> {
        let (consumer_tag, channel) = {
            let mut slot = lock(&self.inner.slot);
            let Some(consumer_tag) = slot.consumer_tag.take() else {
                return Ok(());
            };
            if slot.state == ConsumerState::Consuming {
                slot.state = ConsumerState::Canceled;
            }
            let channel = slot.channel.as_ref().map(|held| held.channel.clone());
            (consumer_tag, channel)
        };

        let outcome = match channel.filter(|channel| !channel.is_closed()) {
            Some(channel) => channel.raw().cancel(&consumer_tag).await,
            None => Ok(()),
        };
        tracing::debug!(consumer = self.inner.id, consumer_tag = %consumer_tag, "Consumer canceled");
        self.inner.events.emit(
            BrokerEvent::new(EventKind::Canceled, EventSource::Local).with_resource(self.inner.id),
        );
        Ok(outcome?)
    }

    /// Cancel the subscription if needed and let go of the channel. A closed consumer cannot
    /// consume again.
    pub async fn close(&self) -> Result<(), ConsumerError> {
        let canceled = self.cancel().await;
        let held = {
            let mut slot = lock(&self.inner.slot);
            slot.state = ConsumerState::Closed;
            slot.channel.take()
        };
        if let Some(HeldChannel { attachment, .. }) = held {
            attachment.detach();
            tracing::debug!(consumer = self.inner.id, "Consumer closed");
            self.inner
                .events
                .emit(BrokerEvent::close(EventSource::Local).with_resource(self.inner.id));
        }
        canceled
    }

    fn is_consuming_with(&self, consumer_tag: &str) -> bool {
        let slot = lock(&self.inner.slot);
        slot.state == ConsumerState::Consuming && slot.consumer_tag.as_deref() == Some(consumer_tag)
    }

    /// The broker ended the subscription.
    fn canceled_by_server(&self, consumer_tag: &str) {
        {
            let mut slot = lock(&self.inner.slot);
            if slot.consumer_tag.as_deref() != Some(consumer_tag) {
                return;
            }
            slot.consumer_tag = None;
            slot.state = ConsumerState::Canceled;
        }
        tracing::debug!(consumer = self.inner.id, consumer_tag, "Subscription canceled by the broker");
        self.inner.events.emit(
            BrokerEvent::new(EventKind::Canceled, EventSource::Server).with_resource(self.inner.id),
        );
    }

    /// The driver stopped delivering without the broker canceling the subscription.
    fn stream_ended(&self, channel: &Channel, consumer_tag: &str) {
        // A dead channel is marked closed here, which already resets the slot.
        let channel_closed = channel.is_closed();
        let mut slot = lock(&self.inner.slot);
        let subscribed = slot.state == ConsumerState::Consuming
            && slot.consumer_tag.as_deref() == Some(consumer_tag);
        if !subscribed {
            return;
        }
        tracing::debug!(
            consumer = self.inner.id,
            consumer_tag,
            channel_closed,
            "Delivery stream ended"
        );
        slot.state = ConsumerState::Idle;
        slot.consumer_tag = None;
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

struct DeliveryLoop {
    consumer: Consumer,
    channel: Channel,
    deliveries: DeliveryStream,
    consumer_tag: String,
    manual_ack: bool,
}

impl DeliveryLoop {
    async fn next_event(&mut self) -> Option<ConsumerEvent> {
        if !self.consumer.is_consuming_with(&self.consumer_tag) {
            return None;
        }
        let Some(signal) = self.deliveries.next().await else {
            self.consumer.stream_ended(&self.channel, &self.consumer_tag);
            return None;
        };
        match signal {
            Ok(DeliverySignal::Delivery(delivery)) => {
                let mut message = Message::new(
                    self.channel.clone(),
                    delivery,
                    &self.consumer_tag,
                    self.manual_ack,
                    self.consumer.inner.publisher.clone(),
                );
                match self.consumer.inner.pipeline.run(&mut message).await {
                    Ok(()) => Some(ConsumerEvent::Message(message)),
                    Err(error) => Some(ConsumerEvent::MessageError(FailedMessage {
                        error,
                        message,
                    })),
                }
            }
            Ok(DeliverySignal::Cancelled) => {
                self.consumer.canceled_by_server(&self.consumer_tag);
                None
            }
            Err(error) => {
                tracing::warn!(
                    consumer = self.consumer.inner.id,
                    error = %error,
                    "Delivery stream failed"
                );
                self.consumer.inner.events.emit(
                    BrokerEvent::error(EventSource::Consumer, Arc::new(error))
                        .with_resource(self.consumer.inner.id),
                );
                None
            }
        }
    }
}

/// The messages of a subscription, in delivery order.
///
/// The stream ends when the subscription is canceled, by either side, or its channel closes.
pub struct Deliveries {
    inner: BoxStream<'static, ConsumerEvent>,
}

impl Deliveries {
    fn new(delivery_loop: DeliveryLoop) -> Self {
        let inner = stream::unfold(delivery_loop, |mut delivery_loop| async move {
            let event = delivery_loop.next_event().await?;
            Some((event, delivery_loop))
        })
        .boxed();
        Self { inner }
    }
}

impl Stream for Deliveries {
    type Item = ConsumerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// A builder for [`Consumer`].
///
/// Use [`Consumer::builder`] as entrypoint.
pub struct ConsumerBuilder {
    provider: Arc<dyn ChannelProvider>,
    publisher: Option<Publisher>,
    publisher_confirms: bool,
    use_default_middleware: bool,
    middleware_chain: Vec<Arc<dyn Middleware<Message>>>,
    pipeline: Option<Pipeline<Message>>,
}

impl ConsumerBuilder {
    pub(crate) fn new(provider: Arc<dyn ChannelProvider>) -> Self {
        Self {
            provider,
            publisher: None,
            publisher_confirms: false,
            use_default_middleware: false,
            middleware_chain: vec![],
            pipeline: None,
        }
    }

    /// Share `publisher`'s channel and let messages [`reply`](Message::reply) through it.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Consume on a confirming channel, when there is no publisher. Defaults to `false`.
    #[must_use]
    pub fn publisher_confirms(mut self, enabled: bool) -> Self {
        self.publisher_confirms = enabled;
        self
    }

    /// Run the default inbound middleware before custom ones. Defaults to `false`.
    #[must_use]
    pub fn use_default_middleware(mut self, enabled: bool) -> Self {
        self.use_default_middleware = enabled;
        self
    }

    /// Append a middleware, executed after the default ones.
    /// Middlewares are executed in the order they are registered.
    #[must_use]
    pub fn with_middleware<M: Middleware<Message>>(self, middleware: M) -> Self {
        self.with_dyn_middleware(Arc::new(middleware))
    }

    #[must_use]
    pub fn with_dyn_middleware(mut self, middleware: Arc<dyn Middleware<Message>>) -> Self {
        self.middleware_chain.push(middleware);
        self
    }

    #[must_use]
    pub fn with_middlewares<I>(mut self, middlewares: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Middleware<Message>>>,
    {
        self.middleware_chain.extend(middlewares);
        self
    }

    /// Use `pipeline` as is, ignoring the default and appended middleware.
    #[must_use]
    pub fn with_pipeline(mut self, pipeline: Pipeline<Message>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn build(self) -> Consumer {
        let pipeline = self.pipeline.unwrap_or_else(|| {
            let defaults = if self.use_default_middleware {
                default_middleware()
            } else {
                vec![]
            };
            Pipeline::new()
                .with_middlewares(defaults)
                .with_middlewares(self.middleware_chain)
        });
        Consumer {
            inner: Arc::new(ConsumerInner {
                id: next_instance_id(),
                provider: self.provider,
                publisher: self.publisher,
                publisher_confirms: self.publisher_confirms,
                pipeline,
                slot: Arc::new(Mutex::new(Slot {
                    state: ConsumerState::Idle,
                    channel: None,
                    consumer_tag: None,
                })),
                acquiring: tokio::sync::Mutex::new(()),
                events: EventBus::new(),
            }),
        }
    }
}
