use crate::broker::{Channel, ChannelProvider};
use crate::content::Content;
use crate::destinations::{parse_destinations, AsDestinations};
use crate::error::ArgumentError;
use crate::lifecycle::node::Attachment;
use crate::lifecycle::{lock, next_instance_id, BrokerEvent, EventBus, EventSource};
use crate::pipeline::{Middleware, MiddlewareError, Pipeline};
use crate::publishers::backpressure::DrainLatch;
use crate::publishers::{default_middleware, PublishOp};
use crate::transport::{TransportError, WriteStatus};
use lapin::options::BasicPublishOptions;
use lapin::BasicProperties;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// How a [`Publisher`] talks to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherSettings {
    /// Publish on a confirming channel.
    pub publisher_confirms: bool,
    /// With `publisher_confirms`, wait for the broker's confirms before `publish` returns.
    pub auto_confirm: bool,
    /// Run the [default middleware](crate::publishers::default_middleware) before any custom one.
    pub use_default_middleware: bool,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            publisher_confirms: false,
            auto_confirm: true,
            use_default_middleware: true,
        }
    }
}

/// Sends messages to one or more destinations.
///
/// Outbound messages go through the middleware pipeline, then are sent once per destination on
/// the publisher's channel. `publish` does not return until every copy was handed to the driver,
/// waiting for the channel to drain if its write buffer fills up, and, with
/// [`PublisherSettings::auto_confirm`], until the broker confirmed them.
///
/// The channel is obtained lazily from a [`ChannelProvider`] and replaced transparently if it
/// closes.
///
/// Built through [`Publisher::builder`], or handed out by
/// [`Broker::create_publisher`](crate::Broker::create_publisher).
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    id: u64,
    provider: Arc<dyn ChannelProvider>,
    settings: PublisherSettings,
    timeout: Option<std::time::Duration>,
    pipeline: Pipeline<PublishOp>,
    channel: Arc<Mutex<Option<HeldChannel>>>,
    // Serializes channel acquisition.
    acquiring: tokio::sync::Mutex<()>,
    events: EventBus,
}

struct HeldChannel {
    channel: Channel,
    attachment: Attachment,
}

impl Publisher {
    /// Start building a [`Publisher`] getting its channel from `provider`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use hutch::amqp::configuration::ConnectTarget;
    /// use hutch::broker::Broker;
    /// use hutch::publishers::Publisher;
    ///
    /// pub fn get_publisher() -> Publisher {
    ///     let broker = Broker::from_target(&ConnectTarget::default()).unwrap();
    ///     Publisher::builder(broker)
    ///         .publisher_confirms(true)
    ///         .publish_timeout(std::time::Duration::from_secs(3))
    ///         .build()
    /// }
    /// ```
    pub fn builder(provider: impl ChannelProvider) -> PublisherBuilder {
        PublisherBuilder::new(Arc::new(provider))
    }

    /// Instance id, unique within the process.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn settings(&self) -> PublisherSettings {
        self.inner.settings
    }

    /// Listen to the publisher's lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    /// The channel messages are published on, obtained from the provider if needed.
    pub async fn channel(&self) -> Result<Channel, TransportError> {
        if let Some(channel) = self.current_channel() {
            return Ok(channel);
        }
        let _acquiring = self.inner.acquiring.lock().await;
        if let Some(channel) = self.current_channel() {
            return Ok(channel);
        }

        let channel = self
            .inner
            .provider
            .channel(self.inner.settings.publisher_confirms)
            .await?;
        let id = channel.id();
        let slot = Arc::clone(&self.inner.channel);
        let attachment = channel.observe(self.inner.events.clone(), move || {
            let mut slot = lock(&slot);
            if slot.as_ref().map(|held| held.channel.id()) == Some(id) {
                *slot = None;
            }
        });
        if channel.is_closed() {
            return Err(TransportError::Closed("channel"));
        }

        tracing::debug!(publisher = self.inner.id, channel = id, "Publisher acquired a channel");
        *lock(&self.inner.channel) = Some(HeldChannel {
            channel: channel.clone(),
            attachment,
        });
        Ok(channel)
    }

    /// Publish a message to one or more destinations.
    ///
    /// Returns the channel the message was published on, e.g. to wait for confirms manually
    /// when `auto_confirm` is disabled.
    pub async fn publish<D>(
        &self,
        destination: &D,
        content: impl Into<Content>,
        properties: BasicProperties,
    ) -> Result<Channel, PublisherError>
    where
        D: AsDestinations + ?Sized,
    {
        self.publish_with_options(
            destination,
            content,
            properties,
            BasicPublishOptions::default(),
        )
        .await
    }

    /// Publish a message to one or more destinations, with explicit AMQP publish options.
    #[tracing::instrument(
        name = "publish",
        level = "debug",
        skip_all,
        fields(publisher = self.inner.id)
    )]
    pub async fn publish_with_options<D>(
        &self,
        destination: &D,
        content: impl Into<Content>,
        properties: BasicProperties,
        options: BasicPublishOptions,
    ) -> Result<Channel, PublisherError>
    where
        D: AsDestinations + ?Sized,
    {
        let destinations = parse_destinations(destination)?;
        let mut op = PublishOp::new(
            destinations,
            content.into(),
            inject_amqp_properties(properties),
        );
        self.inner.pipeline.run(&mut op).await?;

        match self.inner.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.send(op, options))
                .await
                .map_err(|_| PublisherError::TimeoutError)?,
            None => self.send(op, options).await,
        }
    }

    async fn send(
        &self,
        op: PublishOp,
        options: BasicPublishOptions,
    ) -> Result<Channel, PublisherError> {
        let channel = self.channel().await?;
        if op.destinations.is_empty() {
            warn!(publisher = self.inner.id, "Nothing to publish: no destination");
            return Ok(channel);
        }

        let PublishOp {
            destinations,
            content,
            properties,
            ..
        } = op;
        let payload = content.into_payload().map_err(MiddlewareError::Serialize)?;

        let mut latch = DrainLatch::new(&channel);
        for destination in &destinations {
            latch.arm();
            let status = channel
                .raw()
                .publish(
                    &destination.exchange,
                    &destination.routing_key,
                    &payload,
                    options,
                    properties.clone(),
                )
                .await?;
            if status == WriteStatus::BufferFull {
                tracing::debug!(
                    publisher = self.inner.id,
                    %destination,
                    "Write buffer full, waiting for the channel to drain"
                );
                latch.wait().await?;
            }
        }
        drop(latch);

        let settings = self.inner.settings;
        if settings.publisher_confirms && settings.auto_confirm {
            channel.wait_for_confirms().await?;
        }
        Ok(channel)
    }

    /// Let go of the channel. Publishing again acquires a new one.
    ///
    /// Emits a close event only if a channel was held.
    pub fn close(&self) {
        let held = lock(&self.inner.channel).take();
        if let Some(HeldChannel {
            channel,
            attachment,
        }) = held
        {
            attachment.detach();
            tracing::debug!(
                publisher = self.inner.id,
                channel = channel.id(),
                "Publisher closed"
            );
            self.inner
                .events
                .emit(BrokerEvent::close(EventSource::Local).with_resource(self.inner.id));
        }
    }

    fn current_channel(&self) -> Option<Channel> {
        let channel = lock(&self.inner.channel)
            .as_ref()
            .map(|held| held.channel.clone())?;
        (!channel.is_closed()).then_some(channel)
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("id", &self.inner.id)
            .field("settings", &self.inner.settings)
            .finish()
    }
}

#[async_trait::async_trait]
impl ChannelProvider for Publisher {
    async fn channel(&self, _confirming: bool) -> Result<Channel, TransportError> {
        Publisher::channel(self).await
    }
}

/// Why a [`Publisher::publish`] call failed.
#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error(transparent)]
    InvalidDestination(#[from] ArgumentError),
    #[error(transparent)]
    Middleware(#[from] MiddlewareError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("channel closed while waiting for capacity")]
    ClosedWhileWaiting,
    #[error("publish did not complete within the configured timeout")]
    TimeoutError,
}

/// Collects settings and middleware for a [`Publisher`].
pub struct PublisherBuilder {
    provider: Arc<dyn ChannelProvider>,
    settings: PublisherSettings,
    timeout: Option<std::time::Duration>,
    middleware_chain: Vec<Arc<dyn Middleware<PublishOp>>>,
    pipeline: Option<Pipeline<PublishOp>>,
}

impl PublisherBuilder {
    pub(crate) fn new(provider: Arc<dyn ChannelProvider>) -> Self {
        Self {
            provider,
            settings: PublisherSettings::default(),
            timeout: None,
            middleware_chain: vec![],
            pipeline: None,
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: PublisherSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Publish on a confirming channel. Defaults to `false`.
    #[must_use]
    pub fn publisher_confirms(mut self, enabled: bool) -> Self {
        self.settings.publisher_confirms = enabled;
        self
    }

    /// Wait for confirms before `publish` returns, on confirming channels. Defaults to `true`.
    #[must_use]
    pub fn auto_confirm(mut self, enabled: bool) -> Self {
        self.settings.auto_confirm = enabled;
        self
    }

    /// Run the default middleware before custom ones. Defaults to `true`.
    #[must_use]
    pub fn use_default_middleware(mut self, enabled: bool) -> Self {
        self.settings.use_default_middleware = enabled;
        self
    }

    /// Timeout applied to sending a message, once the middleware has run.
    /// No timeout if left unspecified.
    #[must_use]
    pub fn publish_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Append a middleware, executed after the default ones.
    /// Middlewares are executed in the order they are registered.
    #[must_use]
    pub fn with_middleware<M: Middleware<PublishOp>>(self, middleware: M) -> Self {
        self.with_dyn_middleware(Arc::new(middleware))
    }

    /// As [`with_middleware`](Self::with_middleware), for middleware already behind an `Arc`.
    #[must_use]
    pub fn with_dyn_middleware(mut self, middleware: Arc<dyn Middleware<PublishOp>>) -> Self {
        self.middleware_chain.push(middleware);
        self
    }

    /// Append several middlewares, in iteration order, after those already registered.
    #[must_use]
    pub fn with_middlewares<I>(mut self, middlewares: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Middleware<PublishOp>>>,
    {
        self.middleware_chain.extend(middlewares);
        self
    }

    /// Use `pipeline` as is, ignoring the default and appended middleware.
    #[must_use]
    pub fn with_pipeline(mut self, pipeline: Pipeline<PublishOp>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Assemble the [`Publisher`]. No channel is opened until the first publish.
    pub fn build(self) -> Publisher {
        let pipeline = self.pipeline.unwrap_or_else(|| {
            let defaults = if self.settings.use_default_middleware {
                default_middleware()
            } else {
                vec![]
            };
            Pipeline::new()
                .with_middlewares(defaults)
                .with_middlewares(self.middleware_chain)
        });
        Publisher {
            inner: Arc::new(PublisherInner {
                id: next_instance_id(),
                provider: self.provider,
                settings: self.settings,
                timeout: self.timeout,
                pipeline,
                channel: Arc::new(Mutex::new(None)),
                acquiring: tokio::sync::Mutex::new(()),
                events: EventBus::new(),
            }),
        }
    }
}

/// Stamp the message with a timestamp and a message id, unless it already has them.
fn inject_amqp_properties(properties: BasicProperties) -> BasicProperties {
    let current_timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|ct| ct.as_secs());

    let properties = if let Some(ct) = current_timestamp {
        let ts = *properties.timestamp();
        properties.with_timestamp(ts.unwrap_or(ct))
    } else {
        warn!("System time is before 1970");
        properties
    };

    let message_id = properties.message_id().clone();
    properties.with_message_id(message_id.unwrap_or_else(|| Uuid::new_v4().to_string().into()))
}
