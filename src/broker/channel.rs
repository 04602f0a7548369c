use super::connection::{Connection, ConnectionManager};
use crate::lifecycle::node::{Attachment, ResourceNode};
use crate::lifecycle::{lock, BrokerEvent, EventBus, EventKind, EventSource, HookId};
use crate::transport::{AmqpChannel, ChannelId, TransportError};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelFlavor {
    Normal,
    /// Publisher confirms are enabled.
    Confirming,
}

impl ChannelFlavor {
    pub fn from_confirms(confirming: bool) -> Self {
        if confirming {
            Self::Confirming
        } else {
            Self::Normal
        }
    }

    pub fn source(self) -> EventSource {
        match self {
            Self::Normal => EventSource::Channel,
            Self::Confirming => EventSource::ConfirmChannel,
        }
    }
}

/// A channel, shared by whoever obtained it from the same owner.
#[derive(Clone)]
pub struct Channel {
    node: Arc<ResourceNode<dyn AmqpChannel>>,
    flavor: ChannelFlavor,
    // Serializes confirm waits on this channel.
    confirms: Arc<tokio::sync::Mutex<()>>,
}

impl Channel {
    /// Wrap a driver channel.
    pub fn new(raw: Arc<dyn AmqpChannel>, flavor: ChannelFlavor) -> Self {
        Self {
            node: ResourceNode::new(raw),
            flavor,
            confirms: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Instance id, unique within the process.
    pub fn id(&self) -> u64 {
        self.node.id()
    }

    /// The AMQP channel number.
    pub fn channel_id(&self) -> ChannelId {
        self.raw().id()
    }

    pub fn flavor(&self) -> ChannelFlavor {
        self.flavor
    }

    pub fn is_confirming(&self) -> bool {
        self.flavor == ChannelFlavor::Confirming
    }

    /// Get access to the underlying driver channel
    pub fn raw(&self) -> &Arc<dyn AmqpChannel> {
        self.node.handle()
    }

    pub fn is_closed(&self) -> bool {
        self.node.is_closed()
    }

    /// Wait for the broker to confirm everything published on this channel so far.
    ///
    /// Concurrent waits on the same channel run one after the other.
    pub async fn wait_for_confirms(&self) -> Result<(), TransportError> {
        let _confirms = self.confirms.lock().await;
        self.raw().wait_for_confirms().await
    }

    /// Close the channel. Closing an already closed channel does nothing.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Ok(());
        }
        let outcome = self.raw().close().await;
        self.node.mark_closed();
        outcome
    }

    /// Run `hook` once the channel closes, or right away if it already has.
    pub(crate) fn on_close(&self, hook: impl FnOnce() + Send + 'static) -> HookId {
        self.node.hooks().register(move |_| hook())
    }

    pub(crate) fn cancel_on_close(&self, hook: HookId) -> bool {
        self.node.hooks().cancel(hook)
    }

    pub(crate) fn observe(
        &self,
        events: EventBus,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Attachment {
        self.node.observe(events, self.flavor.source(), on_close)
    }

    /// Close this channel whenever `connection` closes.
    pub(crate) fn bind_to(&self, connection: &Connection) {
        let channel = Arc::downgrade(&self.node);
        let connection_hooks = connection.node().hooks();
        let hook = connection_hooks.register(move |_| {
            if let Some(channel) = channel.upgrade() {
                channel.mark_closed();
            }
        });
        let connection_hooks = Arc::downgrade(connection_hooks);
        self.node.hooks().register(move |_| {
            if let Some(hooks) = connection_hooks.upgrade() {
                hooks.cancel(hook);
            }
        });
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("flavor", &self.flavor)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Default)]
struct Slots {
    normal: Option<Channel>,
    confirming: Option<Channel>,
}

impl Slots {
    fn get_mut(&mut self, flavor: ChannelFlavor) -> &mut Option<Channel> {
        match flavor {
            ChannelFlavor::Normal => &mut self.normal,
            ChannelFlavor::Confirming => &mut self.confirming,
        }
    }
}

/// Owns at most one live channel per flavor, opened on demand.
pub(crate) struct ChannelManager {
    connections: Arc<ConnectionManager>,
    slots: Arc<Mutex<Slots>>,
    opening_normal: tokio::sync::Mutex<()>,
    opening_confirming: tokio::sync::Mutex<()>,
    events: EventBus,
}

impl ChannelManager {
    pub(crate) fn new(connections: Arc<ConnectionManager>, events: EventBus) -> Self {
        Self {
            connections,
            slots: Arc::new(Mutex::new(Slots::default())),
            opening_normal: tokio::sync::Mutex::new(()),
            opening_confirming: tokio::sync::Mutex::new(()),
            events,
        }
    }

    /// The live channel of the given flavor, if any.
    pub(crate) fn current(&self, flavor: ChannelFlavor) -> Option<Channel> {
        let channel = lock(&self.slots).get_mut(flavor).clone()?;
        (!channel.is_closed()).then_some(channel)
    }

    /// Return the live channel of the given flavor, opening one (and a connection, if needed)
    /// if there is none.
    #[tracing::instrument(name = "broker_channel", skip(self))]
    pub(crate) async fn channel(&self, flavor: ChannelFlavor) -> Result<Channel, TransportError> {
        if let Some(channel) = self.current(flavor) {
            return Ok(channel);
        }
        let _opening = match flavor {
            ChannelFlavor::Normal => self.opening_normal.lock().await,
            ChannelFlavor::Confirming => self.opening_confirming.lock().await,
        };
        if let Some(channel) = self.current(flavor) {
            return Ok(channel);
        }

        let connection = self.connections.connect().await?;
        let raw = match flavor {
            ChannelFlavor::Normal => connection.raw().create_channel().await?,
            ChannelFlavor::Confirming => connection.raw().create_confirm_channel().await?,
        };
        let channel = Channel::new(raw, flavor);
        channel.bind_to(&connection);

        let id = channel.id();
        let slots = Arc::clone(&self.slots);
        // The broker follows the channel until it closes.
        let _attachment = channel.observe(self.events.clone(), move || {
            let mut slots = lock(&slots);
            let slot = slots.get_mut(flavor);
            if slot.as_ref().map(Channel::id) == Some(id) {
                *slot = None;
            }
        });
        if channel.is_closed() {
            return Err(TransportError::Closed("channel"));
        }

        *lock(&self.slots).get_mut(flavor) = Some(channel.clone());
        tracing::debug!(
            channel = id,
            connection = connection.id(),
            ?flavor,
            "Opened a channel"
        );
        self.events
            .emit(BrokerEvent::new(EventKind::Channel, flavor.source()).with_resource(id));
        Ok(channel)
    }

    /// Close the live channels, confirming one first.
    pub(crate) async fn close_all(&self) {
        for flavor in [ChannelFlavor::Confirming, ChannelFlavor::Normal] {
            if let Some(channel) = self.current(flavor) {
                if let Err(error) = channel.close().await {
                    tracing::warn!(channel = channel.id(), error = %error, "Failed to close channel");
                }
            }
        }
    }
}
