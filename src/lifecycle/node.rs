use super::{next_instance_id, BrokerEvent, CloseCause, CloseHooks, EventBus, EventSource, HookId};
use crate::transport::{AmqpChannel, AmqpConnection, ListenerId, SignalListener, TransportSignal};
use std::sync::{Arc, Weak};

/// Driver handles whose signals a [`ResourceNode`] can follow.
pub(crate) trait Observable: Send + Sync + 'static {
    fn is_open(&self) -> bool;
    fn add_listener(&self, listener: SignalListener) -> ListenerId;
    fn remove_listener(&self, id: ListenerId) -> bool;
}

impl Observable for dyn AmqpConnection {
    fn is_open(&self) -> bool {
        AmqpConnection::is_open(self)
    }

    fn add_listener(&self, listener: SignalListener) -> ListenerId {
        AmqpConnection::add_listener(self, listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        AmqpConnection::remove_listener(self, id)
    }
}

impl Observable for dyn AmqpChannel {
    fn is_open(&self) -> bool {
        AmqpChannel::is_open(self)
    }

    fn add_listener(&self, listener: SignalListener) -> ListenerId {
        AmqpChannel::add_listener(self, listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        AmqpChannel::remove_listener(self, id)
    }
}

/// A driver handle together with the teardown owed to it.
///
/// The node's close hooks fire as soon as the driver reports the handle closed, or when
/// [`ResourceNode::mark_closed`] is called, whichever happens first.
pub(crate) struct ResourceNode<H: ?Sized> {
    id: u64,
    handle: Arc<H>,
    hooks: Arc<CloseHooks>,
}

impl<H: ?Sized + Observable> ResourceNode<H> {
    pub(crate) fn new(handle: Arc<H>) -> Arc<Self> {
        let node = Arc::new(Self {
            id: next_instance_id(),
            handle,
            hooks: Arc::new(CloseHooks::new()),
        });

        let hooks = Arc::downgrade(&node.hooks);
        let listener = node.handle.add_listener(Arc::new(move |signal| {
            if let (TransportSignal::Closed, Some(hooks)) = (signal, hooks.upgrade()) {
                hooks.fire();
            }
        }));
        let handle = Arc::clone(&node.handle);
        node.hooks.register(move |_| {
            handle.remove_listener(listener);
        });

        if !node.handle.is_open() {
            node.mark_closed();
        }
        node
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn handle(&self) -> &Arc<H> {
        &self.handle
    }

    pub(crate) fn hooks(&self) -> &Arc<CloseHooks> {
        &self.hooks
    }

    /// Whether the resource is gone.
    ///
    /// Drivers may only notice a dead handle lazily, so a handle that reports itself down is
    /// marked closed here, running its hooks. Never call this while holding a lock that a close
    /// hook takes.
    pub(crate) fn is_closed(&self) -> bool {
        if !self.hooks.has_fired() && !self.handle.is_open() {
            tracing::debug!(resource = self.id, "Driver reports the resource down");
            self.mark_closed();
        }
        self.hooks.has_fired()
    }

    pub(crate) fn mark_closed(&self) {
        let ran = self.hooks.fire();
        if ran > 0 {
            tracing::debug!(resource = self.id, hooks = ran, "Resource closed");
        }
    }

    /// Follow this resource on behalf of an owner.
    ///
    /// Driver errors are forwarded to `events` tagged with `source`. When the resource closes,
    /// `on_close` runs and a close event is emitted. Detaching runs `on_close` without emitting.
    pub(crate) fn observe(
        &self,
        events: EventBus,
        source: EventSource,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Attachment {
        let id = self.id;
        let errors = events.clone();
        let listener = self.handle.add_listener(Arc::new(move |signal| {
            if let TransportSignal::Error(error) = signal {
                tracing::warn!(resource = id, %source, error = %error, "Resource error");
                errors.emit(BrokerEvent::error(source, Arc::clone(error)).with_resource(id));
            }
        }));

        let handle = Arc::clone(&self.handle);
        let hook = self.hooks.register(move |cause| {
            handle.remove_listener(listener);
            on_close();
            if cause == CloseCause::Closed {
                events.emit(BrokerEvent::close(source).with_resource(id));
            }
        });

        Attachment {
            hooks: Arc::downgrade(&self.hooks),
            hook,
        }
    }
}

/// An owner's registration on a [`ResourceNode`].
#[derive(Debug)]
pub(crate) struct Attachment {
    hooks: Weak<CloseHooks>,
    hook: HookId,
}

impl Attachment {
    /// Stop following the resource, running the owner's cleanup now.
    pub(crate) fn detach(self) -> bool {
        self.hooks
            .upgrade()
            .map_or(false, |hooks| hooks.run(self.hook))
    }
}
