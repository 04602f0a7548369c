use crate::transport::TransportError;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A connection was opened.
    Connect,
    /// A channel was opened.
    Channel,
    /// The shared publisher was created.
    Publisher,
    Close,
    Error,
    /// A subscription ended.
    Canceled,
}

/// The resource an event originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    Connection,
    Channel,
    ConfirmChannel,
    Publisher,
    Consumer,
    /// The broker, on its own initiative.
    Server,
    /// The component emitting the event, on request of its owner.
    Local,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match self {
            Self::Connection => "connection",
            Self::Channel => "channel",
            Self::ConfirmChannel => "confirmChannel",
            Self::Publisher => "publisher",
            Self::Consumer => "consumer",
            Self::Server => "server",
            Self::Local => "self",
        };
        f.write_str(source)
    }
}

#[derive(Debug, Clone)]
pub struct BrokerEvent {
    pub kind: EventKind,
    pub source: EventSource,
    pub error: Option<Arc<TransportError>>,
    /// Instance id of the resource the event is about, if any.
    pub resource: Option<u64>,
}

impl BrokerEvent {
    pub fn new(kind: EventKind, source: EventSource) -> Self {
        Self {
            kind,
            source,
            error: None,
            resource: None,
        }
    }

    pub fn close(source: EventSource) -> Self {
        Self::new(EventKind::Close, source)
    }

    pub fn error(source: EventSource, error: Arc<TransportError>) -> Self {
        Self {
            error: Some(error),
            ..Self::new(EventKind::Error, source)
        }
    }

    #[must_use]
    pub fn with_resource(mut self, id: u64) -> Self {
        self.resource = Some(id);
        self
    }
}

/// Fan-out of [`BrokerEvent`]s to every subscriber.
///
/// Emitting never blocks and never fails: events sent while nobody listens are dropped, and slow
/// subscribers observe a lag.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BrokerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self { sender }
    }

    pub fn emit(&self, event: BrokerEvent) {
        tracing::debug!(
            kind = ?event.kind,
            source = %event.source,
            resource = ?event.resource,
            "Lifecycle event"
        );
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.sender.subscribe()
    }
}
