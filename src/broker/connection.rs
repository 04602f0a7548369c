use crate::lifecycle::node::ResourceNode;
use crate::lifecycle::{lock, BrokerEvent, EventBus, EventKind, EventSource};
use crate::transport::{AmqpConnection, Transport, TransportError};
use std::sync::{Arc, Mutex};

/// A connection to a broker, as owned by a [`Broker`](super::Broker).
#[derive(Clone)]
pub struct Connection {
    node: Arc<ResourceNode<dyn AmqpConnection>>,
}

impl Connection {
    pub(crate) fn new(raw: Arc<dyn AmqpConnection>) -> Self {
        Self {
            node: ResourceNode::new(raw),
        }
    }

    /// Instance id, unique within the process.
    pub fn id(&self) -> u64 {
        self.node.id()
    }

    /// Get access to the underlying driver connection
    pub fn raw(&self) -> &Arc<dyn AmqpConnection> {
        self.node.handle()
    }

    pub fn is_closed(&self) -> bool {
        self.node.is_closed()
    }

    /// Close the connection. Closing an already closed connection does nothing.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Ok(());
        }
        let outcome = self.raw().close().await;
        self.node.mark_closed();
        outcome
    }

    pub(crate) fn node(&self) -> &Arc<ResourceNode<dyn AmqpConnection>> {
        &self.node
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Owns at most one live connection, opened on demand.
pub(crate) struct ConnectionManager {
    transport: Arc<dyn Transport>,
    current: Arc<Mutex<Option<Connection>>>,
    // Serializes connection attempts.
    opening: tokio::sync::Mutex<()>,
    events: EventBus,
}

impl ConnectionManager {
    pub(crate) fn new(transport: Arc<dyn Transport>, events: EventBus) -> Self {
        Self {
            transport,
            current: Arc::new(Mutex::new(None)),
            opening: tokio::sync::Mutex::new(()),
            events,
        }
    }

    /// The live connection, if any.
    pub(crate) fn current(&self) -> Option<Connection> {
        // Checked outside the lock: a dead connection's close hooks take it.
        let connection = lock(&self.current).clone()?;
        (!connection.is_closed()).then_some(connection)
    }

    /// Return the live connection, opening one if there is none.
    ///
    /// Driver failures are handed back as they are, without retrying.
    #[tracing::instrument(name = "broker_connect", skip(self))]
    pub(crate) async fn connect(&self) -> Result<Connection, TransportError> {
        if let Some(connection) = self.current() {
            return Ok(connection);
        }
        let _opening = self.opening.lock().await;
        if let Some(connection) = self.current() {
            return Ok(connection);
        }

        let connection = Connection::new(self.transport.connect().await?);
        let id = connection.id();
        let slot = Arc::clone(&self.current);
        // The broker follows the connection until it closes.
        let _attachment =
            connection
                .node()
                .observe(self.events.clone(), EventSource::Connection, move || {
                    let mut current = lock(&slot);
                    if current.as_ref().map(Connection::id) == Some(id) {
                        *current = None;
                    }
                });
        if connection.is_closed() {
            return Err(TransportError::Closed("connection"));
        }

        *lock(&self.current) = Some(connection.clone());
        tracing::debug!(connection = id, "Connected to the broker");
        self.events.emit(
            BrokerEvent::new(EventKind::Connect, EventSource::Connection).with_resource(id),
        );
        Ok(connection)
    }
}
