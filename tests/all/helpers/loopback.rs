//! An in-process broker implementing the driver traits, good enough to exercise the lifecycle
//! and the publish/consume paths without a RabbitMQ instance.
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use hutch::amqp::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, ExchangeDeleteOptions,
    QueueDeclareOptions, QueueDeleteOptions,
};
use hutch::amqp::types::FieldTable;
use hutch::amqp::{BasicProperties, ExchangeKind};
use hutch::transport::{
    AmqpChannel, AmqpConnection, ChannelId, Delivery, DeliverySignal, DeliveryStream, ListenerId,
    QueueInfo, SignalHub, SignalListener, Transport, TransportError, TransportSignal, WriteStatus,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Ack { tag: u64, multiple: bool },
    Nack { tag: u64, multiple: bool, requeue: bool },
    Reject { tag: u64, requeue: bool },
}

#[derive(Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    data: Vec<u8>,
    redelivered: bool,
}

type DeliverySender = mpsc::UnboundedSender<Result<DeliverySignal, TransportError>>;

struct Subscriber {
    consumer_tag: String,
    channel: u64,
    no_ack: bool,
    sender: DeliverySender,
}

#[derive(Default)]
struct Queue {
    messages: VecDeque<Stored>,
    subscribers: Vec<Subscriber>,
    next: usize,
}

enum Target {
    Queue(String),
    Exchange(String),
}

struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<(String, Target)>,
}

struct OpenChannel {
    key: u64,
    id: ChannelId,
    signals: Arc<SignalHub>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    exchanges: HashMap<String, Exchange>,
    connections: Vec<Arc<SignalHub>>,
    channels: Vec<OpenChannel>,
    unacked: HashMap<(u64, u64), (String, Stored)>,
    acks: Vec<Ack>,
    next_tag: u64,
    backpressure: bool,
    refuse_connections: bool,
    connections_opened: usize,
    confirm_waits: usize,
    confirm_delay: Option<Duration>,
    confirms_in_flight: usize,
    max_confirms_in_flight: usize,
    nack_publishes: bool,
    prefetch: Vec<u16>,
}

impl State {
    fn route(&self, exchange: &str, routing_key: &str, depth: usize) -> Option<Vec<String>> {
        if exchange.is_empty() {
            return Some(
                self.queues
                    .contains_key(routing_key)
                    .then(|| routing_key.to_owned())
                    .into_iter()
                    .collect(),
            );
        }
        let exchange = self.exchanges.get(exchange)?;
        let mut queues = Vec::new();
        for (key, target) in &exchange.bindings {
            let matches = match exchange.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => key == routing_key,
                ExchangeKind::Topic => key == "#" || key == routing_key,
                _ => false,
            };
            if !matches {
                continue;
            }
            match target {
                Target::Queue(queue) => queues.push(queue.clone()),
                Target::Exchange(next) if depth < 8 => {
                    queues.extend(self.route(next, routing_key, depth + 1).unwrap_or_default())
                }
                Target::Exchange(_) => {}
            }
        }
        Some(queues)
    }

    fn dispatch(&mut self, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        while !queue.subscribers.is_empty() {
            let Some(stored) = queue.messages.pop_front() else {
                return;
            };
            let index = queue.next % queue.subscribers.len();
            queue.next = queue.next.wrapping_add(1);
            self.next_tag += 1;
            let tag = self.next_tag;
            let subscriber = &queue.subscribers[index];
            let delivery = Delivery {
                delivery_tag: tag,
                exchange: stored.exchange.as_str().into(),
                routing_key: stored.routing_key.as_str().into(),
                redelivered: stored.redelivered,
                properties: stored.properties.clone(),
                data: stored.data.clone(),
            };
            if subscriber
                .sender
                .send(Ok(DeliverySignal::Delivery(delivery)))
                .is_err()
            {
                queue.subscribers.remove(index);
                queue.messages.push_front(stored);
                continue;
            }
            if !subscriber.no_ack {
                self.unacked
                    .insert((subscriber.channel, tag), (queue_name.to_owned(), stored));
            }
        }
    }

    fn requeue(&mut self, channel: u64, tag: u64) {
        if let Some((queue_name, mut stored)) = self.unacked.remove(&(channel, tag)) {
            stored.redelivered = true;
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                queue.messages.push_front(stored);
            }
            self.dispatch(&queue_name);
        }
    }

    /// Forget a channel: its subscriptions end and its unacknowledged messages are requeued.
    fn release_channel(&mut self, channel: u64) {
        self.channels.retain(|open| open.key != channel);
        for queue in self.queues.values_mut() {
            queue
                .subscribers
                .retain(|subscriber| subscriber.channel != channel);
        }
        let pending: Vec<u64> = self
            .unacked
            .keys()
            .filter(|(key, _)| *key == channel)
            .map(|(_, tag)| *tag)
            .collect();
        for tag in pending {
            self.requeue(channel, tag);
        }
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    next_channel: AtomicU64,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

/// Handle on the in-process broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct Loopback {
    shared: Arc<Shared>,
}

impl Loopback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connections_opened(&self) -> usize {
        self.shared.state().connections_opened
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.state().refuse_connections = refuse;
    }

    /// While set, every publish reports a full write buffer.
    pub fn set_backpressure(&self, enabled: bool) {
        self.shared.state().backpressure = enabled;
    }

    /// Signal every open channel that its write buffer drained.
    pub fn drain(&self) {
        let hubs: Vec<_> = self
            .shared
            .state()
            .channels
            .iter()
            .map(|open| Arc::clone(&open.signals))
            .collect();
        for hub in hubs {
            hub.emit(&TransportSignal::Drained);
        }
    }

    /// Drop every connection, as a network failure would.
    pub fn kill_connections(&self) {
        let hubs = std::mem::take(&mut self.shared.state().connections);
        for hub in hubs {
            hub.emit(&TransportSignal::Error(Arc::new(TransportError::Other(
                anyhow::anyhow!("CONNECTION_FORCED - broker forced connection closure"),
            ))));
            hub.close();
        }
    }

    /// Close the channel with AMQP number `id`, as the broker does on a channel error.
    pub fn kill_channel(&self, id: ChannelId) {
        let hubs: Vec<_> = {
            let mut state = self.shared.state();
            let killed: Vec<_> = state
                .channels
                .iter()
                .filter(|open| open.id == id)
                .map(|open| (open.key, Arc::clone(&open.signals)))
                .collect();
            for (key, _) in &killed {
                state.release_channel(*key);
            }
            killed.into_iter().map(|(_, hub)| hub).collect()
        };
        for hub in hubs {
            hub.emit(&TransportSignal::Error(Arc::new(TransportError::Other(
                anyhow::anyhow!("PRECONDITION_FAILED - channel error"),
            ))));
            hub.close();
        }
    }

    /// End every subscription to `queue` on the broker's initiative.
    pub fn cancel_subscriptions(&self, queue: &str) {
        let mut state = self.shared.state();
        if let Some(queue) = state.queues.get_mut(queue) {
            for subscriber in queue.subscribers.drain(..) {
                let _ = subscriber.sender.send(Ok(DeliverySignal::Cancelled));
            }
        }
    }

    pub fn acks(&self) -> Vec<Ack> {
        self.shared.state().acks.clone()
    }

    /// Messages ready in `queue`, not counting those delivered and not yet acknowledged.
    pub fn ready(&self, queue: &str) -> Option<usize> {
        self.shared
            .state()
            .queues
            .get(queue)
            .map(|queue| queue.messages.len())
    }

    /// Payloads ready in `queue`, in order.
    pub fn payloads(&self, queue: &str) -> Vec<Vec<u8>> {
        self.shared
            .state()
            .queues
            .get(queue)
            .map(|queue| queue.messages.iter().map(|m| m.data.clone()).collect())
            .unwrap_or_default()
    }

    /// Properties of the messages ready in `queue`, in order.
    pub fn properties(&self, queue: &str) -> Vec<BasicProperties> {
        self.shared
            .state()
            .queues
            .get(queue)
            .map(|queue| {
                queue
                    .messages
                    .iter()
                    .map(|m| m.properties.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn subscribers(&self, queue: &str) -> usize {
        self.shared
            .state()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.subscribers.len())
    }

    pub fn confirm_waits(&self) -> usize {
        self.shared.state().confirm_waits
    }

    /// The most confirm waits seen running at the same time.
    pub fn max_concurrent_confirm_waits(&self) -> usize {
        self.shared.state().max_confirms_in_flight
    }

    /// Make every confirm wait take `delay`.
    pub fn set_confirm_delay(&self, delay: Duration) {
        self.shared.state().confirm_delay = Some(delay);
    }

    /// While set, the broker nacks (and drops) messages published on confirming channels.
    pub fn nack_publishes(&self, enabled: bool) {
        self.shared.state().nack_publishes = enabled;
    }

    pub fn prefetch_requests(&self) -> Vec<u16> {
        self.shared.state().prefetch.clone()
    }
}

#[async_trait]
impl Transport for Loopback {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, TransportError> {
        let mut state = self.shared.state();
        if state.refuse_connections {
            return Err(TransportError::Other(anyhow::anyhow!(
                "Connection refused (os error 111)"
            )));
        }
        state.connections_opened += 1;
        let signals = Arc::new(SignalHub::new());
        state.connections.push(Arc::clone(&signals));
        Ok(Arc::new(LoopbackConnection {
            shared: Arc::clone(&self.shared),
            signals,
            next_channel: AtomicU16::new(1),
        }))
    }
}

struct LoopbackConnection {
    shared: Arc<Shared>,
    signals: Arc<SignalHub>,
    next_channel: AtomicU16,
}

impl LoopbackConnection {
    fn open_channel(&self, confirming: bool) -> Result<Arc<dyn AmqpChannel>, TransportError> {
        if self.signals.is_closed() {
            return Err(TransportError::Closed("connection"));
        }
        let key = self.shared.next_channel.fetch_add(1, Ordering::SeqCst);
        let id = self.next_channel.fetch_add(1, Ordering::SeqCst);
        let signals = Arc::new(SignalHub::new());

        let shared = Arc::clone(&self.shared);
        let hub = Arc::clone(&signals);
        let connection_listener = self.signals.add(Arc::new(move |signal| {
            if matches!(signal, TransportSignal::Closed) {
                shared.state().release_channel(key);
                hub.close();
            }
        }));
        self.shared.state().channels.push(OpenChannel {
            key,
            id,
            signals: Arc::clone(&signals),
        });
        Ok(Arc::new(LoopbackChannel {
            key,
            id,
            confirming,
            nacked: AtomicUsize::new(0),
            shared: Arc::clone(&self.shared),
            signals,
            connection_signals: Arc::clone(&self.signals),
            connection_listener,
        }))
    }
}

#[async_trait]
impl AmqpConnection for LoopbackConnection {
    fn is_open(&self) -> bool {
        !self.signals.is_closed()
    }

    fn add_listener(&self, listener: SignalListener) -> ListenerId {
        self.signals.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.signals.remove(id)
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, TransportError> {
        self.open_channel(false)
    }

    async fn create_confirm_channel(&self) -> Result<Arc<dyn AmqpChannel>, TransportError> {
        self.open_channel(true)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared
            .state()
            .connections
            .retain(|hub| !Arc::ptr_eq(hub, &self.signals));
        self.signals.close();
        Ok(())
    }
}

struct LoopbackChannel {
    key: u64,
    id: ChannelId,
    confirming: bool,
    // Nacks owed to the next confirm wait.
    nacked: AtomicUsize,
    shared: Arc<Shared>,
    signals: Arc<SignalHub>,
    connection_signals: Arc<SignalHub>,
    connection_listener: ListenerId,
}

impl LoopbackChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.signals.is_closed() {
            Err(TransportError::Closed("channel"))
        } else {
            Ok(())
        }
    }

    /// Fail the current operation and close the channel, as the broker does on channel errors.
    fn channel_error(&self, reason: String) -> TransportError {
        self.shared.state().release_channel(self.key);
        self.signals
            .emit(&TransportSignal::Error(Arc::new(TransportError::Other(
                anyhow::anyhow!(reason.clone()),
            ))));
        self.signals.close();
        TransportError::Other(anyhow::anyhow!(reason))
    }
}

impl Drop for LoopbackChannel {
    fn drop(&mut self) {
        self.connection_signals.remove(self.connection_listener);
    }
}

#[async_trait]
impl AmqpChannel for LoopbackChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn is_open(&self) -> bool {
        !self.signals.is_closed()
    }

    fn is_confirming(&self) -> bool {
        self.confirming
    }

    fn add_listener(&self, listener: SignalListener) -> ListenerId {
        self.signals.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.signals.remove(id)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        _options: BasicPublishOptions,
        properties: BasicProperties,
    ) -> Result<WriteStatus, TransportError> {
        self.ensure_open()?;
        let mut state = self.shared.state();
        if self.confirming && state.nack_publishes {
            self.nacked.fetch_add(1, Ordering::SeqCst);
            return Ok(WriteStatus::Written);
        }
        let Some(queues) = state.route(exchange, routing_key, 0) else {
            drop(state);
            return Err(self.channel_error(format!("NOT_FOUND - no exchange '{exchange}'")));
        };
        for queue_name in queues {
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                queue.messages.push_back(Stored {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    properties: properties.clone(),
                    data: payload.to_vec(),
                    redelivered: false,
                });
            }
            state.dispatch(&queue_name);
        }
        Ok(if state.backpressure {
            WriteStatus::BufferFull
        } else {
            WriteStatus::Written
        })
    }

    async fn wait_for_confirms(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        let delay = {
            let mut state = self.shared.state();
            state.confirm_waits += 1;
            state.confirms_in_flight += 1;
            state.max_confirms_in_flight =
                state.max_confirms_in_flight.max(state.confirms_in_flight);
            state.confirm_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.shared.state().confirms_in_flight -= 1;
        match self.nacked.swap(0, Ordering::SeqCst) {
            0 => Ok(()),
            nacked => Err(TransportError::NegativeAck(nacked)),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        _arguments: FieldTable,
    ) -> Result<DeliveryStream, TransportError> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.shared.state();
        if !state.queues.contains_key(queue) {
            drop(state);
            return Err(self.channel_error(format!("NOT_FOUND - no queue '{queue}'")));
        }
        state
            .queues
            .entry(queue.to_owned())
            .or_default()
            .subscribers
            .push(Subscriber {
                consumer_tag: consumer_tag.to_owned(),
                channel: self.key,
                no_ack: options.no_ack,
                sender,
            });
        state.dispatch(queue);
        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        for queue in self.shared.state().queues.values_mut() {
            queue.subscribers.retain(|subscriber| {
                subscriber.channel != self.key || subscriber.consumer_tag != consumer_tag
            });
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.shared.state();
        state.acks.push(Ack::Ack {
            tag: delivery_tag,
            multiple,
        });
        state.unacked.remove(&(self.key, delivery_tag));
        Ok(())
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.shared.state();
        state.acks.push(Ack::Nack {
            tag: delivery_tag,
            multiple,
            requeue,
        });
        if requeue {
            state.requeue(self.key, delivery_tag);
        } else {
            state.unacked.remove(&(self.key, delivery_tag));
        }
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.shared.state();
        state.acks.push(Ack::Reject {
            tag: delivery_tag,
            requeue,
        });
        if requeue {
            state.requeue(self.key, delivery_tag);
        } else {
            state.unacked.remove(&(self.key, delivery_tag));
        }
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.shared.state().prefetch.push(count);
        Ok(())
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<QueueInfo, TransportError> {
        self.ensure_open()?;
        let mut state = self.shared.state();
        let name = if queue.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4())
        } else {
            queue.to_owned()
        };
        if options.passive && !state.queues.contains_key(&name) {
            drop(state);
            return Err(self.channel_error(format!("NOT_FOUND - no queue '{name}'")));
        }
        let entry = state.queues.entry(name.clone()).or_default();
        Ok(QueueInfo {
            message_count: entry.messages.len() as u32,
            consumer_count: entry.subscribers.len() as u32,
            name,
        })
    }

    async fn queue_delete(
        &self,
        queue: &str,
        _options: QueueDeleteOptions,
    ) -> Result<u32, TransportError> {
        self.ensure_open()?;
        let mut state = self.shared.state();
        let Some(deleted) = state.queues.remove(queue) else {
            return Ok(0);
        };
        for subscriber in deleted.subscribers {
            let _ = subscriber.sender.send(Ok(DeliverySignal::Cancelled));
        }
        for exchange in state.exchanges.values_mut() {
            exchange
                .bindings
                .retain(|(_, target)| !matches!(target, Target::Queue(name) if name == queue));
        }
        Ok(deleted.messages.len() as u32)
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32, TransportError> {
        self.ensure_open()?;
        let mut state = self.shared.state();
        let purged = state
            .queues
            .get_mut(queue)
            .map_or(0, |queue| std::mem::take(&mut queue.messages).len());
        Ok(purged as u32)
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _arguments: FieldTable,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.shared.state();
        if state.queues.contains_key(queue) {
            if let Some(entry) = state.exchanges.get_mut(exchange) {
                entry
                    .bindings
                    .push((routing_key.to_owned(), Target::Queue(queue.to_owned())));
                return Ok(());
            }
        }
        drop(state);
        Err(self.channel_error(format!(
            "NOT_FOUND - no queue '{queue}' or exchange '{exchange}'"
        )))
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _arguments: FieldTable,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if let Some(entry) = self.shared.state().exchanges.get_mut(exchange) {
            entry.bindings.retain(|(key, target)| {
                !(key == routing_key && matches!(target, Target::Queue(name) if name == queue))
            });
        }
        Ok(())
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.shared.state();
        if options.passive {
            if state.exchanges.contains_key(exchange) {
                return Ok(());
            }
            drop(state);
            return Err(self.channel_error(format!("NOT_FOUND - no exchange '{exchange}'")));
        }
        state
            .exchanges
            .entry(exchange.to_owned())
            .or_insert_with(|| Exchange {
                kind,
                bindings: Vec::new(),
            });
        Ok(())
    }

    async fn exchange_delete(
        &self,
        exchange: &str,
        _options: ExchangeDeleteOptions,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.shared.state().exchanges.remove(exchange);
        Ok(())
    }

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        _arguments: FieldTable,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.shared.state();
        if state.exchanges.contains_key(destination) {
            if let Some(entry) = state.exchanges.get_mut(source) {
                entry
                    .bindings
                    .push((routing_key.to_owned(), Target::Exchange(destination.to_owned())));
                return Ok(());
            }
        }
        drop(state);
        Err(self.channel_error(format!(
            "NOT_FOUND - no exchange '{source}' or '{destination}'"
        )))
    }

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        _arguments: FieldTable,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if let Some(entry) = self.shared.state().exchanges.get_mut(source) {
            entry.bindings.retain(|(key, target)| {
                !(key == routing_key
                    && matches!(target, Target::Exchange(name) if name == destination))
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.state().release_channel(self.key);
        self.signals.close();
        Ok(())
    }
}
