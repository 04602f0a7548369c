//! [`lapin`]-backed implementations of the driver traits.
use super::{
    AmqpChannel, AmqpConnection, ChannelId, Delivery, DeliverySignal, DeliveryStream, ListenerId,
    QueueInfo, SignalHub, SignalListener, TransportError, TransportSignal, WriteStatus,
};
use crate::lifecycle::lock;
use amq_protocol_types::DeliveryTag;
use futures_util::{future, stream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
        ExchangeBindOptions, ExchangeDeclareOptions, ExchangeDeleteOptions, ExchangeUnbindOptions,
        QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
    },
    publisher_confirm::{Confirmation, PublisherConfirm},
    types::FieldTable,
    BasicProperties, ExchangeKind,
};
use std::sync::{Arc, Mutex};
use tracing::warn;

// AMQP reply code for a normal shutdown.
const REPLY_SUCCESS: u16 = 200;

impl From<lapin::message::Delivery> for Delivery {
    fn from(value: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: value.delivery_tag,
            exchange: value.exchange,
            routing_key: value.routing_key,
            redelivered: value.redelivered,
            properties: value.properties,
            data: value.data,
        }
    }
}

/// [`AmqpConnection`] over a live lapin connection.
pub struct RabbitMqConnection {
    inner: lapin::Connection,
    signals: Arc<SignalHub>,
}

impl RabbitMqConnection {
    pub fn new(connection: lapin::Connection) -> Self {
        let signals = Arc::new(SignalHub::new());
        let hub = Arc::clone(&signals);
        connection.on_error(move |e| {
            warn!(error = ?e, "Broker connection failed");
            hub.emit(&TransportSignal::Error(Arc::new(e.into())));
            hub.close();
        });
        Self {
            inner: connection,
            signals,
        }
    }

    async fn open_channel(&self, confirming: bool) -> Result<Arc<dyn AmqpChannel>, TransportError> {
        let channel = self.inner.create_channel().await?;
        if confirming {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
        }
        Ok(Arc::new(RabbitMqChannel::new(
            channel,
            confirming,
            &self.signals,
        )))
    }
}

#[async_trait::async_trait]
impl AmqpConnection for RabbitMqConnection {
    fn is_open(&self) -> bool {
        !self.signals.is_closed() && self.inner.status().connected()
    }

    fn add_listener(&self, listener: SignalListener) -> ListenerId {
        self.signals.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.signals.remove(id)
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, TransportError> {
        self.open_channel(false).await
    }

    async fn create_confirm_channel(&self) -> Result<Arc<dyn AmqpChannel>, TransportError> {
        self.open_channel(true).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        let outcome = if self.inner.status().connected() {
            self.inner.close(REPLY_SUCCESS, "Bye").await
        } else {
            Ok(())
        };
        self.signals.close();
        Ok(outcome?)
    }
}

/// A RabbitMq channel.
///
/// `lapin` buffers outgoing frames internally, so [`AmqpChannel::publish`] always reports
/// [`WriteStatus::Written`].
pub struct RabbitMqChannel {
    inner: lapin::Channel,
    confirming: bool,
    // Confirms of the messages published since the last wait.
    pending: Mutex<Vec<PublisherConfirm>>,
    signals: Arc<SignalHub>,
    connection_signals: Arc<SignalHub>,
    connection_listener: ListenerId,
}

impl RabbitMqChannel {
    fn new(channel: lapin::Channel, confirming: bool, connection: &Arc<SignalHub>) -> Self {
        let signals = Arc::new(SignalHub::new());
        let hub = Arc::clone(&signals);
        let connection_listener = connection.add(Arc::new(move |signal| {
            if matches!(signal, TransportSignal::Closed) {
                hub.close();
            }
        }));
        Self {
            inner: channel,
            confirming,
            pending: Mutex::new(Vec::new()),
            signals,
            connection_signals: Arc::clone(connection),
            connection_listener,
        }
    }

    /// Surface a failed operation on a channel that the broker has since torn down.
    fn check<T>(&self, outcome: Result<T, lapin::Error>) -> Result<T, TransportError> {
        outcome.map_err(|e| {
            if !self.inner.status().connected() && !self.signals.is_closed() {
                warn!(channel = self.inner.id(), "RabbitMQ channel closed: {:?}", e);
                self.signals
                    .emit(&TransportSignal::Error(Arc::new(e.clone().into())));
                self.signals.close();
            }
            e.into()
        })
    }
}

impl Drop for RabbitMqChannel {
    fn drop(&mut self) {
        self.connection_signals.remove(self.connection_listener);
    }
}

#[async_trait::async_trait]
impl AmqpChannel for RabbitMqChannel {
    fn id(&self) -> ChannelId {
        self.inner.id()
    }

    fn is_open(&self) -> bool {
        !self.signals.is_closed() && self.inner.status().connected()
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
        options: BasicPublishOptions,
        properties: BasicProperties,
    ) -> Result<WriteStatus, TransportError> {
        let confirm = self.check(
            self.inner
                .basic_publish(exchange, routing_key, options, payload, properties)
                .await,
        )?;
        if self.confirming {
            lock(&self.pending).push(confirm);
        }
        Ok(WriteStatus::Written)
    }

    async fn wait_for_confirms(&self) -> Result<(), TransportError> {
        let pending = std::mem::take(&mut *lock(&self.pending));
        let (mut nacked, mut returned) = (0, 0);
        for confirmation in future::join_all(pending).await {
            match self.check(confirmation)? {
                Confirmation::Ack(None) | Confirmation::NotRequested => {}
                // Acked, but handed back as unroutable.
                Confirmation::Ack(Some(_)) => returned += 1,
                Confirmation::Nack(_) => nacked += 1,
            }
        }
        if nacked > 0 {
            warn!(channel = self.inner.id(), nacked, "The broker nacked published messages");
            return Err(TransportError::NegativeAck(nacked));
        }
        if returned > 0 {
            return Err(TransportError::Unconfirmed(returned));
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self.check(
            self.inner
                .basic_consume(queue, consumer_tag, options, arguments)
                .await,
        )?;
        let channel = self.inner.clone();
        // The consumer stream ends both on cancellation and on channel closure: only the
        // former is reported as a cancellation.
        let cancelled = stream::once(async move {
            channel
                .status()
                .connected()
                .then_some(Ok(DeliverySignal::Cancelled))
        })
        .filter_map(future::ready);
        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|delivery| DeliverySignal::Delivery(delivery.into()))
                    .map_err(TransportError::from)
            })
            .chain(cancelled)
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.check(
            self.inner
                .basic_cancel(consumer_tag, BasicCancelOptions::default())
                .await,
        )
    }

    async fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<(), TransportError> {
        self.check(
            self.inner
                .basic_ack(delivery_tag, BasicAckOptions { multiple })
                .await,
        )
    }

    async fn nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError> {
        self.check(
            self.inner
                .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
                .await,
        )
    }

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        self.check(
            self.inner
                .basic_reject(delivery_tag, BasicRejectOptions { requeue })
                .await,
        )
    }

    async fn prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.check(
            self.inner
                .basic_qos(count, BasicQosOptions::default())
                .await,
        )
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, TransportError> {
        let queue = self.check(self.inner.queue_declare(queue, options, arguments).await)?;
        Ok(QueueInfo {
            name: queue.name().as_str().to_owned(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn queue_delete(
        &self,
        queue: &str,
        options: QueueDeleteOptions,
    ) -> Result<u32, TransportError> {
        self.check(self.inner.queue_delete(queue, options).await)
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32, TransportError> {
        self.check(
            self.inner
                .queue_purge(queue, QueuePurgeOptions::default())
                .await,
        )
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), TransportError> {
        self.check(
            self.inner
                .queue_bind(
                    queue,
                    exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    arguments,
                )
                .await,
        )
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), TransportError> {
        self.check(
            self.inner
                .queue_unbind(queue, exchange, routing_key, arguments)
                .await,
        )
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), TransportError> {
        self.check(
            self.inner
                .exchange_declare(exchange, kind, options, arguments)
                .await,
        )
    }

    async fn exchange_delete(
        &self,
        exchange: &str,
        options: ExchangeDeleteOptions,
    ) -> Result<(), TransportError> {
        self.check(self.inner.exchange_delete(exchange, options).await)
    }

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), TransportError> {
        self.check(
            self.inner
                .exchange_bind(
                    destination,
                    source,
                    routing_key,
                    ExchangeBindOptions::default(),
                    arguments,
                )
                .await,
        )
    }

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), TransportError> {
        self.check(
            self.inner
                .exchange_unbind(
                    destination,
                    source,
                    routing_key,
                    ExchangeUnbindOptions::default(),
                    arguments,
                )
                .await,
        )
    }

    async fn close(&self) -> Result<(), TransportError> {
        let outcome = if self.inner.status().connected() {
            self.inner.close(REPLY_SUCCESS, "Bye").await
        } else {
            Ok(())
        };
        self.signals.close();
        Ok(outcome?)
    }
}
