//! Queue and exchange management, always through the broker's normal channel.
use super::Broker;
use crate::transport::{QueueInfo, TransportError};
use lapin::{
    options::{ExchangeDeclareOptions, ExchangeDeleteOptions, QueueDeclareOptions, QueueDeleteOptions},
    types::FieldTable,
    ExchangeKind,
};

impl Broker {
    /// Declare `queue`. An empty name asks the broker to generate one, returned in the
    /// [`QueueInfo`].
    pub async fn assert_queue(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
    ) -> Result<QueueInfo, TransportError> {
        self.assert_queue_with_args(queue, options, FieldTable::default())
            .await
    }

    #[tracing::instrument(skip(self, options, arguments), fields(broker = self.id()))]
    pub async fn assert_queue_with_args(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, TransportError> {
        let channel = self.channel(false).await?;
        channel.raw().queue_declare(queue, options, arguments).await
    }

    /// Check that `queue` exists, without creating it.
    ///
    /// The broker closes the channel if the queue is missing.
    #[tracing::instrument(skip(self), fields(broker = self.id()))]
    pub async fn check_queue(&self, queue: &str) -> Result<QueueInfo, TransportError> {
        let channel = self.channel(false).await?;
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        channel
            .raw()
            .queue_declare(queue, options, FieldTable::default())
            .await
    }

    /// Delete `queue`, returning how many messages were dropped with it.
    #[tracing::instrument(skip(self, options), fields(broker = self.id()))]
    pub async fn delete_queue(
        &self,
        queue: &str,
        options: QueueDeleteOptions,
    ) -> Result<u32, TransportError> {
        let channel = self.channel(false).await?;
        channel.raw().queue_delete(queue, options).await
    }

    /// Drop every ready message of `queue`, returning how many there were.
    #[tracing::instrument(skip(self), fields(broker = self.id()))]
    pub async fn purge_queue(&self, queue: &str) -> Result<u32, TransportError> {
        let channel = self.channel(false).await?;
        channel.raw().queue_purge(queue).await
    }

    #[tracing::instrument(skip(self, arguments), fields(broker = self.id()))]
    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), TransportError> {
        let channel = self.channel(false).await?;
        channel
            .raw()
            .queue_bind(queue, exchange, routing_key, arguments)
            .await
    }

    #[tracing::instrument(skip(self, arguments), fields(broker = self.id()))]
    pub async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), TransportError> {
        let channel = self.channel(false).await?;
        channel
            .raw()
            .queue_unbind(queue, exchange, routing_key, arguments)
            .await
    }

    #[tracing::instrument(skip(self, options, arguments), fields(broker = self.id()))]
    pub async fn assert_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), TransportError> {
        let channel = self.channel(false).await?;
        channel
            .raw()
            .exchange_declare(exchange, kind, options, arguments)
            .await
    }

    /// Check that `exchange` exists, without creating it.
    ///
    /// The broker closes the channel if the exchange is missing.
    #[tracing::instrument(skip(self), fields(broker = self.id()))]
    pub async fn check_exchange(&self, exchange: &str) -> Result<(), TransportError> {
        let channel = self.channel(false).await?;
        let options = ExchangeDeclareOptions {
            passive: true,
            ..ExchangeDeclareOptions::default()
        };
        channel
            .raw()
            .exchange_declare(exchange, ExchangeKind::Direct, options, FieldTable::default())
            .await
    }

    #[tracing::instrument(skip(self, options), fields(broker = self.id()))]
    pub async fn delete_exchange(
        &self,
        exchange: &str,
        options: ExchangeDeleteOptions,
    ) -> Result<(), TransportError> {
        let channel = self.channel(false).await?;
        channel.raw().exchange_delete(exchange, options).await
    }

    /// Route messages from `source` to `destination`.
    #[tracing::instrument(skip(self, arguments), fields(broker = self.id()))]
    pub async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), TransportError> {
        let channel = self.channel(false).await?;
        channel
            .raw()
            .exchange_bind(destination, source, routing_key, arguments)
            .await
    }

    #[tracing::instrument(skip(self, arguments), fields(broker = self.id()))]
    pub async fn unbind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), TransportError> {
        let channel = self.channel(false).await?;
        channel
            .raw()
            .exchange_unbind(destination, source, routing_key, arguments)
            .await
    }

    /// Limit the unacknowledged deliveries on the normal channel.
    #[tracing::instrument(skip(self), fields(broker = self.id()))]
    pub async fn prefetch(&self, count: u16) -> Result<(), TransportError> {
        let channel = self.channel(false).await?;
        channel.raw().prefetch(count).await
    }
}
