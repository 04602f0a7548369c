use crate::amqp::configuration::{ConnectTarget, RabbitMqSettings, DEFAULT_CONNECT_TIMEOUT};
use crate::transport::{AmqpConnection, RabbitMqConnection, Transport, TransportError};
use lapin::tcp::{AMQPUriTcpExt, NativeTlsConnector};
use lapin::types::FieldTable;
use lapin::uri::{AMQPScheme, AMQPUri};
use lapin::{Connection, ConnectionProperties};
use std::sync::Arc;
use std::time::Duration;

/// The [`Transport`] that dials a real broker through [`lapin`].
///
/// Cheap to clone; every [`connect`](Transport::connect) opens a new TCP connection.
#[derive(Clone)]
pub struct ConnectionFactory {
    uri: AMQPUri,
    timeout: Duration,
    tls: Option<Arc<TlsParams>>,
    client_properties: FieldTable,
}

struct TlsParams {
    connector: NativeTlsConnector,
    domain: String,
}

impl ConnectionFactory {
    pub fn new(target: &ConnectTarget) -> Result<Self, anyhow::Error> {
        if let ConnectTarget::Settings(settings) = target {
            return Self::new_from_config(settings);
        }
        Ok(Self::plain(target.amqp_uri()?, DEFAULT_CONNECT_TIMEOUT))
    }

    /// Honors the timeout and TLS options carried by `settings`.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let uri = settings.amqp_uri();
        let timeout = settings
            .connection_timeout()
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let mut factory = Self::plain(uri, timeout);
        if let Some(tls) = &settings.tls {
            let (connector, domain) = tls.connector(&factory.uri.authority.host)?;
            factory.set_tls_connector_with_domain(connector, domain);
        }
        Ok(factory)
    }

    fn plain(uri: AMQPUri, timeout: Duration) -> Self {
        Self {
            uri,
            timeout,
            tls: None,
            client_properties: FieldTable::default(),
        }
    }

    /// Verify the server certificate against the broker host.
    pub fn set_tls_connector(&mut self, connector: NativeTlsConnector) {
        let host = self.uri.authority.host.clone();
        self.set_tls_connector_with_domain(connector, host);
    }

    pub fn set_tls_connector_with_domain(&mut self, connector: NativeTlsConnector, domain: String) {
        self.tls = Some(Arc::new(TlsParams { connector, domain }));
    }

    /// Sent to the broker in the connection handshake.
    #[must_use]
    pub fn with_client_properties(mut self, client_properties: FieldTable) -> Self {
        self.client_properties = client_properties;
        self
    }

    #[must_use]
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Dial the broker, giving up after the configured timeout.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self), fields(host = %self.uri.authority.host))]
    pub async fn new_connection(&self) -> Result<Connection, TransportError> {
        let mut properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        properties.client_properties = self.client_properties.clone();

        let dial = async {
            let Some(tls) = self.tls.clone() else {
                return Connection::connect_uri(self.uri.clone(), properties).await;
            };
            // TCP under the plain scheme, then the handshake with our own connector.
            let tls_dialer = move |uri: &AMQPUri| {
                let mut tcp_uri = uri.clone();
                tcp_uri.scheme = AMQPScheme::AMQP;
                tcp_uri
                    .connect()
                    .and_then(|stream| stream.into_native_tls(&tls.connector, &tls.domain))
            };
            Connection::connector(self.uri.clone(), Box::new(tls_dialer), properties).await
        };

        match tokio::time::timeout(self.timeout, dial).await {
            Ok(connected) => Ok(connected?),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

#[async_trait::async_trait]
impl Transport for ConnectionFactory {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, TransportError> {
        let connection = self.new_connection().await?;
        Ok(Arc::new(RabbitMqConnection::new(connection)))
    }
}
