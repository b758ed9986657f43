use crate::{
    amqp::{configuration::RabbitMqSettings, session::AmqpSession},
    error::{ConnectionError, ProtocolError},
    transport::{Broker, BrokerConnection, CloseNotifier, CloseReason, CloseSignal, Session},
};
use anyhow::Context;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::warn;

const DEFAULT_CONNECTION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Clone)]
/// All the information required to connect to a RabbitMq broker.
///
/// `ConnectionFactory` is the [`Broker`] to hand over to a [`Manager`](crate::Manager) in
/// production.
pub struct ConnectionFactory {
    uri: AMQPUri,
    /// The timeout observed when trying to connect to RabbitMq.
    connection_timeout: std::time::Duration,
    /// TLS configuration for the connection to RabbitMq.
    /// If `None`, the connection will not be encrypted.
    tls: Option<Arc<Tls>>,
}

struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// If the connection timeout is left unspecified, it will be defaulted to 10 seconds.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let tls = settings
            .tls
            .as_ref()
            .map::<Result<Tls, anyhow::Error>, _>(|tls_settings| {
                let domain_name = tls_settings
                    .domain
                    .clone()
                    .unwrap_or_else(|| settings.host.clone());

                let mut connector_builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls_settings.ca_certificate_chain()? {
                    connector_builder.add_root_certificate(certificate);
                }
                let connector = connector_builder
                    .build()
                    .context("Failed to build the TLS connector for RabbitMQ.")?;
                Ok(Tls {
                    connector,
                    domain_name,
                })
            })
            .transpose()?;
        Ok(Self {
            uri: settings.amqp_uri(),
            connection_timeout: settings
                .connection_timeout()
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
            tls: tls.map(Arc::new),
        })
    }

    /// Create a new connection to a RabbitMq broker.
    ///
    /// It establishes an encrypted connection if `self.tls` is `Some`.
    /// It establishes an unencrypted connection if `self.tls` is `None`.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self), fields(host = %self.uri.authority.host))]
    pub async fn new_connection(&self) -> Result<lapin::Connection, ConnectionError> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let connection = timeout(self.connection_timeout, async {
            match &self.tls {
                None => self.connect_without_tls(properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        })
        .await
        .map_err(|_| ConnectionError::Timeout(self.connection_timeout))??;
        Ok(connection)
    }

    /// Establish a new unencrypted connection to a RabbitMq broker.
    async fn connect_without_tls(
        &self,
        properties: ConnectionProperties,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connect_uri(self.uri.clone(), properties).await
    }

    /// Establish a new TLS connection to a RabbitMq broker.
    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls_configuration: Arc<Tls>,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // First establish a plain TCP connection using the AMQP protocol
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri
                    .connect()
                    // Then perform a TLS handshake with custom settings
                    // including customisation of the expected domain for the server certificate
                    .and_then(|tcp| {
                        tcp.into_native_tls(
                            &tls_configuration.connector,
                            &tls_configuration.domain_name,
                        )
                    })
            }),
            properties,
        )
        .await
    }
}

#[async_trait::async_trait]
impl Broker for ConnectionFactory {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, ConnectionError> {
        let connection = self.new_connection().await?;
        let notifier = Arc::new(CloseNotifier::new());
        {
            let notifier = notifier.clone();
            // lapin reports both network failures and broker-initiated closures here.
            connection.on_error(move |e| {
                warn!("RabbitMQ broken connection: {:?}", e);
                notifier.notify(CloseReason::Failure(e.to_string()));
            });
        }
        // The connection may have failed before `on_error` was registered.
        notify_if_disconnected(connection.status().connected(), &notifier);
        Ok(Arc::new(AmqpConnection {
            inner: connection,
            notifier,
        }))
    }
}

fn notify_if_disconnected(connected: bool, notifier: &CloseNotifier) {
    if !connected && notifier.notify(CloseReason::Failure("connection lost during setup".into())) {
        warn!("RabbitMQ connection dropped before it could be monitored");
    }
}

/// A [`lapin::Connection`] paired with its close notification.
struct AmqpConnection {
    inner: lapin::Connection,
    notifier: Arc<CloseNotifier>,
}

#[async_trait::async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_session(&self) -> Result<Box<dyn Session>, ProtocolError> {
        let channel = self.inner.create_channel().await?;
        Ok(Box::new(AmqpSession::new(channel)))
    }

    fn close_signal(&self) -> CloseSignal {
        self.notifier.signal()
    }

    fn is_open(&self) -> bool {
        !self.notifier.is_closed() && self.inner.status().connected()
    }

    async fn close(&self) {
        if self.inner.status().connected() {
            if let Err(e) = self.inner.close(200, "Consumer manager shutting down").await {
                warn!(error = %e, "Failed to close the RabbitMQ connection cleanly");
            }
        }
        self.notifier.notify(CloseReason::Graceful);
    }
}
