//! Owns the connection with the broker and drives its re-establishment.
use crate::{
    error::ConnectionError,
    settings::ReconnectPolicy,
    transport::{Broker, BrokerConnection, CloseSignal},
};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;

/// Holds at most one open connection at a time.
pub struct Supervisor {
    broker: Arc<dyn Broker>,
    policy: ReconnectPolicy,
    connection: Option<Arc<dyn BrokerConnection>>,
}

impl Supervisor {
    pub fn new(broker: Arc<dyn Broker>, policy: ReconnectPolicy) -> Self {
        Self {
            broker,
            policy,
            connection: None,
        }
    }

    /// Open a new connection, closing the current one (if any) first.
    #[tracing::instrument(skip_all, name = "broker_connect")]
    pub async fn connect(&mut self) -> Result<Arc<dyn BrokerConnection>, ConnectionError> {
        self.close().await;
        let connection = self.broker.connect().await?;
        tracing::info!("Connected to the message broker");
        self.connection = Some(connection.clone());
        Ok(connection)
    }

    /// Connect, retrying according to the reconnect policy.
    ///
    /// Returns `Ok(None)` if `stop` fires while waiting between two attempts.
    pub async fn connect_with_retry(
        &mut self,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<Option<Arc<dyn BrokerConnection>>, ConnectionError> {
        let mut failed_attempts = 0u32;
        loop {
            if *stop.borrow() {
                return Ok(None);
            }
            let error = match self.connect().await {
                Ok(connection) => return Ok(Some(connection)),
                Err(e) => e,
            };
            failed_attempts += 1;

            if let Some(max_retries) = self.policy.max_retries() {
                if failed_attempts >= max_retries {
                    return Err(ConnectionError::RetriesExhausted {
                        attempts: failed_attempts,
                        last_error: Box::new(error),
                    });
                }
            }
            let delay = self.policy.delay(failed_attempts);
            tracing::warn!(
                failed_attempts,
                error.message = %error,
                error.details = ?error,
                "Failed to connect to the message broker, retrying in {:?}",
                delay
            );
            if !wait_or_stop(delay, stop).await {
                return Ok(None);
            }
        }
    }

    /// A notification that resolves when the current connection terminates.
    ///
    /// `None` if there is no connection. Each connection has its own signal: after a
    /// reconnect, a new one must be obtained.
    pub fn watch_close(&self) -> Option<CloseSignal> {
        self.connection.as_ref().map(|c| c.close_signal())
    }

    pub fn connection(&self) -> Option<&Arc<dyn BrokerConnection>> {
        self.connection.as_ref()
    }

    /// Close the current connection, if any. Calling it again is a no-op.
    pub async fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
    }
}

/// Sleep for `delay`, unless `stop` fires first.
///
/// Returns `false` if we were asked to stop.
pub(crate) async fn wait_or_stop(delay: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    if *stop.borrow() {
        return false;
    }
    tokio::select! {
        biased;
        _ = stop.changed() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
