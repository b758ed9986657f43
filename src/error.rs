//! The failure taxonomy of the consumer manager.
//!
//! Each error type maps to the smallest scope that can absorb it:
//!
//! - [`HandlerError`]: a single delivery, which gets requeued;
//! - [`ProtocolError`]: a single consumer session, which gets recycled;
//! - [`ConnectionError`]: the broker connection, which gets re-established;
//! - [`ConfigurationError`]: a single queue binding, which gets skipped.
use std::time::Duration;

/// A queue binding cannot be turned into running consumers.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("No handler named `{handler}` is registered (required by queue `{queue}`)")]
    UnknownHandler { queue: String, handler: String },
    #[error("The concurrency of queue `{queue}` must be at least 1")]
    ZeroConcurrency { queue: String },
    #[error("A queue binding for handler `{handler}` has an empty queue name")]
    EmptyQueueName { handler: String },
    #[error("The prefetch count of queue `{queue}` must be at least 1")]
    ZeroPrefetch { queue: String },
}

/// Failed to establish (or keep) a connection with the message broker.
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to connect to the message broker")]
    Connect(#[source] anyhow::Error),
    #[error("Timed out after {0:?} while connecting to the message broker")]
    Timeout(Duration),
    #[error("The message broker refused the connection: {0}")]
    Refused(String),
    #[error("Gave up connecting to the message broker after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last_error: Box<ConnectionError>,
    },
}

impl From<lapin::Error> for ConnectionError {
    fn from(e: lapin::Error) -> Self {
        Self::Connect(e.into())
    }
}

/// A channel-level failure reported by the broker.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The queue exists with properties that do not match the declaration.
    #[error("Queue `{queue}` was declared with conflicting properties: {reason}")]
    PreconditionFailed { queue: String, reason: String },
    /// The session (or the connection underneath it) is gone.
    #[error("The session with the message broker is closed")]
    SessionClosed,
    /// The delivery tag is not known to the broker - e.g. it was already settled.
    #[error("Unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),
    #[error("{0}")]
    Other(String),
}

impl From<lapin::Error> for ProtocolError {
    fn from(e: lapin::Error) -> Self {
        match e {
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
                Self::SessionClosed
            }
            e => Self::Other(e.to_string()),
        }
    }
}

/// The error type returned by message handlers.
///
/// Whatever the variant, the consumer negatively acknowledges the delivery asking the broker
/// to requeue it.
#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    /// The handler reported a processing failure.
    #[error("Handling of a message failed")]
    Failed(#[source] anyhow::Error),
    /// The handler panicked while processing the message.
    #[error("Handling of a message panicked: {0}")]
    Panicked(String),
    /// The handler did not complete within the configured timeout.
    #[error("Handling of a message timed out after {0:?}")]
    TimedOut(Duration),
}

impl From<anyhow::Error> for HandlerError {
    fn from(e: anyhow::Error) -> Self {
        Self::Failed(e)
    }
}
