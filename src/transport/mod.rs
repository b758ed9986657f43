//! The seam between the consumer manager and the message broker.
//!
//! The manager never talks to a broker directly: it goes through the traits in this module.
//!
//! - a [`Broker`] knows how to open a [`BrokerConnection`];
//! - a [`BrokerConnection`] hands out independent [`Session`]s and notifies its closure;
//! - a [`Session`] declares queues, sets a prefetch window and streams [`Delivery`]s.
//!
//! [`ConnectionFactory`](crate::amqp::ConnectionFactory) implements [`Broker`] for RabbitMq,
//! [`InMemoryBroker`](in_memory::InMemoryBroker) implements it in-process.
use crate::error::{ConnectionError, ProtocolError};
use futures_util::stream::BoxStream;
use std::{fmt, sync::Arc};
use tokio::sync::watch;

pub mod in_memory;

/// A stream of deliveries pushed by the broker for a single consumer.
///
/// The stream terminates when the consumer is cancelled or the session dies.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, ProtocolError>>;

/// Something we can open connections to.
#[async_trait::async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Open a new connection.
    ///
    /// Whether the error is transient (e.g. network) or not (e.g. bad credentials), the
    /// caller decides whether to try again.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, ConnectionError>;
}

/// A single logical link to the broker.
///
/// It is shared, read-only, by all consumers: each of them derives its own [`Session`].
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// Open a new session (an AMQP channel) on top of this connection.
    async fn open_session(&self) -> Result<Box<dyn Session>, ProtocolError>;

    /// A notification that resolves once, when this connection terminates.
    fn close_signal(&self) -> CloseSignal;

    /// `false` once the connection has terminated, for whatever reason.
    fn is_open(&self) -> bool;

    /// Close the connection. Closing a closed connection is a no-op.
    async fn close(&self);
}

/// A session multiplexed over a [`BrokerConnection`].
#[async_trait::async_trait]
pub trait Session: Send + Sync {
    /// Declare a durable, non-exclusive, non-auto-delete queue.
    ///
    /// Declaring an existing queue with the same properties is a no-op.
    async fn declare_queue(&self, queue_name: &str) -> Result<(), ProtocolError>;

    /// Bound the number of unacknowledged deliveries the broker pushes to this session.
    async fn set_prefetch(&self, prefetch_count: u16) -> Result<(), ProtocolError>;

    /// Start consuming from `queue_name`, with manual acknowledgements.
    async fn consume(
        &self,
        queue_name: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, ProtocolError>;

    /// Ask the broker to stop pushing deliveries to `consumer_tag`.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), ProtocolError>;

    /// Close the session.
    ///
    /// The broker requeues every delivery of this session that has not been settled yet.
    async fn close(&self);
}

/// Settles a delivery with the broker.
///
/// Transport implementations provide one per delivery. It is never exposed to handlers.
#[async_trait::async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), ProtocolError>;
    async fn nack(&self, requeue: bool) -> Result<(), ProtocolError>;
}

/// A message received from the broker, together with its acknowledgement handle.
///
/// Settling a delivery consumes it: a `Delivery` can be acked, requeued or rejected exactly once.
pub struct Delivery {
    /// The broker-assigned tag of the delivery.
    pub delivery_tag: u64,
    /// Whether this message was delivered before and then requeued.
    pub redelivered: bool,
    /// The payload of the message. Its interpretation belongs to the handler.
    pub body: Vec<u8>,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, redelivered: bool, body: Vec<u8>, acker: Box<dyn Acker>) -> Self {
        Self {
            delivery_tag,
            redelivered,
            body,
            acker,
        }
    }

    /// Acknowledge this delivery, and this delivery only.
    pub async fn ack(self) -> Result<(), ProtocolError> {
        self.acker.ack().await
    }

    /// Negatively acknowledge this delivery.
    /// If `requeue` is `false` the broker drops (or dead-letters) the message.
    pub async fn nack(self, requeue: bool) -> Result<(), ProtocolError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Why a connection terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// We closed it.
    Graceful,
    /// The broker or the network closed it for us.
    Failure(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graceful => write!(f, "closed gracefully"),
            Self::Failure(reason) => write!(f, "connection failure: {reason}"),
        }
    }
}

/// The sending half of a connection close notification.
///
/// Owned by transport implementations: call [`CloseNotifier::notify`] when the connection
/// terminates. Only the first notification is recorded.
#[derive(Debug)]
pub struct CloseNotifier {
    sender: watch::Sender<Option<CloseReason>>,
}

impl Default for CloseNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseNotifier {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self { sender }
    }

    /// Record the termination of the connection. Returns `false` if it had already been recorded.
    pub fn notify(&self, reason: CloseReason) -> bool {
        self.sender.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.sender.borrow().is_some()
    }

    pub fn signal(&self) -> CloseSignal {
        CloseSignal(self.sender.subscribe())
    }
}

/// A one-shot notification that a connection has terminated.
#[derive(Debug, Clone)]
pub struct CloseSignal(watch::Receiver<Option<CloseReason>>);

impl CloseSignal {
    /// Wait until the connection terminates.
    ///
    /// Resolves immediately if it already has.
    pub async fn closed(mut self) -> CloseReason {
        loop {
            if let Some(reason) = self.0.borrow_and_update().clone() {
                return reason;
            }
            if self.0.changed().await.is_err() {
                // The notifier went away together with the connection.
                return self
                    .0
                    .borrow()
                    .clone()
                    .unwrap_or_else(|| CloseReason::Failure("connection dropped".into()));
            }
        }
    }
}
