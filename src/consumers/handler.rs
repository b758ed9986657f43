//! The `Handler` trait is heavily inspired by `tide`'s approach to endpoint handlers.
use crate::{consumers::Incoming, error::HandlerError};
use std::sync::Arc;

/// What to tell the broker about a message that was processed without errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerAction {
    /// Acknowledge the message: the broker forgets about it.
    Ack,
    /// Negatively acknowledge the message, asking the broker to deliver it again.
    Requeue,
    /// Negatively acknowledge the message without requeueing it.
    /// The broker drops it, or routes it to a dead letter exchange if the queue has one.
    Reject,
}

/// Implementers of the `Handler` trait process the messages retrieved from a queue.
///
/// Handlers are registered by name in a [`HandlerRegistry`](crate::consumers::HandlerRegistry)
/// and bound to queues via [`QueueBinding`](crate::settings::QueueBinding)s.
///
/// # Scope
///
/// `handle` does not get access to the underlying broker session.
/// The framework takes care of acking/nacking the message with the broker according to the
/// outcome of processing:
///
/// - `Ok(action)` is forwarded to the broker as is;
/// - `Err(_)` requeues the message.
///
/// A panic in `handle` is caught and treated as an `Err`: it never takes the consumer down.
///
/// # Concurrency
///
/// The same handler instance is shared by all the consumers bound to it, which run
/// concurrently.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, incoming: &Incoming) -> Result<BrokerAction, HandlerError>;
}

#[async_trait::async_trait]
impl<H> Handler for Arc<H>
where
    H: Handler + ?Sized,
{
    async fn handle(&self, incoming: &Incoming) -> Result<BrokerAction, HandlerError> {
        H::handle(self, incoming).await
    }
}

#[async_trait::async_trait]
impl<H> Handler for Box<H>
where
    H: Handler + ?Sized,
{
    async fn handle(&self, incoming: &Incoming) -> Result<BrokerAction, HandlerError> {
        H::handle(self, incoming).await
    }
}
