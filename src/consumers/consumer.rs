use crate::{
    consumers::{BrokerAction, Handler, Incoming},
    error::{HandlerError, ProtocolError},
    transport::{BrokerConnection, Delivery, Session},
};
use futures_util::StreamExt;
use std::{any::Any, sync::Arc, time::Duration};
use tokio::sync::watch;
use uuid::Uuid;

/// After this many consecutive session failures we escalate from `warn` to `error`.
const SESSION_FAILURES_BEFORE_ESCALATION: u32 = 3;

/// A single consumer instance: one session, one queue, one message at a time.
///
/// [`ConsumerPool`](crate::pool::ConsumerPool) runs `concurrency` of them for each queue
/// binding. Users of the crate are never exposed to `Consumer` directly.
pub(crate) struct Consumer {
    /// The name of the queue we will be consuming messages from.
    pub(crate) queue_name: String,
    /// The name `handler` is registered with. Only used for diagnostics.
    pub(crate) handler_name: String,
    /// Distinguishes instances bound to the same queue in logs.
    pub(crate) instance: usize,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) prefetch_count: u16,
    /// Abort the handler (and requeue the message) if it runs for longer than this.
    pub(crate) handler_timeout: Option<Duration>,
    /// How long to wait before opening a new session after the current one failed.
    pub(crate) recycle_interval: Duration,
}

/// Why a session stopped serving deliveries.
enum SessionEnd {
    /// We were asked to stop.
    Stopped,
    /// The broker stopped pushing deliveries (cancellation, session or connection closure).
    Closed,
    Failed(ProtocolError),
}

impl Consumer {
    /// Consume from the queue until `stop` flips to `true` or `connection` terminates.
    ///
    /// A session that fails while the connection is still open (e.g. the queue was deleted or
    /// declared with different properties) is replaced by a new one after `recycle_interval`.
    #[tracing::instrument(
        skip_all,
        name = "consumer_run",
        fields(queue_name = %self.queue_name, handler = %self.handler_name, instance = self.instance)
    )]
    pub(crate) async fn run(
        self,
        connection: Arc<dyn BrokerConnection>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut consecutive_failures = 0u32;
        loop {
            if *stop.borrow() {
                return;
            }
            let end = match connection.open_session().await {
                Ok(session) => {
                    let end = self.serve(connection.as_ref(), session.as_ref(), &mut stop).await;
                    session.close().await;
                    end
                }
                Err(e) => SessionEnd::Failed(e),
            };

            let error = match end {
                SessionEnd::Stopped => {
                    tracing::debug!("Consumer stopped");
                    return;
                }
                _ if !connection.is_open() => {
                    tracing::debug!("Connection lost, consumer exiting");
                    return;
                }
                SessionEnd::Closed => "the broker stopped pushing deliveries".to_string(),
                SessionEnd::Failed(e) => e.to_string(),
            };

            consecutive_failures += 1;
            if consecutive_failures >= SESSION_FAILURES_BEFORE_ESCALATION {
                tracing::error!(
                    consecutive_failures,
                    "Consumer session failed repeatedly: {}. Opening a new one in {:?}",
                    error,
                    self.recycle_interval
                );
            } else {
                tracing::warn!(
                    "Consumer session failed: {}. Opening a new one in {:?}",
                    error,
                    self.recycle_interval
                );
            }

            tokio::select! {
                biased;
                _ = stop.changed() => return,
                _ = tokio::time::sleep(self.recycle_interval) => {}
            }
        }
    }

    /// Set up `session` and process its deliveries until it ends.
    ///
    /// Deliveries still buffered once `connection` is gone are dropped unprocessed: the broker
    /// has already put them back in the queue.
    async fn serve(
        &self,
        connection: &dyn BrokerConnection,
        session: &dyn Session,
        stop: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        if let Err(e) = session.declare_queue(&self.queue_name).await {
            return SessionEnd::Failed(e);
        }
        if let Err(e) = session.set_prefetch(self.prefetch_count).await {
            return SessionEnd::Failed(e);
        }
        let consumer_tag = format!("{}-{}", self.queue_name, Uuid::new_v4());
        let mut deliveries = match session.consume(&self.queue_name, &consumer_tag).await {
            Ok(deliveries) => deliveries,
            Err(e) => return SessionEnd::Failed(e),
        };
        tracing::debug!(consumer_tag = %consumer_tag, "Consumer subscribed");

        loop {
            tokio::select! {
                // Prefer stopping over picking up more work.
                biased;

                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        // Deliveries still buffered in the stream are returned to the queue
                        // when the session is closed.
                        if let Err(e) = session.cancel(&consumer_tag).await {
                            tracing::debug!("Failed to cancel consumer {}: {}", consumer_tag, e);
                        }
                        return SessionEnd::Stopped;
                    }
                }

                delivery = deliveries.next() => {
                    match delivery {
                        None => return SessionEnd::Closed,
                        Some(Err(e)) => return SessionEnd::Failed(e),
                        Some(Ok(_)) if !connection.is_open() => return SessionEnd::Closed,
                        Some(Ok(delivery)) => self.process(delivery).await,
                    }
                }
            }
        }
    }

    /// Run the handler on a delivery and settle it according to the outcome.
    #[tracing::instrument(
        name = "process_message",
        skip_all,
        fields(delivery_tag = delivery.delivery_tag, redelivered = delivery.redelivered),
        level = tracing::Level::DEBUG
    )]
    async fn process(&self, mut delivery: Delivery) {
        let incoming = Incoming {
            body: std::mem::take(&mut delivery.body),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            queue_name: self.queue_name.clone(),
        };

        let settled = match self.invoke(incoming).await {
            Ok(BrokerAction::Ack) => delivery.ack().await,
            Ok(BrokerAction::Requeue) => delivery.nack(true).await,
            Ok(BrokerAction::Reject) => delivery.nack(false).await,
            Err(e) => {
                tracing::warn!(
                    error.message = %e,
                    error.details = ?e,
                    "Failed to process message, requeueing it"
                );
                delivery.nack(true).await
            }
        };
        if let Err(e) = settled {
            // The broker requeues the message on its own once the session goes away.
            tracing::warn!("Failed to settle delivery with the broker: {}", e);
        }
    }

    /// Run the handler in its own task.
    ///
    /// This isolates failures: a handler that panics (or hangs past its timeout) does not take
    /// the consumer down with it.
    async fn invoke(&self, incoming: Incoming) -> Result<BrokerAction, HandlerError> {
        let handler = self.handler.clone();
        let mut task = tokio::spawn(async move { handler.handle(&incoming).await });

        let joined = match self.handler_timeout {
            None => (&mut task).await,
            Some(timeout) => match tokio::time::timeout(timeout, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(HandlerError::TimedOut(timeout));
                }
            },
        };

        match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Err(HandlerError::Panicked(panic_message(e.into_panic()))),
            Err(e) => Err(HandlerError::Panicked(e.to_string())),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
