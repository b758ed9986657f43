//! An in-process broker implementing the [`Broker`] family of traits.
//!
//! It models the parts of AMQP 0-9-1 the consumer manager relies on:
//!
//! - queues with declaration properties (conflicting re-declarations fail and close the session);
//! - per-consumer prefetch windows and round-robin dispatch between competing consumers;
//! - manual acknowledgements, with unknown/stale delivery tags rejected;
//! - deliveries that are not settled when their session closes go back to the queue, flagged
//!   as redelivered.
//!
//! On top of that it exposes a few knobs to inject faults (refused connections, dropped
//! connections) and to inspect what happened to each message.
use super::{
    Acker, Broker, BrokerConnection, CloseNotifier, CloseReason, CloseSignal, Delivery,
    DeliveryStream, Session,
};
use crate::error::{ConnectionError, ProtocolError};
use futures_util::StreamExt;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::mpsc;

/// The properties a queue is declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// What [`Session::declare_queue`] asks for.
    pub const DURABLE: Self = Self {
        durable: true,
        exclusive: false,
        auto_delete: false,
    };
}

/// How a delivery was settled by its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Requeued,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRecord {
    /// Stable across redeliveries of the same message.
    pub message_id: u64,
    /// Unique per delivery.
    pub delivery_tag: u64,
    pub settlement: Settlement,
}

/// A snapshot of the counters of a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub published: u64,
    pub delivered: u64,
    pub redelivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
    /// Deliveries handed back to the queue because their session closed before settling them.
    pub returned: u64,
    pub ready: usize,
    pub unacked: usize,
    pub consumers: usize,
}

/// An in-process message broker. Cloning it gives another handle to the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    connections: HashMap<u64, Arc<CloseNotifier>>,
    sessions: HashMap<u64, SessionEntry>,
    refuse_connections: usize,
    connection_attempts: u64,
    next_id: u64,
    next_delivery_tag: u64,
}

struct SessionEntry {
    connection_id: u64,
    prefetch: u16,
}

struct Queue {
    options: QueueOptions,
    ready: VecDeque<Message>,
    unacked: HashMap<u64, InFlight>,
    subscribers: Vec<Subscriber>,
    cursor: usize,
    stats: QueueStats,
    settlements: Vec<SettlementRecord>,
}

struct Message {
    id: u64,
    body: Vec<u8>,
    redelivered: bool,
}

struct InFlight {
    message: Message,
    session_id: u64,
    consumer_tag: String,
}

struct Subscriber {
    session_id: u64,
    consumer_tag: String,
    prefetch: u16,
    sender: mpsc::UnboundedSender<Result<Delivery, ProtocolError>>,
}

impl Queue {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            subscribers: Vec::new(),
            cursor: 0,
            stats: QueueStats::default(),
            settlements: Vec::new(),
        }
    }

    fn in_flight(&self, subscriber: &Subscriber) -> usize {
        self.unacked
            .values()
            .filter(|f| f.session_id == subscriber.session_id && f.consumer_tag == subscriber.consumer_tag)
            .count()
    }

    /// Index of the next subscriber, round-robin, with room in its prefetch window.
    fn next_subscriber(&self) -> Option<usize> {
        let n = self.subscribers.len();
        (0..n).map(|offset| (self.cursor + offset) % n).find(|&idx| {
            let subscriber = &self.subscribers[idx];
            subscriber.prefetch == 0 || self.in_flight(subscriber) < subscriber.prefetch as usize
        })
    }

    /// Put messages back at the head of the queue, lowest delivery tag first.
    fn requeue_front(&mut self, mut returned: Vec<(u64, Message)>) {
        returned.sort_by_key(|(tag, _)| *tag);
        for (_, mut message) in returned.into_iter().rev() {
            message.redelivered = true;
            self.ready.push_front(message);
        }
    }
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Push ready messages to subscribers until we run out of either.
    fn dispatch(&mut self, broker: &InMemoryBroker, queue_name: &str) {
        let Self {
            queues,
            next_delivery_tag,
            ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() {
            let Some(idx) = queue.next_subscriber() else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            *next_delivery_tag += 1;
            let delivery_tag = *next_delivery_tag;
            let subscriber = &queue.subscribers[idx];
            let delivery = Delivery::new(
                delivery_tag,
                message.redelivered,
                message.body.clone(),
                Box::new(InMemoryAcker {
                    broker: broker.clone(),
                    queue_name: queue_name.to_owned(),
                    session_id: subscriber.session_id,
                    delivery_tag,
                }),
            );
            if subscriber.sender.send(Ok(delivery)).is_err() {
                // Nobody is listening on the other side anymore.
                queue.subscribers.remove(idx);
                queue.ready.push_front(message);
                queue.cursor = 0;
                continue;
            }
            queue.cursor = (idx + 1) % queue.subscribers.len();
            queue.stats.delivered += 1;
            if message.redelivered {
                queue.stats.redelivered += 1;
            }
            let in_flight = InFlight {
                session_id: subscriber.session_id,
                consumer_tag: subscriber.consumer_tag.clone(),
                message,
            };
            queue.unacked.insert(delivery_tag, in_flight);
        }
    }

    fn close_session(&mut self, broker: &InMemoryBroker, session_id: u64) {
        if self.sessions.remove(&session_id).is_none() {
            return;
        }
        let mut touched = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            queue.subscribers.retain(|s| s.session_id != session_id);
            let tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, f)| f.session_id == session_id)
                .map(|(tag, _)| *tag)
                .collect();
            if tags.is_empty() {
                continue;
            }
            let returned: Vec<(u64, Message)> = tags
                .into_iter()
                .filter_map(|tag| queue.unacked.remove(&tag).map(|f| (tag, f.message)))
                .collect();
            queue.stats.returned += returned.len() as u64;
            queue.requeue_front(returned);
            touched.push(name.clone());
        }
        for name in touched {
            self.dispatch(broker, &name);
        }
    }

    fn close_connection(&mut self, broker: &InMemoryBroker, connection_id: u64, reason: CloseReason) {
        let Some(notifier) = self.connections.remove(&connection_id) else {
            return;
        };
        let sessions: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for session_id in sessions {
            self.close_session(broker, session_id);
        }
        notifier.notify(reason);
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a queue with the given properties, if it does not exist yet.
    pub fn declare_queue(&self, queue_name: &str, options: QueueOptions) {
        self.lock()
            .queues
            .entry(queue_name.to_owned())
            .or_insert_with(|| Queue::new(options));
    }

    /// Publish a message on the default exchange, routed to `queue_name`.
    ///
    /// The queue is created as durable if it does not exist yet.
    /// Returns the id of the message, stable across redeliveries.
    pub fn publish(&self, queue_name: &str, body: impl Into<Vec<u8>>) -> u64 {
        let mut state = self.lock();
        let id = state.next_id();
        let queue = state
            .queues
            .entry(queue_name.to_owned())
            .or_insert_with(|| Queue::new(QueueOptions::DURABLE));
        queue.stats.published += 1;
        queue.ready.push_back(Message {
            id,
            body: body.into(),
            redelivered: false,
        });
        state.dispatch(self, queue_name);
        id
    }

    pub fn stats(&self, queue_name: &str) -> Option<QueueStats> {
        let state = self.lock();
        let queue = state.queues.get(queue_name)?;
        Some(QueueStats {
            ready: queue.ready.len(),
            unacked: queue.unacked.len(),
            consumers: queue.subscribers.len(),
            ..queue.stats.clone()
        })
    }

    /// Every settlement issued on `queue_name`, in order.
    pub fn settlements(&self, queue_name: &str) -> Vec<SettlementRecord> {
        self.lock()
            .queues
            .get(queue_name)
            .map(|q| q.settlements.clone())
            .unwrap_or_default()
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_connections(&self, n: usize) {
        self.lock().refuse_connections = n;
    }

    /// Terminate every open connection, as a network failure would.
    /// Returns how many connections were dropped.
    pub fn drop_connections(&self) -> usize {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in &ids {
            state.close_connection(self, *id, CloseReason::Failure("connection reset by peer".into()));
        }
        ids.len()
    }

    pub fn connection_attempts(&self) -> u64 {
        self.lock().connection_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    fn settle(
        &self,
        queue_name: &str,
        session_id: u64,
        delivery_tag: u64,
        settlement: Settlement,
    ) -> Result<(), ProtocolError> {
        let mut state = self.lock();
        if !state.sessions.contains_key(&session_id) {
            return Err(ProtocolError::SessionClosed);
        }
        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or(ProtocolError::SessionClosed)?;
        let in_flight = queue
            .unacked
            .remove(&delivery_tag)
            .ok_or(ProtocolError::UnknownDeliveryTag(delivery_tag))?;
        queue.settlements.push(SettlementRecord {
            message_id: in_flight.message.id,
            delivery_tag,
            settlement,
        });
        match settlement {
            Settlement::Acked => queue.stats.acked += 1,
            Settlement::Rejected => queue.stats.rejected += 1,
            Settlement::Requeued => {
                queue.stats.requeued += 1;
                queue.requeue_front(vec![(delivery_tag, in_flight.message)]);
            }
        }
        state.dispatch(self, queue_name);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, ConnectionError> {
        let mut state = self.lock();
        state.connection_attempts += 1;
        if state.refuse_connections > 0 {
            state.refuse_connections -= 1;
            return Err(ConnectionError::Refused("connection refused".into()));
        }
        let id = state.next_id();
        let notifier = Arc::new(CloseNotifier::new());
        state.connections.insert(id, notifier.clone());
        Ok(Arc::new(InMemoryConnection {
            broker: self.clone(),
            id,
            notifier,
        }))
    }
}

struct InMemoryConnection {
    broker: InMemoryBroker,
    id: u64,
    notifier: Arc<CloseNotifier>,
}

#[async_trait::async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn open_session(&self) -> Result<Box<dyn Session>, ProtocolError> {
        let mut state = self.broker.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(ProtocolError::SessionClosed);
        }
        let id = state.next_id();
        state.sessions.insert(
            id,
            SessionEntry {
                connection_id: self.id,
                prefetch: 0,
            },
        );
        Ok(Box::new(InMemorySession {
            broker: self.broker.clone(),
            id,
        }))
    }

    fn close_signal(&self) -> CloseSignal {
        self.notifier.signal()
    }

    fn is_open(&self) -> bool {
        !self.notifier.is_closed()
    }

    async fn close(&self) {
        self.broker
            .lock()
            .close_connection(&self.broker, self.id, CloseReason::Graceful);
    }
}

struct InMemorySession {
    broker: InMemoryBroker,
    id: u64,
}

impl InMemorySession {
    fn ensure_open(&self, state: &State) -> Result<(), ProtocolError> {
        if state.sessions.contains_key(&self.id) {
            Ok(())
        } else {
            Err(ProtocolError::SessionClosed)
        }
    }
}

#[async_trait::async_trait]
impl Session for InMemorySession {
    async fn declare_queue(&self, queue_name: &str) -> Result<(), ProtocolError> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;
        let existing = state.queues.get(queue_name).map(|q| q.options);
        match existing {
            None => {
                state
                    .queues
                    .insert(queue_name.to_owned(), Queue::new(QueueOptions::DURABLE));
                Ok(())
            }
            Some(options) if options == QueueOptions::DURABLE => Ok(()),
            Some(options) => {
                // A failed declaration closes the channel, as RabbitMq does.
                state.close_session(&self.broker, self.id);
                Err(ProtocolError::PreconditionFailed {
                    queue: queue_name.to_owned(),
                    reason: format!("existing queue has {options:?}"),
                })
            }
        }
    }

    async fn set_prefetch(&self, prefetch_count: u16) -> Result<(), ProtocolError> {
        let mut state = self.broker.lock();
        let session = state
            .sessions
            .get_mut(&self.id)
            .ok_or(ProtocolError::SessionClosed)?;
        session.prefetch = prefetch_count;
        Ok(())
    }

    async fn consume(
        &self,
        queue_name: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, ProtocolError> {
        let mut state = self.broker.lock();
        let prefetch = state
            .sessions
            .get(&self.id)
            .map(|s| s.prefetch)
            .ok_or(ProtocolError::SessionClosed)?;
        let Some(queue) = state.queues.get_mut(queue_name) else {
            state.close_session(&self.broker, self.id);
            return Err(ProtocolError::Other(format!(
                "NOT_FOUND - no queue '{queue_name}'"
            )));
        };
        let (sender, receiver) = mpsc::unbounded_channel();
        queue.subscribers.push(Subscriber {
            session_id: self.id,
            consumer_tag: consumer_tag.to_owned(),
            prefetch,
            sender,
        });
        state.dispatch(&self.broker, queue_name);

        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), ProtocolError> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;
        for queue in state.queues.values_mut() {
            queue
                .subscribers
                .retain(|s| !(s.session_id == self.id && s.consumer_tag == consumer_tag));
        }
        Ok(())
    }

    async fn close(&self) {
        self.broker.lock().close_session(&self.broker, self.id);
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.broker.lock().close_session(&self.broker, self.id);
    }
}

struct InMemoryAcker {
    broker: InMemoryBroker,
    queue_name: String,
    session_id: u64,
    delivery_tag: u64,
}

#[async_trait::async_trait]
impl Acker for InMemoryAcker {
    async fn ack(&self) -> Result<(), ProtocolError> {
        self.broker.settle(
            &self.queue_name,
            self.session_id,
            self.delivery_tag,
            Settlement::Acked,
        )
    }

    async fn nack(&self, requeue: bool) -> Result<(), ProtocolError> {
        let settlement = if requeue {
            Settlement::Requeued
        } else {
            Settlement::Rejected
        };
        self.broker
            .settle(&self.queue_name, self.session_id, self.delivery_tag, settlement)
    }
}
