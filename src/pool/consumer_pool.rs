use crate::{
    consumers::{consumer::Consumer, HandlerRegistry},
    error::ConfigurationError,
    settings::{ManagerSettings, QueueBinding},
    transport::BrokerConnection,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle};

/// The outcome of [`ConsumerPool::spawn_all`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SpawnReport {
    /// How many consumer instances were launched, across all bindings.
    pub spawned: usize,
    /// The bindings that were left out, and why.
    pub skipped: Vec<ConfigurationError>,
}

/// Instantiates `concurrency` consumers for each [`QueueBinding`] and tracks their lifetimes.
pub struct ConsumerPool {
    registry: HandlerRegistry,
    bindings: Vec<QueueBinding>,
    prefetch_count: u16,
    handler_timeout: Option<Duration>,
    recycle_interval: Duration,
    roster: Arc<Mutex<Roster>>,
    generation: Mutex<Option<Generation>>,
}

/// The consumers that are currently running, by id.
#[derive(Default)]
struct Roster {
    next_id: u64,
    members: HashMap<u64, String>,
}

/// Every consumer launched by the same `spawn_all` call.
struct Generation {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Keeps a consumer in the roster for as long as its task is alive.
///
/// Removal happens on drop, which covers normal exits, panics and aborted tasks alike.
struct RosterGuard {
    roster: Arc<Mutex<Roster>>,
    id: u64,
}

impl Drop for RosterGuard {
    fn drop(&mut self) {
        lock(&self.roster).members.remove(&self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConsumerPool {
    pub fn new(registry: HandlerRegistry, settings: &ManagerSettings) -> Self {
        Self {
            registry,
            bindings: settings.queue_bindings.clone(),
            prefetch_count: settings.prefetch_count,
            handler_timeout: settings.handler_timeout(),
            recycle_interval: settings.reconnect.interval(),
            roster: Arc::default(),
            generation: Mutex::new(None),
        }
    }

    /// Launch a new generation of consumers on top of `connection`.
    ///
    /// Bindings that are malformed or refer to an unknown handler are logged and skipped: they
    /// do not prevent the others from running.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_all(&self, connection: Arc<dyn BrokerConnection>) -> SpawnReport {
        let (stop, stop_rx) = watch::channel(false);
        let mut report = SpawnReport::default();
        let mut tasks = Vec::new();

        for binding in &self.bindings {
            let handler = match binding
                .validate()
                .and_then(|_| self.registry.resolve(binding))
            {
                Ok(handler) => handler,
                Err(e) => {
                    tracing::error!(
                        queue_name = %binding.queue,
                        handler = %binding.handler,
                        "Skipping queue binding: {}",
                        e
                    );
                    report.skipped.push(e);
                    continue;
                }
            };
            let prefetch_count = binding.prefetch_count.unwrap_or(self.prefetch_count);
            let handler_timeout = binding.handler_timeout().or(self.handler_timeout);

            for instance in 0..binding.concurrency {
                let consumer = Consumer {
                    queue_name: binding.queue.clone(),
                    handler_name: binding.handler.clone(),
                    instance,
                    handler: handler.clone(),
                    prefetch_count,
                    handler_timeout,
                    recycle_interval: self.recycle_interval,
                };
                let guard = self.enroll(&binding.queue);
                let connection = connection.clone();
                let stop = stop_rx.clone();
                tasks.push(tokio::spawn(async move {
                    let _guard = guard;
                    consumer.run(connection, stop).await;
                }));
                report.spawned += 1;
            }
            tracing::info!(
                queue_name = %binding.queue,
                handler = %binding.handler,
                concurrency = binding.concurrency,
                "Consumers started"
            );
        }

        let previous = lock(&self.generation).replace(Generation { stop, tasks });
        if let Some(previous) = previous {
            tracing::warn!("A previous generation of consumers is still running, stopping it");
            let _ = previous.stop.send(true);
        }
        report
    }

    /// Signal every consumer of the current generation to stop and wait for them to exit.
    ///
    /// Consumers finish processing the message they are working on, if any, before exiting.
    /// A no-op if no consumer is running.
    pub async fn stop_all(&self) {
        let generation = lock(&self.generation).take();
        let Some(generation) = generation else {
            return;
        };
        let _ = generation.stop.send(true);
        let n_tasks = generation.tasks.len();
        for result in futures_util::future::join_all(generation.tasks).await {
            if let Err(e) = result {
                tracing::error!("A consumer task terminated abnormally: {}", e);
            }
        }
        tracing::info!(n_tasks, "Consumers stopped");
    }

    /// The number of live consumer instances bound to `queue_name`.
    pub fn online_consumers(&self, queue_name: &str) -> usize {
        lock(&self.roster)
            .members
            .values()
            .filter(|queue| queue.as_str() == queue_name)
            .count()
    }

    /// The number of live consumer instances, across all queues.
    pub fn total_online(&self) -> usize {
        lock(&self.roster).members.len()
    }

    fn enroll(&self, queue_name: &str) -> RosterGuard {
        let mut roster = lock(&self.roster);
        roster.next_id += 1;
        let id = roster.next_id;
        roster.members.insert(id, queue_name.to_owned());
        RosterGuard {
            roster: self.roster.clone(),
            id,
        }
    }
}

impl Drop for ConsumerPool {
    fn drop(&mut self) {
        if let Some(generation) = lock(&self.generation).take() {
            let _ = generation.stop.send(true);
        }
    }
}
