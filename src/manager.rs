use crate::{
    consumers::HandlerRegistry,
    pool::ConsumerPool,
    settings::ManagerSettings,
    supervisor::{wait_or_stop, Supervisor},
    transport::Broker,
};
use anyhow::Context;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use tokio::{sync::watch, task::JoinHandle};

/// The lifecycle of a [`Manager`].
///
/// ```text
/// Idle -> Connecting -> Running -> Reconnecting -> Connecting -> ...
/// ```
///
/// Every state can transition to `Stopped`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Built, not started yet.
    Idle,
    /// Trying to establish a connection with the broker.
    Connecting,
    /// Connected, consumers are running.
    Running,
    /// The connection was lost: consumers are being drained.
    Reconnecting,
    Stopped,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Keeps consumers running against a broker, reconnecting whenever the connection drops.
///
/// The manager owns a [`ConsumerPool`] and a [`Supervisor`]: once [started](Manager::start), a
/// background task connects to the broker, spawns the consumers of every queue binding and
/// watches the connection. When the connection is lost, consumers are drained and a new
/// generation is spawned as soon as a new connection is up.
///
/// ```rust,no_run
/// use carrot_patch::consumers::HandlerRegistry;
/// use carrot_patch::settings::{ManagerSettings, QueueBinding};
/// use carrot_patch::transport::in_memory::InMemoryBroker;
/// use carrot_patch::Manager;
///
/// # async fn example(registry: HandlerRegistry) {
/// let settings =
///     ManagerSettings::default().with_queue_binding(QueueBinding::new("log_queue", "LogHandler", 3));
/// let manager = Manager::new(InMemoryBroker::new(), settings, registry);
///
/// manager.start();
/// // [...]
/// manager.stop().await;
/// # }
/// ```
pub struct Manager {
    inner: Arc<Inner>,
    supervisor_task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    broker: Arc<dyn Broker>,
    settings: ManagerSettings,
    pool: ConsumerPool,
    state: watch::Sender<ManagerState>,
    stop: watch::Sender<bool>,
    connections_established: AtomicU64,
}

impl Manager {
    pub fn new<B: Broker>(broker: B, settings: ManagerSettings, registry: HandlerRegistry) -> Self {
        let pool = ConsumerPool::new(registry, &settings);
        let (state, _) = watch::channel(ManagerState::Idle);
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                broker: Arc::new(broker),
                settings,
                pool,
                state,
                stop,
                connections_established: AtomicU64::new(0),
            }),
            supervisor_task: Mutex::new(None),
        }
    }

    /// Start connecting and consuming in the background. It returns immediately.
    ///
    /// Only the first call has an effect: a manager cannot be restarted once stopped.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let started = self.inner.state.send_if_modified(|state| {
            if *state == ManagerState::Idle {
                *state = ManagerState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            tracing::warn!(state = %self.state(), "The manager has already been started");
            return;
        }
        tracing::info!(
            n_bindings = self.inner.settings.queue_bindings.len(),
            "Starting the consumer manager"
        );
        let stop = self.inner.stop.subscribe();
        let task = tokio::spawn(self.inner.clone().supervise(stop));
        *self
            .supervisor_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Stop consuming and disconnect from the broker.
    ///
    /// It returns once every consumer has settled the message it was working on and the
    /// connection is closed. Calling it more than once is fine.
    pub async fn stop(&self) {
        self.inner.stop.send_replace(true);
        let task = self
            .supervisor_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    tracing::error!("The consumer manager task terminated abnormally: {}", e);
                    self.inner.state.send_replace(ManagerState::Stopped);
                }
            }
            None => {
                // Never started, or somebody else is already waiting on the background task.
                self.inner.state.send_if_modified(|state| {
                    if *state == ManagerState::Idle {
                        *state = ManagerState::Stopped;
                        true
                    } else {
                        false
                    }
                });
                self.stopped().await;
            }
        }
    }

    /// Start the manager and run it until the process receives a Ctrl-C (SIGINT) signal, or
    /// the manager gives up on connecting to the broker.
    pub async fn run_until_ctrl_c(&self) -> Result<(), anyhow::Error> {
        self.start();
        let outcome = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl-C, shutting down");
                signal.context("Failed to listen for the Ctrl-C signal")
            }
            _ = self.stopped() => Ok(()),
        };
        self.stop().await;
        outcome
    }

    pub fn state(&self) -> ManagerState {
        *self.inner.state.borrow()
    }

    /// Get notified of every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ManagerState> {
        self.inner.state.subscribe()
    }

    /// The number of live consumers bound to `queue_name`.
    pub fn online_consumers(&self, queue_name: &str) -> usize {
        self.inner.pool.online_consumers(queue_name)
    }

    /// The number of live consumers, across all queues.
    pub fn total_online(&self) -> usize {
        self.inner.pool.total_online()
    }

    /// How many times a connection with the broker was established, reconnections included.
    pub fn connections_established(&self) -> u64 {
        self.inner.connections_established.load(Ordering::SeqCst)
    }

    async fn stopped(&self) {
        let mut state = self.inner.state.subscribe();
        loop {
            if *state.borrow_and_update() == ManagerState::Stopped {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        // The background task winds down on its own.
        self.inner.stop.send_replace(true);
    }
}

impl Inner {
    fn set_state(&self, state: ManagerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Consumer manager state transition");
        }
    }

    #[tracing::instrument(skip_all, name = "consumer_manager")]
    async fn supervise(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let policy = self.settings.reconnect.clone();
        let mut supervisor = Supervisor::new(self.broker.clone(), policy.clone());
        let mut reconnecting = false;

        loop {
            self.set_state(ManagerState::Connecting);
            if reconnecting && !wait_or_stop(policy.interval(), &mut stop).await {
                break;
            }
            let connection = match supervisor.connect_with_retry(&mut stop).await {
                Ok(Some(connection)) => connection,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(
                        error.message = %e,
                        error.details = ?e,
                        "Giving up on connecting to the message broker"
                    );
                    break;
                }
            };
            let close_signal = connection.close_signal();
            self.connections_established.fetch_add(1, Ordering::SeqCst);

            let report = self.pool.spawn_all(connection);
            tracing::info!(
                n_consumers = report.spawned,
                n_skipped_bindings = report.skipped.len(),
                "Consumer manager running"
            );
            self.set_state(ManagerState::Running);

            tokio::select! {
                biased;

                _ = stop.changed() => break,
                reason = close_signal.closed() => {
                    tracing::warn!("Lost the connection with the message broker ({}), reconnecting", reason);
                    self.set_state(ManagerState::Reconnecting);
                    self.pool.stop_all().await;
                    supervisor.close().await;
                    reconnecting = true;
                }
            }
        }

        self.pool.stop_all().await;
        supervisor.close().await;
        self.set_state(ManagerState::Stopped);
        tracing::info!("Consumer manager stopped");
    }
}
