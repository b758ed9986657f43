//! Configuration of the consumer manager: what to consume, how much of it, and how to
//! react to a broker outage.
//!
//! All settings types implement [`Deserialize`] so that they can be loaded from whatever
//! configuration source your application uses. Numeric fields accept strings as well, which
//! comes in handy when values are sourced from environment variables.
use crate::error::ConfigurationError;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use std::time::Duration;

/// The number of unacknowledged deliveries each consumer instance can hold.
pub const DEFAULT_PREFETCH_COUNT: u16 = 120;
/// How long to wait between two attempts to connect to the broker, in seconds.
pub const DEFAULT_RECONNECT_INTERVAL_SECONDS: f64 = 5.0;

fn default_prefetch_count() -> u16 {
    DEFAULT_PREFETCH_COUNT
}

fn default_reconnect_interval_seconds() -> f64 {
    DEFAULT_RECONNECT_INTERVAL_SECONDS
}

/// Negative or non-finite values are clamped to zero.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}

/// Top-level configuration of a [`Manager`](crate::Manager).
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ManagerSettings {
    /// How to go about re-establishing a lost connection.
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    /// The prefetch count of each consumer instance, unless overridden by its binding.
    #[serde(
        default = "default_prefetch_count",
        deserialize_with = "deserialize_number_from_string"
    )]
    pub prefetch_count: u16,
    /// Abort (and requeue) a message if its handler takes longer than this, in seconds.
    ///
    /// Handlers are not subject to any timeout when left unspecified.
    #[serde(default)]
    pub handler_timeout_seconds: Option<f64>,
    /// The queues to consume from, in declaration order.
    #[serde(default)]
    pub queue_bindings: Vec<QueueBinding>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            handler_timeout_seconds: None,
            queue_bindings: Vec::new(),
        }
    }
}

impl ManagerSettings {
    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    #[must_use]
    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    #[must_use]
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout_seconds = Some(timeout.as_secs_f64());
        self
    }

    #[must_use]
    pub fn with_queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queue_bindings.push(binding);
        self
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_seconds.map(seconds)
    }
}

/// Binds a queue to a handler, with a given number of concurrent consumers.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct QueueBinding {
    /// The name of the queue to consume from.
    pub queue: String,
    /// The name the handler is registered with in the
    /// [`HandlerRegistry`](crate::consumers::HandlerRegistry).
    pub handler: String,
    /// How many consumer instances to run against the queue.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub concurrency: usize,
    /// Overrides [`ManagerSettings::prefetch_count`] for this queue.
    #[serde(default)]
    pub prefetch_count: Option<u16>,
    /// Overrides [`ManagerSettings::handler_timeout_seconds`] for this queue.
    #[serde(default)]
    pub handler_timeout_seconds: Option<f64>,
}

impl QueueBinding {
    pub fn new(queue: impl Into<String>, handler: impl Into<String>, concurrency: usize) -> Self {
        Self {
            queue: queue.into(),
            handler: handler.into(),
            concurrency,
            prefetch_count: None,
            handler_timeout_seconds: None,
        }
    }

    #[must_use]
    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = Some(prefetch_count);
        self
    }

    #[must_use]
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout_seconds = Some(timeout.as_secs_f64());
        self
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_seconds.map(seconds)
    }

    /// Reject bindings that cannot produce a working consumer.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.queue.trim().is_empty() {
            return Err(ConfigurationError::EmptyQueueName {
                handler: self.handler.clone(),
            });
        }
        if self.concurrency == 0 {
            return Err(ConfigurationError::ZeroConcurrency {
                queue: self.queue.clone(),
            });
        }
        if self.prefetch_count == Some(0) {
            return Err(ConfigurationError::ZeroPrefetch {
                queue: self.queue.clone(),
            });
        }
        Ok(())
    }
}

/// How the manager goes about (re-)establishing its connection with the broker.
///
/// Long-running services should stick to the default, [`ReconnectPolicy::Fixed`]: it never
/// gives up. [`ReconnectPolicy::Exponential`] suits short-lived processes, which are better off
/// failing loudly once the broker has been unreachable for a while.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Wait the same interval before every attempt and retry forever.
    Fixed {
        /// A non-positive interval falls back to the default of 5 seconds.
        #[serde(default = "default_reconnect_interval_seconds")]
        interval_seconds: f64,
    },
    /// Double the wait after every failed attempt, up to `max_interval_seconds`, and give up
    /// after `max_retries` failed attempts.
    Exponential {
        initial_interval_seconds: f64,
        max_interval_seconds: f64,
        max_retries: u32,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Fixed {
            interval_seconds: DEFAULT_RECONNECT_INTERVAL_SECONDS,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self::Fixed {
            interval_seconds: interval.as_secs_f64(),
        }
    }

    pub fn exponential(initial_interval: Duration, max_interval: Duration, max_retries: u32) -> Self {
        Self::Exponential {
            initial_interval_seconds: initial_interval.as_secs_f64(),
            max_interval_seconds: max_interval.as_secs_f64(),
            max_retries,
        }
    }

    /// The base interval between two attempts.
    ///
    /// Also used as the pause before re-opening a consumer session after a protocol error.
    /// A non-positive interval falls back to the default of 5 seconds.
    pub fn interval(&self) -> Duration {
        let interval_seconds = match self {
            Self::Fixed { interval_seconds } => *interval_seconds,
            Self::Exponential {
                initial_interval_seconds,
                ..
            } => *initial_interval_seconds,
        };
        if interval_seconds > 0.0 {
            seconds(interval_seconds)
        } else {
            seconds(DEFAULT_RECONNECT_INTERVAL_SECONDS)
        }
    }

    /// How long to wait after `failed_attempts` consecutive failures (at least one).
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        match self {
            Self::Fixed { .. } => self.interval(),
            Self::Exponential {
                max_interval_seconds,
                ..
            } => {
                let cap = seconds(*max_interval_seconds);
                let mut delay = self.interval();
                for _ in 1..failed_attempts {
                    if delay >= cap {
                        break;
                    }
                    delay = delay.saturating_mul(2);
                }
                delay.min(cap)
            }
        }
    }

    /// `None` if the policy retries forever.
    pub fn max_retries(&self) -> Option<u32> {
        match self {
            Self::Fixed { .. } => None,
            Self::Exponential { max_retries, .. } => Some(*max_retries),
        }
    }
}
