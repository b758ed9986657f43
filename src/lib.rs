//! `carrot-patch` keeps your RabbitMQ consumers running through broker outages.
//!
//! You describe which queues to consume from, with which [`Handler`](consumers::Handler) and
//! how many concurrent consumers, and a [`Manager`] takes care of the rest: it connects to the
//! broker, spawns the consumers, acks or requeues every message according to the outcome of
//! its handler and, when the connection drops, drains the consumers and starts over as soon as
//! the broker is reachable again.
//!
//! [`Manager`] and [`HandlerRegistry`](consumers::HandlerRegistry) are the best starting
//! points.
//!
//! ## Brokers
//!
//! [`amqp::ConnectionFactory`] connects to RabbitMQ. The
//! [`InMemoryBroker`](transport::in_memory::InMemoryBroker) runs in-process and is meant for
//! tests.
//!
//! ## Examples
//!
//! Check the `demos` directory to see the library in action.

pub mod amqp;
pub mod consumers;
pub mod error;
pub mod pool;
pub mod settings;
pub mod supervisor;
pub mod transport;

mod manager;

pub use manager::{Manager, ManagerState};
