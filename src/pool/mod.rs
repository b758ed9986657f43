//! Runs the consumers of every queue binding as one unit.
//!
//! A [`ConsumerPool`] is started against an open connection with [`ConsumerPool::spawn_all`]
//! and torn down with [`ConsumerPool::stop_all`]. Each start creates a new generation of
//! consumers, with their own sessions and stop signal: nothing carries over from a previous
//! connection.
//!
//! ```rust
//! use carrot_patch::consumers::HandlerRegistry;
//! use carrot_patch::pool::ConsumerPool;
//! use carrot_patch::settings::ManagerSettings;
//! use carrot_patch::transport::{in_memory::InMemoryBroker, Broker};
//!
//! async fn example() -> anyhow::Result<()> {
//!     let broker = InMemoryBroker::new();
//!     let pool = ConsumerPool::new(HandlerRegistry::new(), &ManagerSettings::default());
//!
//!     let connection = broker.connect().await?;
//!     let report = pool.spawn_all(connection);
//!     assert_eq!(report.spawned, 0);
//!
//!     pool.stop_all().await;
//!     Ok(())
//! }
//! ```

mod consumer_pool;

pub use consumer_pool::{ConsumerPool, SpawnReport};
