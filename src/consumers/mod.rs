//! Facilities to process messages from a queue. Check out [`Handler`] and [`HandlerRegistry`] as
//! a starting point.
pub use handler::{BrokerAction, Handler};
pub use incoming_message::Incoming;
pub use registry::HandlerRegistry;

pub(crate) mod consumer;
mod handler;
mod incoming_message;
mod registry;
