//! Helpers for connecting to a rabbitmq broker

pub mod configuration;
mod factory;
mod session;
pub use factory::ConnectionFactory;
