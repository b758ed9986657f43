mod handlers;

use carrot_patch::consumers::{BrokerAction, Handler, Incoming};
use carrot_patch::error::HandlerError;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

/// Acks every message, keeping track of how many it has seen.
#[derive(Clone, Default)]
pub struct CountingHandler {
    pub invocations: Arc<AtomicUsize>,
    /// How long each message takes to process.
    pub latency: Duration,
}

impl CountingHandler {
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Handler for CountingHandler {
    async fn handle(&self, _incoming: &Incoming) -> Result<BrokerAction, HandlerError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(BrokerAction::Ack)
    }
}

/// Fails to process every message it is given.
#[derive(Clone, Copy)]
pub struct FailingHandler;

#[async_trait::async_trait]
impl Handler for FailingHandler {
    async fn handle(&self, _incoming: &Incoming) -> Result<BrokerAction, HandlerError> {
        Err(anyhow::anyhow!("The downstream service is unavailable").into())
    }
}
