use carrot_patch::amqp::{configuration::RabbitMqSettings, ConnectionFactory};
use carrot_patch::consumers::{BrokerAction, Handler, HandlerRegistry, Incoming};
use carrot_patch::error::HandlerError;
use carrot_patch::settings::{ManagerSettings, QueueBinding};
use carrot_patch::Manager;

/// Prints every message it receives.
struct LogHandler;

#[async_trait::async_trait]
impl Handler for LogHandler {
    async fn handle(&self, incoming: &Incoming) -> Result<BrokerAction, HandlerError> {
        println!(
            "[{}] {}{}",
            incoming.queue_name,
            String::from_utf8_lossy(&incoming.body),
            if incoming.redelivered { " (redelivered)" } else { "" }
        );
        Ok(BrokerAction::Ack)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // We are using the out-of-the-box parameters for the default RabbitMq Docker image.
    let connection_factory = ConnectionFactory::new_from_config(&RabbitMqSettings::default())?;

    // Handlers are registered by name: queue bindings refer to them by that name.
    let registry = HandlerRegistry::new().with_handler("LogHandler", LogHandler);

    // Three consumers, each with its own channel, compete for the messages on `log_queue`.
    // The queue is declared (durable) if it does not exist yet.
    let settings = ManagerSettings::default()
        .with_queue_binding(QueueBinding::new("log_queue", "LogHandler", 3));

    // Try stopping RabbitMq while this is running: the manager waits for it to come back
    // (retrying every 5 seconds) and resumes consuming.
    let manager = Manager::new(connection_factory, settings, registry);
    manager.run_until_ctrl_c().await?;

    Ok(())
}
