use crate::consumers::{CountingHandler, FailingHandler};
use crate::helpers::{count_settlements, eventually, get_manager, queue_name, stats, wait_for_state};
use carrot_patch::consumers::{BrokerAction, Handler, HandlerRegistry, Incoming};
use carrot_patch::error::HandlerError;
use carrot_patch::settings::QueueBinding;
use carrot_patch::transport::in_memory::{InMemoryBroker, Settlement};
use carrot_patch::ManagerState;
use fake::{Fake, Faker};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

#[tokio::test]
async fn every_message_is_acked_once_by_the_log_queue_consumers() {
    // Arrange
    let broker = InMemoryBroker::new();
    let handler = CountingHandler::with_latency(Duration::from_millis(5));
    let manager = get_manager(
        &broker,
        vec![QueueBinding::new("log_queue", "LogHandler", 3)],
        HandlerRegistry::new().with_handler("LogHandler", handler.clone()),
    );
    manager.start();
    wait_for_state(&manager, ManagerState::Running).await;

    eventually("every consumer to come online", || {
        manager.online_consumers("log_queue") == 3
    })
    .await;

    // Act
    for _ in 0..100 {
        broker.publish("log_queue", Faker.fake::<String>());
    }

    // Assert
    let mut samples = Vec::new();
    eventually("100 messages to be acked", || {
        samples.push(manager.online_consumers("log_queue"));
        stats(&broker, "log_queue").acked == 100
    })
    .await;
    assert!(samples.iter().all(|&online| online == 3), "{samples:?}");
    assert_eq!(manager.online_consumers("log_queue"), 3);
    assert_eq!(stats(&broker, "log_queue").consumers, 3);
    assert_eq!(handler.invocations(), 100);
    assert_eq!(count_settlements(&broker, "log_queue", Settlement::Requeued), 0);

    manager.stop().await;
}

#[tokio::test]
async fn messages_are_requeued_and_redelivered_when_the_handler_fails() {
    // Arrange
    let broker = InMemoryBroker::new();
    let queue_name = queue_name();
    let manager = get_manager(
        &broker,
        vec![QueueBinding::new(&queue_name, "FailingHandler", 2)],
        HandlerRegistry::new().with_handler("FailingHandler", FailingHandler),
    );
    let message_ids: HashSet<u64> = (0..100)
        .map(|_| broker.publish(&queue_name, Faker.fake::<String>()))
        .collect();

    // Act
    manager.start();

    // Assert
    eventually("every message to be requeued at least once", || {
        let requeued: HashSet<u64> = broker
            .settlements(&queue_name)
            .into_iter()
            .filter(|r| r.settlement == Settlement::Requeued)
            .map(|r| r.message_id)
            .collect();
        requeued == message_ids
    })
    .await;
    eventually("a redelivery", || stats(&broker, &queue_name).redelivered > 0).await;
    manager.stop().await;

    let stats = stats(&broker, &queue_name);
    assert_eq!(stats.acked, 0);
    assert_eq!(stats.rejected, 0);
    // Nothing got lost along the way.
    assert_eq!(stats.ready, 100);
}

#[tokio::test]
async fn rejected_messages_are_not_requeued() {
    struct Rejecting;

    #[async_trait::async_trait]
    impl Handler for Rejecting {
        async fn handle(&self, _incoming: &Incoming) -> Result<BrokerAction, HandlerError> {
            Ok(BrokerAction::Reject)
        }
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let queue_name = queue_name();
    let manager = get_manager(
        &broker,
        vec![QueueBinding::new(&queue_name, "Rejecting", 1)],
        HandlerRegistry::new().with_handler("Rejecting", Rejecting),
    );
    for _ in 0..10 {
        broker.publish(&queue_name, Faker.fake::<String>());
    }

    // Act
    manager.start();

    // Assert
    eventually("10 rejections", || stats(&broker, &queue_name).rejected == 10).await;
    manager.stop().await;
    let stats = stats(&broker, &queue_name);
    assert_eq!(stats.delivered, 10);
    assert_eq!(stats.ready, 0);
}

#[tokio::test]
async fn handlers_see_the_message_as_published() {
    struct Expecting(Vec<u8>);

    #[async_trait::async_trait]
    impl Handler for Expecting {
        async fn handle(&self, incoming: &Incoming) -> Result<BrokerAction, HandlerError> {
            if incoming.body == self.0 && !incoming.redelivered && incoming.delivery_tag > 0 {
                Ok(BrokerAction::Ack)
            } else {
                Ok(BrokerAction::Reject)
            }
        }
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let queue_name = queue_name();
    let payload: String = Faker.fake();
    let manager = get_manager(
        &broker,
        vec![QueueBinding::new(&queue_name, "Expecting", 1)],
        HandlerRegistry::new().with_handler("Expecting", Expecting(payload.clone().into_bytes())),
    );
    broker.publish(&queue_name, payload);

    // Act
    manager.start();

    // Assert
    eventually("the message to be acked", || stats(&broker, &queue_name).acked == 1).await;
    manager.stop().await;
}

#[tokio::test]
async fn each_delivery_is_settled_exactly_once_whatever_the_handler_does() {
    /// Picks a random outcome for every delivery, panics included.
    struct Chaotic;

    #[async_trait::async_trait]
    impl Handler for Chaotic {
        async fn handle(&self, _incoming: &Incoming) -> Result<BrokerAction, HandlerError> {
            match (0..5u8).fake::<u8>() {
                0 => Ok(BrokerAction::Ack),
                1 => Ok(BrokerAction::Requeue),
                2 => Ok(BrokerAction::Reject),
                3 => Err(anyhow::anyhow!("Random failure").into()),
                _ => panic!("Random panic"),
            }
        }
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let queue_name = queue_name();
    let manager = get_manager(
        &broker,
        vec![QueueBinding::new(&queue_name, "Chaotic", 4).with_prefetch_count(5)],
        HandlerRegistry::new().with_handler("Chaotic", Chaotic),
    );
    let n_messages = 50;
    for _ in 0..n_messages {
        broker.publish(&queue_name, Faker.fake::<String>());
    }

    // Act
    manager.start();
    eventually("every message to reach a terminal outcome", || {
        let stats = stats(&broker, &queue_name);
        stats.acked + stats.rejected == n_messages
    })
    .await;
    manager.stop().await;

    // Assert
    let settlements = broker.settlements(&queue_name);
    let mut per_delivery: HashMap<u64, usize> = HashMap::new();
    let mut terminal_per_message: HashMap<u64, usize> = HashMap::new();
    for record in &settlements {
        *per_delivery.entry(record.delivery_tag).or_default() += 1;
        if record.settlement != Settlement::Requeued {
            *terminal_per_message.entry(record.message_id).or_default() += 1;
        }
    }
    assert!(per_delivery.values().all(|n| *n == 1));
    assert_eq!(terminal_per_message.len(), n_messages as usize);
    assert!(terminal_per_message.values().all(|n| *n == 1));
}

#[tokio::test]
async fn a_handler_exceeding_its_timeout_is_aborted_and_the_message_requeued() {
    struct SlowOnFirstAttempt;

    #[async_trait::async_trait]
    impl Handler for SlowOnFirstAttempt {
        async fn handle(&self, incoming: &Incoming) -> Result<BrokerAction, HandlerError> {
            if !incoming.redelivered {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(BrokerAction::Ack)
        }
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let queue_name = queue_name();
    let manager = get_manager(
        &broker,
        vec![QueueBinding::new(&queue_name, "Slow", 1)
            .with_handler_timeout(Duration::from_millis(100))],
        HandlerRegistry::new().with_handler("Slow", SlowOnFirstAttempt),
    );
    broker.publish(&queue_name, Faker.fake::<String>());

    // Act
    manager.start();

    // Assert
    eventually("the message to be acked", || stats(&broker, &queue_name).acked == 1).await;
    assert_eq!(count_settlements(&broker, &queue_name, Settlement::Requeued), 1);
    manager.stop().await;
}
