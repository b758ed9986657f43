use crate::consumers::CountingHandler;
use crate::helpers::{
    eventually, get_manager, queue_name, stats, wait_for_state, RECONNECT_INTERVAL,
};
use carrot_patch::consumers::{BrokerAction, Handler, HandlerRegistry, Incoming};
use carrot_patch::error::HandlerError;
use carrot_patch::settings::{ManagerSettings, QueueBinding, ReconnectPolicy};
use carrot_patch::transport::in_memory::InMemoryBroker;
use carrot_patch::{Manager, ManagerState};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

#[tokio::test]
async fn the_manager_converges_back_to_running_after_repeated_connection_drops() {
    // Arrange
    let broker = InMemoryBroker::new();
    let log_queue = queue_name();
    let audit_queue = queue_name();
    let handler = CountingHandler::default();
    let manager = get_manager(
        &broker,
        vec![
            QueueBinding::new(&log_queue, "Counting", 3),
            QueueBinding::new(&audit_queue, "Counting", 2),
        ],
        HandlerRegistry::new().with_handler("Counting", handler.clone()),
    );
    manager.start();
    wait_for_state(&manager, ManagerState::Running).await;

    // Act
    let n_drops = 3;
    let started_at = Instant::now();
    for i in 1..=n_drops {
        eventually("every consumer to subscribe", || {
            stats(&broker, &log_queue).consumers == 3 && stats(&broker, &audit_queue).consumers == 2
        })
        .await;
        assert_eq!(broker.drop_connections(), 1);
        eventually("the manager to reconnect", || {
            manager.connections_established() == i + 1 && manager.state() == ManagerState::Running
        })
        .await;
    }

    // Assert
    // One reconnect interval per drop, plus time for the consumers to subscribe.
    let bound = RECONNECT_INTERVAL * (n_drops as u32 + 1) + Duration::from_millis(500);
    assert!(
        started_at.elapsed() < bound,
        "Took {:?} to recover from {} drops",
        started_at.elapsed(),
        n_drops
    );
    assert_eq!(broker.open_connections(), 1);
    assert_eq!(manager.online_consumers(&log_queue), 3);
    assert_eq!(manager.online_consumers(&audit_queue), 2);
    assert_eq!(manager.total_online(), 5);

    // The new generation of consumers does its job.
    for _ in 0..20 {
        broker.publish(&log_queue, "after the storm");
    }
    eventually("the messages to be acked", || stats(&broker, &log_queue).acked == 20).await;
    manager.stop().await;
}

#[tokio::test]
async fn messages_in_flight_when_the_connection_drops_are_redelivered() {
    struct SlowAck;

    #[async_trait::async_trait]
    impl Handler for SlowAck {
        async fn handle(&self, _incoming: &Incoming) -> Result<BrokerAction, HandlerError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(BrokerAction::Ack)
        }
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let queue_name = queue_name();
    let manager = get_manager(
        &broker,
        vec![QueueBinding::new(&queue_name, "SlowAck", 2)],
        HandlerRegistry::new().with_handler("SlowAck", SlowAck),
    );
    for i in 0..30 {
        broker.publish(&queue_name, i.to_string());
    }
    manager.start();
    eventually("some progress", || stats(&broker, &queue_name).acked >= 5).await;

    // Act
    broker.drop_connections();

    // Assert
    eventually("every message to be acked", || stats(&broker, &queue_name).acked == 30).await;
    let stats = stats(&broker, &queue_name);
    assert!(stats.returned > 0);
    assert!(stats.redelivered > 0);
    manager.stop().await;
}

#[tokio::test]
async fn stop_waits_for_in_flight_messages_to_be_settled() {
    struct Sluggish {
        started: Arc<AtomicBool>,
        completed: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl Handler for Sluggish {
        async fn handle(&self, _incoming: &Incoming) -> Result<BrokerAction, HandlerError> {
            self.started.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.completed.store(true, Ordering::SeqCst);
            Ok(BrokerAction::Ack)
        }
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let queue_name = queue_name();
    let started = Arc::new(AtomicBool::new(false));
    let completed = Arc::new(AtomicBool::new(false));
    let manager = get_manager(
        &broker,
        vec![QueueBinding::new(&queue_name, "Sluggish", 1)],
        HandlerRegistry::new().with_handler(
            "Sluggish",
            Sluggish {
                started: started.clone(),
                completed: completed.clone(),
            },
        ),
    );
    for _ in 0..5 {
        broker.publish(&queue_name, "take your time");
    }
    manager.start();
    eventually("the handler to start", || started.load(Ordering::SeqCst)).await;

    // Act
    manager.stop().await;

    // Assert
    assert!(completed.load(Ordering::SeqCst));
    assert_eq!(manager.state(), ManagerState::Stopped);
    assert_eq!(manager.total_online(), 0);
    assert_eq!(broker.open_connections(), 0);
    let stats = stats(&broker, &queue_name);
    assert_eq!(stats.acked, 1);
    // Prefetched messages went back to the queue.
    assert_eq!(stats.ready, 4);
    assert_eq!(stats.unacked, 0);
}

#[tokio::test]
async fn a_binding_with_an_unknown_handler_is_skipped_and_the_others_run() {
    // Arrange
    let broker = InMemoryBroker::new();
    let log_queue = queue_name();
    let audit_queue = queue_name();
    let manager = get_manager(
        &broker,
        vec![
            QueueBinding::new(&audit_queue, "AuditHandler", 2),
            QueueBinding::new(&log_queue, "LogHandler", 2),
        ],
        HandlerRegistry::new().with_handler("LogHandler", CountingHandler::default()),
    );

    // Act
    manager.start();
    wait_for_state(&manager, ManagerState::Running).await;
    for _ in 0..10 {
        broker.publish(&log_queue, "hello");
    }

    // Assert
    eventually("the messages to be acked", || stats(&broker, &log_queue).acked == 10).await;
    assert_eq!(manager.online_consumers(&log_queue), 2);
    assert_eq!(manager.online_consumers(&audit_queue), 0);
    assert!(broker.stats(&audit_queue).is_none());
    manager.stop().await;
}

#[tokio::test]
async fn the_manager_keeps_retrying_while_the_broker_refuses_connections() {
    // Arrange
    let broker = InMemoryBroker::new();
    broker.refuse_connections(3);
    let manager = get_manager(
        &broker,
        vec![QueueBinding::new(queue_name(), "Counting", 1)],
        HandlerRegistry::new().with_handler("Counting", CountingHandler::default()),
    );

    // Act
    manager.start();

    // Assert
    wait_for_state(&manager, ManagerState::Running).await;
    assert_eq!(broker.connection_attempts(), 4);
    assert_eq!(manager.connections_established(), 1);
    manager.stop().await;
}

#[tokio::test]
async fn the_manager_stops_when_the_exponential_policy_gives_up() {
    // Arrange
    let broker = InMemoryBroker::new();
    broker.refuse_connections(usize::MAX);
    let settings = ManagerSettings::default()
        .with_reconnect_policy(ReconnectPolicy::exponential(
            Duration::from_millis(5),
            Duration::from_millis(20),
            4,
        ))
        .with_queue_binding(QueueBinding::new(queue_name(), "Counting", 1));
    let manager = Manager::new(
        broker.clone(),
        settings,
        HandlerRegistry::new().with_handler("Counting", CountingHandler::default()),
    );

    // Act
    manager.start();

    // Assert
    wait_for_state(&manager, ManagerState::Stopped).await;
    assert_eq!(broker.connection_attempts(), 4);
    assert_eq!(manager.connections_established(), 0);
    // Stopping a manager that gave up is fine.
    manager.stop().await;
}

#[tokio::test]
async fn the_manager_can_be_configured_from_json() {
    // Arrange
    let settings: ManagerSettings = serde_json::from_value(serde_json::json!({
        "reconnect": { "policy": "fixed", "interval_seconds": 0.05 },
        "prefetch_count": "10",
        "queue_bindings": [
            { "queue": "log_queue", "handler": "LogHandler", "concurrency": "3" }
        ]
    }))
    .unwrap();
    let broker = InMemoryBroker::new();
    let manager = Manager::new(
        broker.clone(),
        settings,
        HandlerRegistry::new().with_handler("LogHandler", CountingHandler::default()),
    );

    // Act
    manager.start();
    wait_for_state(&manager, ManagerState::Running).await;
    for _ in 0..100 {
        broker.publish("log_queue", "hello");
    }

    // Assert
    eventually("100 acks", || stats(&broker, "log_queue").acked == 100).await;
    assert_eq!(manager.online_consumers("log_queue"), 3);
    manager.stop().await;
}

#[tokio::test]
async fn state_transitions_can_be_observed() {
    // Arrange
    let broker = InMemoryBroker::new();
    let manager = get_manager(&broker, vec![], HandlerRegistry::new());
    let mut states = manager.subscribe_state();
    assert_eq!(*states.borrow_and_update(), ManagerState::Idle);

    // Act
    manager.start();
    wait_for_state(&manager, ManagerState::Running).await;
    manager.stop().await;

    // Assert
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ManagerState::Stopped);
    // Restarting a stopped manager is not possible.
    manager.start();
    assert_eq!(manager.state(), ManagerState::Stopped);
}
