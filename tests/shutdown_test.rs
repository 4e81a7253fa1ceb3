//! 关闭协调器集成测试

use std::sync::Arc;
use std::time::Duration;

use flare_mq_client::{
    Consumer, ConsumerPhase, ConsumerSettings, ExponentialBackoffPolicy, InMemoryBroker, Producer,
    ProducerSettings, RetryPolicy, RuntimeConfig, ShutdownCoordinator, handler_fn,
};
use serde_json::{Value, json};

fn policy() -> Arc<dyn RetryPolicy> {
    Arc::new(
        ExponentialBackoffPolicy::new(Duration::from_millis(50), Duration::from_secs(1), 2.0)
            .with_max_retries(3),
    )
}

fn coordinator() -> ShutdownCoordinator {
    ShutdownCoordinator::new(RuntimeConfig::new().with_shutdown_timeout(Duration::from_secs(2)))
}

#[tokio::test(start_paused = true)]
async fn shutdown_disconnects_producer_and_consumer() {
    let broker = InMemoryBroker::new();
    broker.create_topic("notifications", 2);
    let coordinator = coordinator();

    let producer = Producer::new(
        broker.producer_connector(),
        policy(),
        coordinator.scheduler(),
        ProducerSettings {
            default_topic: Some("notifications".to_string()),
            ..Default::default()
        },
    );
    let consumer = Consumer::new(
        broker.consumer_connector("notifier"),
        policy(),
        coordinator.scheduler(),
        ConsumerSettings::default(),
    );
    coordinator.register(producer.clone());
    coordinator.register(consumer.clone());

    let mut phases = consumer.phase_changes();
    let task = {
        let consumer = consumer.clone();
        let handler = handler_fn(|_: Value| async { Ok(()) });
        tokio::spawn(async move { consumer.run("notifications", handler).await })
    };
    phases.wait_for(|phase| *phase == ConsumerPhase::Running).await.unwrap();
    producer.send("", &json!({ "user": 42 })).await.unwrap();

    let report = coordinator.shutdown().await;

    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.outcomes.len(), 2);
    assert!(report.outcomes.iter().all(|outcome| matches!(outcome.result, Some(Ok(())))));
    assert!(!producer.is_active());
    assert!(!consumer.is_active());
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn failed_disconnect_still_closes_remaining_handles() {
    let broker = InMemoryBroker::new();
    broker.create_topic("notifications", 1);
    let coordinator = coordinator();

    let first = Producer::new(
        broker.producer_connector(),
        policy(),
        coordinator.scheduler(),
        ProducerSettings::default(),
    );
    let second = Producer::new(
        broker.producer_connector(),
        policy(),
        coordinator.scheduler(),
        ProducerSettings::default(),
    );
    first.connect().await.unwrap();
    second.connect().await.unwrap();
    coordinator.register(first.clone());
    coordinator.register(second.clone());

    broker.fail_next_disconnect();
    let report = coordinator.shutdown().await;

    assert_eq!(report.exit_code(), 1);
    assert!(report.outcomes[0].is_failure());
    assert!(!report.outcomes[1].is_failure());
    assert_eq!(broker.disconnect_calls(), 2);
    assert!(!first.is_active());
    assert!(!second.is_active());
}

#[tokio::test]
async fn inactive_handles_are_skipped() {
    let broker = InMemoryBroker::new();
    let coordinator = coordinator();
    let producer = Producer::new(
        broker.producer_connector(),
        policy(),
        coordinator.scheduler(),
        ProducerSettings::default(),
    );
    coordinator.register(producer);

    let report = coordinator.shutdown().await;

    assert_eq!(report.exit_code(), 0);
    assert!(report.outcomes[0].result.is_none());
    assert_eq!(broker.disconnect_calls(), 0);
}

#[tokio::test]
async fn trigger_cancels_pending_connects() {
    let broker = InMemoryBroker::new();
    broker.create_topic("notifications", 1);
    let coordinator = coordinator();
    let producer = Producer::new(
        broker.producer_connector(),
        policy(),
        coordinator.scheduler(),
        ProducerSettings::default(),
    );

    coordinator.trigger();
    assert!(coordinator.is_triggered());

    let err = producer.connect().await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(broker.connect_calls(), 0);
}
