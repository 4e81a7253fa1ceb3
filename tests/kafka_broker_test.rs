//! Kafka 集成测试
//!
//! 这些测试需要运行中的 Kafka 实例以及已创建的 topic。
//! 默认情况下，测试会被忽略，需要使用
//! `cargo test --features kafka --test kafka_broker_test -- --ignored` 运行。
//!
//! 启动 Kafka：
//! ```bash
//! docker run -d --name kafka-test -p 9092:9092 apache/kafka:3.7.0
//! docker exec kafka-test /opt/kafka/bin/kafka-topics.sh \
//!   --bootstrap-server localhost:9092 --create --topic flare-mq-test --partitions 3
//! ```

#![cfg(feature = "kafka")]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use flare_mq_client::{
    Consumer, ConsumerPhase, ErrorCode, KafkaConsumerConnector, KafkaProducerConnector,
    MessagingConfig, Producer, RetryScheduler, handler_fn,
};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

/// 测试 topic
const TEST_TOPIC: &str = "flare-mq-test";

/// Kafka 地址，可以通过环境变量 KAFKA_BROKERS 覆盖
fn test_config() -> MessagingConfig {
    let mut config = MessagingConfig::default();
    config.brokers = std::env::var("KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string());
    config.group_id = format!("flare-mq-test-{}", uuid::Uuid::new_v4());
    config.topic_probe_attempts = 3;
    config.topic_probe_delay.0 = Duration::from_millis(500);
    config.max_retries = 3;
    config
}

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    seq: u64,
    nonce: String,
}

#[tokio::test]
#[ignore]
async fn produce_then_consume_round_trip() {
    let config = Arc::new(test_config());
    let scheduler = RetryScheduler::new();
    let nonce = uuid::Uuid::new_v4().to_string();

    let producer = Producer::new(
        KafkaProducerConnector::new(config.clone()),
        config.shared_retry_policy(),
        &scheduler,
        config.producer_settings(),
    );
    let first = producer
        .send_keyed(TEST_TOPIC, Some(&nonce), &Ping { seq: 1, nonce: nonce.clone() })
        .await
        .unwrap();
    let second = producer
        .send_keyed(TEST_TOPIC, Some(&nonce), &Ping { seq: 2, nonce: nonce.clone() })
        .await
        .unwrap();
    assert_eq!(first.partition, second.partition);
    assert!(second.offset > first.offset);

    let consumer = Consumer::new(
        KafkaConsumerConnector::new(config.clone()),
        config.shared_retry_policy(),
        &scheduler,
        config.consumer_settings(),
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = Arc::clone(&seen);
        let nonce = nonce.clone();
        handler_fn(move |ping: Ping| {
            let seen = Arc::clone(&seen);
            let nonce = nonce.clone();
            async move {
                if ping.nonce == nonce {
                    seen.lock().unwrap().push(ping.seq);
                }
                Ok(())
            }
        })
    };
    let task = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.run(TEST_TOPIC, handler).await })
    };

    for _ in 0..300 {
        if seen.lock().unwrap().len() >= 2 {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);

    consumer.shutdown(Duration::from_secs(10)).await.unwrap();
    producer.disconnect().await.unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(consumer.phase(), ConsumerPhase::Idle);
}

#[tokio::test]
#[ignore]
async fn missing_topic_is_fatal() {
    let config = Arc::new(test_config());
    let consumer = Consumer::new(
        KafkaConsumerConnector::new(config.clone()),
        config.shared_retry_policy(),
        &RetryScheduler::new(),
        config.consumer_settings(),
    );

    let topic = format!("flare-mq-missing-{}", uuid::Uuid::new_v4());
    let err = consumer
        .run(&topic, handler_fn(|_: Ping| async { Ok(()) }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TopicNotFound);
}

#[tokio::test]
#[ignore]
async fn unreachable_broker_exhausts_retry_budget() {
    let mut config = test_config();
    config.brokers = "127.0.0.1:1".to_string();
    let config = Arc::new(config);

    let producer = Producer::new(
        KafkaProducerConnector::new(config.clone()),
        config.shared_retry_policy(),
        &RetryScheduler::new(),
        config.producer_settings(),
    );
    let err = producer.connect().await.unwrap_err();
    assert!(err.is_fatal());
}
