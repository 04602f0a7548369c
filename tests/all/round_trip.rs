use crate::helpers::{loopback_broker, next_event, transient_queue};
use hutch::amqp::BasicProperties;
use hutch::consumers::{ConsumeOptions, ConsumerEvent};
use hutch::Content;
use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Greeting {
    greeting: String,
}

async fn consume_one(broker: &hutch::Broker, queue: &str) -> hutch::consumers::Message {
    let consumer = broker
        .create_consumer()
        .use_default_middleware(true)
        .build();
    let options = ConsumeOptions {
        no_ack: true,
        ..ConsumeOptions::default()
    };
    let mut deliveries = consumer.consume(queue, options).await.unwrap();
    match next_event(&mut deliveries).await {
        Some(ConsumerEvent::Message(message)) => message,
        other => panic!("Expected a message, got {other:?}"),
    }
}

#[tokio::test]
async fn text_round_trip() {
    let (broker, _loopback) = loopback_broker();
    let queue = transient_queue(&broker).await;

    broker
        .send_to_queue(&queue, "world!", BasicProperties::default())
        .await
        .unwrap();
    let message = consume_one(&broker, &queue).await;

    assert_eq!(message.content, Content::Text("world!".into()));
    assert_eq!(message.fields.routing_key.as_str(), queue);
}

#[tokio::test]
async fn object_round_trip() {
    let (broker, loopback) = loopback_broker();
    let queue = transient_queue(&broker).await;
    let greeting = Greeting {
        greeting: "Hello".into(),
    };

    broker
        .send_to_queue(
            &queue,
            Content::json(&greeting).unwrap(),
            BasicProperties::default(),
        )
        .await
        .unwrap();
    assert_eq!(
        loopback.payloads(&queue),
        vec![br#"{"greeting":"Hello"}"#.to_vec()]
    );
    let message = consume_one(&broker, &queue).await;

    let received: Greeting = message.content.deserialize().unwrap().unwrap();
    assert_eq!(received, greeting);
}

#[tokio::test]
async fn compressed_round_trip() {
    let (broker, loopback) = loopback_broker();
    let queue = transient_queue(&broker).await;
    let payload: Vec<u8> = (0..4096u32).map(|n| (n % 7) as u8).collect();

    broker
        .send_to_queue(
            &queue,
            payload.clone(),
            BasicProperties::default().with_content_encoding("gzip, deflate".into()),
        )
        .await
        .unwrap();
    let wire = loopback.payloads(&queue).remove(0);
    assert_ne!(wire, payload);
    assert!(wire.len() < payload.len());
    let message = consume_one(&broker, &queue).await;

    assert_eq!(message.content, Content::Bytes(payload));
}
