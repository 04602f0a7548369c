//! Against a live broker, see [`get_rabbitmq_settings`].
use crate::helpers::{get_rabbitmq_settings, next_event};
use hutch::amqp::configuration::ConnectTarget;
use hutch::amqp::options::{QueueDeclareOptions, QueueDeleteOptions};
use hutch::amqp::BasicProperties;
use hutch::consumers::{ConsumeOptions, ConsumerEvent};
use hutch::lifecycle::{EventKind, EventSource};
use hutch::{Broker, Content};

fn broker() -> Broker {
    Broker::from_target(&ConnectTarget::from(get_rabbitmq_settings())).unwrap()
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ"]
async fn publish_and_consume() {
    let broker = broker();
    let queue = broker
        .assert_queue(
            "",
            QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..QueueDeclareOptions::default()
            },
        )
        .await
        .unwrap()
        .name;

    broker
        .send_to_queue(&queue, "world!", BasicProperties::default())
        .await
        .unwrap();
    let consumer = broker
        .create_consumer()
        .use_default_middleware(true)
        .build();
    let mut deliveries = consumer
        .consume(&queue, ConsumeOptions::default())
        .await
        .unwrap();
    let Some(ConsumerEvent::Message(mut message)) = next_event(&mut deliveries).await else {
        panic!("Expected a message");
    };
    assert_eq!(message.content, Content::Text("world!".into()));
    message.ack(false).await.unwrap();

    consumer.close().await.unwrap();
    broker
        .delete_queue(&queue, QueueDeleteOptions::default())
        .await
        .unwrap();
    broker.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ"]
async fn a_missing_queue_only_costs_the_channel() {
    let broker = broker();
    let connection = broker.connect().await.unwrap();
    let mut events = broker.subscribe();

    assert!(broker.check_queue("hutch-does-not-exist").await.is_err());

    // The close of the channel is reported from the driver's own task.
    let event = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.kind == EventKind::Close {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event.source, EventSource::Channel);
    assert!(!connection.is_closed());
    assert!(!broker.channel(false).await.unwrap().is_closed());
    broker.close().await.unwrap();
}
