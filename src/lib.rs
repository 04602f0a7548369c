//! `hutch` manages the lifecycle of AMQP resources on top of [`lapin`], to make it easy and
//! ergonomic to publish to and consume from RabbitMQ.
//!
//! A [`Broker`](crate::broker::Broker) owns one connection and up to two channels, opened on
//! demand and replaced transparently once closed. [`Publisher`](crate::publishers::Publisher)s
//! and [`Consumer`](crate::consumers::Consumer)s get their channel from it and run every
//! payload through an ordered [middleware pipeline](crate::pipeline): the defaults encode text
//! and JSON, apply the codecs listed in `content-encoding` and guard the payload with a CRC-32.
//!
//! Teardown flows downward: closing a broker closes its publisher, its channels, then its
//! connection. Failures flow upward: the driver reporting a channel or connection closed
//! releases everything built on top of it, and the next operation opens fresh resources.
//!
//! ```rust
//! use futures_util::StreamExt;
//! use hutch::amqp::configuration::ConnectTarget;
//! use hutch::amqp::BasicProperties;
//! use hutch::broker::Broker;
//! use hutch::consumers::{ConsumeOptions, ConsumerEvent};
//!
//! async fn example() -> anyhow::Result<()> {
//!     let broker = Broker::from_target(&ConnectTarget::default())?;
//!     broker
//!         .publish("tasks:high,low", serde_json::json!({ "greeting": "Hello" }), BasicProperties::default())
//!         .await?;
//!
//!     let consumer = broker.create_consumer().use_default_middleware(true).build();
//!     let mut deliveries = consumer
//!         .consume("high", ConsumeOptions { no_ack: true, ..Default::default() })
//!         .await?;
//!     if let Some(ConsumerEvent::Message(message)) = deliveries.next().await {
//!         println!("{:?}", message.content.as_json());
//!     }
//!
//!     consumer.close().await?;
//!     broker.close().await?;
//!     Ok(())
//! }
//! ```

pub mod amqp;
pub mod broker;
pub mod consumers;
pub mod content;
pub mod destinations;
pub mod error;
pub mod lifecycle;
pub mod pipeline;
pub mod publishers;
pub mod transport;

pub use broker::{Broker, BrokerOptions, Channel, ChannelProvider, Connection};
pub use content::Content;
pub use destinations::{parse_destinations, Destination};
pub use error::ArgumentError;
