//! Facilities to consume messages from a queue. Check out [`Consumer`] as a starting point.
//!
//! ```rust
//! use futures_util::StreamExt;
//! use hutch::broker::Broker;
//! use hutch::consumers::{ConsumeOptions, ConsumerEvent};
//!
//! async fn example(broker: Broker) -> anyhow::Result<()> {
//!     let consumer = broker
//!         .create_consumer()
//!         .use_default_middleware(true)
//!         .build();
//!     let mut deliveries = consumer.consume("tasks", ConsumeOptions::default()).await?;
//!
//!     while let Some(event) = deliveries.next().await {
//!         match event {
//!             ConsumerEvent::Message(mut message) => {
//!                 println!("{:?}", message.content);
//!                 message.ack(false).await?;
//!             }
//!             ConsumerEvent::MessageError(failed) => {
//!                 let mut message = failed.message;
//!                 message.reject(false).await?;
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```
mod consumer;
mod consumer_middleware;
mod error;
mod message;

pub use consumer::{
    ConsumeOptions, Consumer, ConsumerBuilder, ConsumerEvent, ConsumerState, Deliveries,
};
pub use consumer_middleware::{
    default_middleware, ContentDecoding, DecodeObject, DecodeString, VerifiedCrc32, VerifyCrc32,
};
pub use error::{AckError, ConsumerError, FailedMessage};
pub use message::{AckState, DeliveryFields, Message};
