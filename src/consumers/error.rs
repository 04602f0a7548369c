use crate::pipeline::MiddlewareError;
use crate::transport::TransportError;

/// Returned by [`Consumer`](crate::consumers::Consumer) operations.
#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("The consumer is already consuming with tag `{0}`")]
    AlreadyConsuming(String),
    #[error("The consumer is closed")]
    Closed,
}

/// Returned when acknowledging a [`Message`](crate::consumers::Message) fails.
#[derive(thiserror::Error, Debug)]
pub enum AckError {
    #[error("Invalid state; channel closed")]
    ChannelClosed,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A delivery the inbound middleware refused.
///
/// `message` is left as the middleware that ran before the failure shaped it. Whether to ack,
/// nack or reject it is up to the caller.
#[derive(Debug)]
pub struct FailedMessage {
    pub error: MiddlewareError,
    pub message: super::Message,
}
