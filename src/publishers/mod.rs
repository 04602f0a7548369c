//! Facilities to publish messages. Check out [`Publisher`] as a starting point.
mod backpressure;
mod publish_op;
mod publisher;
mod publisher_middleware;

pub use publish_op::PublishOp;
pub use publisher::{Publisher, PublisherBuilder, PublisherError, PublisherSettings};
pub use publisher_middleware::{
    default_middleware, ContentEncoding, Crc32Checksum, EncodeObject, EncodeString,
};
