//! The default outbound middleware.
//!
//! In order: [`EncodeString`], [`EncodeObject`], [`ContentEncoding`], [`Crc32Checksum`]. The
//! checksum is computed last, over the bytes that actually go on the wire.
use crate::amqp::convenience::set_header;
use crate::content::Content;
use crate::pipeline::codec::{codec_names, crc32, Codec, CRC32_HEADER};
use crate::pipeline::{Middleware, MiddlewareError};
use crate::publishers::PublishOp;
use lapin::types::AMQPValue;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::Level;

const TEXT_PLAIN: &str = "text/plain";
const APPLICATION_JSON: &str = "application/json";

/// The default outbound middleware, in the order they must run.
pub fn default_middleware() -> Vec<Arc<dyn Middleware<PublishOp>>> {
    vec![
        Arc::new(EncodeString),
        Arc::new(EncodeObject),
        Arc::new(ContentEncoding),
        Arc::new(Crc32Checksum),
    ]
}

/// Turns text into UTF-8 bytes, labelling it `text/plain` unless a content type is already set.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeString;

#[async_trait::async_trait]
impl Middleware<PublishOp> for EncodeString {
    async fn handle(&self, op: &mut PublishOp) -> Result<(), MiddlewareError> {
        if let Content::Text(text) = &mut op.content {
            op.content = Content::Bytes(std::mem::take(text).into_bytes());
            if op.content_type().is_none() {
                op.properties = std::mem::take(&mut op.properties).with_content_type(TEXT_PLAIN.into());
            }
        }
        Ok(())
    }
}

/// Serializes structured content as JSON and labels it `application/json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeObject;

#[async_trait::async_trait]
impl Middleware<PublishOp> for EncodeObject {
    async fn handle(&self, op: &mut PublishOp) -> Result<(), MiddlewareError> {
        if let Content::Json(value) = &op.content {
            let bytes = serde_json::to_vec(value).map_err(MiddlewareError::Serialize)?;
            op.content = Content::Bytes(bytes);
            op.properties =
                std::mem::take(&mut op.properties).with_content_type(APPLICATION_JSON.into());
        }
        Ok(())
    }
}

/// Applies the codecs listed in the `content-encoding` property, left to right.
///
/// Supports `gzip`, `deflate` and `identity`; anything else fails the publish.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentEncoding;

#[async_trait::async_trait]
impl Middleware<PublishOp> for ContentEncoding {
    async fn handle(&self, op: &mut PublishOp) -> Result<(), MiddlewareError> {
        let Some(content_encoding) = op.content_encoding().map(str::to_owned) else {
            return Ok(());
        };
        let Content::Bytes(bytes) = &mut op.content else {
            return Ok(());
        };

        let mut payload = Cow::Borrowed(bytes.as_slice());
        for name in codec_names(&content_encoding) {
            let codec =
                Codec::parse(name).ok_or_else(|| MiddlewareError::UnknownEncoding(name.to_owned()))?;
            payload = Cow::Owned(codec.encode(&payload).map_err(MiddlewareError::Compression)?);
        }
        let encoded = payload.into_owned();
        *bytes = encoded;
        op.log
            .push(Level::DEBUG, format!("Encoded content as {content_encoding}"));
        Ok(())
    }
}

/// Attaches the CRC-32 of the payload as the `x-crc32` header.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32Checksum;

#[async_trait::async_trait]
impl Middleware<PublishOp> for Crc32Checksum {
    async fn handle(&self, op: &mut PublishOp) -> Result<(), MiddlewareError> {
        if let Content::Bytes(bytes) = &op.content {
            let checksum = crc32(bytes);
            op.properties = set_header(
                std::mem::take(&mut op.properties),
                CRC32_HEADER,
                AMQPValue::LongString(checksum.to_string().into()),
            );
            op.log.push(Level::DEBUG, format!("CRC-32 {checksum}"));
        }
        Ok(())
    }
}
