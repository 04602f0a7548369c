//! The default inbound middleware, mirroring the outbound defaults.
//!
//! In order: [`VerifyCrc32`], [`ContentDecoding`], [`DecodeObject`], [`DecodeString`].
use crate::amqp::convenience::BasicPropertiesExt;
use crate::consumers::Message;
use crate::content::Content;
use crate::pipeline::codec::{codec_names, crc32, Codec, CRC32_HEADER};
use crate::pipeline::{Middleware, MiddlewareError};
use lapin::types::AMQPValue;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::Level;

/// The default inbound middleware, in the order they must run.
pub fn default_middleware() -> Vec<Arc<dyn Middleware<Message>>> {
    vec![
        Arc::new(VerifyCrc32),
        Arc::new(ContentDecoding),
        Arc::new(DecodeObject),
        Arc::new(DecodeString),
    ]
}

/// The CRC-32 of a message payload, stored in the message extensions once verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedCrc32(pub u32);

/// Checks the payload against its `x-crc32` header, when there is one.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyCrc32;

#[async_trait::async_trait]
impl Middleware<Message> for VerifyCrc32 {
    async fn handle(&self, message: &mut Message) -> Result<(), MiddlewareError> {
        let Content::Bytes(bytes) = &message.content else {
            return Ok(());
        };
        let Some(expected) = message
            .properties
            .get_header(CRC32_HEADER)
            .and_then(header_text)
            .map(Cow::into_owned)
        else {
            return Ok(());
        };

        let actual = crc32(bytes);
        if expected.trim() != actual.to_string() {
            let error = MiddlewareError::ChecksumMismatch {
                expected,
                actual,
            };
            message.log(Level::ERROR, error.to_string());
            return Err(error);
        }
        message.set(VerifiedCrc32(actual));
        message.log(
            Level::DEBUG,
            format!("Calculated CRC matches the message header: {actual}"),
        );
        Ok(())
    }
}

fn header_text(value: &AMQPValue) -> Option<Cow<'_, str>> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes())),
        AMQPValue::ShortString(s) => Some(Cow::Borrowed(s.as_str())),
        AMQPValue::LongUInt(n) => Some(Cow::Owned(n.to_string())),
        AMQPValue::LongInt(n) => Some(Cow::Owned(n.to_string())),
        AMQPValue::LongLongInt(n) => Some(Cow::Owned(n.to_string())),
        _ => None,
    }
}

/// Undoes the codecs listed in the `content-encoding` property, right to left.
///
/// An unrecognized codec leaves the payload as it was received.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentDecoding;

#[async_trait::async_trait]
impl Middleware<Message> for ContentDecoding {
    async fn handle(&self, message: &mut Message) -> Result<(), MiddlewareError> {
        let Some(content_encoding) = message
            .properties
            .content_encoding()
            .as_ref()
            .map(|encoding| encoding.as_str().to_owned())
        else {
            return Ok(());
        };
        let destination = message.destination();
        let Content::Bytes(bytes) = &message.content else {
            return Ok(());
        };

        match decode_all(bytes, &content_encoding, &destination)? {
            Decoded::Payload(payload) => {
                message.override_content(payload);
                message.log(
                    Level::DEBUG,
                    format!("Processed content encoding {content_encoding}"),
                );
            }
            Decoded::Unrecognized(name) => {
                message.log(
                    Level::DEBUG,
                    format!("{destination} unrecognized content encoding: {name}"),
                );
            }
        }
        Ok(())
    }
}

enum Decoded {
    Payload(Vec<u8>),
    Unrecognized(String),
}

fn decode_all(
    bytes: &[u8],
    content_encoding: &str,
    destination: &str,
) -> Result<Decoded, MiddlewareError> {
    let mut payload = Cow::Borrowed(bytes);
    for name in codec_names(content_encoding).rev() {
        let Some(codec) = Codec::parse(name) else {
            return Ok(Decoded::Unrecognized(name.to_owned()));
        };
        let decoded = codec
            .decode(&payload)
            .map_err(|source| MiddlewareError::Decompression {
                destination: destination.to_owned(),
                source,
            })?;
        payload = Cow::Owned(decoded);
    }
    Ok(Decoded::Payload(payload.into_owned()))
}

/// Deserializes `application/json` payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeObject;

#[async_trait::async_trait]
impl Middleware<Message> for DecodeObject {
    async fn handle(&self, message: &mut Message) -> Result<(), MiddlewareError> {
        let Some(content_type) = content_type(message)? else {
            return Ok(());
        };
        if content_type.essence_str() != mime::APPLICATION_JSON.essence_str() {
            return Ok(());
        }
        let Content::Bytes(bytes) = &message.content else {
            return Ok(());
        };

        match serde_json::from_slice::<serde_json::Value>(bytes) {
            Ok(value) => {
                message.override_content(value);
                message.log(
                    Level::DEBUG,
                    format!("Transformed to object from {content_type}"),
                );
                Ok(())
            }
            Err(source) => {
                let error = MiddlewareError::Deserialize {
                    destination: message.destination(),
                    source,
                };
                message.log(Level::ERROR, error.to_string());
                Err(error)
            }
        }
    }
}

/// Decodes `text/*` payloads according to their charset, UTF-8 if unspecified.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeString;

#[async_trait::async_trait]
impl Middleware<Message> for DecodeString {
    async fn handle(&self, message: &mut Message) -> Result<(), MiddlewareError> {
        let Some(content_type) = content_type(message)? else {
            return Ok(());
        };
        if content_type.type_() != mime::TEXT {
            return Ok(());
        }
        let Content::Bytes(bytes) = &message.content else {
            return Ok(());
        };

        let charset = content_type
            .get_param(mime::CHARSET)
            .map(|charset| charset.as_str().to_ascii_lowercase())
            .unwrap_or_else(|| "utf-8".to_owned());
        let text = decode_text(bytes, &charset)?;
        message.override_content(text);
        Ok(())
    }
}

fn content_type(message: &Message) -> Result<Option<mime::Mime>, MiddlewareError> {
    message
        .properties
        .content_type()
        .as_ref()
        .map(|content_type| {
            content_type
                .as_str()
                .parse::<mime::Mime>()
                .map_err(|_| MiddlewareError::InvalidContentType(content_type.as_str().to_owned()))
        })
        .transpose()
}

fn decode_text(bytes: &[u8], charset: &str) -> Result<String, MiddlewareError> {
    match charset {
        "utf-8" | "utf8" => {
            String::from_utf8(bytes.to_vec()).map_err(|_| MiddlewareError::Charset {
                charset: charset.to_owned(),
            })
        }
        "us-ascii" | "ascii" => {
            if bytes.is_ascii() {
                Ok(bytes.iter().map(|&b| char::from(b)).collect())
            } else {
                Err(MiddlewareError::Charset {
                    charset: charset.to_owned(),
                })
            }
        }
        "iso-8859-1" | "latin1" | "latin-1" => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
        other => Err(MiddlewareError::UnsupportedCharset(other.to_owned())),
    }
}
