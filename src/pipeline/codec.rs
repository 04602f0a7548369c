//! Content codecs shared by the outbound and inbound default middleware.
use flate2::{
    read::{GzDecoder, ZlibDecoder},
    write::{GzEncoder, ZlibEncoder},
    Compression,
};
use std::io::{self, Read, Write};

/// Header carrying the CRC-32 of the payload, as a decimal string.
pub const CRC32_HEADER: &str = "x-crc32";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Codec {
    Gzip,
    /// zlib-wrapped deflate.
    Deflate,
    Identity,
}

impl Codec {
    pub(crate) fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "gzip" => Some(Self::Gzip),
            "deflate" => Some(Self::Deflate),
            "identity" => Some(Self::Identity),
            _ => None,
        }
    }

    pub(crate) fn encode(self, payload: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(payload)?;
                encoder.finish()
            }
            Self::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(payload)?;
                encoder.finish()
            }
            Self::Identity => Ok(payload.to_vec()),
        }
    }

    pub(crate) fn decode(self, payload: &[u8]) -> io::Result<Vec<u8>> {
        let mut decoded = Vec::new();
        match self {
            Self::Gzip => GzDecoder::new(payload).read_to_end(&mut decoded)?,
            Self::Deflate => ZlibDecoder::new(payload).read_to_end(&mut decoded)?,
            Self::Identity => return Ok(payload.to_vec()),
        };
        Ok(decoded)
    }
}

/// The codec names listed in a `content-encoding` value, in application order.
pub(crate) fn codec_names(content_encoding: &str) -> impl DoubleEndedIterator<Item = &str> {
    content_encoding
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
}

pub(crate) fn crc32(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}
