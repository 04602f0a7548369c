/// Why a middleware refused to let a value through the pipeline.
///
/// Errors are returned to the caller as-is: they are never retried and never swallowed.
#[derive(thiserror::Error, Debug)]
pub enum MiddlewareError {
    #[error("Unrecognized content encoding: {0}")]
    UnknownEncoding(String),
    #[error("Failed to compress the message payload")]
    Compression(#[source] std::io::Error),
    #[error("`{destination}` unexpected error decompressing message")]
    Decompression {
        destination: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Calculated CRC doesn't match the message header: got {actual}, expected {expected}")]
    ChecksumMismatch { expected: String, actual: u32 },
    #[error("Failed to serialize the message payload as JSON")]
    Serialize(#[source] serde_json::Error),
    #[error("`{destination}` unexpected error deserializing JSON data")]
    Deserialize {
        destination: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("`{0}` is not a valid content type")]
    InvalidContentType(String),
    #[error("Unsupported charset: {0}")]
    UnsupportedCharset(String),
    #[error("The payload is not valid {charset}")]
    Charset { charset: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
