/// A caller supplied an argument that cannot be used.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("destination (string | string[]) is required")]
    MissingDestination,
    #[error("`{uri}` is not a valid AMQP uri: {reason}")]
    InvalidUri { uri: String, reason: String },
}
