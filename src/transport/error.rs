/// Failures reported by the AMQP driver.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Amqp(#[from] lapin::Error),
    #[error("The {0} is closed")]
    Closed(&'static str),
    #[error("Timed out while trying to connect to the broker")]
    Timeout,
    #[error("The broker returned {0} published message(s) as unroutable")]
    Unconfirmed(usize),
    #[error("The broker nacked {0} published message(s)")]
    NegativeAck(usize),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
