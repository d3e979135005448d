use thiserror::Error;

/// Failures surfaced to the user of a raw channel
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("raw channel is closed")]
    Closed,
    #[error("raw channel was aborted: {0}")]
    Aborted(String),
    #[error("block {requested} was requested for re-sending, but it is no longer retained")]
    OutOfWindow { requested: u64 },
    #[error("the connection carrying the raw channel is gone")]
    ConnectionGone,
    #[error("block {0} was not acknowledged by the peer")]
    NotAcknowledged(u64),
    #[error("invalid compressed data: {0}")]
    Compression(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
