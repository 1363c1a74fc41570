//! The crate-wide error type.
//!
//! Submodules define their own narrower error enums and convert into this
//! one with `#[from]`, following the same "one flat top-level error, narrow
//! ones underneath" shape used throughout the engine.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("hash pipeline error: {0}")]
    Hash(#[from] crate::hash::Error),

    #[error("hub protocol error: {0}")]
    Hub(#[from] crate::hub::Error),

    #[error("peer protocol error: {0}")]
    Peer(#[from] crate::peer::Error),

    #[error("share error: {0}")]
    Share(#[from] crate::share::Error),

    #[error("queue error: {0}")]
    Queue(#[from] crate::queue::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] crate::crypto::Error),

    #[error("invalid id: {0}")]
    InvalidId(&'static str),

    #[error("channel closed")]
    ChannelClosed,
}
