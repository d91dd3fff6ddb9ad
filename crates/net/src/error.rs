//! Transport error types

use std::io;

/// Transport result type
pub type Result<T> = std::result::Result<T, Error>;

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Client is already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Server is already serving")]
    AlreadyServing,

    #[error("Server is not serving")]
    NotServing,

    #[error("Client {0} does not exist")]
    UnknownClient(usize),

    #[error("Could not resolve address: {0}")]
    InvalidAddress(String),
}
