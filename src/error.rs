//! Error types for the chatrelay library.

use std::io;
use std::str::Utf8Error;

/// Result type alias for chatrelay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur during protocol operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("UTF-8 decoding error: {0}")]
    Utf8(#[from] Utf8Error),

    #[error("Base64 decoding error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Invalid auth mode: {0}")]
    InvalidAuthMode(String),

    #[error("Malformed auth request")]
    MalformedAuth,

    #[error("Malformed message")]
    MalformedMessage,

    #[error("Malformed file message")]
    MalformedFileMessage,

    #[error("Unknown message tag: {0}")]
    UnknownMessageTag(String),
}
