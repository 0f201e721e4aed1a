// SPDX-License-Identifier: MIT
//
// SceyeFi: Eye-Fi Card Upload Server

//! Error types for the Eye-Fi protocol
//!
//! Provides a unified error taxonomy using `thiserror`. Framing errors raised
//! inside `Read` implementations travel as `io::Error` values wrapping an
//! [`Error`]; the `From<io::Error>` conversion unwraps them again so `?`
//! restores the original variant.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for Eye-Fi operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed multipart or archive framing
    #[error("Stream format error: {0}")]
    StreamFormat(String),

    /// No card registered under the given MAC address
    #[error("Card not found: {0}")]
    CardNotFound(String),

    /// Credential supplied by the card did not match
    #[error("Authentication failed")]
    Authentication,

    /// Integrity digest asserted by the card differs from the computed one
    #[error("Integrity digest mismatch: expected {expected}, actual {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    /// Unknown action, missing fields or missing parts
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Charset named in a content type is not supported
    #[error("Unsupported charset: {0}")]
    UnsupportedCharset(String),

    /// SOAP envelope could not be read or written
    #[error("XML error: {0}")]
    Xml(String),

    /// Upload sink failure
    #[error("Sink error: {0}")]
    Sink(String),

    /// Configuration validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network communication failed
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl Error {
    /// Check if error is transient and retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout)
    }

    /// Check if error indicates authentication failure
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Error::Authentication)
    }

    /// Wrap this error into an `io::Error` so it can cross a `Read` boundary
    pub(crate) fn into_io(self) -> io::Error {
        let kind = match self {
            Error::Timeout => io::ErrorKind::TimedOut,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, self)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.get_ref().map_or(false, |inner| inner.is::<Error>()) {
            let kind = e.kind();
            return match e.into_inner().map(|inner| inner.downcast::<Error>()) {
                Some(Ok(err)) => *err,
                _ => Error::Io(io::Error::from(kind)),
            };
        }
        match e.kind() {
            io::ErrorKind::TimedOut => Error::Timeout,
            io::ErrorKind::UnexpectedEof => {
                Error::StreamFormat("unexpected end of stream".to_string())
            }
            _ => Error::Io(e),
        }
    }
}

impl From<quick_xml::Error> for Error {
    fn from(e: quick_xml::Error) -> Self {
        Error::Xml(e.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::Protocol(format!("Invalid hex: {}", e))
    }
}
