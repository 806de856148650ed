//! Error types for the local proxy core

use std::io;
use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bind error: {0}")]
    Bind(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// AEAD tag mismatch, duplicate salt or malformed length record.
    /// Surfaced to the user as a single "invalid password or cipher" line.
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn bind<S: Into<String>>(msg: S) -> Self {
        Error::Bind(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn dns<S: Into<String>>(msg: S) -> Self {
        Error::Dns(msg.into())
    }

    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Error::Connection(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn crypto<S: Into<String>>(msg: S) -> Self {
        Error::Crypto(msg.into())
    }

    pub fn address<S: Into<String>>(msg: S) -> Self {
        Error::Address(msg.into())
    }

    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Whether this error terminates a single connection rather than the
    /// process. Only startup-phase errors are fatal.
    pub fn is_connection_scoped(&self) -> bool {
        !matches!(self, Error::Config(_) | Error::Bind(_))
    }

    /// AEAD failure, in either its native form or round-tripped through an
    /// io::Error inside a stream adapter.
    pub fn is_invalid_frame(&self) -> bool {
        match self {
            Error::InvalidFrame(_) => true,
            Error::Io(e) => e.kind() == io::ErrorKind::InvalidData,
            _ => false,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        match e {
            Error::Io(err) => err,
            Error::InvalidFrame(msg) => io::Error::new(io::ErrorKind::InvalidData, msg),
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::protocol("bad header");
        assert_eq!(e.to_string(), "Protocol error: bad header");
    }

    #[test]
    fn test_connection_scoped() {
        assert!(Error::InvalidFrame("tag mismatch").is_connection_scoped());
        assert!(Error::timeout("idle").is_connection_scoped());
        assert!(!Error::config("unknown cipher").is_connection_scoped());
        assert!(!Error::bind("address in use").is_connection_scoped());
    }

    #[test]
    fn test_invalid_frame_to_io() {
        let io_err: io::Error = Error::InvalidFrame("duplicate salt").into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);
    }
}
