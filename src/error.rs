use std::io;
use thiserror::Error;

use crate::core::GuardError;

/// Unified error type for the proxy node
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error during relay
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid instance settings or handler construction failure
    #[error("Configuration error: {0}")]
    Config(String),

    /// Short read, AEAD authentication failure or malformed framing
    #[error("Decode error: {0}")]
    Decode(String),

    /// Protocol violation detected after a successful decode
    #[error("Validation error: {0}")]
    Validation(String),

    /// Dial or resolve failure towards the target
    #[error("Connect error: {0}")]
    Connect(String),

    /// Request header not received in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Admission guard management error
    #[error("Admission error: {0}")]
    Guard(#[from] GuardError),
}

/// Result alias used across the core
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    pub fn config(msg: impl Into<String>) -> Self {
        ProxyError::Config(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        ProxyError::Decode(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ProxyError::Validation(msg.into())
    }

    pub fn connect(msg: impl Into<String>) -> Self {
        ProxyError::Connect(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: ProxyError = io_err.into();
        let display = format!("{}", err);
        assert!(display.contains("IO error"));
        assert!(display.contains("file not found"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ProxyError::config("missing vless id");
        let display = format!("{}", err);
        assert!(display.contains("Configuration error"));
        assert!(display.contains("missing vless id"));
    }

    #[test]
    fn test_decode_error_display() {
        let err = ProxyError::decode("authentication failed");
        assert_eq!(format!("{}", err), "Decode error: authentication failed");
    }

    #[test]
    fn test_validation_error_display() {
        let err = ProxyError::validation("unsupported version 1");
        assert!(format!("{}", err).contains("unsupported version 1"));
    }

    #[test]
    fn test_connect_error_display() {
        let err = ProxyError::connect("connection refused");
        let display = format!("{}", err);
        assert!(display.contains("Connect error"));
        assert!(display.contains("connection refused"));
    }

    #[test]
    fn test_guard_error_conversion() {
        let err: ProxyError = GuardError::InvalidAddress("nope".to_string()).into();
        assert!(matches!(err, ProxyError::Guard(GuardError::InvalidAddress(_))));
        assert!(format!("{}", err).contains("nope"));
    }

    #[test]
    fn test_error_debug() {
        let err = ProxyError::Config("test".to_string());
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("Config"));
        assert!(debug_str.contains("test"));
    }
}
