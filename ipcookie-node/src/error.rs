use ipcookie_common::WireError;
use thiserror::Error;

/// Errors that can occur in the IP cookie node library
///
/// Untrusted protocol input never ends up here: malformed or forged control
/// messages are discarded by the handlers and reported as outcomes.
#[derive(Error, Debug)]
pub enum CookieError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Secret management error
    #[error("Secret error: {0}")]
    Secret(String),

    /// Network I/O error
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Control message transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Control message could not be decoded
    #[error("Wire format error: {0}")]
    Wire(#[from] WireError),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias using CookieError
pub type Result<T> = std::result::Result<T, CookieError>;

impl From<String> for CookieError {
    fn from(s: String) -> Self {
        CookieError::Other(s)
    }
}

impl From<&str> for CookieError {
    fn from(s: &str) -> Self {
        CookieError::Other(s.to_string())
    }
}

impl From<config::ConfigError> for CookieError {
    fn from(err: config::ConfigError) -> Self {
        CookieError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CookieError::Config("cache capacity must be non-zero".to_string());
        assert_eq!(err.to_string(), "Configuration error: cache capacity must be non-zero");
    }

    #[test]
    fn test_error_from_string() {
        let err: CookieError = "test error".into();
        assert!(matches!(err, CookieError::Other(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "raw socket");
        let err: CookieError = io_err.into();
        assert!(matches!(err, CookieError::Io(_)));
    }

    #[test]
    fn test_wire_error_conversion() {
        let err: CookieError = WireError::Truncated(4).into();
        assert!(matches!(err, CookieError::Wire(WireError::Truncated(4))));
        assert!(err.to_string().starts_with("Wire format error"));
    }
}
