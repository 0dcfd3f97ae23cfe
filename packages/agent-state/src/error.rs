//! Error types for agent-state

use std::fmt;
use thiserror::Error;

/// State error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Serialization/deserialization errors
    Serialization,
    /// Backing document exists but cannot be interpreted
    Corrupted,
    /// I/O errors (read, write, rename, remove)
    IO,
    /// Store is misconfigured (e.g. path has no parent directory)
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Serialization => "serialization",
            ErrorKind::Corrupted => "corrupted",
            ErrorKind::IO => "io",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// State error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StateError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StateError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // Convenience constructors
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn corrupted(location: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Corrupted,
            format!("State document is corrupted: {}", location.into()),
        )
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IO, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }
}

impl From<std::io::Error> for StateError {
    fn from(err: std::io::Error) -> Self {
        StateError::io(format!("I/O error: {}", err)).with_source(err)
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_error_display() {
        let err = StateError::corrupted("/tmp/state.json");
        let msg = format!("{}", err);
        assert!(msg.starts_with("[corrupted]"));
        assert!(msg.contains("/tmp/state.json"));
    }

    #[test]
    fn test_io_error_conversion_keeps_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StateError = io_err.into();

        assert_eq!(err.kind, ErrorKind::IO);
        assert!(err.message.contains("denied"));
        assert!(err.source().unwrap().to_string().contains("denied"));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json")
            .err()
            .unwrap();
        let err: StateError = json_err.into();

        assert_eq!(err.kind, ErrorKind::Serialization);
        assert!(err.message.contains("JSON error"));
        assert!(err.source.is_some());
    }

    #[test]
    fn test_error_kind_as_str() {
        assert_eq!(ErrorKind::Serialization.as_str(), "serialization");
        assert_eq!(ErrorKind::Corrupted.as_str(), "corrupted");
        assert_eq!(ErrorKind::IO.as_str(), "io");
        assert_eq!(ErrorKind::Config.as_str(), "config");
    }
}
