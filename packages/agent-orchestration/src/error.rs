use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("State error: {0}")]
    State(#[from] agent_state::StateError),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Lock acquisition timed out: {0}")]
    LockTimeout(String),

    #[error("Throttle admission timed out after {0}ms")]
    ThrottleTimeout(u64),

    #[error("Worker failed: {0}")]
    WorkerFailed(String),

    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported config version: found {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
}

impl OrchestratorError {
    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    /// Failure class used for logging and retry decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchestratorError::LockTimeout(_)
            | OrchestratorError::ThrottleTimeout(_)
            | OrchestratorError::Timeout(_)
            | OrchestratorError::WorkerFailed(_)
            | OrchestratorError::WorkerPanicked(_)
            | OrchestratorError::CommandFailed(_) => ErrorCategory::Transient,
            OrchestratorError::State(_) | OrchestratorError::Io(_) => {
                ErrorCategory::Infrastructure
            }
            OrchestratorError::InvalidStateTransition { .. }
            | OrchestratorError::Parse(_)
            | OrchestratorError::Config(_)
            | OrchestratorError::UnsupportedVersion { .. } => ErrorCategory::Permanent,
        }
    }
}

impl From<serde_yaml::Error> for OrchestratorError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Parse(format!("YAML: {}", e))
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Transient error - item is retried on the next run (timeout, worker error)
    Transient,
    /// Permanent error - don't retry (invalid input, bad configuration)
    Permanent,
    /// Infrastructure error - state directory or persistence problems
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(OrchestratorError::parse(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_roundtrip() {
        for category in &[
            ErrorCategory::Transient,
            ErrorCategory::Permanent,
            ErrorCategory::Infrastructure,
        ] {
            let s = category.as_str();
            let parsed = ErrorCategory::from_str(s).unwrap();
            assert_eq!(*category, parsed);
        }
    }

    #[test]
    fn test_error_category_invalid() {
        assert!(ErrorCategory::from_str("invalid").is_err());
    }

    #[test]
    fn test_timeouts_are_transient() {
        assert_eq!(
            OrchestratorError::LockTimeout("a.py".into()).category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            OrchestratorError::ThrottleTimeout(50).category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            OrchestratorError::Config("bad".into()).category(),
            ErrorCategory::Permanent
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(
            OrchestratorError::from(io).category(),
            ErrorCategory::Infrastructure
        );
    }

    #[test]
    fn test_malformed_yaml_is_a_permanent_parse_error() {
        let yaml = serde_yaml::from_str::<serde_yaml::Value>("a: [1, 2").unwrap_err();
        let err = OrchestratorError::from(yaml);
        assert!(matches!(err, OrchestratorError::Parse(ref msg) if msg.starts_with("YAML: ")));
        assert_eq!(err.category(), ErrorCategory::Permanent);
    }
}
