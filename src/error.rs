//! Custom error types for quarry

use thiserror::Error;

/// Planning failures. Always fatal for the whole statement.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("cyclic step dependency involving step {0}")]
    Cyclic(usize),

    #[error("unsatisfiable pushdown: {0}")]
    UnsatisfiablePushdown(String),

    #[error("unknown column: {0}")]
    UnknownColumn(String),

    #[error("ambiguous column: {0}")]
    AmbiguousColumn(String),

    #[error("invalid statement: {0}")]
    InvalidStatement(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Sub-kinds of adapter failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    Connection,
    Auth,
    Timeout,
    Schema,
    Other,
}

impl SourceErrorKind {
    /// Connection drops and timeouts are worth another attempt
    pub fn is_transient(self) -> bool {
        matches!(self, SourceErrorKind::Connection | SourceErrorKind::Timeout)
    }
}

impl std::fmt::Display for SourceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceErrorKind::Connection => write!(f, "connection"),
            SourceErrorKind::Auth => write!(f, "auth"),
            SourceErrorKind::Timeout => write!(f, "timeout"),
            SourceErrorKind::Schema => write!(f, "malformed schema"),
            SourceErrorKind::Other => write!(f, "other"),
        }
    }
}

/// Main error type for quarry operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown relation: {0}")]
    UnknownRelation(String),

    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Source error ({kind}): {message}")]
    Source {
        kind: SourceErrorKind,
        message: String,
    },

    #[error("Inference error: {message}")]
    Inference { retryable: bool, message: String },

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Statement timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Statement cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Qdrant error: {0}")]
    Qdrant(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn source_failure(kind: SourceErrorKind, message: impl Into<String>) -> Self {
        Error::Source {
            kind,
            message: message.into(),
        }
    }

    pub fn inference_transient(message: impl Into<String>) -> Self {
        Error::Inference {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn inference_permanent(message: impl Into<String>) -> Self {
        Error::Inference {
            retryable: false,
            message: message.into(),
        }
    }

    /// Whether a retry with backoff may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Source { kind, .. } => kind.is_transient(),
            Error::Inference { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

/// Result type alias for quarry
pub type Result<T> = std::result::Result<T, Error>;

/// Convert qdrant errors
impl From<qdrant_client::QdrantError> for Error {
    fn from(err: qdrant_client::QdrantError) -> Self {
        Error::Qdrant(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::source_failure(SourceErrorKind::Timeout, "slow").is_transient());
        assert!(Error::source_failure(SourceErrorKind::Connection, "reset").is_transient());
        assert!(!Error::source_failure(SourceErrorKind::Auth, "denied").is_transient());
        assert!(Error::inference_transient("503").is_transient());
        assert!(!Error::inference_permanent("401").is_transient());
        assert!(!Error::Execution("boom".to_string()).is_transient());
    }

    #[test]
    fn test_plan_error_display() {
        let err: Error = PlanError::Cyclic(3).into();
        assert_eq!(err.to_string(), "Plan error: cyclic step dependency involving step 3");
    }
}
