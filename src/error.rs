//! Error types for the onboarding service.

use std::time::Duration;

/// Top-level error type for the service binary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Integration error: {0}")]
    Integration(#[from] IntegrationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Failures talking to the external ticketing system.
#[derive(Debug, thiserror::Error)]
pub enum IntegrationError {
    /// The ticketing system answered with a non-success status.
    #[error("Ticketing request failed with status {status}: {body}")]
    Http { status: u16, body: String },

    /// No answer at all: timeout, refused connection, DNS failure.
    #[error("No response from ticketing system ({reason})")]
    NoResponse { reason: String },

    #[error("Ticketing timed out after {0:?}")]
    Timeout(Duration),

    /// The client could not even build the request.
    #[error("Ticketing setup error: {0}")]
    Setup(String),

    #[error("Invalid response from ticketing system: {0}")]
    InvalidResponse(String),
}

impl IntegrationError {
    /// Short machine-readable tag telling "rejected" apart from "unreachable".
    pub fn kind(&self) -> &'static str {
        match self {
            IntegrationError::Http { .. } => "integration_rejected",
            IntegrationError::NoResponse { .. } | IntegrationError::Timeout(_) => {
                "integration_unreachable"
            }
            IntegrationError::Setup(_) => "integration_setup",
            IntegrationError::InvalidResponse(_) => "integration_invalid_response",
        }
    }
}

/// Errors surfaced by the onboarding engine and the automated task executor.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Task {task_id} is a {actual} task; this operation requires an automated access request")]
    InvalidTaskKind { task_id: String, actual: String },

    #[error("Integration failure: {0}")]
    IntegrationFailure(#[from] IntegrationError),

    #[error("Transaction failed: {0}")]
    TransactionFailure(#[from] DatabaseError),

    #[error("Validation failed: {0}")]
    ValidationFailure(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::ValidationFailure(message.into())
    }
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integration_kinds_distinguish_rejected_from_unreachable() {
        let rejected = IntegrationError::Http {
            status: 400,
            body: "bad field".into(),
        };
        let unreachable = IntegrationError::Timeout(Duration::from_secs(30));
        assert_eq!(rejected.kind(), "integration_rejected");
        assert_eq!(unreachable.kind(), "integration_unreachable");
        assert_eq!(
            IntegrationError::Setup("no url".into()).kind(),
            "integration_setup"
        );
    }

    #[test]
    fn startup_failures_convert_into_the_top_level_error() {
        fn open() -> Result<()> {
            Err(DatabaseError::Pool("unable to open database file".into()))?
        }
        let err = open().unwrap_err();
        assert!(matches!(err, Error::Database(_)));
        assert!(err.to_string().starts_with("Database error"));
    }

    #[test]
    fn database_errors_become_transaction_failures() {
        let err: EngineError = DatabaseError::Query("disk I/O error".into()).into();
        assert!(matches!(err, EngineError::TransactionFailure(_)));
        assert!(err.to_string().contains("disk I/O error"));
    }
}
