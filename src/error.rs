//! Error types for dossier-core.

use thiserror::Error;

/// Result type alias using dossier-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a research run.
#[derive(Error, Debug)]
pub enum Error {
    /// LLM API error
    #[error("LLM API error: {provider} - {message}")]
    LlmApi { provider: String, message: String },

    /// LLM error (simple variant)
    #[error("LLM error: {0}")]
    Llm(String),

    /// LLM output failed schema validation after repair retries
    #[error("LLM output failed schema validation after {attempts} attempts: {message}")]
    SchemaValidation { attempts: u32, message: String },

    /// Timeout during operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Budget exhausted; no further paid work is admitted
    #[error("Budget exhausted: {resource}")]
    BudgetExhausted { resource: String },

    /// Run cancelled (user, time, or cost)
    #[error("Run cancelled: {reason}")]
    Cancelled { reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source adapter failed structural validation at registration
    #[error("Source registration error for '{source_id}': {message}")]
    Registration { source_id: String, message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error while writing run artifacts
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an LLM API error.
    pub fn llm_api(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LlmApi {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a budget exhausted error.
    pub fn budget_exhausted(resource: impl Into<String>) -> Self {
        Self::BudgetExhausted {
            resource: resource.into(),
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create a schema validation error.
    pub fn schema_validation(attempts: u32, message: impl Into<String>) -> Self {
        Self::SchemaValidation {
            attempts,
            message: message.into(),
        }
    }

    /// Create a source registration error.
    pub fn registration(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Registration {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    /// Whether this error is the hard budget sentinel.
    pub fn is_budget_exhausted(&self) -> bool {
        matches!(self, Self::BudgetExhausted { .. })
    }

    /// Whether this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_constructors() {
        let err = Error::llm_api("anthropic", "overloaded");
        assert!(err.to_string().contains("anthropic"));

        let err = Error::budget_exhausted("cost");
        assert!(err.is_budget_exhausted());
        assert!(!err.is_cancelled());

        let err = Error::cancelled("time");
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_schema_validation_message() {
        let err = Error::schema_validation(3, "missing field 'action'");
        let msg = err.to_string();
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("action"));
    }
}
