//! Error types for Recollect

use thiserror::Error;

/// Main error type for Recollect operations
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Backend I/O or index failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// A fact referenced an entity that does not exist in the graph
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// Malformed output from a generation capability or model
    #[error("Generation parse error: {0}")]
    GenerationParse(String),

    /// A reranker backend could not be loaded
    #[error("Model load error: {0}")]
    ModelLoad(String),

    /// Failure during a consolidation pass (wraps generation/storage failures)
    #[error("Consolidation error: {0}")]
    Consolidation(String),

    /// Bad caller input (hop count 0, confidence outside [0, 1], ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// A deadline elapsed before the operation completed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Embedding generation errors
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Generation capability errors (transport, API status)
    #[error("Generation error: {0}")]
    Generation(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl MemoryError {
    /// Whether a background consolidation pass may retry after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MemoryError::Generation(_)
                | MemoryError::GenerationParse(_)
                | MemoryError::Consolidation(_)
                | MemoryError::Timeout(_)
                | MemoryError::Embedding(_)
        )
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(e: serde_json::Error) -> Self {
        MemoryError::Serialization(e.to_string())
    }
}

/// Result type alias for Recollect operations
pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MemoryError::EntityNotFound("Paris".to_string());
        assert_eq!(err.to_string(), "Entity not found: Paris");

        let err = MemoryError::Validation("max_hops must be at least 1".to_string());
        assert_eq!(
            err.to_string(),
            "Validation error: max_hops must be at least 1"
        );
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(MemoryError::GenerationParse("bad json".into()).is_recoverable());
        assert!(MemoryError::Generation("503".into()).is_recoverable());
        assert!(!MemoryError::Validation("bad".into()).is_recoverable());
        assert!(!MemoryError::EntityNotFound("x".into()).is_recoverable());
    }

    #[test]
    fn test_serde_json_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: MemoryError = parse.unwrap_err().into();
        assert!(matches!(err, MemoryError::Serialization(_)));
    }
}
