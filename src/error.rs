use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::lifecycle::IndexState;

#[derive(Error, Debug)]
pub enum SiftError {
    // Configuration errors
    #[error("config error: {0}")]
    Config(String),

    #[error("no search engine registered under '{name}' (available: {available})")]
    UnknownEngine { name: String, available: String },

    // Schema errors
    #[error("schema error: {0}")]
    Schema(String),

    // Index errors
    #[error("index not found: {index}")]
    IndexNotFound { index: String },

    #[error("index already exists: {index}")]
    IndexAlreadyExists { index: String },

    #[error("invalid transition for index {index}: {from} -> {to}")]
    InvalidTransition {
        index: String,
        from: IndexState,
        to: IndexState,
    },

    #[error("document {id} not found in index {index}")]
    DocumentNotFound { index: String, id: String },

    // Write errors
    #[error(transparent)]
    Bulk(#[from] BulkOperationError),

    // Backend errors
    #[error("search backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("search backend rejected request ({status}): {reason}")]
    Backend { status: u16, reason: String },

    // Validation errors
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    // Serialization errors
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),

    // IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SiftError>;

impl SiftError {
    pub fn status_code(&self) -> u16 {
        match self {
            SiftError::IndexNotFound { .. } | SiftError::DocumentNotFound { .. } => 404,

            SiftError::IndexAlreadyExists { .. } | SiftError::InvalidTransition { .. } => 409,

            SiftError::Schema(_)
            | SiftError::DimensionMismatch { .. }
            | SiftError::Validation(_)
            | SiftError::InvalidQuery(_) => 400,

            SiftError::Bulk(_) => 207,

            SiftError::BackendUnavailable(_) => 503,

            _ => 500,
        }
    }

    /// Whether the caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SiftError::BackendUnavailable(_))
    }
}

/// Operation carried by one bulk action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkOperation {
    Index,
    Update,
    Delete,
}

impl std::fmt::Display for BulkOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BulkOperation::Index => write!(f, "index"),
            BulkOperation::Update => write!(f, "update"),
            BulkOperation::Delete => write!(f, "delete"),
        }
    }
}

/// One document that could not be written. `status` is `None` when the
/// document was rejected locally and never reached the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkItemFailure {
    pub id: Uuid,
    pub operation: BulkOperation,
    pub status: Option<u16>,
    pub reason: String,
    /// Raw error object as returned by the backend.
    pub error: serde_json::Value,
}

/// Aggregate of every per-document failure from one bulk call. The documents
/// not listed here were written.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("bulk operation on {index} failed for {} of {attempted} documents", .failures.len())]
pub struct BulkOperationError {
    pub index: String,
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<BulkItemFailure>,
}

impl BulkOperationError {
    pub fn failed_ids(&self) -> Vec<Uuid> {
        self.failures.iter().map(|f| f.id).collect()
    }

    /// The raw backend error objects, one per failure.
    pub fn raw_errors(&self) -> Vec<serde_json::Value> {
        self.failures.iter().map(|f| f.error.clone()).collect()
    }
}
