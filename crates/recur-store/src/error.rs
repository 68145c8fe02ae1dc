use thiserror::Error;

/// Errors that can occur within the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A JSON column could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// No run with the given ID exists in the store.
    #[error("Run not found: {id}")]
    RunNotFound { id: String },

    /// A stored value could not be mapped back to its type.
    #[error("Corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Database(_) => "STORE_ERROR",
            StoreError::Serialization(_) => "SERIALIZATION_ERROR",
            StoreError::JobNotFound { .. } => "JOB_NOT_FOUND",
            StoreError::RunNotFound { .. } => "RUN_NOT_FOUND",
            StoreError::Corrupt { .. } => "CORRUPT_ROW",
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
