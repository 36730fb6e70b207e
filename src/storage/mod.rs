//! Storage shared by the inbound pipeline.
//!
//! The inbound log and the chunk store each define a backend trait; this
//! module holds their common error type and the optional SQLite backends.

#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteChunkStore, SqliteInboundLog};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing table or collection does not exist. Not retryable.
    #[error("Storage resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Errors that no amount of retrying will fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::ResourceNotFound(_))
    }
}
