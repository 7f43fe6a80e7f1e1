//! Storage error types.

use thiserror::Error;
use uuid::Uuid;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}. Run from repo root or services/allocator.")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// A unique field is already taken.
    #[error("{entity} with {field} {value} already exists")]
    Duplicate {
        entity: &'static str,
        field: &'static str,
        value: String,
    },

    /// The targeted record does not exist.
    #[error("{entity} {identity} could not be found")]
    NotFound {
        entity: &'static str,
        identity: String,
    },

    /// An in-progress operation holds the node lock.
    #[error("node {node} is locked by {lock}")]
    NodeLocked { node: Uuid, lock: String },

    /// A stored row could not be decoded.
    #[error("corrupt {entity} row: {message}")]
    Corrupt {
        entity: &'static str,
        message: String,
    },
}
