//! Error types for the sync core.
//!
//! Adapters fail with [`StoreError`]. The engine never lets a `StoreError`
//! escape a sync cycle; it classifies it with [`StoreError::class`] and turns it
//! into a per-entry outcome. [`SyncError`] is what the public engine API
//! returns for the few operations that can fail synchronously.

use sea_orm::{DbErr, SqlErr};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::Table;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Network unavailable: {0}")]
    Connectivity(String),

    #[error("Rejected by store: {0}")]
    Validation(String),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Constraint violated: {0}")]
    Constraint(String),

    #[error("Record {1} not found in {0}")]
    NotFound(Table, String),

    #[error("Database error: {0}")]
    Database(DbErr),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// The four failure classes the orchestrator distinguishes when deciding what
/// to do with a failed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// No network. Retry later, nothing is lost.
    Connectivity,
    /// The store rejected the payload. Retried a capped number of times.
    Validation,
    /// The remote copy disagrees with what we expected to exist.
    Conflict,
    /// Local persistence failed.
    Store,
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Connectivity(_) => ErrorClass::Connectivity,
            StoreError::Validation(_) | StoreError::Constraint(_) | StoreError::NotFound(..) => {
                ErrorClass::Validation
            }
            StoreError::Conflict(_) => ErrorClass::Conflict,
            StoreError::Database(_)
            | StoreError::Serialization(_)
            | StoreError::Unsupported(_) => ErrorClass::Store,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        StoreError::Validation(message.into())
    }
}

impl From<DbErr> for StoreError {
    fn from(err: DbErr) -> Self {
        match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(msg)) => StoreError::Conflict(msg),
            Some(SqlErr::ForeignKeyConstraintViolation(msg)) => StoreError::Constraint(msg),
            _ => StoreError::Database(err),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("Invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sync engine is missing its {0}")]
    Incomplete(&'static str),
}
