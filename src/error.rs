//! Error taxonomy for the matrix pipeline
//!
//! Only genuine failures live here. An incomplete commit is reported through
//! `CommitReport::complete`, a division guard yields `None`, and an opening
//! stamp race is tolerated without surfacing anything.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Live snapshot did not arrive within the configured budget
    #[error("Snapshot provider timed out after {0:?}")]
    ProviderTimeout(Duration),

    /// An expected relation (or upstream source) is missing
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("Unknown matrix type: {0}")]
    UnknownMatrixType(String),

    #[error("Schema directory not found: {0}")]
    SchemaDirMissing(String),

    #[error("Store connection lock poisoned")]
    LockPoisoned,
}

pub type MatrixResult<T> = Result<T, MatrixError>;
