//! Error types for the mirror store

use crate::models::EntityKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    #[error("Sync integrity error: {0}")]
    SyncIntegrity(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Record kind mismatch: table {expected}, payload {actual}")]
    KindMismatch {
        expected: EntityKind,
        actual: EntityKind,
    },

    #[error("Unsupported schema version {found} for {kind} (latest known: {supported})")]
    SchemaVersion {
        kind: EntityKind,
        found: u32,
        supported: u32,
    },

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
