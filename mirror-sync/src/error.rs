//! Error types for the sync engine

use mirror_store::{EntityKind, StoreError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Operation requires connectivity")]
    Offline,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid server response: {0}")]
    InvalidResponse(String),

    #[error("Sync integrity error: {0}")]
    SyncIntegrity(String),

    #[error("A sync is already in progress")]
    InProgress,

    #[error("No {kind} record with local id {local_id}")]
    NotFound { kind: EntityKind, local_id: Uuid },

    #[error("Storage error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SyncIntegrity(message) => SyncError::SyncIntegrity(message),
            other => SyncError::Store(other),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::InvalidResponse(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
