//! On-device mirror store for Labdesk
//!
//! Provides:
//! - SQLite tables mirroring server entities (patients, memos, expense
//!   types, tests, assets, expenses) with sync bookkeeping
//! - Transactional bulk replace for snapshot downloads
//! - The sync status row and persisted device flags
//! - Storage for cached offline identities

pub mod error;
pub mod models;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use models::{
    AssetSnapshot, ConnectionStatus, DeviceFlag, EntityKind, EntityRef, ExpenseSnapshot,
    ExpenseTypeSnapshot, MemoSnapshot, MemoTestLine, MirrorPayload, MirrorRecord, PatientSnapshot,
    RecordFilter, RecordId, SyncStatus, TestSnapshot, SCHEMA_VERSION,
};
pub use store::{MirrorStore, ReplaceSummary, StoreConfig};
