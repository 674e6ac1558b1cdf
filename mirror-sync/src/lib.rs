//! Offline synchronization for Labdesk
//!
//! Keeps the on-device mirror store in step with the server:
//! - `connectivity`: effective online/offline state and transition events
//! - `protocol`: wire shapes of the `/api/offline-sync` routes
//! - `client`: the server endpoint seam and its HTTP implementation
//! - `engine`: snapshot download, pending upload and reconnect handling

pub mod client;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod protocol;

pub use client::{HttpServerEndpoint, PushAction, ServerEndpoint, SyncConfig};
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, ConnectivityState};
pub use engine::{DownloadReport, FailureReason, RecordFailure, SyncEngine, UploadReport};
pub use error::{SyncError, SyncResult};
pub use protocol::{PushAck, PushBody, PushError, SnapshotData, SNAPSHOT_PAGE_SIZE};
