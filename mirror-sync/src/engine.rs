//! Synchronization engine
//!
//! Moves data between the mirror store and the server:
//! - Download: replace synced records with the server snapshot, keeping
//!   every record that still has unpushed local edits
//! - Upload: push pending records in dependency order, one at a time
//! - Connectivity: follow monitor events and flush on reconnect
//!
//! One sync runs at a time per engine. The lock is process-local; the
//! persisted `sync_status` row only reports what the engine is doing.

use crate::client::{PushAction, ServerEndpoint};
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{PushBody, PushError};
use chrono::{DateTime, Utc};
use mirror_store::{
    ConnectionStatus, EntityKind, EntityRef, MirrorPayload, MirrorRecord, MirrorStore, RecordFilter,
    ReplaceSummary, StoreError, SyncStatus,
};
use std::future::Future;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Why one record was not accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    RejectedByServer(String),
    Network(String),
    /// A referenced record has no server id yet
    UnresolvedReference(String),
    /// Accepted remotely but could not be marked locally
    Storage(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    pub kind: EntityKind,
    pub local_id: Uuid,
    pub reason: FailureReason,
}

/// Outcome of `upload_pending`
#[derive(Debug, Clone, Default)]
pub struct UploadReport {
    pub synced_items: usize,
    pub failures: Vec<RecordFailure>,
    /// Pending changes left after the upload
    pub pending_changes: u64,
}

impl UploadReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of `download_snapshot`
#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    pub replaced: Vec<(EntityKind, ReplaceSummary)>,
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl DownloadReport {
    /// Records written from the snapshot across all kinds
    pub fn downloaded_items(&self) -> u64 {
        self.replaced.iter().map(|(_, summary)| summary.inserted).sum()
    }
}

pub struct SyncEngine {
    store: Arc<MirrorStore>,
    monitor: Arc<ConnectivityMonitor>,
    endpoint: Arc<dyn ServerEndpoint>,
    sync_lock: tokio::sync::Mutex<()>,
    /// Reconnect flushes spawned by the listener
    flushes: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<MirrorStore>,
        monitor: Arc<ConnectivityMonitor>,
        endpoint: Arc<dyn ServerEndpoint>,
    ) -> Self {
        Self {
            store,
            monitor,
            endpoint,
            sync_lock: tokio::sync::Mutex::new(()),
            flushes: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<MirrorStore> {
        &self.store
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    /// Align the persisted status with the monitor and refresh the
    /// pending counter. Called once at startup.
    pub async fn initialize(&self) -> SyncResult<SyncStatus> {
        if self.monitor.is_online() {
            self.store
                .try_transition_status(ConnectionStatus::Offline, ConnectionStatus::Online)
                .await?;
        } else {
            self.store.set_status(ConnectionStatus::Offline).await?;
        }
        self.count_pending_changes().await?;
        Ok(self.store.sync_status().await?)
    }

    pub async fn status(&self) -> SyncResult<SyncStatus> {
        Ok(self.store.sync_status().await?)
    }

    /// Replace the synced part of the mirror with the server snapshot
    pub async fn download_snapshot(&self) -> SyncResult<DownloadReport> {
        if !self.monitor.is_online() {
            return Err(SyncError::Offline);
        }

        let snapshot = self.endpoint.fetch_snapshot().await?;
        let server_timestamp = snapshot.timestamp;
        let batches = snapshot.into_batches();

        self.exclusive(async move {
            let mut report = DownloadReport {
                replaced: Vec::new(),
                server_timestamp,
            };

            report.replaced = self
                .store
                .bulk_replace_all(batches, &RecordFilter::PendingSync)
                .await?;

            self.store.set_last_sync(Utc::now()).await?;
            self.count_pending_changes().await?;

            tracing::info!(downloaded = report.downloaded_items(), "Snapshot downloaded");
            Ok::<_, SyncError>(report)
        })
        .await
    }

    /// Push every pending record to the server
    pub async fn upload_pending(&self) -> SyncResult<UploadReport> {
        if !self.monitor.is_online() {
            return Err(SyncError::Offline);
        }

        let mut pending = Vec::new();
        for kind in EntityKind::ALL {
            let mut records = self.store.query(kind, &RecordFilter::PendingSync).await?;
            if records.is_empty() {
                continue;
            }
            // Oldest first
            records.reverse();
            pending.push((kind, records));
        }

        if pending.is_empty() {
            return Ok(UploadReport {
                pending_changes: self.count_pending_changes().await?,
                ..Default::default()
            });
        }

        self.exclusive(async move {
            let mut report = UploadReport::default();

            for (kind, records) in pending {
                for record in records {
                    match self.push_one(kind, record).await {
                        Ok(()) => report.synced_items += 1,
                        Err(failure) => {
                            tracing::warn!(
                                kind = %failure.kind,
                                local_id = %failure.local_id,
                                reason = ?failure.reason,
                                "Record not synced"
                            );
                            report.failures.push(failure);
                        }
                    }
                }
            }

            if report.synced_items > 0 {
                self.store.set_last_sync(Utc::now()).await?;
            }
            report.pending_changes = self.count_pending_changes().await?;

            tracing::info!(
                synced = report.synced_items,
                failed = report.failures.len(),
                pending = report.pending_changes,
                "Upload finished"
            );
            Ok::<_, SyncError>(report)
        })
        .await
    }

    /// Recompute and persist the number of pending records
    pub async fn count_pending_changes(&self) -> SyncResult<u64> {
        let mut total = 0;
        for kind in EntityKind::ALL {
            total += self.store.count(kind, &RecordFilter::PendingSync).await?;
        }
        self.store.set_pending_changes(total).await?;
        Ok(total)
    }

    /// Store a record created on this device
    pub async fn record_local_create(&self, payload: MirrorPayload) -> SyncResult<MirrorRecord> {
        let kind = payload.kind();
        let record = self.store.put(kind, MirrorRecord::local(payload)).await?;
        self.count_pending_changes().await?;

        tracing::debug!(kind = %kind, local_id = ?record.id.local_id(), "Local record created");
        Ok(record)
    }

    /// Apply a local edit to a stored record
    pub async fn record_local_update(
        &self,
        kind: EntityKind,
        local_id: Uuid,
        payload: MirrorPayload,
    ) -> SyncResult<MirrorRecord> {
        if payload.kind() != kind {
            return Err(SyncError::Store(StoreError::KindMismatch {
                expected: kind,
                actual: payload.kind(),
            }));
        }

        let mut record = self
            .store
            .get(kind, local_id)
            .await?
            .ok_or(SyncError::NotFound { kind, local_id })?;
        record.mark_edited(payload);
        let record = self.store.put(kind, record).await?;
        self.count_pending_changes().await?;

        tracing::debug!(kind = %kind, local_id = %local_id, "Local record updated");
        Ok(record)
    }

    /// Follow monitor events until the channel closes
    pub fn spawn_connectivity_listener(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<ConnectivityEvent>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Connectivity events lagged, using current state");
                        if engine.monitor.is_online() {
                            ConnectivityEvent::BecameOnline
                        } else {
                            ConnectivityEvent::BecameOffline
                        }
                    }
                    Err(RecvError::Closed) => break,
                };

                match event {
                    ConnectivityEvent::BecameOnline => {
                        if let Err(e) = engine.mark_online().await {
                            tracing::error!(error = %e, "Failed to record online status");
                            continue;
                        }
                        // Off the listener task so a later BecameOffline is
                        // recorded without waiting for the upload.
                        let uploader = Arc::clone(&engine);
                        engine.track_flush(tokio::spawn(async move {
                            uploader.flush_after_reconnect().await;
                        }));
                    }
                    ConnectivityEvent::BecameOffline => {
                        if let Err(e) = engine.handle_became_offline().await {
                            tracing::error!(error = %e, "Failed to record offline status");
                        }
                    }
                }
            }
            tracing::debug!("Connectivity listener stopped");
        })
    }

    /// Reconnect handling: mark online, then flush pending records once
    pub async fn handle_became_online(&self) -> SyncResult<UploadReport> {
        self.mark_online().await?;
        self.upload_pending().await
    }

    pub async fn handle_became_offline(&self) -> SyncResult<()> {
        self.store.set_status(ConnectionStatus::Offline).await?;
        tracing::info!("Sync status set to offline");
        Ok(())
    }

    /// Abort reconnect flushes still running. Used on shutdown, before
    /// the store is closed.
    pub fn abort_flushes(&self) {
        let flushes = std::mem::take(&mut *self.flushes.lock());
        for flush in flushes {
            flush.abort();
        }
    }

    fn track_flush(&self, flush: JoinHandle<()>) {
        let mut flushes = self.flushes.lock();
        flushes.retain(|handle| !handle.is_finished());
        flushes.push(flush);
    }

    async fn mark_online(&self) -> SyncResult<()> {
        let moved = self
            .store
            .try_transition_status(ConnectionStatus::Offline, ConnectionStatus::Online)
            .await?;
        if moved {
            tracing::info!("Sync status set to online");
        }
        Ok(())
    }

    async fn flush_after_reconnect(&self) {
        match self.upload_pending().await {
            Ok(report) => {
                tracing::debug!(synced = report.synced_items, "Reconnect flush done");
            }
            Err(SyncError::InProgress) => {
                tracing::debug!("Reconnect flush skipped, sync already running");
            }
            Err(SyncError::Offline) => {
                tracing::debug!("Reconnect flush skipped, offline again");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Reconnect flush failed");
            }
        }
    }

    /// Run `work` holding the sync lock and showing the `syncing` status.
    ///
    /// The lock is independent of the status row: an offline/online flap
    /// rewrites the row mid-sync but never lets a second sync start.
    async fn exclusive<T, F>(&self, work: F) -> SyncResult<T>
    where
        F: Future<Output = SyncResult<T>>,
    {
        let Ok(_running) = self.sync_lock.try_lock() else {
            return Err(SyncError::InProgress);
        };

        // `syncing` seen while holding the lock was left by an aborted sync task
        let acquired = self
            .store
            .try_transition_status(ConnectionStatus::Online, ConnectionStatus::Syncing)
            .await?
            || self
                .store
                .try_transition_status(ConnectionStatus::Syncing, ConnectionStatus::Syncing)
                .await?;
        if !acquired {
            return match self.store.sync_status().await?.status {
                ConnectionStatus::Offline => Err(SyncError::Offline),
                _ => Err(SyncError::InProgress),
            };
        }

        let result = work.await;

        // A BecameOffline during the sync has already written offline; leave it.
        if let Err(e) = self
            .store
            .try_transition_status(ConnectionStatus::Syncing, ConnectionStatus::Online)
            .await
        {
            tracing::error!(error = %e, "Failed to release sync status");
        }

        result
    }

    async fn push_one(&self, kind: EntityKind, record: MirrorRecord) -> Result<(), RecordFailure> {
        let local_id = record.id.local_id().unwrap_or_else(Uuid::nil);
        let fail = |reason: FailureReason| RecordFailure {
            kind,
            local_id,
            reason,
        };

        let payload = self
            .resolve_references(record.payload.clone())
            .await
            .map_err(fail)?;
        let body = PushBody {
            local_id,
            payload: payload
                .to_json()
                .map_err(|e| fail(FailureReason::Storage(e.to_string())))?,
        };
        let action = match record.id.server_id() {
            Some(server_id) => PushAction::Update {
                server_id: server_id.to_string(),
            },
            None => PushAction::Create,
        };

        let ack = self
            .endpoint
            .push_record(kind, &action, &body)
            .await
            .map_err(|e| {
                fail(match e {
                    PushError::Rejected(message) => FailureReason::RejectedByServer(message),
                    PushError::Network(message) => FailureReason::Network(message),
                })
            })?;

        self.confirm_pushed(kind, &record, ack.server_id, payload)
            .await
            .map_err(|e| fail(FailureReason::Storage(e.to_string())))?;

        tracing::debug!(kind = %kind, local_id = %local_id, "Record synced");
        Ok(())
    }

    /// Fill in server ids for references to records created offline
    async fn resolve_references(&self, payload: MirrorPayload) -> Result<MirrorPayload, FailureReason> {
        match payload {
            MirrorPayload::Memo(mut memo) => {
                memo.patient = self.resolve(EntityKind::Patient, memo.patient).await?;
                for line in memo.tests.iter_mut() {
                    line.test = self.resolve(EntityKind::Test, line.test.clone()).await?;
                }
                Ok(MirrorPayload::Memo(memo))
            }
            MirrorPayload::Expense(mut expense) => {
                expense.expense_type = self
                    .resolve(EntityKind::ExpenseType, expense.expense_type)
                    .await?;
                Ok(MirrorPayload::Expense(expense))
            }
            other => Ok(other),
        }
    }

    async fn resolve(&self, kind: EntityKind, reference: EntityRef) -> Result<EntityRef, FailureReason> {
        if reference.server_id.is_some() {
            return Ok(reference);
        }
        let Some(local_id) = reference.local_id else {
            return Err(FailureReason::UnresolvedReference(format!(
                "{} reference is empty",
                kind
            )));
        };

        let target = self
            .store
            .get(kind, local_id)
            .await
            .map_err(|e| FailureReason::Storage(e.to_string()))?;

        match target {
            Some(record) if record.id.server_id().is_some() => Ok(EntityRef::to_record(&record.id)),
            Some(_) => Err(FailureReason::UnresolvedReference(format!(
                "{} {} has not been synced",
                kind, local_id
            ))),
            None => Err(FailureReason::UnresolvedReference(format!(
                "{} {} does not exist",
                kind, local_id
            ))),
        }
    }

    /// Record the server's acceptance. If the record was edited while the
    /// push was in flight, keep it pending so the edit is pushed next time.
    async fn confirm_pushed(
        &self,
        kind: EntityKind,
        pushed: &MirrorRecord,
        server_id: String,
        payload: MirrorPayload,
    ) -> Result<(), StoreError> {
        let Some(local_id) = pushed.id.local_id() else {
            return Ok(());
        };
        let Some(mut current) = self.store.get(kind, local_id).await? else {
            return Ok(());
        };

        if current.last_updated != pushed.last_updated {
            tracing::debug!(kind = %kind, local_id = %local_id, "Edited during push, kept pending");
            current.id = current.id.with_server_id(server_id);
        } else {
            current.payload = payload;
            current.mark_pushed(server_id);
        }

        self.store.put(kind, current).await?;
        Ok(())
    }
}
