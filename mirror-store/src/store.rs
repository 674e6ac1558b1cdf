//! Local SQLite mirror store
//!
//! Provides:
//! - One table per mirrored entity kind, keyed by local id
//! - Transactional bulk replace for snapshot downloads
//! - The singleton sync status row
//! - Device flags and cached offline identities

use crate::error::{StoreError, StoreResult};
use crate::models::{
    ConnectionStatus, DeviceFlag, EntityKind, MirrorPayload, MirrorRecord, RecordFilter, RecordId,
    SyncStatus, SCHEMA_VERSION,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use uuid::Uuid;

/// Configuration for the mirror store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the database file
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Whether to enable WAL mode
    #[serde(default = "default_true")]
    pub enable_wal: bool,
}

fn default_db_path() -> String {
    "labdesk_mirror.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_connections: default_max_connections(),
            enable_wal: true,
        }
    }
}

/// Outcome of a `bulk_replace`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceSummary {
    pub removed: u64,
    pub inserted: u64,
    /// Incoming records shadowed by a kept local row
    pub skipped: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Upsert,
    Insert,
}

/// Mirror store handle
pub struct MirrorStore {
    pool: SqlitePool,
}

impl MirrorStore {
    /// Open (creating if needed) the mirror database
    pub async fn open(config: StoreConfig) -> StoreResult<Self> {
        let journal_mode = if config.enable_wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.db_path))?
            .create_if_missing(true)
            .journal_mode(journal_mode)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        store.recover_interrupted_sync().await?;

        tracing::debug!(db_path = %config.db_path, "Mirror store opened");
        Ok(store)
    }

    async fn initialize_schema(&self) -> StoreResult<()> {
        for kind in EntityKind::ALL {
            let table = kind.table_name();
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    local_id TEXT PRIMARY KEY,
                    server_id TEXT,
                    schema_version INTEGER NOT NULL,
                    payload TEXT NOT NULL,
                    synced INTEGER NOT NULL DEFAULT 0,
                    pending_sync INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    last_updated TEXT NOT NULL
                )
                "#
            ))
            .execute(&self.pool)
            .await?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_pending ON {table}(pending_sync)"
            ))
            .execute(&self.pool)
            .await?;
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_server ON {table}(server_id)"
            ))
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_status (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                status TEXT NOT NULL,
                last_sync TEXT,
                pending_changes INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO sync_status (id, status, pending_changes) VALUES (1, 'offline', 0)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS offline_users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                first_name TEXT,
                last_name TEXT,
                role TEXT NOT NULL,
                last_updated TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_offline_users_email ON offline_users(email)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS device_flags (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// A process that died mid-sync leaves `syncing` behind; release it.
    async fn recover_interrupted_sync(&self) -> StoreResult<()> {
        let result = sqlx::query("UPDATE sync_status SET status = 'online' WHERE id = 1 AND status = 'syncing'")
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            tracing::warn!("Released sync status left over from an interrupted sync");
        }
        Ok(())
    }

    /// Insert or update a record, keyed by its local id.
    ///
    /// A `Remote` id is given the local id of the row already holding that
    /// server id, or a fresh one. Returns the record as stored.
    pub async fn put(&self, kind: EntityKind, record: MirrorRecord) -> StoreResult<MirrorRecord> {
        ensure_kind(kind, &record)?;

        let mut record = record;
        if record.id.local_id().is_none() {
            let existing = match record.id.server_id() {
                Some(server_id) => self.local_id_for_server(kind, server_id).await?,
                None => None,
            };
            record.id = record.id.with_local_id(existing.unwrap_or_else(Uuid::new_v4));
        }

        write_row(&self.pool, kind, &record, WriteMode::Upsert).await?;

        tracing::debug!(
            kind = %kind,
            local_id = ?record.id.local_id(),
            pending_sync = record.pending_sync,
            "Stored mirror record"
        );

        Ok(record)
    }

    /// Fetch a record by local id
    pub async fn get(&self, kind: EntityKind, local_id: Uuid) -> StoreResult<Option<MirrorRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} WHERE local_id = ?",
            kind.table_name()
        ))
        .bind(local_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| decode_row(kind, &row)).transpose()
    }

    /// All records of `kind` matching `filter`, most recently updated first
    pub async fn query(&self, kind: EntityKind, filter: &RecordFilter) -> StoreResult<Vec<MirrorRecord>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE {} ORDER BY last_updated DESC, local_id ASC",
            kind.table_name(),
            filter.sql_clause()
        );
        let rows = bind_filter(sqlx::query(&sql), filter)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(|row| decode_row(kind, row)).collect()
    }

    /// Number of records of `kind` matching `filter`
    pub async fn count(&self, kind: EntityKind, filter: &RecordFilter) -> StoreResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {} WHERE {}",
            kind.table_name(),
            filter.sql_clause()
        );
        let row = bind_filter(sqlx::query(&sql), filter)
            .fetch_one(&self.pool)
            .await?;

        let n: i64 = row.try_get("n")?;
        Ok(u64::try_from(n).unwrap_or_default())
    }

    /// Atomically delete every row of `kind` not matching `keep`, then
    /// insert `records`.
    ///
    /// Incoming records whose server id belongs to a kept row are skipped.
    /// Replaced rows hand their local id to the incoming record with the
    /// same server id. On any failure the transaction is rolled back and
    /// `SyncIntegrity` is returned.
    pub async fn bulk_replace(
        &self,
        kind: EntityKind,
        records: Vec<MirrorRecord>,
        keep: &RecordFilter,
    ) -> StoreResult<ReplaceSummary> {
        let mut summaries = self.bulk_replace_all(vec![(kind, records)], keep).await?;
        Ok(summaries.pop().map(|(_, summary)| summary).unwrap_or_default())
    }

    /// `bulk_replace` for several kinds inside one transaction: either
    /// every kind is replaced or none is.
    pub async fn bulk_replace_all(
        &self,
        batches: Vec<(EntityKind, Vec<MirrorRecord>)>,
        keep: &RecordFilter,
    ) -> StoreResult<Vec<(EntityKind, ReplaceSummary)>> {
        for (kind, records) in &batches {
            for record in records {
                ensure_kind(*kind, record)?;
            }
        }

        // Dropping `tx` without commit rolls everything back.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| rolled_back("snapshot replace", e))?;

        let mut summaries = Vec::with_capacity(batches.len());
        for (kind, records) in batches {
            let summary = match replace_kind(&mut tx, kind, records, keep).await {
                Ok(summary) => summary,
                Err(StoreError::Unavailable(err)) => {
                    return Err(rolled_back(&format!("replace of {}", kind.table_name()), err));
                }
                Err(other) => return Err(other),
            };
            tracing::debug!(
                kind = %kind,
                removed = summary.removed,
                inserted = summary.inserted,
                skipped = summary.skipped,
                "Replaced mirror records"
            );
            summaries.push((kind, summary));
        }

        tx.commit()
            .await
            .map_err(|e| rolled_back("snapshot replace", e))?;
        Ok(summaries)
    }

    async fn local_id_for_server(&self, kind: EntityKind, server_id: &str) -> StoreResult<Option<Uuid>> {
        let row = sqlx::query(&format!(
            "SELECT local_id FROM {} WHERE server_id = ? LIMIT 1",
            kind.table_name()
        ))
        .bind(server_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let local_id: String = row.try_get("local_id")?;
                Ok(Some(parse_uuid(&local_id)?))
            }
            None => Ok(None),
        }
    }

    /// Read the sync status row
    pub async fn sync_status(&self) -> StoreResult<SyncStatus> {
        let row = sqlx::query("SELECT status, last_sync, pending_changes FROM sync_status WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;

        let status: String = row.try_get("status")?;
        let last_sync: Option<String> = row.try_get("last_sync")?;
        let pending_changes: i64 = row.try_get("pending_changes")?;

        Ok(SyncStatus {
            status: status.parse()?,
            last_sync: last_sync.as_deref().map(parse_timestamp).transpose()?,
            pending_changes: u64::try_from(pending_changes).unwrap_or_default(),
        })
    }

    /// Move the status from `from` to `to` only if it currently is `from`.
    ///
    /// Returns whether the transition happened.
    pub async fn try_transition_status(&self, from: ConnectionStatus, to: ConnectionStatus) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE sync_status SET status = ? WHERE id = 1 AND status = ?")
            .bind(to.as_str())
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Overwrite the whole status row
    pub async fn write_sync_status(&self, status: &SyncStatus) -> StoreResult<()> {
        sqlx::query("UPDATE sync_status SET status = ?, last_sync = ?, pending_changes = ? WHERE id = 1")
            .bind(status.status.as_str())
            .bind(status.last_sync.map(format_timestamp))
            .bind(i64::try_from(status.pending_changes).unwrap_or(i64::MAX))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Unconditionally set the status
    pub async fn set_status(&self, to: ConnectionStatus) -> StoreResult<()> {
        sqlx::query("UPDATE sync_status SET status = ? WHERE id = 1")
            .bind(to.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_pending_changes(&self, pending: u64) -> StoreResult<()> {
        sqlx::query("UPDATE sync_status SET pending_changes = ? WHERE id = 1")
            .bind(i64::try_from(pending).unwrap_or(i64::MAX))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_last_sync(&self, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE sync_status SET last_sync = ? WHERE id = 1")
            .bind(format_timestamp(at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Read a device flag
    pub async fn flag(&self, flag: DeviceFlag) -> StoreResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM device_flags WHERE key = ?")
            .bind(flag.key())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| row.try_get::<String, _>("value"))
            .transpose()
            .map_err(StoreError::from)
    }

    pub async fn set_flag(&self, flag: DeviceFlag, value: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO device_flags (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(flag.key())
        .bind(value)
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_flag(&self, flag: DeviceFlag) -> StoreResult<()> {
        sqlx::query("DELETE FROM device_flags WHERE key = ?")
            .bind(flag.key())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Get database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close database connections
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn rolled_back(what: &str, err: sqlx::Error) -> StoreError {
    tracing::error!(error = %err, "{} rolled back", what);
    StoreError::SyncIntegrity(format!("{} rolled back: {}", what, err))
}

async fn replace_kind(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    records: Vec<MirrorRecord>,
    keep: &RecordFilter,
) -> StoreResult<ReplaceSummary> {
    let table = kind.table_name();
    let clause = keep.sql_clause();
    let mut summary = ReplaceSummary::default();

    let kept_sql = format!(
        "SELECT server_id FROM {table} WHERE COALESCE(({clause}), 0) AND server_id IS NOT NULL"
    );
    let kept: HashSet<String> = bind_filter(sqlx::query(&kept_sql), keep)
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(|row| row.try_get::<String, _>("server_id"))
        .collect::<Result<_, _>>()?;

    let replaced_sql = format!(
        "SELECT local_id, server_id FROM {table} WHERE NOT COALESCE(({clause}), 0) AND server_id IS NOT NULL"
    );
    let mut reusable: HashMap<String, Uuid> = HashMap::new();
    for row in bind_filter(sqlx::query(&replaced_sql), keep)
        .fetch_all(&mut *conn)
        .await?
    {
        let local_id: String = row.try_get("local_id")?;
        let server_id: String = row.try_get("server_id")?;
        reusable.insert(server_id, parse_uuid(&local_id)?);
    }

    let delete_sql = format!("DELETE FROM {table} WHERE NOT COALESCE(({clause}), 0)");
    summary.removed = bind_filter(sqlx::query(&delete_sql), keep)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    let mut seen: HashSet<String> = HashSet::new();
    for mut record in records {
        if let Some(server_id) = record.id.server_id() {
            if kept.contains(server_id) || !seen.insert(server_id.to_string()) {
                summary.skipped += 1;
                continue;
            }
        }

        if record.id.local_id().is_none() {
            let local = record
                .id
                .server_id()
                .and_then(|server_id| reusable.get(server_id).copied())
                .unwrap_or_else(Uuid::new_v4);
            record.id = record.id.with_local_id(local);
        }

        write_row(&mut *conn, kind, &record, WriteMode::Insert).await?;
        summary.inserted += 1;
    }

    Ok(summary)
}

const COLUMNS: &str = "local_id, server_id, schema_version, payload, synced, pending_sync, last_updated";

fn ensure_kind(kind: EntityKind, record: &MirrorRecord) -> StoreResult<()> {
    let actual = record.kind();
    if actual != kind {
        return Err(StoreError::KindMismatch { expected: kind, actual });
    }
    Ok(())
}

fn bind_filter<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    filter: &'q RecordFilter,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match filter.bind_value() {
        Some(value) => query.bind(value),
        None => query,
    }
}

async fn write_row<'e, E>(executor: E, kind: EntityKind, record: &MirrorRecord, mode: WriteMode) -> StoreResult<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let local_id = record
        .id
        .local_id()
        .ok_or_else(|| StoreError::Corrupt("record has no local id".to_string()))?;

    let conflict = match mode {
        WriteMode::Upsert => {
            r#"
            ON CONFLICT(local_id) DO UPDATE SET
                server_id = excluded.server_id,
                schema_version = excluded.schema_version,
                payload = excluded.payload,
                synced = excluded.synced,
                pending_sync = excluded.pending_sync,
                created_at = excluded.created_at,
                last_updated = excluded.last_updated
            "#
        }
        WriteMode::Insert => "",
    };

    let sql = format!(
        r#"
        INSERT INTO {} (
            local_id, server_id, schema_version, payload,
            synced, pending_sync, created_at, last_updated
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        {}
        "#,
        kind.table_name(),
        conflict
    );

    sqlx::query(&sql)
        .bind(local_id.to_string())
        .bind(record.id.server_id())
        .bind(i64::from(SCHEMA_VERSION))
        .bind(record.payload.to_json()?.to_string())
        .bind(record.synced)
        .bind(record.pending_sync)
        .bind(format_timestamp(record.payload.created_at()))
        .bind(format_timestamp(record.last_updated))
        .execute(executor)
        .await?;

    Ok(())
}

fn decode_row(kind: EntityKind, row: &SqliteRow) -> StoreResult<MirrorRecord> {
    let local_id: String = row.try_get("local_id")?;
    let server_id: Option<String> = row.try_get("server_id")?;
    let schema_version: i64 = row.try_get("schema_version")?;
    let payload: String = row.try_get("payload")?;
    let synced: bool = row.try_get("synced")?;
    let pending_sync: bool = row.try_get("pending_sync")?;
    let last_updated: String = row.try_get("last_updated")?;

    let version = u32::try_from(schema_version)
        .map_err(|_| StoreError::Corrupt(format!("Invalid schema version: {}", schema_version)))?;

    Ok(MirrorRecord {
        id: RecordId::from_parts(parse_uuid(&local_id)?, server_id),
        payload: MirrorPayload::from_stored(kind, version, &payload)?,
        synced,
        pending_sync,
        last_updated: parse_timestamp(&last_updated)?,
    })
}

pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("Invalid timestamp: {}", e)))
}

fn parse_uuid(raw: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt(format!("Invalid UUID: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MemoSnapshot, PatientSnapshot, TestSnapshot, EntityRef};
    use rust_decimal::Decimal;
    use tempfile::NamedTempFile;

    async fn create_test_store() -> (MirrorStore, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap().to_string();

        let config = StoreConfig {
            db_path,
            max_connections: 5,
            enable_wal: true,
        };

        (MirrorStore::open(config).await.unwrap(), temp_file)
    }

    fn patient(name: &str) -> MirrorPayload {
        MirrorPayload::Patient(PatientSnapshot {
            name: name.to_string(),
            age: Some(30),
            gender: None,
            phone: Some("01700000000".to_string()),
            address: None,
            created_at: Utc::now(),
        })
    }

    fn test_item(name: &str) -> MirrorPayload {
        MirrorPayload::Test(TestSnapshot {
            name: name.to_string(),
            price: Decimal::new(50000, 2),
            category: Some("Hematology".to_string()),
            description: None,
            created_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_put_and_query_pending() {
        let (store, _file) = create_test_store().await;

        let local = store.put(EntityKind::Patient, MirrorRecord::local(patient("Ayesha"))).await.unwrap();
        store
            .put(EntityKind::Patient, MirrorRecord::downloaded("p-1", patient("Karim")))
            .await
            .unwrap();

        let pending = store.query(EntityKind::Patient, &RecordFilter::PendingSync).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, local.id);

        assert_eq!(store.count(EntityKind::Patient, &RecordFilter::All).await.unwrap(), 2);
        assert_eq!(store.count(EntityKind::Patient, &RecordFilter::Synced).await.unwrap(), 1);
        assert_eq!(store.count(EntityKind::Patient, &RecordFilter::LocalOnly).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_put_remote_reuses_existing_row() {
        let (store, _file) = create_test_store().await;

        let first = store
            .put(EntityKind::Test, MirrorRecord::downloaded("t-1", test_item("CBC")))
            .await
            .unwrap();
        let second = store
            .put(EntityKind::Test, MirrorRecord::downloaded("t-1", test_item("CBC (revised)")))
            .await
            .unwrap();

        assert_eq!(first.id.local_id(), second.id.local_id());
        assert_eq!(store.count(EntityKind::Test, &RecordFilter::All).await.unwrap(), 1);

        let fetched = store
            .get(EntityKind::Test, second.id.local_id().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(fetched.payload, MirrorPayload::Test(ref t) if t.name == "CBC (revised)"));
    }

    #[tokio::test]
    async fn test_put_rejects_wrong_kind() {
        let (store, _file) = create_test_store().await;

        let err = store
            .put(EntityKind::Memo, MirrorRecord::local(patient("Mismatch")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::KindMismatch { expected: EntityKind::Memo, actual: EntityKind::Patient }));
    }

    #[tokio::test]
    async fn test_bulk_replace_keeps_pending_records() {
        let (store, _file) = create_test_store().await;

        let pending = store.put(EntityKind::Patient, MirrorRecord::local(patient("Offline"))).await.unwrap();
        store
            .put(EntityKind::Patient, MirrorRecord::downloaded("p-old", patient("Stale")))
            .await
            .unwrap();

        let summary = store
            .bulk_replace(
                EntityKind::Patient,
                vec![
                    MirrorRecord::downloaded("p-1", patient("Fresh 1")),
                    MirrorRecord::downloaded("p-2", patient("Fresh 2")),
                ],
                &RecordFilter::PendingSync,
            )
            .await
            .unwrap();

        assert_eq!(summary, ReplaceSummary { removed: 1, inserted: 2, skipped: 0 });

        let all = store.query(EntityKind::Patient, &RecordFilter::All).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().any(|r| r.id == pending.id && r.pending_sync));
        assert!(!all.iter().any(|r| r.id.server_id() == Some("p-old")));
    }

    #[tokio::test]
    async fn test_bulk_replace_skips_records_shadowed_by_local_edits() {
        let (store, _file) = create_test_store().await;

        let mut edited = store
            .put(EntityKind::Patient, MirrorRecord::downloaded("p-1", patient("Server name")))
            .await
            .unwrap();
        edited.mark_edited(patient("Edited offline"));
        store.put(EntityKind::Patient, edited.clone()).await.unwrap();

        let summary = store
            .bulk_replace(
                EntityKind::Patient,
                vec![MirrorRecord::downloaded("p-1", patient("Server name"))],
                &RecordFilter::PendingSync,
            )
            .await
            .unwrap();

        assert_eq!(summary.skipped, 1);
        let all = store.query(EntityKind::Patient, &RecordFilter::All).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(matches!(all[0].payload, MirrorPayload::Patient(ref p) if p.name == "Edited offline"));
    }

    #[tokio::test]
    async fn test_bulk_replace_reuses_local_ids() {
        let (store, _file) = create_test_store().await;

        store
            .bulk_replace(EntityKind::Test, vec![MirrorRecord::downloaded("t-1", test_item("CBC"))], &RecordFilter::PendingSync)
            .await
            .unwrap();
        let before = store.query(EntityKind::Test, &RecordFilter::All).await.unwrap();

        store
            .bulk_replace(EntityKind::Test, vec![MirrorRecord::downloaded("t-1", test_item("CBC"))], &RecordFilter::PendingSync)
            .await
            .unwrap();
        let after = store.query(EntityKind::Test, &RecordFilter::All).await.unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(before[0].id, after[0].id);
        assert_eq!(before[0].payload, after[0].payload);
    }

    #[tokio::test]
    async fn test_bulk_replace_rolls_back_on_failure() {
        let (store, _file) = create_test_store().await;

        store
            .put(EntityKind::Patient, MirrorRecord::downloaded("p-keep", patient("Survivor")))
            .await
            .unwrap();

        // Two incoming rows sharing a local id violate the primary key
        let shared = Uuid::new_v4();
        let mut a = MirrorRecord::downloaded("p-a", patient("A"));
        a.id = a.id.with_local_id(shared);
        let mut b = MirrorRecord::downloaded("p-b", patient("B"));
        b.id = b.id.with_local_id(shared);

        let err = store
            .bulk_replace(EntityKind::Patient, vec![a, b], &RecordFilter::PendingSync)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SyncIntegrity(_)));

        let all = store.query(EntityKind::Patient, &RecordFilter::All).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id.server_id(), Some("p-keep"));
    }

    #[tokio::test]
    async fn test_bulk_replace_all_is_one_transaction() {
        let (store, _file) = create_test_store().await;

        store
            .put(EntityKind::Patient, MirrorRecord::downloaded("p-old", patient("Old")))
            .await
            .unwrap();
        sqlx::query(
            "CREATE TRIGGER memos_full BEFORE INSERT ON memos BEGIN SELECT RAISE(ABORT, 'disk full'); END",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let memo = MirrorPayload::Memo(MemoSnapshot {
            memo_number: Some("M-0002".to_string()),
            patient: EntityRef::server("p-new"),
            patient_name: "New".to_string(),
            tests: vec![],
            total: Decimal::ZERO,
            discount: Decimal::ZERO,
            paid: Decimal::ZERO,
            due: Decimal::ZERO,
            created_at: Utc::now(),
        });
        let batches = vec![
            (EntityKind::Patient, vec![MirrorRecord::downloaded("p-new", patient("New"))]),
            (EntityKind::Memo, vec![MirrorRecord::downloaded("m-new", memo)]),
        ];

        let err = store
            .bulk_replace_all(batches, &RecordFilter::PendingSync)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SyncIntegrity(ref m) if m.contains("memos")));

        // The patients replaced before the failing kind are rolled back too
        let patients = store.query(EntityKind::Patient, &RecordFilter::All).await.unwrap();
        assert_eq!(patients.len(), 1);
        assert_eq!(patients[0].id.server_id(), Some("p-old"));
        assert_eq!(store.count(EntityKind::Memo, &RecordFilter::All).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memo_keeps_denormalized_patient_name() {
        let (store, _file) = create_test_store().await;

        let memo = MirrorPayload::Memo(MemoSnapshot {
            memo_number: Some("M-0001".to_string()),
            patient: EntityRef::local(Uuid::new_v4()),
            patient_name: "Nusrat Jahan".to_string(),
            tests: vec![],
            total: Decimal::new(120000, 2),
            discount: Decimal::ZERO,
            paid: Decimal::new(100000, 2),
            due: Decimal::new(20000, 2),
            created_at: Utc::now(),
        });
        let stored = store.put(EntityKind::Memo, MirrorRecord::local(memo)).await.unwrap();

        let fetched = store
            .get(EntityKind::Memo, stored.id.local_id().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(fetched.payload, MirrorPayload::Memo(ref m) if m.patient_name == "Nusrat Jahan"));
    }

    #[tokio::test]
    async fn test_rows_from_newer_schema_are_refused() {
        let (store, _file) = create_test_store().await;
        let local_id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO patients (local_id, server_id, schema_version, payload, synced, pending_sync, created_at, last_updated) VALUES (?, NULL, 99, '{}', 0, 1, ?, ?)",
        )
        .bind(local_id.to_string())
        .bind(format_timestamp(Utc::now()))
        .bind(format_timestamp(Utc::now()))
        .execute(store.pool())
        .await
        .unwrap();

        let err = store.get(EntityKind::Patient, local_id).await.unwrap_err();
        assert!(matches!(err, StoreError::SchemaVersion { found: 99, .. }));
    }

    #[tokio::test]
    async fn test_status_compare_and_set() {
        let (store, _file) = create_test_store().await;

        assert_eq!(store.sync_status().await.unwrap().status, ConnectionStatus::Offline);
        assert!(!store.try_transition_status(ConnectionStatus::Online, ConnectionStatus::Syncing).await.unwrap());

        store.set_status(ConnectionStatus::Online).await.unwrap();
        assert!(store.try_transition_status(ConnectionStatus::Online, ConnectionStatus::Syncing).await.unwrap());
        assert!(!store.try_transition_status(ConnectionStatus::Online, ConnectionStatus::Syncing).await.unwrap());
        assert_eq!(store.sync_status().await.unwrap().status, ConnectionStatus::Syncing);
    }

    #[tokio::test]
    async fn test_write_sync_status_round_trips() {
        let (store, _file) = create_test_store().await;
        let at = parse_timestamp("2024-03-01T10:00:00.000000Z").unwrap();

        let status = SyncStatus {
            status: ConnectionStatus::Online,
            last_sync: Some(at),
            pending_changes: 7,
        };
        store.write_sync_status(&status).await.unwrap();
        assert_eq!(store.sync_status().await.unwrap(), status);
    }

    #[tokio::test]
    async fn test_interrupted_sync_is_released_on_open() {
        let temp_file = NamedTempFile::new().unwrap();
        let config = StoreConfig {
            db_path: temp_file.path().to_str().unwrap().to_string(),
            max_connections: 1,
            enable_wal: false,
        };

        let store = MirrorStore::open(config.clone()).await.unwrap();
        store.set_status(ConnectionStatus::Syncing).await.unwrap();
        store.close().await;

        let reopened = MirrorStore::open(config).await.unwrap();
        assert_eq!(reopened.sync_status().await.unwrap().status, ConnectionStatus::Online);
    }

    #[tokio::test]
    async fn test_device_flags() {
        let (store, _file) = create_test_store().await;

        assert_eq!(store.flag(DeviceFlag::OfflineMode).await.unwrap(), None);
        store.set_flag(DeviceFlag::OfflineMode, "true").await.unwrap();
        store.set_flag(DeviceFlag::OfflineMode, "false").await.unwrap();
        assert_eq!(store.flag(DeviceFlag::OfflineMode).await.unwrap().as_deref(), Some("false"));

        store.clear_flag(DeviceFlag::OfflineMode).await.unwrap();
        assert_eq!(store.flag(DeviceFlag::OfflineMode).await.unwrap(), None);
    }
}
