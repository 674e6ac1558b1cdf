//! Mirror record model
//!
//! Every cached server entity is stored as a [`MirrorRecord`]: an explicit
//! identifier ([`RecordId`]), a tagged and versioned payload
//! ([`MirrorPayload`]) and the `synced` / `pending_sync` / `last_updated`
//! bookkeeping triad.

use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Latest payload schema version written by this build
pub const SCHEMA_VERSION: u32 = 1;

/// Entity kinds mirrored on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Patient,
    Memo,
    ExpenseType,
    Test,
    Asset,
    Expense,
}

impl EntityKind {
    /// All kinds, in push order: referenced kinds come before the kinds
    /// that reference them.
    pub const ALL: [EntityKind; 6] = [
        EntityKind::ExpenseType,
        EntityKind::Test,
        EntityKind::Patient,
        EntityKind::Asset,
        EntityKind::Memo,
        EntityKind::Expense,
    ];

    /// Kinds included in the server snapshot
    pub const SNAPSHOT: [EntityKind; 4] = [
        EntityKind::Patient,
        EntityKind::Memo,
        EntityKind::ExpenseType,
        EntityKind::Test,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Patient => "patient",
            EntityKind::Memo => "memo",
            EntityKind::ExpenseType => "expense_type",
            EntityKind::Test => "test",
            EntityKind::Asset => "asset",
            EntityKind::Expense => "expense",
        }
    }

    /// Local table holding this kind
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityKind::Patient => "patients",
            EntityKind::Memo => "memos",
            EntityKind::ExpenseType => "expense_types",
            EntityKind::Test => "tests",
            EntityKind::Asset => "assets",
            EntityKind::Expense => "expenses",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patient" => Ok(EntityKind::Patient),
            "memo" => Ok(EntityKind::Memo),
            "expense_type" => Ok(EntityKind::ExpenseType),
            "test" => Ok(EntityKind::Test),
            "asset" => Ok(EntityKind::Asset),
            "expense" => Ok(EntityKind::Expense),
            _ => Err(StoreError::Corrupt(format!("Unknown entity kind: {}", s))),
        }
    }
}

/// Identity of a mirrored record.
///
/// Rows in the store always carry a local id. `Remote` only exists for
/// records that came from the server and have not been stored yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordId {
    /// Created on this device, unknown to the server
    Local(Uuid),
    /// Known to the server, not yet stored locally
    Remote(String),
    /// Stored locally and known to the server
    Both { local: Uuid, server: String },
}

impl RecordId {
    pub fn new_local() -> Self {
        RecordId::Local(Uuid::new_v4())
    }

    pub(crate) fn from_parts(local: Uuid, server: Option<String>) -> Self {
        match server {
            Some(server) => RecordId::Both { local, server },
            None => RecordId::Local(local),
        }
    }

    pub fn local_id(&self) -> Option<Uuid> {
        match self {
            RecordId::Local(local) | RecordId::Both { local, .. } => Some(*local),
            RecordId::Remote(_) => None,
        }
    }

    pub fn server_id(&self) -> Option<&str> {
        match self {
            RecordId::Remote(server) | RecordId::Both { server, .. } => Some(server),
            RecordId::Local(_) => None,
        }
    }

    /// Attach (or replace) the server-assigned identifier
    pub fn with_server_id(self, server: String) -> Self {
        match self {
            RecordId::Local(local) | RecordId::Both { local, .. } => RecordId::Both { local, server },
            RecordId::Remote(_) => RecordId::Remote(server),
        }
    }

    /// Attach a local identifier, keeping any server identifier
    pub fn with_local_id(self, local: Uuid) -> Self {
        match self {
            RecordId::Local(_) => RecordId::Local(local),
            RecordId::Remote(server) | RecordId::Both { server, .. } => RecordId::Both { local, server },
        }
    }
}

/// Reference from one mirrored entity to another.
///
/// Either side may be missing: a reference to a record created offline
/// only has a local id until that record is pushed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub local_id: Option<Uuid>,
    pub server_id: Option<String>,
}

impl EntityRef {
    pub fn server(id: impl Into<String>) -> Self {
        Self {
            local_id: None,
            server_id: Some(id.into()),
        }
    }

    pub fn local(id: Uuid) -> Self {
        Self {
            local_id: Some(id),
            server_id: None,
        }
    }

    pub fn to_record(record_id: &RecordId) -> Self {
        Self {
            local_id: record_id.local_id(),
            server_id: record_id.server_id().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientSnapshot {
    pub name: String,
    pub age: Option<u32>,
    pub gender: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoTestLine {
    pub test: EntityRef,
    pub test_name: String,
    pub price: Decimal,
}

/// Test memo. Carries the patient's name so it renders without resolving
/// the patient relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoSnapshot {
    pub memo_number: Option<String>,
    pub patient: EntityRef,
    pub patient_name: String,
    pub tests: Vec<MemoTestLine>,
    pub total: Decimal,
    pub discount: Decimal,
    pub paid: Decimal,
    pub due: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseTypeSnapshot {
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSnapshot {
    pub name: String,
    pub price: Decimal,
    pub category: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetSnapshot {
    pub name: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub purchase_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseSnapshot {
    pub amount: Decimal,
    pub expense_type: EntityRef,
    pub expense_type_name: String,
    pub description: Option<String>,
    pub date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Denormalized entity payload, one variant per kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum MirrorPayload {
    Patient(PatientSnapshot),
    Memo(MemoSnapshot),
    ExpenseType(ExpenseTypeSnapshot),
    Test(TestSnapshot),
    Asset(AssetSnapshot),
    Expense(ExpenseSnapshot),
}

impl MirrorPayload {
    pub fn kind(&self) -> EntityKind {
        match self {
            MirrorPayload::Patient(_) => EntityKind::Patient,
            MirrorPayload::Memo(_) => EntityKind::Memo,
            MirrorPayload::ExpenseType(_) => EntityKind::ExpenseType,
            MirrorPayload::Test(_) => EntityKind::Test,
            MirrorPayload::Asset(_) => EntityKind::Asset,
            MirrorPayload::Expense(_) => EntityKind::Expense,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            MirrorPayload::Patient(p) => p.created_at,
            MirrorPayload::Memo(m) => m.created_at,
            MirrorPayload::ExpenseType(e) => e.created_at,
            MirrorPayload::Test(t) => t.created_at,
            MirrorPayload::Asset(a) => a.created_at,
            MirrorPayload::Expense(e) => e.created_at,
        }
    }

    /// Untagged JSON body stored in the kind's table
    pub fn to_json(&self) -> StoreResult<serde_json::Value> {
        let value = match self {
            MirrorPayload::Patient(p) => serde_json::to_value(p)?,
            MirrorPayload::Memo(m) => serde_json::to_value(m)?,
            MirrorPayload::ExpenseType(e) => serde_json::to_value(e)?,
            MirrorPayload::Test(t) => serde_json::to_value(t)?,
            MirrorPayload::Asset(a) => serde_json::to_value(a)?,
            MirrorPayload::Expense(e) => serde_json::to_value(e)?,
        };
        Ok(value)
    }

    /// Decode a stored body written with `version` of the schema
    pub fn from_stored(kind: EntityKind, version: u32, body: &str) -> StoreResult<Self> {
        if version > SCHEMA_VERSION {
            return Err(StoreError::SchemaVersion {
                kind,
                found: version,
                supported: SCHEMA_VERSION,
            });
        }
        let value: serde_json::Value = serde_json::from_str(body)?;
        let value = upgrade(kind, version, value)?;
        let payload = match kind {
            EntityKind::Patient => MirrorPayload::Patient(serde_json::from_value(value)?),
            EntityKind::Memo => MirrorPayload::Memo(serde_json::from_value(value)?),
            EntityKind::ExpenseType => MirrorPayload::ExpenseType(serde_json::from_value(value)?),
            EntityKind::Test => MirrorPayload::Test(serde_json::from_value(value)?),
            EntityKind::Asset => MirrorPayload::Asset(serde_json::from_value(value)?),
            EntityKind::Expense => MirrorPayload::Expense(serde_json::from_value(value)?),
        };
        Ok(payload)
    }
}

/// Bring a stored body written by an older schema up to [`SCHEMA_VERSION`].
///
/// Version 1 is the first layout; new versions add a match arm here.
fn upgrade(kind: EntityKind, version: u32, value: serde_json::Value) -> StoreResult<serde_json::Value> {
    match version {
        SCHEMA_VERSION => Ok(value),
        other => Err(StoreError::SchemaVersion {
            kind,
            found: other,
            supported: SCHEMA_VERSION,
        }),
    }
}

/// A cached server entity with sync bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorRecord {
    pub id: RecordId,
    pub payload: MirrorPayload,
    /// The server holds an identical or newer version
    pub synced: bool,
    /// Local mutations exist that the server has not acknowledged
    pub pending_sync: bool,
    pub last_updated: DateTime<Utc>,
}

impl MirrorRecord {
    /// Record freshly downloaded from the server
    pub fn downloaded(server_id: impl Into<String>, payload: MirrorPayload) -> Self {
        Self {
            id: RecordId::Remote(server_id.into()),
            payload,
            synced: true,
            pending_sync: false,
            last_updated: Utc::now(),
        }
    }

    /// Record created on this device
    pub fn local(payload: MirrorPayload) -> Self {
        Self {
            id: RecordId::new_local(),
            payload,
            synced: false,
            pending_sync: true,
            last_updated: Utc::now(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.payload.kind()
    }

    /// Apply a local edit. The server no longer holds this version.
    pub fn mark_edited(&mut self, payload: MirrorPayload) {
        self.payload = payload;
        self.synced = false;
        self.pending_sync = true;
        self.last_updated = Utc::now();
    }

    /// The server accepted this record under `server_id`
    pub fn mark_pushed(&mut self, server_id: String) {
        self.id = self.id.clone().with_server_id(server_id);
        self.synced = true;
        self.pending_sync = false;
        self.last_updated = Utc::now();
    }
}

/// Value of `SyncStatus.status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Online,
    Offline,
    Syncing,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Online => "online",
            ConnectionStatus::Offline => "offline",
            ConnectionStatus::Syncing => "syncing",
        }
    }
}

impl FromStr for ConnectionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(ConnectionStatus::Online),
            "offline" => Ok(ConnectionStatus::Offline),
            "syncing" => Ok(ConnectionStatus::Syncing),
            _ => Err(StoreError::Corrupt(format!("Unknown sync status: {}", s))),
        }
    }
}

/// Singleton sync bookkeeping row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub status: ConnectionStatus,
    pub last_sync: Option<DateTime<Utc>>,
    pub pending_changes: u64,
}

/// Row selection for `query`, `count` and `bulk_replace`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordFilter {
    All,
    PendingSync,
    Synced,
    /// Never seen by the server
    LocalOnly,
    ServerId(String),
}

impl RecordFilter {
    pub(crate) fn sql_clause(&self) -> &'static str {
        match self {
            RecordFilter::All => "1 = 1",
            RecordFilter::PendingSync => "pending_sync = 1",
            RecordFilter::Synced => "synced = 1",
            RecordFilter::LocalOnly => "server_id IS NULL",
            RecordFilter::ServerId(_) => "server_id = ?",
        }
    }

    pub(crate) fn bind_value(&self) -> Option<&str> {
        match self {
            RecordFilter::ServerId(id) => Some(id.as_str()),
            _ => None,
        }
    }
}

/// Persisted device-level flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFlag {
    /// Keep the offline UX/auth path even when connectivity returns
    OfflineMode,
    OfflineAuthenticated,
    ActiveOfflineUserId,
    ActiveOfflineUserRole,
}

impl DeviceFlag {
    pub fn key(&self) -> &'static str {
        match self {
            DeviceFlag::OfflineMode => "offline_mode",
            DeviceFlag::OfflineAuthenticated => "offline_authenticated",
            DeviceFlag::ActiveOfflineUserId => "active_offline_user_id",
            DeviceFlag::ActiveOfflineUserRole => "active_offline_user_role",
        }
    }
}
