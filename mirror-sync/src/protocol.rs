//! Offline sync wire protocol
//!
//! Shapes exchanged with the server's `/api/offline-sync` routes.
//!
//! Snapshot flow:
//! 1. `GET /api/offline-sync?t=<millis>` returns a `SnapshotEnvelope`
//! 2. Each list is cut to the `SNAPSHOT_PAGE_SIZE` most recent entries
//! 3. Entries become downloaded `MirrorRecord`s keyed by server id
//!
//! Push flow:
//! - Create: `POST /api/offline-sync/{segment}` with a `PushBody`
//! - Update: `PUT /api/offline-sync/{segment}/{server_id}` with a `PushBody`
//! - 2xx answers carry the server id in a `PushEnvelope`

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use mirror_store::{
    EntityKind, EntityRef, ExpenseTypeSnapshot, MemoSnapshot, MemoTestLine, MirrorPayload,
    MirrorRecord, PatientSnapshot, TestSnapshot,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Most recent entries kept per kind from one snapshot
pub const SNAPSHOT_PAGE_SIZE: usize = 100;

/// Path segment of a kind under `/api/offline-sync`
pub fn kind_segment(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Patient => "patients",
        EntityKind::Memo => "memos",
        EntityKind::ExpenseType => "expense-types",
        EntityKind::Test => "tests",
        EntityKind::Asset => "assets",
        EntityKind::Expense => "expenses",
    }
}

/// Response wrapper used by every offline-sync route
#[derive(Debug, Deserialize)]
pub struct SnapshotEnvelope {
    pub success: bool,
    pub data: Option<SnapshotData>,
    pub error: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotData {
    #[serde(default)]
    pub patients: Vec<ServerPatient>,
    #[serde(default)]
    pub memos: Vec<ServerMemo>,
    #[serde(default)]
    pub expense_types: Vec<ServerExpenseType>,
    #[serde(default)]
    pub tests: Vec<ServerTest>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerPatient {
    pub id: String,
    pub name: String,
    pub age: Option<u32>,
    pub gender: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMemoTest {
    pub test_id: Option<String>,
    pub test_name: String,
    pub price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMemo {
    pub id: String,
    pub memo_number: Option<String>,
    pub patient_id: Option<String>,
    pub patient_name: String,
    #[serde(default)]
    pub tests: Vec<ServerMemoTest>,
    pub total: Decimal,
    #[serde(default)]
    pub discount: Decimal,
    #[serde(default)]
    pub paid: Decimal,
    #[serde(default)]
    pub due: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerExpenseType {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTest {
    pub id: String,
    pub name: String,
    pub price: Decimal,
    pub category: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<ServerPatient> for MirrorRecord {
    fn from(p: ServerPatient) -> Self {
        MirrorRecord::downloaded(
            p.id,
            MirrorPayload::Patient(PatientSnapshot {
                name: p.name,
                age: p.age,
                gender: p.gender,
                phone: p.phone,
                address: p.address,
                created_at: p.created_at,
            }),
        )
    }
}

impl From<ServerMemo> for MirrorRecord {
    fn from(m: ServerMemo) -> Self {
        let tests = m
            .tests
            .into_iter()
            .map(|line| MemoTestLine {
                test: EntityRef {
                    local_id: None,
                    server_id: line.test_id,
                },
                test_name: line.test_name,
                price: line.price,
            })
            .collect();

        MirrorRecord::downloaded(
            m.id,
            MirrorPayload::Memo(MemoSnapshot {
                memo_number: m.memo_number,
                patient: EntityRef {
                    local_id: None,
                    server_id: m.patient_id,
                },
                patient_name: m.patient_name,
                tests,
                total: m.total,
                discount: m.discount,
                paid: m.paid,
                due: m.due,
                created_at: m.created_at,
            }),
        )
    }
}

impl From<ServerExpenseType> for MirrorRecord {
    fn from(e: ServerExpenseType) -> Self {
        MirrorRecord::downloaded(
            e.id,
            MirrorPayload::ExpenseType(ExpenseTypeSnapshot {
                name: e.name,
                description: e.description,
                created_at: e.created_at,
            }),
        )
    }
}

impl From<ServerTest> for MirrorRecord {
    fn from(t: ServerTest) -> Self {
        MirrorRecord::downloaded(
            t.id,
            MirrorPayload::Test(TestSnapshot {
                name: t.name,
                price: t.price,
                category: t.category,
                description: t.description,
                created_at: t.created_at,
            }),
        )
    }
}

/// Newest first, cut to the page size
fn latest_page<T, R>(mut items: Vec<T>, created_at: impl Fn(&T) -> DateTime<Utc>) -> Vec<R>
where
    R: From<T>,
{
    items.sort_by_key(|item| std::cmp::Reverse(created_at(item)));
    items.truncate(SNAPSHOT_PAGE_SIZE);
    items.into_iter().map(R::from).collect()
}

impl SnapshotData {
    /// Split into per-kind record batches, in `EntityKind::SNAPSHOT` order
    pub fn into_batches(self) -> Vec<(EntityKind, Vec<MirrorRecord>)> {
        vec![
            (EntityKind::Patient, latest_page(self.patients, |p| p.created_at)),
            (EntityKind::Memo, latest_page(self.memos, |m| m.created_at)),
            (EntityKind::ExpenseType, latest_page(self.expense_types, |e| e.created_at)),
            (EntityKind::Test, latest_page(self.tests, |t| t.created_at)),
        ]
    }
}

/// Decode a snapshot response
pub fn parse_snapshot_response(status: u16, body: &str) -> SyncResult<SnapshotData> {
    if !(200..300).contains(&status) {
        let detail = serde_json::from_str::<SnapshotEnvelope>(body)
            .ok()
            .and_then(|envelope| envelope.message.or(envelope.error));
        return Err(SyncError::Network(match detail {
            Some(message) => format!("Snapshot failed with status {}: {}", status, message),
            None => format!("Snapshot failed with status {}", status),
        }));
    }

    let envelope: SnapshotEnvelope = serde_json::from_str(body)?;
    if !envelope.success {
        let message = envelope
            .message
            .or(envelope.error)
            .unwrap_or_else(|| "server reported failure".to_string());
        return Err(SyncError::Network(message));
    }

    envelope
        .data
        .ok_or_else(|| SyncError::InvalidResponse("snapshot response has no data".to_string()))
}

/// Body of a push request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushBody {
    pub local_id: Uuid,
    pub payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    success: bool,
    data: Option<PushData>,
    error: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PushData {
    id: String,
}

/// Server acknowledgement of a pushed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushAck {
    pub server_id: String,
}

/// Why a single push did not go through
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    Rejected(String),
    Network(String),
}

/// Decode a push response
pub fn parse_push_response(status: u16, body: &str) -> Result<PushAck, PushError> {
    let envelope = serde_json::from_str::<PushEnvelope>(body).ok();

    match status {
        200..=299 => match envelope {
            Some(PushEnvelope {
                success: true,
                data: Some(data),
                ..
            }) => Ok(PushAck { server_id: data.id }),
            Some(PushEnvelope { message, error, .. }) => Err(PushError::Rejected(
                message
                    .or(error)
                    .unwrap_or_else(|| "accepted without an id".to_string()),
            )),
            None => Err(PushError::Network(format!(
                "Undecodable push response with status {}",
                status
            ))),
        },
        400..=499 => Err(PushError::Rejected(
            envelope
                .and_then(|e| e.message.or(e.error))
                .unwrap_or_else(|| format!("Rejected with status {}", status)),
        )),
        _ => Err(PushError::Network(format!("Push failed with status {}", status))),
    }
}
