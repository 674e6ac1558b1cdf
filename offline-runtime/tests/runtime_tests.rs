//! End-to-end tests of the offline runtime
//!
//! A front-desk day: online sign-in, network loss, offline login, work
//! offline, return online and flush.

use access_guard::{GuardState, IdentityProvider, ProviderError, ProviderSession};
use async_trait::async_trait;
use auth_offline::{AuthError, OfflineAuthConfig};
use chrono::Utc;
use mirror_store::{ConnectionStatus, MirrorPayload, PatientSnapshot, StoreConfig};
use mirror_sync::protocol::ServerPatient;
use mirror_sync::{
    ConnectivityEvent, PushAck, PushAction, PushBody, PushError, ServerEndpoint, SnapshotData,
    SyncError, SyncResult,
};
use offline_runtime::{LoggingConfig, OfflineRuntime, RuntimeConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

const PASSPHRASE: &str = "front-desk";

#[derive(Default)]
struct RecordingEndpoint {
    pushes: Mutex<Vec<PushBody>>,
}

#[async_trait]
impl ServerEndpoint for RecordingEndpoint {
    async fn fetch_snapshot(&self) -> SyncResult<SnapshotData> {
        Ok(SnapshotData {
            patients: vec![ServerPatient {
                id: "p-100".to_string(),
                name: "Server Patient".to_string(),
                age: Some(55),
                gender: None,
                phone: None,
                address: None,
                created_at: Utc::now(),
            }],
            ..Default::default()
        })
    }

    async fn push_record(
        &self,
        _kind: mirror_store::EntityKind,
        _action: &PushAction,
        body: &PushBody,
    ) -> Result<PushAck, PushError> {
        let mut pushes = self.pushes.lock();
        pushes.push(body.clone());
        Ok(PushAck {
            server_id: format!("srv-{}", pushes.len()),
        })
    }
}

#[derive(Default)]
struct NoSession;

#[async_trait]
impl IdentityProvider for NoSession {
    async fn current_session(&self) -> Result<Option<ProviderSession>, ProviderError> {
        Ok(None)
    }
}

fn test_config(file: &NamedTempFile) -> RuntimeConfig {
    RuntimeConfig {
        store: StoreConfig {
            db_path: file.path().to_str().unwrap().to_string(),
            max_connections: 4,
            enable_wal: true,
        },
        auth: OfflineAuthConfig::with_passphrase(PASSPHRASE),
        logging: LoggingConfig::default(),
        ..Default::default()
    }
}

async fn create_runtime(online: bool) -> (OfflineRuntime, Arc<RecordingEndpoint>, NamedTempFile) {
    let file = NamedTempFile::new().unwrap();
    let endpoint = Arc::new(RecordingEndpoint::default());
    let runtime = OfflineRuntime::with_endpoint(
        test_config(&file),
        Arc::new(NoSession),
        Arc::clone(&endpoint) as Arc<dyn ServerEndpoint>,
        online,
    )
    .await
    .unwrap();
    (runtime, endpoint, file)
}

fn receptionist_session() -> ProviderSession {
    ProviderSession {
        user_id: "user_rcp".to_string(),
        email: "receptionist@example.com".to_string(),
        first_name: Some("Sadia".to_string()),
        last_name: None,
        role: "receptionist".to_string(),
    }
}

async fn wait_for_status(runtime: &OfflineRuntime, expected: ConnectionStatus) {
    for _ in 0..50 {
        if runtime.sync_status().await.unwrap().status == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("status never became {:?}", expected);
}

fn walk_in_patient() -> MirrorPayload {
    MirrorPayload::Patient(PatientSnapshot {
        name: "Walk-in".to_string(),
        age: Some(8),
        gender: Some("female".to_string()),
        phone: None,
        address: None,
        created_at: Utc::now(),
    })
}

#[tokio::test]
async fn test_front_desk_day() {
    let (runtime, endpoint, _file) = create_runtime(true).await;
    runtime.identity_signed_in(&receptionist_session()).await;

    assert_eq!(
        runtime.platform_connectivity_changed(false).await,
        Some(ConnectivityEvent::BecameOffline)
    );
    wait_for_status(&runtime, ConnectionStatus::Offline).await;

    assert_eq!(
        runtime.navigate("/receptionist").await,
        GuardState::Redirected("/offline-login".to_string())
    );

    let identity = runtime.offline_login("receptionist", PASSPHRASE).await.unwrap();
    assert_eq!(identity.email, "receptionist@example.com");
    assert_eq!(runtime.route_state(), GuardState::Allowed);
    assert!(runtime.monitor().offline_mode());

    assert_eq!(
        runtime.navigate("/admin").await,
        GuardState::Redirected("/receptionist".to_string())
    );

    runtime.record_local_create(walk_in_patient()).await.unwrap();
    let status = runtime.sync_status().await.unwrap();
    assert_eq!(status.status, ConnectionStatus::Offline);
    assert_eq!(status.pending_changes, 1);

    // Network is back but offline mode holds
    assert_eq!(runtime.platform_connectivity_changed(true).await, None);
    assert!(matches!(runtime.upload_pending().await, Err(SyncError::Offline)));

    let event = runtime.resume_online().await.unwrap();
    assert_eq!(event, Some(ConnectivityEvent::BecameOnline));

    let mut flushed = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if runtime.sync_status().await.unwrap().pending_changes == 0 {
            flushed = true;
            break;
        }
    }
    assert!(flushed, "reconnect should flush the offline patient");
    assert_eq!(endpoint.pushes.lock().len(), 1);
    assert_eq!(endpoint.pushes.lock()[0].payload["name"], "Walk-in");

    runtime.teardown().await;
}

#[tokio::test]
async fn test_wrong_passphrase_keeps_online_mode() {
    let (runtime, _endpoint, _file) = create_runtime(true).await;
    runtime.identity_signed_in(&receptionist_session()).await;

    let err = runtime.offline_login("receptionist", "nope").await.unwrap_err();
    assert!(matches!(err, AuthError::CredentialsInvalid));
    assert!(!runtime.monitor().offline_mode());
    assert!(runtime.identity_cache().get_active().await.is_none());

    runtime.teardown().await;
}

#[tokio::test]
async fn test_offline_logout_stays_in_offline_mode() {
    let (runtime, _endpoint, _file) = create_runtime(false).await;
    runtime.identity_signed_in(&receptionist_session()).await;
    runtime.offline_login("receptionist@example.com", PASSPHRASE).await.unwrap();
    runtime.navigate("/receptionist/all-patients").await;

    let state = runtime.offline_logout().await;
    assert_eq!(state, GuardState::Redirected("/offline-login".to_string()));
    assert!(runtime.monitor().offline_mode());

    runtime.teardown().await;
}

#[tokio::test]
async fn test_download_through_runtime() {
    let (runtime, _endpoint, _file) = create_runtime(true).await;

    let report = runtime.download_snapshot().await.unwrap();
    assert_eq!(report.downloaded_items(), 1);

    let status = runtime.sync_status().await.unwrap();
    assert_eq!(status.status, ConnectionStatus::Online);
    assert!(status.last_sync.is_some());

    runtime.teardown().await;
    assert!(runtime.sync_status().await.is_err());
}

#[tokio::test]
async fn test_state_survives_restart() {
    let file = NamedTempFile::new().unwrap();
    {
        let runtime = OfflineRuntime::with_endpoint(
            test_config(&file),
            Arc::new(NoSession),
            Arc::new(RecordingEndpoint::default()),
            false,
        )
        .await
        .unwrap();
        runtime.identity_signed_in(&receptionist_session()).await;
        runtime.offline_login("receptionist", PASSPHRASE).await.unwrap();
        runtime.record_local_create(walk_in_patient()).await.unwrap();
        runtime.teardown().await;
    }

    let runtime = OfflineRuntime::with_endpoint(
        test_config(&file),
        Arc::new(NoSession),
        Arc::new(RecordingEndpoint::default()),
        true,
    )
    .await
    .unwrap();

    // Offline mode and the active identity are persisted
    assert!(runtime.monitor().offline_mode());
    assert_eq!(
        runtime.identity_cache().get_active().await.map(|i| i.id),
        Some("user_rcp".to_string())
    );
    assert_eq!(runtime.sync_status().await.unwrap().pending_changes, 1);
    runtime.teardown().await;
}
