//! Application service object
//!
//! Owns one instance of every data-layer service. Built once with
//! [`OfflineRuntime::init`] and shut down with [`OfflineRuntime::teardown`].

use crate::config::RuntimeConfig;
use access_guard::{AccessGuard, GuardState, IdentityProvider, ProviderSession, RouteGate};
use anyhow::Context;
use auth_offline::{AuthResult, OfflineIdentity, OfflineIdentityCache};
use mirror_store::{EntityKind, MirrorPayload, MirrorRecord, MirrorStore, StoreResult, SyncStatus};
use mirror_sync::{
    ConnectivityEvent, ConnectivityMonitor, DownloadReport, HttpServerEndpoint, ServerEndpoint,
    SyncEngine, SyncResult, UploadReport,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub struct OfflineRuntime {
    store: Arc<MirrorStore>,
    monitor: Arc<ConnectivityMonitor>,
    engine: Arc<SyncEngine>,
    cache: Arc<OfflineIdentityCache>,
    gate: Arc<RouteGate>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl OfflineRuntime {
    /// Build every service against the configured HTTP server
    pub async fn init(
        config: RuntimeConfig,
        provider: Arc<dyn IdentityProvider>,
        platform_online: bool,
    ) -> anyhow::Result<Self> {
        let endpoint = HttpServerEndpoint::new(config.sync.clone()).context("Failed to create sync endpoint")?;
        Self::with_endpoint(config, provider, Arc::new(endpoint), platform_online).await
    }

    /// Build every service against a given server endpoint
    pub async fn with_endpoint(
        config: RuntimeConfig,
        provider: Arc<dyn IdentityProvider>,
        endpoint: Arc<dyn ServerEndpoint>,
        platform_online: bool,
    ) -> anyhow::Result<Self> {
        let db_path = config.store.db_path.clone();
        let store = Arc::new(
            MirrorStore::open(config.store)
                .await
                .with_context(|| format!("Failed to open mirror store at {}", db_path))?,
        );

        let monitor = Arc::new(ConnectivityMonitor::new(Arc::clone(&store), platform_online).await);
        let engine = Arc::new(SyncEngine::new(Arc::clone(&store), Arc::clone(&monitor), endpoint));
        let status = engine
            .initialize()
            .await
            .context("Failed to initialize sync status")?;

        let cache = Arc::new(OfflineIdentityCache::new(Arc::clone(&store), config.auth));
        let guard = AccessGuard::new(provider, Arc::clone(&cache), Arc::clone(&monitor))
            .context("Failed to build access guard")?;
        let gate = Arc::new(RouteGate::new(Arc::new(guard)));

        let listeners = vec![
            engine.spawn_connectivity_listener(monitor.subscribe()),
            spawn_gate_listener(Arc::clone(&gate), monitor.subscribe()),
        ];

        tracing::info!(
            db_path = %db_path,
            status = status.status.as_str(),
            pending_changes = status.pending_changes,
            offline_mode = monitor.offline_mode(),
            "Offline runtime initialized"
        );

        Ok(Self {
            store,
            monitor,
            engine,
            cache,
            gate,
            listeners: Mutex::new(listeners),
        })
    }

    /// Stop the listener tasks and reconnect flushes, then close the store
    pub async fn teardown(&self) {
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            listener.abort();
        }
        self.engine.abort_flushes();
        self.store.close().await;
        tracing::info!("Offline runtime stopped");
    }

    pub fn store(&self) -> &Arc<MirrorStore> {
        &self.store
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn identity_cache(&self) -> &Arc<OfflineIdentityCache> {
        &self.cache
    }

    /// Feed the platform's connectivity signal; re-checks the current page
    /// when the effective state changes
    pub async fn platform_connectivity_changed(&self, online: bool) -> Option<ConnectivityEvent> {
        let event = self.monitor.report_platform_signal(online);
        if event.is_some() {
            self.gate.reevaluate().await;
        }
        event
    }

    pub async fn download_snapshot(&self) -> SyncResult<DownloadReport> {
        self.engine.download_snapshot().await
    }

    pub async fn upload_pending(&self) -> SyncResult<UploadReport> {
        self.engine.upload_pending().await
    }

    pub async fn sync_status(&self) -> SyncResult<SyncStatus> {
        self.engine.status().await
    }

    pub async fn record_local_create(&self, payload: MirrorPayload) -> SyncResult<MirrorRecord> {
        self.engine.record_local_create(payload).await
    }

    pub async fn record_local_update(
        &self,
        kind: EntityKind,
        local_id: Uuid,
        payload: MirrorPayload,
    ) -> SyncResult<MirrorRecord> {
        self.engine.record_local_update(kind, local_id, payload).await
    }

    /// Sign in against the cached identities and switch to offline mode
    pub async fn offline_login(&self, username_or_email: &str, password: &str) -> AuthResult<OfflineIdentity> {
        let identity = self
            .cache
            .verify_credentials(username_or_email, password)
            .await?;
        self.cache.set_active(&identity.id).await?;
        self.monitor.set_offline_mode(true).await?;
        self.gate.reevaluate().await;

        tracing::info!(user_id = %identity.id, "Offline login");
        Ok(identity)
    }

    /// Sign out of the offline identity; offline mode stays on
    pub async fn offline_logout(&self) -> GuardState {
        self.cache.clear().await;
        tracing::info!("Offline logout");
        self.gate.reevaluate().await
    }

    /// Leave offline mode. Connectivity returning emits `BecameOnline`,
    /// which flushes pending records.
    pub async fn resume_online(&self) -> StoreResult<Option<ConnectivityEvent>> {
        self.cache.clear().await;
        let event = self.monitor.set_offline_mode(false).await?;
        self.gate.reevaluate().await;

        tracing::info!(event = ?event, "Offline mode cleared");
        Ok(event)
    }

    /// The identity provider reported a signed-in user
    pub async fn identity_signed_in(&self, session: &ProviderSession) -> GuardState {
        self.cache.save(&session.to_identity()).await;
        self.gate.reevaluate().await
    }

    pub async fn navigate(&self, path: &str) -> GuardState {
        self.gate.navigate(path).await
    }

    pub fn route_state(&self) -> GuardState {
        self.gate.state()
    }
}

/// Re-check the current page on every connectivity transition
fn spawn_gate_listener(
    gate: Arc<RouteGate>,
    mut events: broadcast::Receiver<ConnectivityEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let state = gate.reevaluate().await;
                    tracing::debug!(event = ?event, state = ?state, "Route re-checked");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Route listener lagged");
                    gate.reevaluate().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
