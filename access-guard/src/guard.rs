//! Navigation guard
//!
//! Decides, for every navigation, whether the current identity may open a
//! path. The identity comes from the identity provider while online and
//! from the offline identity cache while offline or in offline mode.
//!
//! Decision order:
//! 1. Public paths are always allowed
//! 2. Offline: active cached identity, admin bypass, offline prefix table
//! 3. Online: provider session, root redirect, online regex table
//!
//! A refused navigation is a redirect to the role's landing path, never an
//! error. Provider failures block.

use crate::error::GuardResult;
use crate::provider::IdentityProvider;
use crate::routes::{self, RouteTable, OFFLINE_LOGIN_PATH, SIGN_IN_PATH};
use auth_offline::{OfflineIdentityCache, Role};
use mirror_sync::ConnectivityMonitor;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Allow,
    Redirect(String),
    Blocked,
}

impl GuardDecision {
    fn redirect(path: &str) -> Self {
        GuardDecision::Redirect(path.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardState {
    Unchecked,
    Allowed,
    Redirected(String),
    Blocked,
}

impl From<GuardDecision> for GuardState {
    fn from(decision: GuardDecision) -> Self {
        match decision {
            GuardDecision::Allow => GuardState::Allowed,
            GuardDecision::Redirect(path) => GuardState::Redirected(path),
            GuardDecision::Blocked => GuardState::Blocked,
        }
    }
}

pub struct AccessGuard {
    provider: Arc<dyn IdentityProvider>,
    cache: Arc<OfflineIdentityCache>,
    monitor: Arc<ConnectivityMonitor>,
    online_routes: RouteTable,
}

impl AccessGuard {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        cache: Arc<OfflineIdentityCache>,
        monitor: Arc<ConnectivityMonitor>,
    ) -> GuardResult<Self> {
        Ok(Self {
            provider,
            cache,
            monitor,
            online_routes: RouteTable::online()?,
        })
    }

    /// Decide whether the current identity may open `path`
    pub async fn check(&self, path: &str) -> GuardDecision {
        let path = routes::normalize(path);

        let decision = if routes::is_public(path) {
            GuardDecision::Allow
        } else if self.monitor.offline_mode() || !self.monitor.is_online() {
            self.check_offline(path).await
        } else {
            self.check_online(path).await
        };

        tracing::debug!(path, decision = ?decision, "Navigation checked");
        decision
    }

    async fn check_offline(&self, path: &str) -> GuardDecision {
        let Some(identity) = self.cache.get_active().await else {
            return GuardDecision::redirect(OFFLINE_LOGIN_PATH);
        };
        let Some(role) = identity.role() else {
            tracing::warn!(user_id = %identity.id, role = %identity.role, "Unknown role on offline identity");
            return GuardDecision::redirect(SIGN_IN_PATH);
        };

        if role == Role::Admin || routes::offline_allows(role, path) {
            GuardDecision::Allow
        } else {
            GuardDecision::redirect(routes::landing_path(role))
        }
    }

    async fn check_online(&self, path: &str) -> GuardDecision {
        let session = match self.provider.current_session().await {
            Ok(Some(session)) => session,
            Ok(None) => return GuardDecision::redirect(SIGN_IN_PATH),
            Err(e) => {
                tracing::warn!(error = %e, "Identity provider failed, blocking navigation");
                return GuardDecision::Blocked;
            }
        };

        let identity = session.to_identity();
        self.cache.save(&identity).await;

        let Some(role) = identity.role() else {
            tracing::warn!(user_id = %identity.id, role = %identity.role, "Unknown role on session");
            return GuardDecision::redirect(SIGN_IN_PATH);
        };

        if path == "/" || !self.online_routes.allows(role, path) {
            GuardDecision::redirect(routes::landing_path(role))
        } else {
            GuardDecision::Allow
        }
    }
}

#[derive(Debug)]
struct GateSlot {
    path: Option<String>,
    state: GuardState,
    /// Bumped on every evaluation so a slow check cannot overwrite a newer one
    generation: u64,
}

/// Holds the guard state for the page currently being shown
pub struct RouteGate {
    guard: Arc<AccessGuard>,
    slot: Mutex<GateSlot>,
}

impl RouteGate {
    pub fn new(guard: Arc<AccessGuard>) -> Self {
        Self {
            guard,
            slot: Mutex::new(GateSlot {
                path: None,
                state: GuardState::Unchecked,
                generation: 0,
            }),
        }
    }

    pub fn state(&self) -> GuardState {
        self.slot.lock().state.clone()
    }

    pub fn current_path(&self) -> Option<String> {
        self.slot.lock().path.clone()
    }

    /// Evaluate a navigation to `path` and remember the outcome
    pub async fn navigate(&self, path: &str) -> GuardState {
        let generation = {
            let mut slot = self.slot.lock();
            slot.path = Some(path.to_string());
            slot.state = GuardState::Unchecked;
            slot.generation += 1;
            slot.generation
        };
        self.evaluate(path, generation).await
    }

    /// Re-run the check for the current path, after a connectivity change
    /// or an identity load
    pub async fn reevaluate(&self) -> GuardState {
        let (path, generation) = {
            let mut slot = self.slot.lock();
            let Some(path) = slot.path.clone() else {
                return GuardState::Unchecked;
            };
            slot.generation += 1;
            (path, slot.generation)
        };
        self.evaluate(&path, generation).await
    }

    async fn evaluate(&self, path: &str, generation: u64) -> GuardState {
        let state = GuardState::from(self.guard.check(path).await);

        let mut slot = self.slot.lock();
        if slot.generation == generation {
            slot.state = state.clone();
        }
        state
    }
}
