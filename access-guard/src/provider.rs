use async_trait::async_trait;
use auth_offline::OfflineIdentity;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Signed-in session as reported by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSession {
    pub user_id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    /// Role from the provider's public metadata
    pub role: String,
}

impl ProviderSession {
    /// Identity to cache for later offline sign-in
    pub fn to_identity(&self) -> OfflineIdentity {
        OfflineIdentity {
            id: self.user_id.clone(),
            email: self.email.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            role: self.role.clone(),
            last_updated: Utc::now(),
        }
    }
}

/// External identity service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `Ok(None)` when nobody is signed in
    async fn current_session(&self) -> Result<Option<ProviderSession>, ProviderError>;
}
