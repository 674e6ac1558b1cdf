//! Offline identity cache
//!
//! Identities are upserted on every online sign-in and never expire. The
//! active pointer lives in the store's device flags so it survives restarts.
//! Read paths degrade to "nobody signed in" when storage is unavailable.

use crate::config::OfflineAuthConfig;
use crate::error::{AuthError, AuthResult};
use crate::models::OfflineIdentity;
use chrono::{DateTime, SecondsFormat, Utc};
use mirror_store::{DeviceFlag, MirrorStore, StoreError};
use secrecy::ExposeSecret;
use sqlx::Row;
use std::sync::Arc;
use subtle::ConstantTimeEq;

const COLUMNS: &str = "id, email, first_name, last_name, role, last_updated";

pub struct OfflineIdentityCache {
    store: Arc<MirrorStore>,
    config: OfflineAuthConfig,
}

impl OfflineIdentityCache {
    pub fn new(store: Arc<MirrorStore>, config: OfflineAuthConfig) -> Self {
        Self { store, config }
    }

    /// Upsert an identity by id. Failures are logged, not returned.
    pub async fn save(&self, identity: &OfflineIdentity) {
        if let Err(e) = self.try_save(identity).await {
            tracing::warn!(user_id = %identity.id, error = %e, "Failed to cache offline identity");
        }
    }

    async fn try_save(&self, identity: &OfflineIdentity) -> AuthResult<()> {
        sqlx::query(
            r#"
            INSERT INTO offline_users (id, email, first_name, last_name, role, last_updated)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                role = excluded.role,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(&identity.id)
        .bind(identity.email.trim())
        .bind(&identity.first_name)
        .bind(&identity.last_name)
        .bind(&identity.role)
        .bind(format_timestamp(identity.last_updated))
        .execute(self.store.pool())
        .await?;

        tracing::debug!(user_id = %identity.id, role = %identity.role, "Cached offline identity");
        Ok(())
    }

    /// Look up a cached identity by id
    pub async fn get(&self, id: &str) -> AuthResult<Option<OfflineIdentity>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM offline_users WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.store.pool())
            .await?;

        row.map(|row| decode_identity(&row)).transpose()
    }

    /// The identity signed in offline, if any
    pub async fn get_active(&self) -> Option<OfflineIdentity> {
        match self.try_get_active().await {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to resolve active offline identity");
                None
            }
        }
    }

    async fn try_get_active(&self) -> AuthResult<Option<OfflineIdentity>> {
        let authenticated = self.store.flag(DeviceFlag::OfflineAuthenticated).await?;
        if authenticated.as_deref() != Some("true") {
            return Ok(None);
        }

        match self.store.flag(DeviceFlag::ActiveOfflineUserId).await? {
            Some(id) => self.get(&id).await,
            None => Ok(None),
        }
    }

    /// Match a username or email against cached identities and check the
    /// shared passphrase.
    ///
    /// An exact email match wins over an email local-part match.
    pub async fn verify_credentials(
        &self,
        username_or_email: &str,
        password: &str,
    ) -> AuthResult<OfflineIdentity> {
        let needle = username_or_email.trim().to_lowercase();

        let passphrase_ok: bool = password
            .as_bytes()
            .ct_eq(self.config.shared_passphrase.expose_secret().as_bytes())
            .into();

        if needle.is_empty() {
            return Err(AuthError::CredentialsInvalid);
        }

        let identities = match self.try_list().await {
            Ok(identities) => identities,
            Err(e) => {
                tracing::warn!(error = %e, "Offline identity store unavailable during sign-in");
                return Err(AuthError::CredentialsInvalid);
            }
        };

        let matched = identities
            .iter()
            .find(|identity| identity.email.trim().to_lowercase() == needle)
            .or_else(|| {
                identities
                    .iter()
                    .find(|identity| identity.email_local_part() == needle)
            });

        match matched {
            Some(identity) if passphrase_ok => {
                tracing::info!(user_id = %identity.id, "Offline credentials verified");
                Ok(identity.clone())
            }
            _ => {
                tracing::info!("Offline credentials rejected");
                Err(AuthError::CredentialsInvalid)
            }
        }
    }

    /// Make `id` the active offline identity
    pub async fn set_active(&self, id: &str) -> AuthResult<OfflineIdentity> {
        let identity = self
            .get(id)
            .await?
            .ok_or_else(|| AuthError::IdentityNotFound(id.to_string()))?;

        self.store.set_flag(DeviceFlag::ActiveOfflineUserId, &identity.id).await?;
        self.store
            .set_flag(DeviceFlag::ActiveOfflineUserRole, &identity.role)
            .await?;
        self.store.set_flag(DeviceFlag::OfflineAuthenticated, "true").await?;

        tracing::info!(user_id = %identity.id, role = %identity.role, "Offline identity activated");
        Ok(identity)
    }

    /// Drop the active pointer; cached identities stay
    pub async fn clear(&self) {
        if let Err(e) = self.try_clear().await {
            tracing::warn!(error = %e, "Failed to clear active offline identity");
        }
    }

    async fn try_clear(&self) -> AuthResult<()> {
        self.store.clear_flag(DeviceFlag::OfflineAuthenticated).await?;
        self.store.clear_flag(DeviceFlag::ActiveOfflineUserId).await?;
        self.store.clear_flag(DeviceFlag::ActiveOfflineUserRole).await?;
        Ok(())
    }

    /// Cached identities, most recently seen first
    pub async fn list(&self) -> Vec<OfflineIdentity> {
        self.try_list().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to list offline identities");
            Vec::new()
        })
    }

    async fn try_list(&self) -> AuthResult<Vec<OfflineIdentity>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM offline_users ORDER BY last_updated DESC, id ASC"
        ))
        .fetch_all(self.store.pool())
        .await?;

        rows.iter().map(decode_identity).collect()
    }

    /// Forget one identity. Clears the pointer if it was active.
    pub async fn remove(&self, id: &str) -> AuthResult<bool> {
        let removed = sqlx::query("DELETE FROM offline_users WHERE id = ?")
            .bind(id)
            .execute(self.store.pool())
            .await?
            .rows_affected()
            > 0;

        if self.store.flag(DeviceFlag::ActiveOfflineUserId).await?.as_deref() == Some(id) {
            self.try_clear().await?;
        }

        tracing::debug!(user_id = %id, removed, "Removed offline identity");
        Ok(removed)
    }

    /// Forget every identity and the pointer
    pub async fn clear_all(&self) -> AuthResult<u64> {
        let removed = sqlx::query("DELETE FROM offline_users")
            .execute(self.store.pool())
            .await?
            .rows_affected();
        self.try_clear().await?;

        tracing::info!(removed, "Cleared offline identities");
        Ok(removed)
    }
}

fn decode_identity(row: &sqlx::sqlite::SqliteRow) -> AuthResult<OfflineIdentity> {
    let last_updated: String = row.try_get("last_updated")?;
    Ok(OfflineIdentity {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        role: row.try_get("role")?,
        last_updated: parse_timestamp(&last_updated)?,
    })
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> AuthResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| AuthError::Storage(StoreError::Corrupt(format!("Invalid timestamp: {}", e))))
}
