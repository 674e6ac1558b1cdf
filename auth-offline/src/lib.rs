//! Offline sign-in for Labdesk
//!
//! When the identity provider cannot be reached, staff sign in against
//! identities cached during earlier online sessions:
//! - `OfflineIdentityCache` stores identities and the active pointer
//! - Credentials are a cached username/email plus the shared passphrase
//! - Storage failures read as "not signed in"

pub mod cache;
pub mod config;
pub mod error;
pub mod models;

pub use cache::OfflineIdentityCache;
pub use config::OfflineAuthConfig;
pub use error::{AuthError, AuthResult};
pub use models::{OfflineIdentity, Role};
