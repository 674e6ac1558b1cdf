//! Navigation access control for Labdesk
//!
//! - `routes`: public paths, landing paths and the role route tables
//! - `provider`: seam for the external identity provider
//! - `guard`: `AccessGuard` decisions and the `RouteGate` state holder

pub mod error;
pub mod guard;
pub mod provider;
pub mod routes;

pub use error::{GuardError, GuardResult, ProviderError};
pub use guard::{AccessGuard, GuardDecision, GuardState, RouteGate};
pub use provider::{IdentityProvider, ProviderSession};
pub use routes::{landing_path, OFFLINE_LOGIN_PATH, PUBLIC_PREFIXES, SIGN_IN_PATH};
