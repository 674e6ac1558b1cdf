use thiserror::Error;

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Invalid route pattern: {0}")]
    InvalidRoute(#[from] regex::Error),
}

/// Failure reported by the identity provider
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Identity provider error: {0}")]
pub struct ProviderError(pub String);

pub type GuardResult<T> = std::result::Result<T, GuardError>;
