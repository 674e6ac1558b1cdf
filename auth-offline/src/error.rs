use mirror_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid credentials")]
    CredentialsInvalid,

    #[error("No cached identity with id {0}")]
    IdentityNotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        AuthError::Storage(StoreError::Unavailable(err))
    }
}

pub type AuthResult<T> = std::result::Result<T, AuthError>;
