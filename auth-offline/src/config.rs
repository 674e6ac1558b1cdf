use secrecy::SecretString;
use serde::Deserialize;

/// Offline sign-in settings.
///
/// Every cached identity signs in offline with the same passphrase.
#[derive(Debug, Deserialize)]
pub struct OfflineAuthConfig {
    #[serde(default = "default_shared_passphrase")]
    pub shared_passphrase: SecretString,
}

fn default_shared_passphrase() -> SecretString {
    SecretString::new("labdesk-offline".to_string())
}

impl Default for OfflineAuthConfig {
    fn default() -> Self {
        Self {
            shared_passphrase: default_shared_passphrase(),
        }
    }
}

impl OfflineAuthConfig {
    pub fn with_passphrase(passphrase: impl Into<String>) -> Self {
        Self {
            shared_passphrase: SecretString::new(passphrase.into()),
        }
    }
}
