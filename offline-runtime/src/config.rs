//! Runtime configuration
//!
//! Sources, later ones winning:
//! 1. `.env` in the working directory (optional)
//! 2. Built-in defaults
//! 3. An optional config file; format follows the extension
//! 4. `LABDESK__SECTION__KEY` environment variables

use auth_offline::OfflineAuthConfig;
use config::{Config, Environment, File};
use mirror_store::StoreConfig;
use mirror_sync::SyncConfig;
use serde::Deserialize;
use std::path::Path;

pub const ENV_PREFIX: &str = "LABDESK";

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Level for the data-layer crates; `RUST_LOG` overrides it
    #[serde(default = "default_level")]
    pub level: String,
    /// JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub auth: OfflineAuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Load configuration from `.env`, `path` and the environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(anyhow::anyhow!("Failed to read .env: {}", e));
            }
        }
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    pub(crate) fn load_with_prefix(path: Option<&Path>, prefix: &str) -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(prefix)
                .prefix_separator("__")
                .separator("__"),
        );

        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?
            .try_deserialize::<RuntimeConfig>()
            .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::io::Write;

    #[test]
    fn test_defaults_without_sources() {
        let config = RuntimeConfig::load_with_prefix(None, "LABDESK_TEST_DEFAULTS").unwrap();
        assert_eq!(config.store.db_path, "labdesk_mirror.db");
        assert!(config.store.enable_wal);
        assert_eq!(config.sync.server_url, "http://localhost:3000");
        assert!(config.sync.auth_token.is_none());
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert_eq!(config.auth.shared_passphrase.expose_secret(), "labdesk-offline");
    }

    #[test]
    fn test_file_then_environment() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[store]
db_path = "/var/lib/labdesk/mirror.db"
max_connections = 3

[sync]
server_url = "https://file.example.com"
auth_token = "from-file"

[auth]
shared_passphrase = "branch-2"
"#
        )
        .unwrap();

        std::env::set_var("LABDESK_TEST_LAYERS__SYNC__SERVER_URL", "https://env.example.com");
        std::env::set_var("LABDESK_TEST_LAYERS__LOGGING__JSON", "true");

        let config = RuntimeConfig::load_with_prefix(Some(file.path()), "LABDESK_TEST_LAYERS").unwrap();

        assert_eq!(config.store.db_path, "/var/lib/labdesk/mirror.db");
        assert_eq!(config.store.max_connections, 3);
        assert_eq!(config.sync.server_url, "https://env.example.com");
        assert_eq!(config.sync.auth_token.as_deref(), Some("from-file"));
        assert_eq!(config.auth.shared_passphrase.expose_secret(), "branch-2");
        assert!(config.logging.json);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = RuntimeConfig::load_with_prefix(
            Some(Path::new("/nonexistent/labdesk.toml")),
            "LABDESK_TEST_MISSING",
        );
        assert!(result.is_err());
    }
}
