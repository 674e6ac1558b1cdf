use crate::config::LoggingConfig;
use tracing_subscriber::fmt::{self, time::ChronoUtc};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

fn default_directives(level: &str) -> String {
    format!(
        "offline_runtime={level},mirror_sync={level},mirror_store={level},auth_offline={level},access_guard={level},sqlx=warn,reqwest=info"
    )
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
///
/// Returns `false` if a subscriber was already installed.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.level)));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .json(),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_level(true),
            )
            .try_init()
    };

    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "Tracing already initialized");
            false
        }
    }
}
