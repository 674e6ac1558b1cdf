//! Labdesk offline data layer runtime
//!
//! Loads configuration, installs logging and builds the mirror store,
//! connectivity monitor, sync engine, offline identity cache and route
//! gate as one [`OfflineRuntime`].

pub mod config;
pub mod runtime;
pub mod telemetry;

pub use config::{LoggingConfig, RuntimeConfig};
pub use runtime::OfflineRuntime;
pub use telemetry::init_tracing;
