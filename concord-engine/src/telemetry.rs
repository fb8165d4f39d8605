//! Tracing subscriber setup.
//!
//! The engine only emits `tracing` events. Binaries embedding it call
//! [`init_tracing`] once at startup; libraries and tests leave the
//! subscriber alone.

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter applied when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "concord_engine=info,concord_storage=info,warn";

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Reported in the startup event.
    pub service_name: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Filter directive used when `RUST_LOG` is unset or invalid.
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "concord".to_string(),
            json: true,
            default_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Read `CONCORD_SERVICE_NAME` and `CONCORD_LOG_JSON`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("CONCORD_SERVICE_NAME").unwrap_or(defaults.service_name),
            json: std::env::var("CONCORD_LOG_JSON")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(defaults.json),
            default_filter: defaults.default_filter,
        }
    }
}

/// Install the global subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()?;
    }

    tracing::info!(service_name = %config.service_name, json = config.json, "Tracing initialized");
    Ok(())
}
