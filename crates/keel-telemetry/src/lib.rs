//! Tracing subscriber setup shared by the keel binary and its tests.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use keel_settings::LoggingSettings;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter {filter:?}: {detail}")]
    InvalidFilter { filter: String, detail: String },

    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Handle returned by [`init_telemetry`]. Holds the effective filter so the
/// binary can report it.
#[derive(Debug)]
pub struct TelemetryGuard {
    filter: String,
}

impl TelemetryGuard {
    pub fn filter(&self) -> &str {
        &self.filter
    }
}

/// Build the filter directive string from settings: the base level followed
/// by per-module overrides.
pub fn filter_directives(settings: &LoggingSettings) -> String {
    let mut filter = settings.level.to_lowercase();
    for (module, level) in &settings.module_levels {
        filter.push_str(&format!(",{}={}", module, level.to_lowercase()));
    }
    filter
}

/// Install the global subscriber, writing to stderr. `RUST_LOG` takes
/// precedence over the configured levels. Call once at startup.
pub fn init_telemetry(settings: &LoggingSettings) -> Result<TelemetryGuard, TelemetryError> {
    let configured = filter_directives(settings);
    let (env_filter, effective) = match EnvFilter::try_from_default_env() {
        Ok(filter) => {
            let shown = filter.to_string();
            (filter, shown)
        }
        Err(_) => {
            let filter = EnvFilter::try_new(&configured).map_err(|e| TelemetryError::InvalidFilter {
                filter: configured.clone(),
                detail: e.to_string(),
            })?;
            (filter, configured)
        }
    };

    let json_layer = settings.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
    });
    let text_layer = (!settings.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|_| TelemetryError::AlreadyInitialized)?;

    tracing::debug!(filter = %effective, json = settings.json, "telemetry initialized");
    Ok(TelemetryGuard { filter: effective })
}
