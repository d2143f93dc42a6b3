//! Tracing subscriber setup.

use burypoint_core::LoggingConfig;
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Failed to init subscriber: {0}")]
    Init(String),
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured filter. Output is JSON
/// lines when `json` is set, human-readable otherwise.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            EnvFilter::try_new(&config.filter).map_err(|e| TelemetryError::InvalidFilter {
                filter: config.filter.clone(),
                reason: e.to_string(),
            })?
        }
    };

    let (json, plain) = if config.json {
        (Some(fmt::layer().json()), None)
    } else {
        (None, Some(fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json)
        .with(plain)
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_filter_is_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            filter: "burypoint=loud".to_string(),
            json: false,
        };
        assert!(matches!(
            init_tracing(&config),
            Err(TelemetryError::InvalidFilter { .. })
        ));
    }
}
