//! Tracing subscriber setup.
//!
//! The library itself only emits `tracing` events. Hosts that do not install
//! their own subscriber can call [`init_tracing`] once at startup.
//!
//! # Environment Variables
//!
//! - `STEPWISE_LOG`: filter directive (falls back to `RUST_LOG`, then config)

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::TelemetrySettings;
use crate::error::{Error, Result};

/// Build the filter from STEPWISE_LOG, RUST_LOG, or the configured default.
pub fn build_filter(settings: &TelemetrySettings) -> EnvFilter {
    std::env::var("STEPWISE_LOG")
        .ok()
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(&settings.filter))
}

/// Install a global fmt subscriber.
///
/// Returns an error if a global subscriber is already set.
pub fn init_tracing(settings: &TelemetrySettings) -> Result<()> {
    let filter = build_filter(settings);

    let fmt_layer = if settings.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {}", e)))?;

    info!(json = settings.json, "Tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_reports_error() {
        let settings = TelemetrySettings::default();
        // The first call may lose to another test's subscriber; the second never succeeds.
        let _ = init_tracing(&settings);
        assert!(init_tracing(&settings).is_err());
    }

    #[test]
    fn test_build_filter_uses_configured_default() {
        let settings = TelemetrySettings {
            filter: "warn".to_string(),
            json: false,
        };
        let filter = build_filter(&settings);
        assert!(!filter.to_string().is_empty());
    }
}
