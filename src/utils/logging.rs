//! Process-wide `tracing` setup.
//!
//! `RUST_LOG` wins when it is set. Otherwise the worker logs at the
//! configured level, with the AMQP client held to warnings.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingSettings;

/// Crates whose own logs drown out the worker's at `info`.
const QUIET_CRATES: [&str; 2] = ["lapin", "pinky_swear"];

pub fn init(settings: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| build_filter(&settings.level));

    // try_init: tests and embedders may have installed a subscriber already
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Filter for a configured level; unknown levels fall back to `info`.
pub(crate) fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(filter_directive(level)).unwrap_or_else(|_| EnvFilter::new("info"))
}

pub(crate) fn filter_directive(level: &str) -> String {
    let level = normalize_level(level);
    let mut directive = level.to_string();
    for name in QUIET_CRATES {
        directive.push_str(&format!(",{name}=warn"));
    }
    directive
}

fn normalize_level(level: &str) -> &'static str {
    match level.trim().to_lowercase().as_str() {
        "error" => "error",
        "warn" | "warning" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        "off" => "off",
        _ => "info",
    }
}
