//! Logging setup
//!
//! Everything goes to stderr so `steward ask --json` keeps stdout clean.
//! `RUST_LOG` replaces the computed filter entirely.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Crates whose events follow the configured level; everything else is `warn`
const OWN_TARGETS: [&str; 3] = ["steward_engine", "steward", "sdk"];

/// Filter directives for `log_level`
pub fn default_directives(log_level: &str) -> String {
    let mut directives = vec!["warn".to_string()];
    directives.extend(
        OWN_TARGETS
            .iter()
            .map(|target| format!("{}={}", target, log_level)),
    );
    directives.join(",")
}

/// Install the global subscriber. Debug builds log pretty lines, release
/// builds log JSON with the current span. A second call is a no-op.
pub fn init_telemetry_with_level(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(log_level)));

    let layer = fmt::layer().with_writer(std::io::stderr);

    #[cfg(debug_assertions)]
    let result = tracing_subscriber::registry()
        .with(filter)
        .with(layer.pretty().with_target(false))
        .try_init();

    #[cfg(not(debug_assertions))]
    let result = tracing_subscriber::registry()
        .with(filter)
        .with(layer.json().with_current_span(true))
        .try_init();

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
