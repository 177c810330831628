//! Log output for depot binaries.
//!
//! Logs always go to stderr: stdout carries command output (reports, JSON,
//! shell exports) that callers parse. Verbosity comes from `DEPOT_LOG`,
//! then `RUST_LOG`, then the level chosen on the command line. The default
//! filter applies that level to the depot crates only and keeps third-party
//! crates at `warn`.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter override read before `RUST_LOG`.
pub const LOG_ENV: &str = "DEPOT_LOG";

const DEPOT_TARGETS: &[&str] = &["depot", "depot_core", "depot_ci", "depot_env"];

/// Filter directives for `level` when no environment override is set.
fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    std::iter::once("warn".to_string())
        .chain(DEPOT_TARGETS.iter().map(|t| format!("{}={}", t, level)))
        .collect::<Vec<_>>()
        .join(",")
}

/// Pick the directives to use. Blank or unparsable overrides are skipped.
fn select_directives(depot_log: Option<&str>, rust_log: Option<&str>, level: Level) -> String {
    [depot_log, rust_log]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|d| !d.is_empty() && EnvFilter::try_new(d).is_ok())
        .map(str::to_string)
        .unwrap_or_else(|| default_directives(level))
}

/// Install the global subscriber. Only the first call in a process has
/// any effect.
pub fn init_tracing(json: bool, level: Level) {
    let depot_log = std::env::var(LOG_ENV).ok();
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directives = select_directives(depot_log.as_deref(), rust_log.as_deref(), level);
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("warn"));

    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let installed = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json().with_current_span(true))
            .try_init()
    } else {
        tracing_subscriber::registry().with(filter).with(layer).try_init()
    };
    if installed.is_ok() {
        tracing::debug!(filter = %directives, json, "Logging initialised");
    }
}
