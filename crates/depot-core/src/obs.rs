//! Structured lifecycle events for depot runs.
//!
//! Every event is a record with an `event` field so log pipelines
//! can filter on it:
//!
//! - `task.started` / `task.finished`
//! - `cache.hit` / `cache.built`
//! - `task.failed`
//! - `run.finished`

use tracing::{info, warn};

/// Span for one run, for use with `tracing::Instrument`.
///
/// ```ignore
/// orchestrate(...).instrument(run_span("6f1c...")).await
/// // every record inside carries run_id
/// ```
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("depot.run", run_id = %run_id)
}

/// Span for one task, for use with `tracing::Instrument`.
pub fn task_span(task: &str) -> tracing::Span {
    tracing::info_span!("depot.task", task = %task)
}

pub fn emit_task_started(task: &str, key: &str) {
    info!(event = "task.started", task = %task, key = %key);
}

pub fn emit_task_finished(task: &str, outcome: &str, cached: bool, duration_ms: u64) {
    info!(
        event = "task.finished",
        task = %task,
        outcome = %outcome,
        cached = cached,
        duration_ms = duration_ms,
    );
}

/// A published entry was reused instead of rebuilt.
pub fn emit_cache_hit(kind: &str, key: &str) {
    info!(event = "cache.hit", kind = %kind, key = %key);
}

/// A new entry was built and published.
pub fn emit_cache_built(kind: &str, key: &str, duration_ms: u64) {
    info!(event = "cache.built", kind = %kind, key = %key, duration_ms = duration_ms);
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, failed_tasks: usize, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        failed_tasks = failed_tasks,
        success = success,
    );
}

/// A task failed; diagnostics are stored under `log_digest`.
pub fn emit_task_failed(task: &str, category: &str, log_digest: &str) {
    warn!(event = "task.failed", task = %task, category = %category, log = %log_digest);
}
