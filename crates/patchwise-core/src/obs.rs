//! Structured lifecycle events for a patchwise run.
//!
//! - [`run_span`]: the span every event of a run is recorded under
//! - `emit_*`: one function per lifecycle event, all at `info!` except
//!   failures
//!
//! Field names are stable so JSON log consumers can key on `event`.

use tracing::{info, warn};

/// Span carrying `run_id` and `range`. Attach it to the run's future with
/// [`tracing::Instrument`] so it survives await points.
///
/// ```ignore
/// pipeline_future.instrument(run_span("5f0c…", "abc123..def456")).await
/// ```
pub fn run_span(run_id: &str, range: &str) -> tracing::Span {
    tracing::info_span!("patchwise.run", run_id = %run_id, range = %range)
}

pub fn emit_run_started(run_id: &str, range: &str, checks: usize, max_concurrency: usize) {
    info!(
        event = "run.started",
        run_id = %run_id,
        range = %range,
        checks = checks,
        max_concurrency = max_concurrency,
    );
}

pub fn emit_check_started(check_id: &str, environment_id: &str) {
    info!(event = "check.started", check = %check_id, environment = %environment_id);
}

/// `class` is the outcome classification; `error` its error kind, if any.
pub fn emit_check_finished(check_id: &str, class: &str, elapsed_ms: u64, error: Option<&str>) {
    if let Some(error) = error {
        warn!(
            event = "check.finished",
            check = %check_id,
            class = %class,
            elapsed_ms = elapsed_ms,
            error = %error,
        );
    } else {
        info!(
            event = "check.finished",
            check = %check_id,
            class = %class,
            elapsed_ms = elapsed_ms,
        );
    }
}

pub fn emit_run_finished(run_id: &str, verdict: &str, findings: usize, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        verdict = %verdict,
        findings = findings,
        duration_ms = duration_ms,
    );
}

pub fn emit_run_cancelled(run_id: &str) {
    warn!(event = "run.cancelled", run_id = %run_id);
}
