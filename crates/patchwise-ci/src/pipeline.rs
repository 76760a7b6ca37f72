//! End-to-end run orchestration.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument};
use uuid::Uuid;

use patchwise_core::{
    emit_run_cancelled, emit_run_finished, emit_run_started, run_span, CheckSpec, PatchReference,
    Report, Result,
};

use crate::aggregate::{self, Aggregation};
use crate::normalize::normalize_all;
use crate::runner::RunContext;
use crate::scheduler::Scheduler;

/// Runs selected checks against a patch and merges what they found.
pub struct Pipeline {
    scheduler: Scheduler,
    aggregation: Aggregation,
    jobs: usize,
}

impl Pipeline {
    pub fn new(scheduler: Scheduler) -> Self {
        let jobs = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            scheduler,
            aggregation: Aggregation::default(),
            jobs,
        }
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Parallelism handed to build tools through `{jobs}`.
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// Execute a run.
    ///
    /// Fails only for problems that make the run impossible (invalid patch
    /// reference, bad check configuration, unreadable repository). Anything
    /// that goes wrong in an individual check is reported in that check's
    /// outcome. If `cancel` fires the partial report is still returned.
    pub async fn run(
        &self,
        patch: &PatchReference,
        specs: &[CheckSpec],
        cancel: &CancellationToken,
    ) -> Result<Report> {
        Scheduler::validate(patch, specs)?;

        let run_id = Uuid::new_v4();
        let span = run_span(&run_id.to_string(), &patch.range());
        self.execute(run_id, patch, specs, cancel).instrument(span).await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        patch: &PatchReference,
        specs: &[CheckSpec],
        cancel: &CancellationToken,
    ) -> Result<Report> {
        let started_at = Utc::now();
        let start = Instant::now();
        let run_id_str = run_id.to_string();

        emit_run_started(
            &run_id_str,
            &patch.range(),
            specs.len(),
            self.scheduler.max_concurrency(),
        );

        let ctx = Arc::new(RunContext::prepare(patch.clone(), self.jobs).await?);
        info!(
            files = ctx.diff.files.len(),
            dirs = ctx.diff.touched_dirs().len(),
            "patch diff loaded"
        );

        let outcomes = self.scheduler.run_all(Arc::clone(&ctx), specs, cancel).await?;
        let findings = normalize_all(specs, &outcomes, &ctx.diff);
        let report = aggregate::build(
            run_id,
            patch,
            specs,
            &outcomes,
            findings,
            self.aggregation,
            started_at,
        );

        if cancel.is_cancelled() {
            emit_run_cancelled(&run_id_str);
        }
        emit_run_finished(
            &run_id_str,
            report.verdict.as_str(),
            report.findings.len(),
            start.elapsed().as_millis() as u64,
        );
        Ok(report)
    }
}
