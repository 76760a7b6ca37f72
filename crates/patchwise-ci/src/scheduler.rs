//! Concurrent check scheduling.
//!
//! Every selected check runs in its own task, bounded by a semaphore of
//! `max_concurrency` permits. A task acquires an environment instance,
//! materializes the target revision, runs the check, then tears down the
//! tree and returns the instance. Nothing a single check does can take down
//! its siblings: failures, timeouts and panics all become that check's
//! outcome.

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use patchwise_core::{
    emit_check_finished, emit_check_started, CheckError, CheckErrorKind, CheckOutcome, CheckSpec,
    OutcomeClass, PatchReference, PatchwiseError, Result,
};
use patchwise_env::{EnvironmentHandle, EnvironmentProvider, Materializer};

use crate::events::CheckEvent;
use crate::runner::{CheckRunner, RunContext};

/// Runs a set of checks against one patch.
pub struct Scheduler {
    provider: Arc<dyn EnvironmentProvider>,
    materializer: Arc<dyn Materializer>,
    runner: Arc<CheckRunner>,
    max_concurrency: usize,
    timeout_override: Option<Duration>,
    events: Option<mpsc::UnboundedSender<CheckEvent>>,
}

impl Scheduler {
    pub fn new(
        provider: Arc<dyn EnvironmentProvider>,
        materializer: Arc<dyn Materializer>,
        runner: Arc<CheckRunner>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            provider,
            materializer,
            runner,
            max_concurrency: max_concurrency.max(1),
            timeout_override: None,
            events: None,
        }
    }

    /// Apply one timeout to every check instead of each check's own.
    pub fn with_timeout_override(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_override = timeout;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<CheckEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Problems that make the whole run impossible.
    pub fn validate(patch: &PatchReference, specs: &[CheckSpec]) -> Result<()> {
        patch.validate()?;
        if specs.is_empty() {
            return Err(PatchwiseError::NoChecks);
        }
        let mut seen = HashSet::new();
        for spec in specs {
            if !seen.insert(spec.id.as_str()) {
                return Err(PatchwiseError::DuplicateCheck(spec.id.clone()));
            }
            spec.validate()?;
        }
        Ok(())
    }

    /// Run every check and return exactly one outcome per spec, in the
    /// order the specs were given.
    #[instrument(skip_all, fields(checks = specs.len(), max_concurrency = self.max_concurrency))]
    pub async fn run_all(
        &self,
        ctx: Arc<RunContext>,
        specs: &[CheckSpec],
        cancel: &CancellationToken,
    ) -> Result<Vec<CheckOutcome>> {
        Self::validate(&ctx.patch, specs)?;

        let sem = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = Vec::with_capacity(specs.len());

        for spec in specs {
            self.send(CheckEvent::Queued {
                check_id: spec.id.clone(),
            });
            let job = CheckJob {
                provider: Arc::clone(&self.provider),
                materializer: Arc::clone(&self.materializer),
                runner: Arc::clone(&self.runner),
                timeout_override: self.timeout_override,
                events: self.events.clone(),
            };
            let spec = spec.clone();
            let ctx = Arc::clone(&ctx);
            let sem = Arc::clone(&sem);
            let cancel = cancel.clone();

            tasks.push(tokio::spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = sem.acquire_owned() => permit.ok(),
                };
                let outcome = match permit {
                    Some(_permit) if !cancel.is_cancelled() => job.execute(&spec, &ctx, &cancel).await,
                    _ => CheckOutcome::cancelled(&spec.id),
                };
                job.finished(&outcome);
                outcome
            }));
        }

        let outcomes = join_all(tasks)
            .await
            .into_iter()
            .zip(specs)
            .map(|(joined, spec)| match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(check = %spec.id, error = %err, "check task aborted");
                    let outcome = CheckOutcome::infrastructure_failure(
                        &spec.id,
                        CheckError::new(
                            CheckErrorKind::InfrastructureFailure,
                            format!("check task failed: {err}"),
                        ),
                    );
                    emit_check_finished(
                        &spec.id,
                        outcome.class.as_str(),
                        0,
                        outcome.error_kind().map(|k| k.as_str()),
                    );
                    self.send(CheckEvent::Finished {
                        check_id: spec.id.clone(),
                        class: outcome.class,
                        elapsed_ms: 0,
                    });
                    outcome
                }
            })
            .collect();
        Ok(outcomes)
    }

    fn send(&self, event: CheckEvent) {
        if let Some(events) = &self.events {
            // A dropped receiver just means nobody is watching.
            let _ = events.send(event);
        }
    }
}

/// Everything one check task needs, detached from the scheduler's lifetime.
struct CheckJob {
    provider: Arc<dyn EnvironmentProvider>,
    materializer: Arc<dyn Materializer>,
    runner: Arc<CheckRunner>,
    timeout_override: Option<Duration>,
    events: Option<mpsc::UnboundedSender<CheckEvent>>,
}

impl CheckJob {
    async fn execute(&self, spec: &CheckSpec, ctx: &RunContext, cancel: &CancellationToken) -> CheckOutcome {
        if !spec.applies_to_diff(&ctx.diff) {
            info!(check = %spec.id, "patch touches nothing this check covers, skipping");
            return CheckOutcome::new(&spec.id, OutcomeClass::Clean);
        }

        let acquired = tokio::select! {
            _ = cancel.cancelled() => return CheckOutcome::cancelled(&spec.id),
            acquired = self.provider.acquire(&spec.environment_id) => acquired,
        };
        let handle = match acquired {
            Ok(handle) => handle,
            Err(err) => {
                warn!(check = %spec.id, environment = %spec.environment_id, error = %err, "environment unavailable");
                return CheckOutcome::infrastructure_failure(&spec.id, err.to_check_error());
            }
        };

        emit_check_started(&spec.id, &spec.environment_id);
        self.send(CheckEvent::Started {
            check_id: spec.id.clone(),
            environment_id: spec.environment_id.clone(),
        });

        // The instance goes back even if the check panics.
        let outcome = AssertUnwindSafe(self.run_in(spec, &handle, ctx, cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| panicked(&spec.id, panic.as_ref()));

        if let Err(err) = self.provider.release(handle).await {
            warn!(check = %spec.id, error = %err, "failed to release environment");
        }
        outcome
    }

    async fn run_in(
        &self,
        spec: &CheckSpec,
        handle: &EnvironmentHandle,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> CheckOutcome {
        let tree = match self
            .materializer
            .materialize(handle, &ctx.patch, &spec.fixup_patches)
            .await
        {
            Ok(tree) => tree,
            Err(err) => {
                warn!(check = %spec.id, error = %err, "failed to materialize tree");
                return CheckOutcome::infrastructure_failure(&spec.id, err.to_check_error());
            }
        };

        let outcome = if cancel.is_cancelled() {
            CheckOutcome::cancelled(&spec.id)
        } else {
            let timeout = self.timeout_override.or_else(|| spec.timeout());
            AssertUnwindSafe(self.runner.run(spec, handle, &tree, ctx, timeout, cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| panicked(&spec.id, panic.as_ref()))
        };
        tree.destroy().await;
        outcome
    }

    fn finished(&self, outcome: &CheckOutcome) {
        let kind = outcome.error_kind().map(|k| k.as_str());
        emit_check_finished(&outcome.check_id, outcome.class.as_str(), outcome.elapsed_ms, kind);
        self.send(CheckEvent::Finished {
            check_id: outcome.check_id.clone(),
            class: outcome.class,
            elapsed_ms: outcome.elapsed_ms,
        });
    }

    fn send(&self, event: CheckEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// A panic inside one check becomes that check's infrastructure failure.
fn panicked(check_id: &str, panic: &(dyn Any + Send)) -> CheckOutcome {
    let detail = if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    warn!(check = %check_id, detail = %detail, "check panicked");
    CheckOutcome::infrastructure_failure(
        check_id,
        CheckError::new(
            CheckErrorKind::InfrastructureFailure,
            format!("check panicked: {detail}"),
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchwise_core::{DiagnosticFormat, PatchwiseError};
    use std::path::PathBuf;

    fn patch() -> PatchReference {
        PatchReference {
            repo_path: PathBuf::from("/src/linux"),
            base_revision: "abc".to_string(),
            target_revision: "def".to_string(),
        }
    }

    fn check(id: &str) -> CheckSpec {
        CheckSpec::command(id, "base", vec!["true".to_string()], DiagnosticFormat::Gcc)
    }

    #[test]
    fn test_validate_rejects_empty_selection() {
        let err = Scheduler::validate(&patch(), &[]).unwrap_err();
        assert!(matches!(err, PatchwiseError::NoChecks));
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let err = Scheduler::validate(&patch(), &[check("a"), check("b"), check("a")]).unwrap_err();
        assert!(matches!(err, PatchwiseError::DuplicateCheck(id) if id == "a"));
    }

    #[test]
    fn test_validate_rejects_bad_patch() {
        let mut bad = patch();
        bad.target_revision.clear();
        let err = Scheduler::validate(&bad, &[check("a")]).unwrap_err();
        assert!(matches!(err, PatchwiseError::InvalidPatchReference(_)));
    }

    #[test]
    fn test_validate_accepts_distinct_checks() {
        Scheduler::validate(&patch(), &[check("a"), check("b")]).unwrap();
    }
}
