//! Patchwise core library.
//!
//! Domain model, configuration, git plumbing, diff parsing and tracing setup
//! shared by the other patchwise crates.

pub mod config;
pub mod diff;
pub mod domain;
pub mod git;
pub mod obs;
pub mod telemetry;

pub use config::{BackendSettings, PatchwiseConfig, ProviderKind, ProviderSettings, RunSettings};
pub use diff::{AddedLine, FileDiff, PatchDiff};
pub use domain::{
    CheckError, CheckErrorKind, CheckOutcome, CheckPolicy, CheckScope, CheckSpec,
    DiagnosticFormat, EquivalenceRule, Execution, Finding, FindingContent, FindingOrder, Location,
    OutcomeClass, OutcomeSummary, OutputKind, PatchReference, PatchwiseError, Repeat, Report,
    Result, ReviewKind, Severity, TouchFilter, Verdict,
};
pub use git::{capture_head_sha, is_git_repo, patch_reference};
pub use obs::{
    emit_check_finished, emit_check_started, emit_run_cancelled, emit_run_finished,
    emit_run_started, run_span,
};
pub use telemetry::init_tracing;

/// Patchwise version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
