//! Per-check results.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::error::{CheckError, CheckErrorKind};

/// How a check invocation ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    Clean,
    FindingsReported,
    ToolFailure,
    InfrastructureFailure,
    TimedOut,
    Cancelled,
}

impl OutcomeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeClass::Clean => "clean",
            OutcomeClass::FindingsReported => "findings_reported",
            OutcomeClass::ToolFailure => "tool_failure",
            OutcomeClass::InfrastructureFailure => "infrastructure_failure",
            OutcomeClass::TimedOut => "timed_out",
            OutcomeClass::Cancelled => "cancelled",
        }
    }

    /// True when the tool ran to completion and its output is worth parsing.
    pub fn produced_output(&self) -> bool {
        matches!(self, OutcomeClass::Clean | OutcomeClass::FindingsReported)
    }
}

impl std::fmt::Display for OutcomeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one check invocation. Built once by the runner (or the
/// scheduler, for failures outside the runner) and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckOutcome {
    pub check_id: String,
    pub class: OutcomeClass,

    /// Exit status of the tool; `None` for reviews, kills and failures
    /// before spawn.
    pub exit_code: Option<i32>,

    pub stdout: String,
    pub stderr: String,

    pub elapsed_ms: u64,

    pub error: Option<CheckError>,

    /// Root of the materialized tree, used to relativise diagnostic paths.
    pub tree_root: Option<PathBuf>,
}

impl CheckOutcome {
    pub fn new(check_id: impl Into<String>, class: OutcomeClass) -> Self {
        Self {
            check_id: check_id.into(),
            class,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            elapsed_ms: 0,
            error: None,
            tree_root: None,
        }
    }

    /// Outcome for a check that never reached its tool.
    pub fn infrastructure_failure(check_id: impl Into<String>, error: CheckError) -> Self {
        let mut outcome = Self::new(check_id, OutcomeClass::InfrastructureFailure);
        outcome.error = Some(error);
        outcome
    }

    /// Outcome for a check interrupted by run cancellation.
    pub fn cancelled(check_id: impl Into<String>) -> Self {
        let mut outcome = Self::new(check_id, OutcomeClass::Cancelled);
        outcome.error = Some(CheckError::new(
            CheckErrorKind::Cancelled,
            "run cancelled before the check finished",
        ));
        outcome
    }

    pub fn with_output(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self.stderr = stderr.into();
        self
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    pub fn with_error(mut self, error: CheckError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_tree_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.tree_root = Some(root.into());
        self
    }

    pub fn error_kind(&self) -> Option<CheckErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// stdout followed by stderr, as a single text stream.
    pub fn raw_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => {
                let mut out = self.stdout.clone();
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&self.stderr);
                out
            }
        }
    }

    /// Last `max_lines` non-empty lines of raw output.
    pub fn snippet(&self, max_lines: usize) -> String {
        let raw = self.raw_output();
        let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}
