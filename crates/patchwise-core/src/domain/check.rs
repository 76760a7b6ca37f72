//! Check definitions.
//!
//! A [`CheckSpec`] is configuration data: which environment a check needs,
//! how to run it, how to read its output and whether it may fail a run.
//! The engine never special-cases a check by name.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::diff::PatchDiff;
use crate::domain::error::{PatchwiseError, Result};

/// Placeholders a command may reference. Anything else is rejected when the
/// spec is validated.
pub const COMMAND_PLACEHOLDERS: &[&str] = &[
    "base",
    "target",
    "tree",
    "touched_files",
    "touched_dirs",
    "jobs",
];

/// Extra placeholder available to commands repeated per touched directory.
pub const DIR_PLACEHOLDER: &str = "dir";

/// Whether a check's failure can fail the overall verdict by itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckPolicy {
    #[default]
    Mandatory,
    Advisory,
}

/// Line format of a structured diagnostics stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticFormat {
    /// `file:line[:col]: [severity:] message` (sparse, compilers, dtc, dt-schema).
    Gcc,
    /// checkpatch.pl `--showfile` output.
    Checkpatch,
    /// coccinelle report mode, `file:line:col-col: message`.
    Coccinelle,
}

/// How a check's output is interpreted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputKind {
    StructuredDiagnostics { format: DiagnosticFormat },
    FreeTextReview,
}

/// The two AI reviewer prompt variants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReviewKind {
    /// Audits the commit message prose.
    CommitAudit,
    /// Inline, line-anchored review of the diff.
    CodeReview,
}

impl ReviewKind {
    pub fn name(&self) -> &'static str {
        match self {
            ReviewKind::CommitAudit => "commit_audit",
            ReviewKind::CodeReview => "code_review",
        }
    }
}

/// How often a command runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Repeat {
    #[default]
    Once,
    /// Once per directory containing a touched file, with `{dir}` bound.
    PerTouchedDirectory,
}

/// Execution contract of a check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Execution {
    /// Run an external program inside the environment.
    Command {
        /// Program and arguments; first element is the executable.
        argv: Vec<String>,

        /// Working directory relative to the tree root.
        #[serde(default)]
        workdir: Option<PathBuf>,

        /// Non-zero exit codes that still mean "ran fine, reported issues".
        #[serde(default)]
        soft_failure_codes: Vec<i32>,

        #[serde(default)]
        repeat: Repeat,
    },
    /// Ask the AI reviewer.
    Review { kind: ReviewKind },
}

/// Which findings survive normalization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckScope {
    /// Keep only findings in files the patch touched.
    #[default]
    TouchedFiles,
    /// Keep findings anywhere in the tree.
    WholeTree,
}

/// Restricts a check to patches that touch matching files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TouchFilter {
    /// Path prefix a touched file must start with.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Accepted file name endings; empty accepts any file.
    #[serde(default)]
    pub suffixes: Vec<String>,
}

fn default_timeout_secs() -> u64 {
    1800
}

/// A named check definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckSpec {
    /// Unique check identifier (e.g. "sparse").
    pub id: String,

    /// Environment the check runs in.
    pub environment_id: String,

    pub execution: Execution,

    pub output: OutputKind,

    #[serde(default)]
    pub policy: CheckPolicy,

    /// Per-check timeout in seconds (0 disables the timeout).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub scope: CheckScope,

    /// Local patches applied on top of the target revision before running.
    #[serde(default)]
    pub fixup_patches: Vec<PathBuf>,

    /// Free-form group tags ("short", "llm", ...).
    #[serde(default)]
    pub tags: Vec<String>,

    /// Skip the check unless the patch touches a matching file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applies_to: Option<TouchFilter>,
}

impl CheckSpec {
    /// Create a command check with default policy, scope and timeout.
    pub fn command(
        id: impl Into<String>,
        environment_id: impl Into<String>,
        argv: Vec<String>,
        format: DiagnosticFormat,
    ) -> Self {
        Self {
            id: id.into(),
            environment_id: environment_id.into(),
            execution: Execution::Command {
                argv,
                workdir: None,
                soft_failure_codes: Vec::new(),
                repeat: Repeat::Once,
            },
            output: OutputKind::StructuredDiagnostics { format },
            policy: CheckPolicy::Mandatory,
            timeout_secs: default_timeout_secs(),
            scope: CheckScope::TouchedFiles,
            fixup_patches: Vec::new(),
            tags: Vec::new(),
            applies_to: None,
        }
    }

    /// Create an AI review check. Review checks are advisory by default.
    pub fn review(
        id: impl Into<String>,
        environment_id: impl Into<String>,
        kind: ReviewKind,
    ) -> Self {
        Self {
            id: id.into(),
            environment_id: environment_id.into(),
            execution: Execution::Review { kind },
            output: OutputKind::FreeTextReview,
            policy: CheckPolicy::Advisory,
            timeout_secs: 600,
            scope: CheckScope::WholeTree,
            fixup_patches: Vec::new(),
            tags: Vec::new(),
            applies_to: None,
        }
    }

    pub fn with_policy(mut self, policy: CheckPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_scope(mut self, scope: CheckScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_soft_failure_codes(mut self, codes: Vec<i32>) -> Self {
        if let Execution::Command {
            soft_failure_codes, ..
        } = &mut self.execution
        {
            *soft_failure_codes = codes;
        }
        self
    }

    pub fn with_repeat(mut self, value: Repeat) -> Self {
        if let Execution::Command { repeat, .. } = &mut self.execution {
            *repeat = value;
        }
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_applies_to(mut self, prefix: Option<&str>, suffixes: &[&str]) -> Self {
        self.applies_to = Some(TouchFilter {
            prefix: prefix.map(str::to_string),
            suffixes: suffixes.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    /// Whether the check has anything to look at in `diff`.
    pub fn applies_to_diff(&self, diff: &PatchDiff) -> bool {
        let Some(filter) = &self.applies_to else {
            return true;
        };
        let suffixes: Vec<&str> = filter.suffixes.iter().map(String::as_str).collect();
        if suffixes.is_empty() {
            return diff.touches_matching(filter.prefix.as_deref(), &[""]);
        }
        diff.touches_matching(filter.prefix.as_deref(), &suffixes)
    }

    pub fn is_mandatory(&self) -> bool {
        self.policy == CheckPolicy::Mandatory
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// `None` when the timeout is disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// Reject specs the engine could not run.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| PatchwiseError::InvalidCheckSpec {
            check: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("check id is empty".to_string()));
        }
        if self.environment_id.trim().is_empty() {
            return Err(invalid("environment id is empty".to_string()));
        }

        match (&self.execution, &self.output) {
            (Execution::Review { .. }, OutputKind::StructuredDiagnostics { .. }) => {
                return Err(invalid(
                    "review checks must produce free-text output".to_string(),
                ));
            }
            (Execution::Command { argv, repeat, .. }, _) => {
                if argv.is_empty() {
                    return Err(invalid("command is empty".to_string()));
                }
                for arg in argv {
                    for name in placeholders(arg) {
                        let allowed = COMMAND_PLACEHOLDERS.contains(&name)
                            || (name == DIR_PLACEHOLDER && *repeat == Repeat::PerTouchedDirectory);
                        if !allowed {
                            return Err(invalid(format!("unknown placeholder {{{name}}}")));
                        }
                    }
                }
            }
            _ => {}
        }

        for patch in &self.fixup_patches {
            if patch.as_os_str().is_empty() {
                return Err(invalid("empty fixup patch path".to_string()));
            }
        }

        Ok(())
    }
}

/// Names of `{placeholder}` tokens in `arg`. Only lowercase identifiers
/// count, so shell syntax such as `${HOME}` passes through untouched.
pub fn placeholders(arg: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut rest = arg;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                let is_ident = !name.is_empty()
                    && name.chars().all(|c| c.is_ascii_lowercase() || c == '_');
                if is_ident && !rest[..open].ends_with('$') {
                    names.push(name);
                }
                rest = &after[close + 1..];
            }
            None => break,
        }
    }
    names
}
