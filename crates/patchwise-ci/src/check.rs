//! Builtin checks and check selection.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use patchwise_core::{
    CheckScope, CheckSpec, DiagnosticFormat, PatchwiseError, Repeat, Result, ReviewKind,
};

/// Kernel build flags shared by the make-based checks.
const KBUILD: &str = "make -s O=.build LLVM=1";

/// Builtin checks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinCheck {
    /// scripts/checkpatch.pl over the commit range
    Checkpatch,

    /// make coccicheck, once per touched directory
    Coccicheck,

    /// make C=1 CHECK=sparse
    Sparse,

    /// make refcheckdocs dt_binding_check
    DtBindingCheck,

    /// make dtbs_check
    DtbsCheck,

    /// AI audit of the commit message
    CommitAudit,

    /// AI review of the diff
    CodeReview,
}

impl BuiltinCheck {
    pub const ALL: [BuiltinCheck; 7] = [
        BuiltinCheck::Checkpatch,
        BuiltinCheck::Coccicheck,
        BuiltinCheck::Sparse,
        BuiltinCheck::DtBindingCheck,
        BuiltinCheck::DtbsCheck,
        BuiltinCheck::CommitAudit,
        BuiltinCheck::CodeReview,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            BuiltinCheck::Checkpatch => "checkpatch",
            BuiltinCheck::Coccicheck => "coccicheck",
            BuiltinCheck::Sparse => "sparse",
            BuiltinCheck::DtBindingCheck => "dt-binding-check",
            BuiltinCheck::DtbsCheck => "dtbs-check",
            BuiltinCheck::CommitAudit => "commit-audit",
            BuiltinCheck::CodeReview => "code-review",
        }
    }

    pub fn environment_id(&self) -> &'static str {
        match self {
            BuiltinCheck::Checkpatch | BuiltinCheck::CommitAudit | BuiltinCheck::CodeReview => {
                "base"
            }
            BuiltinCheck::Coccicheck => "coccicheck",
            BuiltinCheck::Sparse => "sparse",
            BuiltinCheck::DtBindingCheck | BuiltinCheck::DtbsCheck => "dt-check",
        }
    }

    /// Programs the check expects to find in its environment.
    pub fn required_tools(&self) -> &'static [&'static str] {
        match self {
            BuiltinCheck::Checkpatch => &["perl", "git"],
            BuiltinCheck::Coccicheck => &["make", "spatch"],
            BuiltinCheck::Sparse => &["make", "sparse", "clang"],
            BuiltinCheck::DtBindingCheck => &["make", "dt-doc-validate", "yamllint"],
            BuiltinCheck::DtbsCheck => &["make", "dtc", "dt-validate"],
            BuiltinCheck::CommitAudit | BuiltinCheck::CodeReview => &[],
        }
    }

    pub fn spec(&self) -> CheckSpec {
        match self {
            BuiltinCheck::Checkpatch => CheckSpec::command(
                self.id(),
                self.environment_id(),
                argv(&[
                    "perl",
                    "scripts/checkpatch.pl",
                    "--quiet",
                    "--subjective",
                    "--strict",
                    "--showfile",
                    "--show-types",
                    "--codespell",
                    "--ignore",
                    "UNDOCUMENTED_DT_STRING,FILE_PATH_CHANGES,CONFIG_DESCRIPTION",
                    "--git",
                    "{base}..{target}",
                ]),
                DiagnosticFormat::Checkpatch,
            )
            .with_soft_failure_codes(vec![1])
            .with_timeout_secs(600)
            .with_tags(&["short", "static"]),

            BuiltinCheck::Coccicheck => CheckSpec::command(
                self.id(),
                self.environment_id(),
                shell(&format!(
                    "{KBUILD} ARCH=arm64 defconfig && {KBUILD} ARCH=arm64 scripts && \
                     {KBUILD} -j{{jobs}} ARCH=arm64 coccicheck M={{dir}} MODE=report"
                )),
                DiagnosticFormat::Coccinelle,
            )
            .with_repeat(Repeat::PerTouchedDirectory)
            .with_applies_to(None, &[".c", ".h"])
            .with_tags(&["short", "static"]),

            BuiltinCheck::Sparse => CheckSpec::command(
                self.id(),
                self.environment_id(),
                shell(&format!(
                    "{KBUILD} ARCH=arm64 defconfig && \
                     {KBUILD} -j{{jobs}} ARCH=arm64 C=1 CHECK=sparse"
                )),
                DiagnosticFormat::Gcc,
            )
            .with_applies_to(None, &[".c", ".h"])
            .with_timeout_secs(3600)
            .with_tags(&["long", "static"]),

            BuiltinCheck::DtBindingCheck => CheckSpec::command(
                self.id(),
                self.environment_id(),
                shell(&format!(
                    "{KBUILD} -j{{jobs}} ARCH=arm refcheckdocs; \
                     {KBUILD} -j{{jobs}} ARCH=arm DT_CHECKER_FLAGS=-m dt_binding_check"
                )),
                DiagnosticFormat::Gcc,
            )
            .with_applies_to(Some("Documentation/"), &[".yaml"])
            .with_timeout_secs(3600)
            .with_tags(&["long", "static"]),

            BuiltinCheck::DtbsCheck => {
                let cfg = "CONFIG_ARM64_ERRATUM_843419=n CONFIG_ARM64_USE_LSE_ATOMICS=n \
                           CONFIG_BROKEN_GAS_INST=n";
                CheckSpec::command(
                    self.id(),
                    self.environment_id(),
                    shell(&format!(
                        "{KBUILD} ARCH=arm64 defconfig {cfg} && \
                         {KBUILD} -j{{jobs}} ARCH=arm64 dtbs_check {cfg}"
                    )),
                    DiagnosticFormat::Gcc,
                )
                .with_applies_to(None, &[".yaml", ".dts", ".dtsi"])
                .with_timeout_secs(3600)
                .with_tags(&["long", "static"])
            }

            BuiltinCheck::CommitAudit => {
                CheckSpec::review(self.id(), self.environment_id(), ReviewKind::CommitAudit)
                    .with_tags(&["short", "llm"])
            }

            BuiltinCheck::CodeReview => {
                CheckSpec::review(self.id(), self.environment_id(), ReviewKind::CodeReview)
                    .with_scope(CheckScope::WholeTree)
                    .with_tags(&["long", "llm"])
            }
        }
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn shell(script: &str) -> Vec<String> {
    argv(&["sh", "-c", script])
}

/// Named sets of checks, selected with `--short`, `--llm`, ...
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckGroup {
    Short,
    Long,
    Llm,
    StaticAnalysis,
    All,
}

impl CheckGroup {
    /// Tag carried by member checks; `None` for [`CheckGroup::All`].
    pub fn tag(&self) -> Option<&'static str> {
        match self {
            CheckGroup::Short => Some("short"),
            CheckGroup::Long => Some("long"),
            CheckGroup::Llm => Some("llm"),
            CheckGroup::StaticAnalysis => Some("static"),
            CheckGroup::All => None,
        }
    }

    fn contains(&self, spec: &CheckSpec) -> bool {
        self.tag().map_or(true, |tag| spec.has_tag(tag))
    }
}

/// Every known check, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct CheckRegistry {
    specs: Vec<CheckSpec>,
}

impl CheckRegistry {
    pub fn builtin() -> Self {
        Self {
            specs: BuiltinCheck::ALL.iter().map(|b| b.spec()).collect(),
        }
    }

    /// Add configured checks. A check whose id matches an existing one
    /// (ignoring case) replaces it in place; others are appended.
    pub fn with_overrides(mut self, checks: &[CheckSpec]) -> Result<Self> {
        for check in checks {
            check.validate()?;
            match self.position(&check.id) {
                Some(idx) => self.specs[idx] = check.clone(),
                None => self.specs.push(check.clone()),
            }
        }
        Ok(self)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.specs.iter().position(|s| s.id.eq_ignore_ascii_case(id))
    }

    pub fn get(&self, id: &str) -> Option<&CheckSpec> {
        self.position(id).map(|idx| &self.specs[idx])
    }

    pub fn specs(&self) -> &[CheckSpec] {
        &self.specs
    }

    /// Checks named in `names` (case-insensitive) plus members of `groups`,
    /// in registry order. With neither, every check is selected.
    pub fn select(&self, names: &[String], groups: &[CheckGroup]) -> Result<Vec<CheckSpec>> {
        for name in names {
            if self.position(name).is_none() {
                return Err(PatchwiseError::UnknownCheck(name.clone()));
            }
        }
        if names.is_empty() && groups.is_empty() {
            return Ok(self.specs.clone());
        }
        Ok(self
            .specs
            .iter()
            .filter(|spec| {
                names.iter().any(|n| n.eq_ignore_ascii_case(&spec.id))
                    || groups.iter().any(|g| g.contains(spec))
            })
            .cloned()
            .collect())
    }

    /// Tools each environment must provide on the host, for the builtin
    /// checks present in the registry.
    pub fn tool_requirements(&self) -> BTreeMap<String, Vec<&'static str>> {
        let mut requirements: BTreeMap<String, Vec<&'static str>> = BTreeMap::new();
        for builtin in BuiltinCheck::ALL {
            let Some(spec) = self.get(builtin.id()) else {
                continue;
            };
            if spec.environment_id != builtin.environment_id() {
                continue;
            }
            let tools = requirements.entry(spec.environment_id.clone()).or_default();
            for tool in builtin.required_tools() {
                if !tools.contains(tool) {
                    tools.push(*tool);
                }
            }
        }
        requirements
    }
}
