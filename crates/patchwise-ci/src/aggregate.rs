//! Report building: verdict, de-duplication and ordering.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use patchwise_core::{
    CheckOutcome, CheckSpec, EquivalenceRule, Finding, FindingContent, FindingOrder, Location,
    OutcomeClass, OutcomeSummary, PatchReference, Report, Severity, Verdict,
};

/// Raw-output lines kept in the summary of a check that did not finish
/// cleanly.
pub const SNIPPET_LINES: usize = 20;

/// How findings are merged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Aggregation {
    pub equivalence: EquivalenceRule,
    pub order: FindingOrder,
}

/// Overall verdict. Only mandatory checks count.
pub fn verdict(specs: &[CheckSpec], outcomes: &[CheckOutcome], findings: &[Finding]) -> Verdict {
    let mandatory: HashSet<&str> = specs
        .iter()
        .filter(|s| s.is_mandatory())
        .map(|s| s.id.as_str())
        .collect();

    let has_error = findings
        .iter()
        .any(|f| f.severity == Severity::Error && mandatory.contains(f.check_id.as_str()));
    let mandatory_outcomes = || {
        outcomes
            .iter()
            .filter(|o| mandatory.contains(o.check_id.as_str()))
    };

    if has_error
        || mandatory_outcomes().any(|o| o.class == OutcomeClass::InfrastructureFailure)
    {
        return Verdict::Fail;
    }
    let unfinished = mandatory_outcomes().any(|o| {
        matches!(
            o.class,
            OutcomeClass::ToolFailure | OutcomeClass::TimedOut | OutcomeClass::Cancelled
        ) && !findings.iter().any(|f| f.check_id == o.check_id)
    });
    if unfinished {
        Verdict::Inconclusive
    } else {
        Verdict::Pass
    }
}

/// Drop exact duplicates, then apply the equivalence rule. Order is kept.
/// A duplicate merged into an earlier finding raises it to the higher of
/// the two severities.
pub fn dedup(findings: Vec<Finding>, equivalence: EquivalenceRule) -> Vec<Finding> {
    let mut seen = HashMap::new();
    let mut unique: Vec<Finding> = Vec::with_capacity(findings.len());
    for finding in findings {
        match seen.entry(finding.dedup_key()) {
            Entry::Occupied(slot) => {
                let kept: &mut Finding = &mut unique[*slot.get()];
                kept.severity = kept.severity.max(finding.severity);
            }
            Entry::Vacant(slot) => {
                slot.insert(unique.len());
                unique.push(finding);
            }
        }
    }

    match equivalence {
        EquivalenceRule::Distinct => unique,
        EquivalenceRule::SameLine => {
            let diagnosed: HashSet<(String, u32)> = unique
                .iter()
                .filter(|f| matches!(f.content, FindingContent::Diagnostic { .. }))
                .filter_map(|f| f.location.as_ref())
                .map(|l| (l.file.clone(), l.line))
                .collect();
            let before = unique.len();
            let kept: Vec<Finding> = unique
                .into_iter()
                .filter(|f| {
                    f.anchor()
                        .map_or(true, |a| !diagnosed.contains(&(a.file.clone(), a.line)))
                })
                .collect();
            if kept.len() < before {
                debug!(dropped = before - kept.len(), "review findings merged into diagnostics");
            }
            kept
        }
    }
}

/// Reorder findings. The input is expected in declaration order.
pub fn order(mut findings: Vec<Finding>, order: FindingOrder) -> Vec<Finding> {
    if order == FindingOrder::Location {
        findings.sort_by(|a, b| {
            let key = |f: &Finding| {
                let loc: Option<&Location> = f.location.as_ref();
                (
                    loc.is_none(),
                    loc.map(|l| l.file.clone()),
                    loc.map(|l| l.line),
                    f.check_id.clone(),
                )
            };
            key(a).cmp(&key(b))
        });
    }
    findings
}

fn summarize(spec: Option<&CheckSpec>, outcome: &CheckOutcome, findings: &[Finding]) -> OutcomeSummary {
    let failed = matches!(
        outcome.class,
        OutcomeClass::ToolFailure
            | OutcomeClass::InfrastructureFailure
            | OutcomeClass::TimedOut
            | OutcomeClass::Cancelled
    );
    OutcomeSummary {
        check_id: outcome.check_id.clone(),
        policy: spec.map(|s| s.policy).unwrap_or_default(),
        class: outcome.class,
        exit_code: outcome.exit_code,
        elapsed_ms: outcome.elapsed_ms,
        finding_count: findings
            .iter()
            .filter(|f| f.check_id == outcome.check_id)
            .count(),
        error: outcome.error.clone(),
        output_snippet: if failed {
            outcome.snippet(SNIPPET_LINES)
        } else {
            String::new()
        },
    }
}

/// Assemble the final report. `findings` must be in declaration order, as
/// returned by [`crate::normalize::normalize_all`].
pub fn build(
    run_id: Uuid,
    patch: &PatchReference,
    specs: &[CheckSpec],
    outcomes: &[CheckOutcome],
    findings: Vec<Finding>,
    aggregation: Aggregation,
    started_at: DateTime<Utc>,
) -> Report {
    // The verdict sees every finding, before any of them are merged away.
    let verdict = verdict(specs, outcomes, &findings);
    let findings = order(dedup(findings, aggregation.equivalence), aggregation.order);

    let outcomes = specs
        .iter()
        .filter_map(|spec| {
            outcomes
                .iter()
                .find(|o| o.check_id == spec.id)
                .map(|o| summarize(Some(spec), o, &findings))
        })
        .collect();

    Report {
        run_id,
        patch: patch.clone(),
        started_at,
        finished_at: Utc::now(),
        verdict,
        outcomes,
        findings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchwise_core::{CheckError, CheckErrorKind, CheckPolicy, DiagnosticFormat, ReviewKind};
    use std::path::PathBuf;

    fn mandatory(id: &str) -> CheckSpec {
        CheckSpec::command(id, "base", vec!["true".to_string()], DiagnosticFormat::Gcc)
    }

    fn advisory(id: &str) -> CheckSpec {
        CheckSpec::review(id, "base", ReviewKind::CodeReview)
    }

    fn outcome(id: &str, class: OutcomeClass) -> CheckOutcome {
        CheckOutcome::new(id, class)
    }

    fn error_at(id: &str, file: &str, line: u32) -> Finding {
        Finding::diagnostic(id, Severity::Error, "boom").with_location(Location::new(file, line))
    }

    #[test]
    fn test_all_clean_passes() {
        let specs = [mandatory("a"), mandatory("b")];
        let outcomes = [outcome("a", OutcomeClass::Clean), outcome("b", OutcomeClass::Clean)];
        assert_eq!(verdict(&specs, &outcomes, &[]), Verdict::Pass);
    }

    #[test]
    fn test_error_finding_in_mandatory_check_fails() {
        let specs = [mandatory("sparse")];
        let outcomes = [outcome("sparse", OutcomeClass::FindingsReported)];
        let findings = [error_at("sparse", "drivers/foo.c", 42)];
        assert_eq!(verdict(&specs, &outcomes, &findings), Verdict::Fail);
    }

    #[test]
    fn test_warnings_alone_pass() {
        let specs = [mandatory("a")];
        let outcomes = [outcome("a", OutcomeClass::FindingsReported)];
        let findings = [Finding::diagnostic("a", Severity::Warning, "meh")];
        assert_eq!(verdict(&specs, &outcomes, &findings), Verdict::Pass);
    }

    #[test]
    fn test_infrastructure_failure_fails() {
        let specs = [mandatory("a"), mandatory("b")];
        let outcomes = [
            outcome("a", OutcomeClass::Clean),
            CheckOutcome::infrastructure_failure(
                "b",
                CheckError::new(CheckErrorKind::EnvironmentUnavailable, "no image"),
            ),
        ];
        assert_eq!(verdict(&specs, &outcomes, &[]), Verdict::Fail);
    }

    #[test]
    fn test_unfinished_mandatory_check_is_inconclusive() {
        for class in [OutcomeClass::ToolFailure, OutcomeClass::TimedOut, OutcomeClass::Cancelled] {
            let specs = [mandatory("a"), mandatory("b")];
            let outcomes = [outcome("a", OutcomeClass::Clean), outcome("b", class)];
            assert_eq!(verdict(&specs, &outcomes, &[]), Verdict::Inconclusive, "{class}");
        }
    }

    #[test]
    fn test_advisory_checks_never_change_verdict() {
        let specs = [mandatory("a"), advisory("review")];
        let outcomes = [
            outcome("a", OutcomeClass::Clean),
            CheckOutcome::infrastructure_failure(
                "review",
                CheckError::new(CheckErrorKind::BackendUnavailable, "down"),
            ),
        ];
        let findings = [Finding::diagnostic("review", Severity::Error, "bad")];
        assert_eq!(verdict(&specs, &outcomes, &findings), Verdict::Pass);

        let specs = [mandatory("a"), advisory("review").with_policy(CheckPolicy::Mandatory)];
        assert_eq!(verdict(&specs, &outcomes, &findings), Verdict::Fail);
    }

    #[test]
    fn test_dedup_drops_exact_duplicates_only() {
        let findings = vec![
            error_at("a", "x.c", 1),
            error_at("a", "x.c", 1),
            error_at("a", "x.c", 2),
            error_at("b", "x.c", 1),
        ];
        assert_eq!(dedup(findings, EquivalenceRule::Distinct).len(), 3);
    }

    #[test]
    fn test_dedup_keeps_highest_severity() {
        let warning = Finding::diagnostic("a", Severity::Warning, "boom")
            .with_location(Location::new("drivers/foo.c", 42).with_column(3));
        let error = Finding::diagnostic("a", Severity::Error, "boom")
            .with_location(Location::new("drivers/foo.c", 42).with_column(9));
        let merged = dedup(vec![warning, error], EquivalenceRule::Distinct);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].severity, Severity::Error);
        assert_eq!(
            merged[0].location,
            Some(Location::new("drivers/foo.c", 42).with_column(3))
        );
    }

    #[test]
    fn test_build_fails_when_error_duplicates_a_warning() {
        let patch = PatchReference {
            repo_path: PathBuf::from("/src/linux"),
            base_revision: "abc".to_string(),
            target_revision: "def".to_string(),
        };
        let specs = [mandatory("a")];
        let outcomes = [outcome("a", OutcomeClass::FindingsReported)];
        let findings = vec![
            Finding::diagnostic("a", Severity::Warning, "boom")
                .with_location(Location::new("drivers/foo.c", 42).with_column(3)),
            Finding::diagnostic("a", Severity::Error, "boom")
                .with_location(Location::new("drivers/foo.c", 42).with_column(9)),
        ];
        let report = build(
            Uuid::new_v4(),
            &patch,
            &specs,
            &outcomes,
            findings,
            Aggregation::default(),
            Utc::now(),
        );
        assert_eq!(report.verdict, Verdict::Fail);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].severity, Severity::Error);
    }

    #[test]
    fn test_same_line_equivalence_drops_review_duplicates() {
        let anchored = Finding::review("code-review", Severity::Warning, "leak?")
            .with_quote(vec!["+x = alloc();".to_string()], Some(Location::new("x.c", 1)));
        let elsewhere = Finding::review("code-review", Severity::Warning, "naming")
            .with_quote(vec!["+y = 2;".to_string()], Some(Location::new("x.c", 9)));
        let findings = vec![error_at("sparse", "x.c", 1), anchored.clone(), elsewhere.clone()];

        assert_eq!(dedup(findings.clone(), EquivalenceRule::Distinct).len(), 3);
        let merged = dedup(findings, EquivalenceRule::SameLine);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1], elsewhere);
    }

    #[test]
    fn test_location_order_puts_unattributed_last() {
        let findings = vec![
            Finding::diagnostic("a", Severity::Info, "general"),
            error_at("b", "z.c", 1),
            error_at("c", "a.c", 10),
            error_at("a", "a.c", 10),
            error_at("a", "a.c", 2),
        ];
        let sorted = order(findings.clone(), FindingOrder::Location);
        let keys: Vec<_> = sorted
            .iter()
            .map(|f| (f.check_id.as_str(), f.location.as_ref().map(|l| l.line)))
            .collect();
        assert_eq!(
            keys,
            vec![("a", Some(2)), ("a", Some(10)), ("c", Some(10)), ("b", Some(1)), ("a", None)]
        );
        assert_eq!(order(findings.clone(), FindingOrder::Declaration), findings);
    }

    #[test]
    fn test_build_report() {
        let patch = PatchReference {
            repo_path: PathBuf::from("/src/linux"),
            base_revision: "abc".to_string(),
            target_revision: "def".to_string(),
        };
        let specs = [mandatory("a"), mandatory("b")];
        let outcomes = [
            outcome("b", OutcomeClass::ToolFailure).with_output("", "make: *** Error 2"),
            outcome("a", OutcomeClass::FindingsReported),
        ];
        let findings = vec![error_at("a", "drivers/foo.c", 42)];
        let report = build(
            Uuid::new_v4(),
            &patch,
            &specs,
            &outcomes,
            findings,
            Aggregation::default(),
            Utc::now(),
        );

        assert_eq!(report.verdict, Verdict::Fail);
        let ids: Vec<_> = report.outcomes.iter().map(|o| o.check_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(report.outcome("a").unwrap().finding_count, 1);
        assert!(report.outcome("a").unwrap().output_snippet.is_empty());
        assert_eq!(report.outcome("b").unwrap().output_snippet, "make: *** Error 2");
    }
}
