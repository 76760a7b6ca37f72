//! Report rendering for terminals and machines.

use clap::ValueEnum;
use patchwise_core::{CheckPolicy, Finding, FindingContent, OutcomeSummary, Report, Result};

/// Output format of a rendered report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

pub fn render(report: &Report, format: ReportFormat) -> Result<String> {
    match format {
        ReportFormat::Text => Ok(render_text(report)),
        ReportFormat::Json => render_json(report),
    }
}

pub fn render_json(report: &Report) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

/// Human-readable report.
pub fn render_text(report: &Report) -> String {
    let mut out = format!(
        "patchwise {} on {}\n",
        report.patch.range(),
        report.patch.repo_path.display()
    );
    out.push_str(&format!(
        "Verdict: {} ({} check(s), {} finding(s), {:.1}s)\n",
        report.verdict,
        report.outcomes.len(),
        report.findings.len(),
        report.duration_ms() as f64 / 1000.0
    ));

    out.push_str("\nChecks:\n");
    let width = report
        .outcomes
        .iter()
        .map(|o| o.check_id.len())
        .max()
        .unwrap_or(0);
    for outcome in &report.outcomes {
        out.push_str(&outcome_row(outcome, width));
    }

    for outcome in report.outcomes.iter().filter(|o| !o.output_snippet.is_empty()) {
        out.push_str(&format!("\n--- {} output (tail) ---\n", outcome.check_id));
        for line in outcome.output_snippet.lines() {
            out.push_str(&format!("  {line}\n"));
        }
    }

    if report.findings.is_empty() {
        out.push_str("\nNo findings.\n");
        return out;
    }
    for outcome in &report.outcomes {
        let mut findings = report.findings_for(&outcome.check_id).peekable();
        if findings.peek().is_none() {
            continue;
        }
        out.push_str(&format!("\n== {} ==\n", outcome.check_id));
        for finding in findings {
            out.push_str(&finding_text(finding));
        }
    }
    out
}

fn outcome_row(outcome: &OutcomeSummary, width: usize) -> String {
    let policy = match outcome.policy {
        CheckPolicy::Mandatory => "",
        CheckPolicy::Advisory => " (advisory)",
    };
    let mut row = format!(
        "  {:<width$}  {:<22} {:>4} finding(s) {:>7.1}s{}",
        outcome.check_id,
        outcome.class.as_str(),
        outcome.finding_count,
        outcome.elapsed_ms as f64 / 1000.0,
        policy,
    );
    if let Some(error) = &outcome.error {
        row.push_str(&format!("\n  {:<width$}  ! {}", "", error));
    }
    row.push('\n');
    row
}

fn finding_text(finding: &Finding) -> String {
    let prefix = match &finding.location {
        Some(loc) => format!("{loc}: "),
        None => String::new(),
    };
    match &finding.content {
        FindingContent::Diagnostic { message, code } => {
            let code = code.as_deref().map(|c| format!(" [{c}]")).unwrap_or_default();
            format!("{prefix}{}: {message}{code}\n", finding.severity)
        }
        FindingContent::ParseWarning { message, lines } => {
            let mut text = format!("{prefix}{}: {message}\n", finding.severity);
            for line in lines {
                text.push_str(&format!("    | {line}\n"));
            }
            text
        }
        FindingContent::Review {
            body,
            quoted,
            anchor,
        } => {
            let mut text = String::new();
            if let Some(anchor) = anchor {
                text.push_str(&format!("{anchor}:\n"));
            }
            for line in quoted {
                text.push_str(&format!("> {line}\n"));
            }
            for line in body.lines() {
                text.push_str(&format!("{line}\n"));
            }
            text.push('\n');
            text
        }
    }
}
