//! Normalization of tool output into findings.
//!
//! Structured output is parsed line by line with the check's
//! [`DiagnosticFormat`]. Lines that are neither diagnostics nor known noise
//! are collected into a single parse-warning finding so nothing a tool said
//! is silently lost. Free-text reviews are split into quoted comment units.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

use patchwise_core::{
    CheckOutcome, CheckScope, CheckSpec, DiagnosticFormat, Execution, Finding, FindingContent,
    Location, OutputKind, PatchDiff, ReviewKind, Severity,
};

/// Reply meaning the reviewer had nothing to say.
pub const NO_ISSUES: &str = "No issues found.";

fn gcc_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<file>[^\s:][^:]*):(?P<line>\d+):(?:(?P<col>\d+):)?\s+(?:(?P<sev>fatal error|error|warning|note|info):\s*)?(?P<msg>\S.*)$",
        )
        .unwrap_or_else(|err| panic!("valid gcc regex: {err}"))
    })
}

fn checkpatch_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<sev>ERROR|WARNING|CHECK):(?:(?P<code>[A-Z0-9_]+):)?\s*(?P<msg>.*)$")
            .unwrap_or_else(|err| panic!("valid checkpatch regex: {err}"))
    })
}

/// `--showfile` form: the position leads the diagnostic.
fn checkpatch_showfile_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<file>[^\s:#][^:]*):(?P<line>\d+): (?P<sev>ERROR|WARNING|CHECK):(?:(?P<code>[A-Z0-9_]+):)?\s*(?P<msg>.*)$",
        )
        .unwrap_or_else(|err| panic!("valid checkpatch showfile regex: {err}"))
    })
}

fn checkpatch_file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^#\d+:\s*FILE:\s*(?P<file>[^:]+):(?P<line>\d+):?")
            .unwrap_or_else(|err| panic!("valid checkpatch file regex: {err}"))
    })
}

fn coccinelle_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<file>[^\s:][^:]*):(?P<line>\d+):(?P<col>\d+)-(?P<end>\d+):\s*(?P<msg>\S.*)$")
            .unwrap_or_else(|err| panic!("valid coccinelle regex: {err}"))
    })
}

fn severity_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(?P<sev>error|warning|info|note)\s*:\s*")
            .unwrap_or_else(|err| panic!("valid severity regex: {err}"))
    })
}

fn noise_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            ^make(\[\d+\])?:\s            # make chatter
            | ^\s{2}[A-Z0-9_]{2,8}\s+\S   # kbuild quiet-build lines (CC, LD, CHECK ...)
            | ^\#\s                       # kconfig comments
            | ^\*\*\*                     # kconfig banners
            | :\sIn\s(function|member\sfunction)\s
            | :\sAt\stop\slevel:$
            | ^In\sfile\sincluded\sfrom\s
            | ^\s+from\s\S+:\d+[:,]$
            | ^\s*\d*\s*\|                # compiler source excerpts
            | ^\s*\^~*$
            | ^Please\scheck\sfor\sfalse\spositives
            | ^When\susing\s.patch.\smode
            ",
        )
        .unwrap_or_else(|err| panic!("valid noise regex: {err}"))
    })
}

fn checkpatch_noise_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            ^total:\s\d+\serrors?
            | ^NOTE:\s
            | has\s(no\sobvious\s)?style\sproblems
            | ^Commit\s[0-9a-f]{7,}\s\(
            | ^-{3,}$
            | ^\#\d+:\s                   # position lines without a file
            | ^[+\-\s]                    # patch excerpts
            | ^\$
            ",
        )
        .unwrap_or_else(|err| panic!("valid checkpatch noise regex: {err}"))
    })
}

fn is_noise(line: &str, format: DiagnosticFormat) -> bool {
    if line.trim().is_empty() || noise_re().is_match(line) {
        return true;
    }
    format == DiagnosticFormat::Checkpatch && checkpatch_noise_re().is_match(line)
}

/// Findings for one outcome. Outcomes that did not produce usable output
/// yield nothing.
pub fn normalize(spec: &CheckSpec, outcome: &CheckOutcome, diff: &PatchDiff) -> Vec<Finding> {
    if !outcome.class.produced_output() {
        return Vec::new();
    }
    let raw = outcome.raw_output();

    let findings = match &spec.output {
        OutputKind::StructuredDiagnostics { format } => {
            parse_structured(&spec.id, *format, &raw, outcome.tree_root.as_deref(), diff)
        }
        OutputKind::FreeTextReview => {
            let kind = match &spec.execution {
                Execution::Review { kind } => *kind,
                Execution::Command { .. } => ReviewKind::CodeReview,
            };
            parse_review(&spec.id, kind, &raw, diff)
        }
    };

    match spec.scope {
        CheckScope::WholeTree => findings,
        CheckScope::TouchedFiles => {
            let before = findings.len();
            let kept: Vec<Finding> = findings
                .into_iter()
                .filter(|f| f.location.as_ref().map_or(true, |l| diff.touches(&l.file)))
                .collect();
            if kept.len() < before {
                debug!(
                    check = %spec.id,
                    dropped = before - kept.len(),
                    "dropped findings outside touched files"
                );
            }
            kept
        }
    }
}

/// Findings of every outcome, in declaration order of `specs`.
pub fn normalize_all(specs: &[CheckSpec], outcomes: &[CheckOutcome], diff: &PatchDiff) -> Vec<Finding> {
    specs
        .iter()
        .filter_map(|spec| {
            outcomes
                .iter()
                .find(|o| o.check_id == spec.id)
                .map(|outcome| normalize(spec, outcome, diff))
        })
        .flatten()
        .collect()
}

/// Parse a diagnostics stream.
pub fn parse_structured(
    check_id: &str,
    format: DiagnosticFormat,
    raw: &str,
    tree_root: Option<&Path>,
    diff: &PatchDiff,
) -> Vec<Finding> {
    let mut findings: Vec<Finding> = Vec::new();
    let mut unparsed: Vec<String> = Vec::new();
    // Index of the checkpatch finding still waiting for its FILE: line.
    let mut pending: Option<usize> = None;

    for line in raw.lines() {
        let line = line.trim_end();

        if format == DiagnosticFormat::Checkpatch {
            if let Some(caps) = checkpatch_file_re().captures(line) {
                if let (Some(idx), Ok(n)) = (pending.take(), caps["line"].parse::<u32>()) {
                    let file = relativize(&caps["file"], tree_root, diff);
                    findings[idx].location = Some(Location::new(file, n));
                }
                continue;
            }
        }

        if is_noise(line, format) {
            continue;
        }

        let parsed = match format {
            DiagnosticFormat::Gcc => parse_gcc(check_id, line, tree_root, diff),
            DiagnosticFormat::Checkpatch => parse_checkpatch(check_id, line, tree_root, diff),
            DiagnosticFormat::Coccinelle => parse_coccinelle(check_id, line, tree_root, diff),
        };
        match parsed {
            Some(finding) => {
                pending = (format == DiagnosticFormat::Checkpatch && finding.location.is_none())
                    .then_some(findings.len());
                findings.push(finding);
            }
            None => unparsed.push(line.to_string()),
        }
    }

    if !unparsed.is_empty() {
        debug!(check = %check_id, lines = unparsed.len(), "unparseable tool output");
        findings.push(Finding::parse_warning(check_id, unparsed));
    }
    findings
}

fn parse_gcc(check_id: &str, line: &str, tree_root: Option<&Path>, diff: &PatchDiff) -> Option<Finding> {
    let caps = gcc_re().captures(line)?;
    let line_no: u32 = caps["line"].parse().ok()?;
    let severity = caps
        .name("sev")
        .and_then(|m| Severity::from_label(m.as_str()))
        .unwrap_or(Severity::Warning);

    let mut location = Location::new(relativize(&caps["file"], tree_root, diff), line_no);
    if let Some(col) = caps.name("col").and_then(|m| m.as_str().parse().ok()) {
        location = location.with_column(col);
    }
    Some(Finding::diagnostic(check_id, severity, caps["msg"].trim()).with_location(location))
}

/// A checkpatch diagnostic, either `--showfile` style with its position up
/// front or the bare form whose `#N: FILE:` line follows.
fn parse_checkpatch(
    check_id: &str,
    line: &str,
    tree_root: Option<&Path>,
    diff: &PatchDiff,
) -> Option<Finding> {
    let (caps, location) = match checkpatch_showfile_re().captures(line) {
        Some(caps) => {
            let line_no: u32 = caps["line"].parse().ok()?;
            let file = relativize(&caps["file"], tree_root, diff);
            (caps, Some(Location::new(file, line_no)))
        }
        None => (checkpatch_re().captures(line)?, None),
    };
    let severity = Severity::from_label(&caps["sev"]).unwrap_or(Severity::Warning);
    let mut finding = Finding::diagnostic(check_id, severity, caps["msg"].trim());
    if let Some(code) = caps.name("code") {
        finding = finding.with_code(code.as_str());
    }
    if let Some(location) = location {
        finding = finding.with_location(location);
    }
    Some(finding)
}

fn parse_coccinelle(
    check_id: &str,
    line: &str,
    tree_root: Option<&Path>,
    diff: &PatchDiff,
) -> Option<Finding> {
    let caps = coccinelle_re().captures(line)?;
    let line_no: u32 = caps["line"].parse().ok()?;
    let col: u32 = caps["col"].parse().ok()?;

    let mut message = caps["msg"].trim();
    let mut severity = Severity::Warning;
    if let Some(prefix) = severity_prefix_re().captures(message) {
        severity = Severity::from_label(&prefix["sev"]).unwrap_or(Severity::Warning);
        let end = prefix.get(0).map_or(0, |m| m.end());
        message = &message[end..];
    }

    let location =
        Location::new(relativize(&caps["file"], tree_root, diff), line_no).with_column(col);
    Some(Finding::diagnostic(check_id, severity, message).with_location(location))
}

/// Make a reported path relative to the tree root. Paths reported relative
/// to a subdirectory (`M=drivers/foo`) are matched to the touched file they
/// uniquely end in.
pub fn relativize(path: &str, tree_root: Option<&Path>, diff: &PatchDiff) -> String {
    let mut rel = path.trim();
    if let Some(root) = tree_root {
        let root = root.to_string_lossy();
        let root = root.trim_end_matches('/');
        if !root.is_empty() {
            if let Some(rest) = rel.strip_prefix(root) {
                if rest.starts_with('/') {
                    rel = rest.trim_start_matches('/');
                }
            }
        }
    }
    loop {
        if let Some(rest) = rel.strip_prefix("./") {
            rel = rest;
        } else if let Some(rest) = rel.strip_prefix("../") {
            rel = rest;
        } else {
            break;
        }
    }

    if diff.touches(rel) || rel.starts_with('/') {
        return rel.to_string();
    }
    let suffix = format!("/{rel}");
    let mut candidates = diff
        .files
        .iter()
        .filter(|f| f.path.ends_with(&suffix))
        .map(|f| f.path.as_str());
    match (candidates.next(), candidates.next()) {
        (Some(only), None) => only.to_string(),
        _ => rel.to_string(),
    }
}

/// Split a free-text review into findings, one per quoted comment unit.
pub fn parse_review(check_id: &str, kind: ReviewKind, text: &str, diff: &PatchDiff) -> Vec<Finding> {
    let trimmed = text.trim();
    if trimmed.is_empty() || is_no_issues(trimmed) {
        return Vec::new();
    }
    let severity = match kind {
        ReviewKind::CodeReview => Severity::Warning,
        ReviewKind::CommitAudit => Severity::Info,
    };

    let mut units: Vec<(Vec<String>, Vec<&str>)> = Vec::new();
    let mut quoted: Vec<String> = Vec::new();
    let mut body: Vec<&str> = Vec::new();

    for line in trimmed.lines() {
        if let Some(q) = strip_quote(line) {
            if body.iter().any(|l| !l.trim().is_empty()) {
                units.push((std::mem::take(&mut quoted), std::mem::take(&mut body)));
            } else {
                body.clear();
            }
            quoted.push(q.to_string());
        } else {
            body.push(line);
        }
    }
    units.push((quoted, body));

    units
        .into_iter()
        .filter_map(|(quoted, body)| {
            let body = body
                .iter()
                .skip_while(|l| l.trim().is_empty())
                .copied()
                .collect::<Vec<_>>();
            let body = match body.iter().rposition(|l| !l.trim().is_empty()) {
                Some(end) => body[..=end].join("\n"),
                // A bare quote still flags the lines it quotes.
                None if !quoted.is_empty() => quoted.join("\n"),
                None => return None,
            };
            if is_no_issues(&body) {
                return None;
            }
            let anchor = anchor_for(&quoted, diff);
            Some(Finding::review(check_id, severity, body).with_quote(quoted, anchor))
        })
        .collect()
}

fn is_no_issues(text: &str) -> bool {
    text.trim()
        .trim_end_matches('.')
        .eq_ignore_ascii_case(NO_ISSUES.trim_end_matches('.'))
}

fn strip_quote(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix('>')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Location of the first quoted added line that can be found in the diff.
fn anchor_for(quoted: &[String], diff: &PatchDiff) -> Option<Location> {
    quoted
        .iter()
        .filter(|q| q.starts_with('+'))
        .chain(quoted.iter().filter(|q| !q.starts_with('+')))
        .find_map(|q| diff.locate_quoted(q))
}

/// Number of parse-warning findings in `findings`.
pub fn parse_warning_count(findings: &[Finding]) -> usize {
    findings
        .iter()
        .filter(|f| matches!(f.content, FindingContent::ParseWarning { .. }))
        .count()
}
