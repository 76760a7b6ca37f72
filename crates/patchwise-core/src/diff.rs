//! Unified diff parsing.
//!
//! Only what routing and attribution need: which files a patch touches and
//! which lines it adds. Files are split on `diff --git` headers and their
//! hunks handed to `diffy`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use crate::domain::finding::Location;

/// A line added by the patch, numbered in the new file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddedLine {
    pub line: u32,
    pub text: String,
}

/// Per-file view of a diff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FileDiff {
    /// Path in the new tree (old path for deletions).
    pub path: String,
    pub deleted: bool,
    /// `(start, count)` of each hunk on the new side.
    pub hunks: Vec<(u32, u32)>,
    pub added: Vec<AddedLine>,
}

impl FileDiff {
    /// True when `line` falls inside one of the new-side hunks.
    pub fn covers(&self, line: u32) -> bool {
        self.hunks
            .iter()
            .any(|&(start, count)| line >= start && line < start + count.max(1))
    }
}

/// Parsed patch diff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PatchDiff {
    pub files: Vec<FileDiff>,
}

impl PatchDiff {
    /// Parse `git diff` / `git format-patch` output. Anything before the
    /// first `diff --git` header (mail headers, commit message) is skipped.
    pub fn parse(text: &str) -> Self {
        Self {
            files: file_sections(text).into_iter().map(parse_file).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Paths of every touched file, in diff order.
    pub fn touched_files(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    /// Distinct parent directories of touched files, sorted. Files at the
    /// tree root map to `.`.
    pub fn touched_dirs(&self) -> Vec<String> {
        let dirs: BTreeSet<String> = self
            .files
            .iter()
            .map(|f| match f.path.rfind('/') {
                Some(idx) => f.path[..idx].to_string(),
                None => ".".to_string(),
            })
            .collect();
        dirs.into_iter().collect()
    }

    pub fn touches(&self, path: &str) -> bool {
        self.files.iter().any(|f| f.path == path)
    }

    /// True when any touched file ends with one of `suffixes` and, if given,
    /// lives under `prefix`.
    pub fn touches_matching(&self, prefix: Option<&str>, suffixes: &[&str]) -> bool {
        self.files.iter().filter(|f| !f.deleted).any(|f| {
            prefix.map_or(true, |p| f.path.starts_with(p))
                && suffixes.iter().any(|s| f.path.ends_with(s))
        })
    }

    pub fn file(&self, path: &str) -> Option<&FileDiff> {
        self.files.iter().find(|f| f.path == path)
    }

    /// Resolve a line quoted from the diff to where it landed in the new
    /// tree. Only added lines are considered; the leading `+` is optional
    /// and surrounding whitespace is ignored.
    pub fn locate_quoted(&self, quoted: &str) -> Option<Location> {
        let needle = quoted.strip_prefix('+').unwrap_or(quoted).trim();
        if needle.is_empty() {
            return None;
        }
        self.files.iter().find_map(|file| {
            file.added
                .iter()
                .find(|added| added.text.trim() == needle)
                .map(|added| Location::new(file.path.clone(), added.line))
        })
    }
}

fn strip_side_prefix(path: &str) -> &str {
    path.strip_prefix("b/")
        .or_else(|| path.strip_prefix("a/"))
        .unwrap_or(path)
}

/// Best-effort path from `a/<old> b/<new>`; the `+++` line overrides it.
fn header_path(rest: &str) -> String {
    match rest.rfind(" b/") {
        Some(idx) => rest[idx + 3..].to_string(),
        None => strip_side_prefix(rest).to_string(),
    }
}

/// One `diff --git` section per touched file.
fn file_sections(text: &str) -> Vec<&str> {
    let mut starts = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.starts_with("diff --git ") {
            starts.push(offset);
        }
        offset += line.len();
    }
    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| &text[start..starts.get(i + 1).copied().unwrap_or(text.len())])
        .collect()
}

fn is_hunk_line(line: &str) -> bool {
    matches!(line.as_bytes().first(), Some(b' ' | b'+' | b'-' | b'@' | b'\\'))
}

fn parse_file(section: &str) -> FileDiff {
    let mut lines = section.split_inclusive('\n').peekable();
    let header = lines
        .next()
        .and_then(|l| l.trim_end().strip_prefix("diff --git "))
        .unwrap_or_default();
    let mut file = FileDiff {
        path: header_path(header),
        ..FileDiff::default()
    };

    // The `---`/`+++`/hunk part. Extended headers (`index`, `new file
    // mode`) come before it.
    let mut body: Vec<&str> = Vec::new();
    let mut in_hunks = false;
    while let Some(line) = lines.next() {
        let bare = line.trim_end_matches(['\n', '\r']);
        if in_hunks {
            let signature = bare == "-- " && lines.peek().map_or(true, |next| !is_hunk_line(next));
            if signature || !(bare.is_empty() || is_hunk_line(bare)) {
                break;
            }
        } else {
            if let Some(path) = bare.strip_prefix("+++ ") {
                if path.trim() == "/dev/null" {
                    file.deleted = true;
                } else {
                    file.path = strip_side_prefix(path.trim()).to_string();
                }
            }
            in_hunks = bare.starts_with("@@");
            if body.is_empty() && !in_hunks && !bare.starts_with("--- ") {
                continue;
            }
        }
        body.push(line);
    }
    if body.is_empty() {
        return file;
    }

    // Trailing blank lines are either context or separators; try both.
    let full = hunk_text(&body);
    let keep = body.iter().rposition(|l| !l.trim().is_empty()).map_or(0, |i| i + 1);
    let trimmed = hunk_text(&body[..keep]);
    match diffy::Patch::from_str(&full).or_else(|_| diffy::Patch::from_str(&trimmed)) {
        Ok(patch) => {
            for hunk in patch.hunks() {
                let range = hunk.new_range();
                let start = u32::try_from(range.start()).unwrap_or(u32::MAX);
                let count = u32::try_from(range.len()).unwrap_or(u32::MAX);
                file.hunks.push((start, count));

                let mut line_no = start;
                for line in hunk.lines() {
                    match line {
                        diffy::Line::Insert(text) => {
                            file.added.push(AddedLine {
                                line: line_no,
                                text: text.trim_end_matches(['\n', '\r']).to_string(),
                            });
                            line_no += 1;
                        }
                        diffy::Line::Context(_) => line_no += 1,
                        diffy::Line::Delete(_) => {}
                    }
                }
            }
        }
        Err(err) => debug!(path = %file.path, error = %err, "could not parse hunks"),
    }
    file
}

/// Hunk text with bare blank lines turned back into the context lines a
/// mailer stripped the leading space from.
fn hunk_text(lines: &[&str]) -> String {
    lines
        .iter()
        .map(|&l| if l.trim_end_matches(['\n', '\r']).is_empty() { " \n" } else { l })
        .collect()
}
