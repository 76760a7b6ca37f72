//! Reflow of model output into mailing-list shape.
//!
//! Prose is re-wrapped at 75 columns without breaking long words (links).
//! Commit trailers, quoted lines, code blocks and blank lines are kept
//! verbatim; bullets are wrapped individually with a hanging indent.

use regex::Regex;
use std::sync::OnceLock;

pub const WRAP_WIDTH: usize = 75;

/// Line prefixes that mark commit trailers and tags.
const COMMIT_TAGS: &[&str] = &[
    "Acked-by:",
    "Cc:",
    "Closes:",
    "Co-developed-by:",
    "Fixes:",
    "From:",
    "Link:",
    "Reported-by:",
    "Reviewed-by:",
    "Signed-off-by:",
    "Suggested-by:",
    "Tested-by:",
    "(cherry picked from commit",
    "Change-Id",
    "Git-Commit:",
    "Git-repo",
    "Git-Repo:",
];

const FENCES: &[&str] = &["```", "'''", "\"\"\""];

fn bullet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:[*+\-]|\d+[.)-]|\d+(?:\.\d+)+)\s+")
            .unwrap_or_else(|err| panic!("valid bullet regex: {err}"))
    })
}

pub fn is_commit_tag(line: &str) -> bool {
    let line = line.trim_start();
    COMMIT_TAGS.iter().any(|tag| line.starts_with(tag))
}

pub fn is_quote(line: &str) -> bool {
    line.trim_start().starts_with('>')
}

fn is_fence(line: &str) -> bool {
    let trimmed = line.trim();
    FENCES.iter().any(|f| trimmed.starts_with(f))
}

/// Reflow `text` at `width` columns.
pub fn reflow(text: &str, width: usize) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    let mut in_code = false;

    for line in text.lines() {
        if in_code {
            out.push(line.to_string());
            if is_fence(line) {
                in_code = false;
            }
            continue;
        }
        if is_fence(line) {
            flush(&mut paragraph, &mut out, width);
            out.push(line.to_string());
            in_code = true;
            continue;
        }
        if line.trim().is_empty() || is_quote(line) || is_commit_tag(line) {
            flush(&mut paragraph, &mut out, width);
            out.push(line.trim_end().to_string());
            continue;
        }
        if let Some(m) = bullet_re().find(line) {
            flush(&mut paragraph, &mut out, width);
            let indent = " ".repeat(m.end());
            out.push(fill(line.trim_end(), width, &indent));
            continue;
        }
        paragraph.push(line);
    }
    flush(&mut paragraph, &mut out, width);

    out.join("\n")
}

/// Wrap the pending prose lines as one paragraph.
fn flush(paragraph: &mut Vec<&str>, out: &mut Vec<String>, width: usize) {
    if paragraph.is_empty() {
        return;
    }
    let joined = paragraph
        .iter()
        .map(|l| l.trim())
        .collect::<Vec<_>>()
        .join(" ");
    out.push(fill(&joined, width, ""));
    paragraph.clear();
}

fn fill(text: &str, width: usize, subsequent_indent: &str) -> String {
    let options = textwrap::Options::new(width)
        .break_words(false)
        .subsequent_indent(subsequent_indent);
    textwrap::fill(text, options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prose_rewrapped() {
        let input = "This is a sentence that goes on and on and on, well past the\ncolumn limit that mailing lists expect, so it must be wrapped again.";
        let out = reflow(input, WRAP_WIDTH);
        assert!(out.lines().all(|l| l.len() <= WRAP_WIDTH));
        assert_eq!(out.split_whitespace().count(), input.split_whitespace().count());
        assert!(out.starts_with("This is a sentence that goes on and on and on, well past the column"));
    }

    #[test]
    fn test_quotes_and_tags_preserved() {
        let long_quote = format!("> +{}", "x = y; ".repeat(20));
        let tag = "Signed-off-by: Some Developer With A Very Long Name <some.developer.with.a.long.name@example.org>";
        let input = format!("{long_quote}\nThis leaks buf.\n\n{tag}");
        let out = reflow(&input, WRAP_WIDTH);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], long_quote.trim_end());
        assert_eq!(lines[1], "This leaks buf.");
        assert_eq!(lines[2], "");
        assert_eq!(lines[3], tag);
    }

    #[test]
    fn test_code_block_kept_verbatim() {
        let code = "    if (!buf)                                                                  return -ENOMEM;";
        let input = format!("Consider:\n```\n{code}\n```\nDone.");
        let out = reflow(&input, WRAP_WIDTH);
        assert!(out.contains(code));
        assert!(out.ends_with("```\nDone."));
    }

    #[test]
    fn test_bullets_wrapped_separately() {
        let input = "- first point that is long enough to need wrapping because it keeps going and going\n- second";
        let out = reflow(input, 40);
        let lines: Vec<&str> = out.lines().collect();
        assert!(lines[0].starts_with("- first"));
        assert!(lines[1].starts_with("  "));
        assert_eq!(*lines.last().unwrap(), "- second");
    }

    #[test]
    fn test_long_words_not_broken() {
        let url = format!("https://lore.kernel.org/all/{}", "a".repeat(90));
        let out = reflow(&format!("See {url} for details."), WRAP_WIDTH);
        assert!(out.lines().any(|l| l == url));
    }
}
