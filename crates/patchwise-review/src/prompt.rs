//! Prompt templates.
//!
//! Templates are plain text with `{name}` placeholders drawn from a fixed
//! set. `{{` and `}}` produce literal braces, and any other brace is taken
//! literally, so C snippets in a template need no escaping. Unknown
//! placeholders are rejected when the template is built.

use crate::error::ReviewError;
use crate::Result;

/// Placeholders a template may use.
pub const PLACEHOLDERS: &[&str] = &["diff", "commit_text", "context", "metadata", "coding_style"];

/// Values substituted into a template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptValues {
    pub diff: String,
    pub commit_text: String,
    pub context: String,
    pub metadata: String,
    pub coding_style: String,
}

impl PromptValues {
    fn get(&self, name: &str) -> &str {
        match name {
            "diff" => &self.diff,
            "commit_text" => &self.commit_text,
            "context" => &self.context,
            "metadata" => &self.metadata,
            "coding_style" => &self.coding_style,
            _ => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Placeholder(&'static str),
}

/// A validated prompt template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    segments: Vec<Segment>,
}

impl PromptTemplate {
    pub fn new(text: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = text;

        while let Some(idx) = rest.find(['{', '}']) {
            literal.push_str(&rest[..idx]);
            let tail = &rest[idx..];

            if tail.starts_with("{{") || tail.starts_with("}}") {
                literal.push_str(&tail[..1]);
                rest = &tail[2..];
                continue;
            }
            if tail.starts_with('}') {
                literal.push('}');
                rest = &tail[1..];
                continue;
            }

            let ident_len = tail[1..]
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(tail.len() - 1);
            let name = &tail[1..1 + ident_len];
            let closed = tail[1 + ident_len..].starts_with('}');

            if closed && !name.is_empty() {
                let known = PLACEHOLDERS
                    .iter()
                    .find(|p| **p == name)
                    .ok_or_else(|| ReviewError::Template(format!("unknown placeholder {{{name}}}")))?;
                if !literal.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Placeholder(*known));
                rest = &tail[ident_len + 2..];
            } else {
                literal.push('{');
                rest = &tail[1..];
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Text(literal));
        }
        Ok(Self { segments })
    }

    /// Placeholders the template uses, in order of first use.
    pub fn placeholders(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        for segment in &self.segments {
            if let Segment::Placeholder(name) = segment {
                if !names.contains(name) {
                    names.push(*name);
                }
            }
        }
        names
    }

    pub fn render(&self, values: &PromptValues) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Placeholder(name) => out.push_str(values.get(name)),
            }
        }
        out
    }
}

/// System prompt shared by both reviewers.
pub const SYSTEM_PROMPT: &str = "\
You are an experienced Linux kernel maintainer reviewing patches sent to a
mailing list. You are precise, terse and technical. You only comment when you
have something concrete to say, and you never praise or summarize.

Reply in plain text suitable for an email reply: no Markdown headings, no bold
text, no tables. Keep lines under 75 characters.

The kernel coding style follows.

{coding_style}
";

/// Audit of the commit message prose.
pub const COMMIT_AUDIT_PROMPT: &str = "\
Review the commit message of the patch below as a maintainer would.

Check that:
- the subject has a subsystem prefix and is written in the imperative mood
- the body explains the problem being solved before the solution
- the body justifies why the change is needed, not only what it does
- the text describes this patch and nothing else
- required trailers such as Signed-off-by: are present

Quote each line you comment on, prefixed with \"> \", and put your comment
directly below the quote. If the commit message has no problems, reply with
exactly: No issues found.

Patch metadata:
{metadata}

Commit message:
{commit_text}

Diff, for reference only:
{diff}
";

/// Inline review of the diff.
pub const CODE_REVIEW_PROMPT: &str = "\
Review the code changes in the patch below.

Report only real defects: bugs, memory or reference leaks, missing error
handling, locking mistakes, undefined behaviour, API misuse and clear
violations of the kernel coding style. Do not comment on things that are
correct, and do not restate what the code does.

For each problem, quote the relevant lines of the diff exactly as they appear,
including the leading '+' or '-', each prefixed with \"> \". Put your comment
directly below the quote. If you find nothing worth reporting, reply with
exactly: No issues found.

Patch metadata:
{metadata}

Commit message:
{commit_text}

Surrounding code from the patched tree:
{context}

Diff:
{diff}
";
