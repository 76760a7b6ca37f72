//! Normalized findings.

use serde::{Deserialize, Serialize};

/// Severity of a finding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Map tool severity words (gcc, checkpatch, dt-schema) onto a severity.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "error" | "fatal error" | "fatal" => Some(Severity::Error),
            "warning" | "check" => Some(Severity::Warning),
            "note" | "info" | "information" => Some(Severity::Info),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position in the source tree, relative to the tree root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    pub file: String,
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl Location {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column: None,
        }
    }

    pub fn with_column(mut self, column: u32) -> Self {
        self.column = Some(column);
        self
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.column {
            Some(col) => write!(f, "{}:{}:{}", self.file, self.line, col),
            None => write!(f, "{}:{}", self.file, self.line),
        }
    }
}

/// What a finding says.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FindingContent {
    /// One parsed diagnostic line.
    Diagnostic {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    /// Tool output the parser could not interpret.
    ParseWarning { message: String, lines: Vec<String> },
    /// One reviewer comment.
    Review {
        body: String,
        /// Diff lines the comment quotes, without the `>` markers.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        quoted: Vec<String>,
        /// Where the first quoted added line sits in the new tree.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor: Option<Location>,
    },
}

/// One normalized unit of feedback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Finding {
    pub check_id: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub content: FindingContent,
}

impl Finding {
    pub fn diagnostic(
        check_id: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            check_id: check_id.into(),
            severity,
            location: None,
            content: FindingContent::Diagnostic {
                message: message.into(),
                code: None,
            },
        }
    }

    pub fn parse_warning(check_id: impl Into<String>, lines: Vec<String>) -> Self {
        let message = format!("{} line(s) of tool output could not be parsed", lines.len());
        Self {
            check_id: check_id.into(),
            severity: Severity::Warning,
            location: None,
            content: FindingContent::ParseWarning { message, lines },
        }
    }

    pub fn review(check_id: impl Into<String>, severity: Severity, body: impl Into<String>) -> Self {
        Self {
            check_id: check_id.into(),
            severity,
            location: None,
            content: FindingContent::Review {
                body: body.into(),
                quoted: Vec::new(),
                anchor: None,
            },
        }
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Attach a tool code (e.g. checkpatch type). Ignored for non-diagnostics.
    pub fn with_code(mut self, value: impl Into<String>) -> Self {
        if let FindingContent::Diagnostic { code, .. } = &mut self.content {
            *code = Some(value.into());
        }
        self
    }

    pub fn with_quote(mut self, lines: Vec<String>, at: Option<Location>) -> Self {
        if let FindingContent::Review { quoted, anchor, .. } = &mut self.content {
            *quoted = lines;
            *anchor = at;
        }
        self
    }

    /// Primary text of the finding.
    pub fn message(&self) -> &str {
        match &self.content {
            FindingContent::Diagnostic { message, .. } => message,
            FindingContent::ParseWarning { message, .. } => message,
            FindingContent::Review { body, .. } => body,
        }
    }

    pub fn is_review(&self) -> bool {
        matches!(self.content, FindingContent::Review { .. })
    }

    pub fn anchor(&self) -> Option<&Location> {
        match &self.content {
            FindingContent::Review { anchor, .. } => anchor.as_ref(),
            _ => None,
        }
    }

    /// Identity used for de-duplication: check, file, line and message.
    pub fn dedup_key(&self) -> (String, Option<String>, Option<u32>, String) {
        (
            self.check_id.clone(),
            self.location.as_ref().map(|l| l.file.clone()),
            self.location.as_ref().map(|l| l.line),
            self.message().to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_from_label() {
        assert_eq!(Severity::from_label("error"), Some(Severity::Error));
        assert_eq!(Severity::from_label("WARNING"), Some(Severity::Warning));
        assert_eq!(Severity::from_label("CHECK"), Some(Severity::Warning));
        assert_eq!(Severity::from_label("note"), Some(Severity::Info));
        assert_eq!(Severity::from_label("bogus"), None);
        assert!(Severity::Error > Severity::Warning);
    }

    #[test]
    fn test_location_display() {
        assert_eq!(Location::new("drivers/foo.c", 42).to_string(), "drivers/foo.c:42");
        assert_eq!(
            Location::new("drivers/foo.c", 42).with_column(7).to_string(),
            "drivers/foo.c:42:7"
        );
    }

    #[test]
    fn test_builders_apply_to_matching_content_only() {
        let d = Finding::diagnostic("checkpatch", Severity::Warning, "trailing whitespace")
            .with_code("TRAILING_WHITESPACE");
        assert!(matches!(
            d.content,
            FindingContent::Diagnostic { code: Some(ref c), .. } if c == "TRAILING_WHITESPACE"
        ));

        let r = Finding::review("code-review", Severity::Warning, "leak").with_code("ignored");
        assert!(r.is_review());
        assert_eq!(r.message(), "leak");
    }

    #[test]
    fn test_dedup_key_ignores_severity() {
        let a = Finding::diagnostic("sparse", Severity::Warning, "msg")
            .with_location(Location::new("a.c", 1));
        let b = Finding::diagnostic("sparse", Severity::Error, "msg")
            .with_location(Location::new("a.c", 1).with_column(3));
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn test_review_anchor_is_not_location() {
        let f = Finding::review("code-review", Severity::Warning, "body")
            .with_quote(vec!["+x".to_string()], Some(Location::new("a.c", 3)));
        assert!(f.location.is_none());
        assert_eq!(f.anchor(), Some(&Location::new("a.c", 3)));
    }

    #[test]
    fn test_finding_json_shape() {
        let f = Finding::diagnostic("sparse", Severity::Error, "bad")
            .with_location(Location::new("drivers/foo.c", 42));
        let json = serde_json::to_value(&f).expect("serialize");
        assert_eq!(json["severity"], "error");
        assert_eq!(json["content"]["type"], "diagnostic");
        assert_eq!(json["location"]["line"], 42);
        assert!(json["location"].get("column").is_none());
    }
}
