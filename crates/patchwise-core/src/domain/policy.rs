//! Aggregation knobs.

use serde::{Deserialize, Serialize};

/// Whether a review comment and a structured diagnostic about the same line
/// are considered the same finding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EquivalenceRule {
    /// Keep both.
    #[default]
    Distinct,
    /// Drop review findings anchored on a line a structured check already
    /// reported.
    SameLine,
}

/// Order of findings in the report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FindingOrder {
    /// Check declaration order, then emission order.
    #[default]
    Declaration,
    /// File, then line, then check id. Unattributed findings last.
    Location,
}
