//! Domain model for patchwise.
//!
//! - `PatchReference`: the change under review
//! - `CheckSpec`: one configured check
//! - `CheckOutcome`: what running a check produced
//! - `Finding`: a normalized unit of feedback
//! - `Report`: the merged result of a run

pub mod check;
pub mod error;
pub mod finding;
pub mod outcome;
pub mod patch;
pub mod policy;
pub mod report;

pub use check::{
    CheckPolicy, CheckScope, CheckSpec, DiagnosticFormat, Execution, OutputKind, Repeat,
    ReviewKind, TouchFilter,
};
pub use error::{CheckError, CheckErrorKind, PatchwiseError, Result};
pub use finding::{Finding, FindingContent, Location, Severity};
pub use outcome::{CheckOutcome, OutcomeClass};
pub use patch::PatchReference;
pub use policy::{EquivalenceRule, FindingOrder};
pub use report::{OutcomeSummary, Report, Verdict};
