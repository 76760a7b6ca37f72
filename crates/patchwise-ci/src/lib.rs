//! Patchwise CI engine.
//!
//! Runs a patch through a set of checks concurrently and folds the results
//! into a single report:
//! - [`CheckRegistry`]: builtin checks, config overrides and group selection
//! - [`Scheduler`]: bounded fan-out, one isolated tree per check
//! - [`CheckRunner`]: process execution, timeouts and outcome classification
//! - [`normalize`]: tool output and review text to [`Finding`]s
//! - [`aggregate`] / [`render`]: verdict, de-duplication and presentation
//!
//! [`Finding`]: patchwise_core::Finding

pub mod aggregate;
pub mod check;
pub mod events;
pub mod normalize;
pub mod pipeline;
pub mod render;
pub mod runner;
pub mod scheduler;

pub use aggregate::Aggregation;
pub use check::{BuiltinCheck, CheckGroup, CheckRegistry};
pub use events::CheckEvent;
pub use normalize::{normalize, normalize_all};
pub use pipeline::Pipeline;
pub use render::{render, ReportFormat};
pub use runner::{CheckRunner, RunContext};
pub use scheduler::Scheduler;
