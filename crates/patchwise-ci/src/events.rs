//! Progress events for callers that want to follow a run as it happens.

use serde::{Deserialize, Serialize};

use patchwise_core::OutcomeClass;

/// Lifecycle of a single check within a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CheckEvent {
    /// Waiting for a concurrency slot.
    Queued { check_id: String },
    /// Environment acquired, tree about to be prepared.
    Started {
        check_id: String,
        environment_id: String,
    },
    Finished {
        check_id: String,
        class: OutcomeClass,
        elapsed_ms: u64,
    },
}

impl CheckEvent {
    pub fn check_id(&self) -> &str {
        match self {
            CheckEvent::Queued { check_id }
            | CheckEvent::Started { check_id, .. }
            | CheckEvent::Finished { check_id, .. } => check_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = CheckEvent::Finished {
            check_id: "sparse".to_string(),
            class: OutcomeClass::TimedOut,
            elapsed_ms: 12,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "finished");
        assert_eq!(json["check_id"], "sparse");
        assert_eq!(event.check_id(), "sparse");
    }
}
