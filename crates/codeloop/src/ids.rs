//! Opaque identifiers used across the engine.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one completion (one `run_scheduler` lifetime).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompletionId(String);

impl CompletionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CompletionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one call (root or sub-call) within a completion. Opaque, but
/// kept as a string so tests and trace output can use literal ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(String);

impl CallId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CallId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Engine-side key for an outstanding bridge future.
pub type BridgeRequestId = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_call_ids_are_unique() {
        assert_ne!(CallId::generate(), CallId::generate());
    }

    #[test]
    fn literal_call_ids_compare_by_value() {
        assert_eq!(CallId::from("stale"), CallId::from("stale"));
    }
}
