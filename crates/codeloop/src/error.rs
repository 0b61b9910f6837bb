//! Engine error taxonomy.
//!
//! Everything here is `Clone`: errors travel through commands, events, and
//! the completion result, all of which fan out to multiple consumers.

use thiserror::Error;

use crate::budget::BudgetResource;
use crate::ids::CallId;

/// Failures of the sandbox infrastructure (not of the code it runs).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SandboxError {
    #[error("sandbox request timed out after {0} ms")]
    Timeout(u64),
    #[error("sandbox worker exited unexpectedly (status {status:?})")]
    WorkerExited { status: Option<i32> },
    #[error("sandbox sent a bad frame: {0}")]
    BadFrame(String),
    #[error("sandbox ipc disconnected")]
    Disconnected,
    #[error("sandbox worker could not be spawned: {0}")]
    Spawn(String),
    #[error("sandbox is unavailable: {0}")]
    Unavailable(String),
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
    /// The worker reported that user code threw. Recovered locally by the
    /// scheduler, never propagated as a call failure.
    #[error("{message}")]
    Exec {
        message: String,
        stack: Option<String>,
    },
}

impl SandboxError {
    /// Execution errors are fed back to the model; everything else fails the
    /// call.
    pub fn is_exec_error(&self) -> bool {
        matches!(self, SandboxError::Exec { .. })
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("budget exhausted: {resource} (call {call_id}, {remaining} remaining)")]
    BudgetExhausted {
        resource: BudgetResource,
        call_id: CallId,
        remaining: u64,
    },
    #[error("no final answer within {max_iterations} iterations (call {call_id})")]
    NoFinalAnswer { call_id: CallId, max_iterations: u32 },
    #[error("sandbox failure: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("output validation failed: {message}")]
    OutputValidation { message: String, raw: String },
    #[error("no state registered for call {call_id}")]
    CallStateMissing { call_id: CallId },
    #[error("{message}")]
    Unknown {
        message: String,
        cause: Option<String>,
    },
}

impl EngineError {
    pub fn unknown(message: impl Into<String>) -> Self {
        EngineError::Unknown {
            message: message.into(),
            cause: None,
        }
    }

    pub fn unknown_with_cause(message: impl Into<String>, cause: impl ToString) -> Self {
        EngineError::Unknown {
            message: message.into(),
            cause: Some(cause.to_string()),
        }
    }

    pub fn budget(resource: BudgetResource, call_id: CallId, remaining: u64) -> Self {
        EngineError::BudgetExhausted {
            resource,
            call_id,
            remaining,
        }
    }

    /// True for the iteration exhaustion that routes into the extract
    /// fallback rather than failing the call outright.
    pub fn is_iteration_exhaustion(&self) -> bool {
        matches!(
            self,
            EngineError::BudgetExhausted {
                resource: BudgetResource::Iterations,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_resource_and_call() {
        let err = EngineError::budget(BudgetResource::LlmCalls, CallId::from("c1"), 0);
        let text = err.to_string();
        assert!(text.contains("llm_calls"));
        assert!(text.contains("c1"));
    }

    #[test]
    fn exec_errors_are_recoverable() {
        assert!(
            SandboxError::Exec {
                message: "TypeError: x is not a function".into(),
                stack: None,
            }
            .is_exec_error()
        );
        assert!(!SandboxError::Disconnected.is_exec_error());
    }

    #[test]
    fn iteration_exhaustion_is_distinguished() {
        let iterations = EngineError::budget(BudgetResource::Iterations, CallId::from("c"), 0);
        let tokens = EngineError::budget(BudgetResource::Tokens, CallId::from("c"), 0);
        assert!(iterations.is_iteration_exhaustion());
        assert!(!tokens.is_iteration_exhaustion());
    }
}
