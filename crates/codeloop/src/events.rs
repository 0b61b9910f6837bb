//! Event stream published by the scheduler.
//!
//! Built on a bounded broadcast channel: publishing never blocks the
//! scheduler, and a subscriber that falls behind loses events rather than
//! applying backpressure.

use tokio::sync::broadcast;

use crate::budget::BudgetSnapshot;
use crate::error::EngineError;
use crate::ids::{CallId, CompletionId};
use crate::model::TokenUsage;
use crate::submit::Answer;

/// Stable codes for recoverable anomalies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningCode {
    StaleCommandDropped,
    QueueClosed,
    CallScopeCleanup,
    MixedSubmitAndCode,
    ToolkitDegraded,
    VariableSyncFailed,
    StallDetectedEarlyExtract,
    SubmitResolveFailed,
    SubmitInvalid,
    QueueOverloadedFatal,
}

impl WarningCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningCode::StaleCommandDropped => "STALE_COMMAND_DROPPED",
            WarningCode::QueueClosed => "QUEUE_CLOSED",
            WarningCode::CallScopeCleanup => "CALL_SCOPE_CLEANUP",
            WarningCode::MixedSubmitAndCode => "MIXED_SUBMIT_AND_CODE",
            WarningCode::ToolkitDegraded => "TOOLKIT_DEGRADED",
            WarningCode::VariableSyncFailed => "VARIABLE_SYNC_FAILED",
            WarningCode::StallDetectedEarlyExtract => "STALL_DETECTED_EARLY_EXTRACT",
            WarningCode::SubmitResolveFailed => "SUBMIT_RESOLVE_FAILED",
            WarningCode::SubmitInvalid => "SUBMIT_INVALID",
            WarningCode::QueueOverloadedFatal => "QUEUE_OVERLOADED_FATAL",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    CallStarted {
        completion_id: CompletionId,
        call_id: CallId,
        depth: u32,
    },
    IterationStarted {
        completion_id: CompletionId,
        call_id: CallId,
        depth: u32,
        iteration: u32,
        budget: BudgetSnapshot,
    },
    ModelResponse {
        completion_id: CompletionId,
        call_id: CallId,
        depth: u32,
        text: String,
        usage: Option<TokenUsage>,
    },
    CodeExecutionStarted {
        completion_id: CompletionId,
        call_id: CallId,
        depth: u32,
        code: String,
    },
    CodeExecutionCompleted {
        completion_id: CompletionId,
        call_id: CallId,
        depth: u32,
        output: String,
    },
    BridgeCallReceived {
        completion_id: CompletionId,
        call_id: CallId,
        depth: u32,
        method: String,
    },
    CallFinalized {
        completion_id: CompletionId,
        call_id: CallId,
        depth: u32,
        answer: Answer,
    },
    CallFailed {
        completion_id: CompletionId,
        call_id: CallId,
        depth: u32,
        error: EngineError,
    },
    SchedulerWarning {
        completion_id: CompletionId,
        code: WarningCode,
        message: String,
        call_id: Option<CallId>,
        command_tag: Option<&'static str>,
    },
}

impl Event {
    /// Discriminant name, used by tests asserting event sequences.
    pub fn tag(&self) -> &'static str {
        match self {
            Event::CallStarted { .. } => "CallStarted",
            Event::IterationStarted { .. } => "IterationStarted",
            Event::ModelResponse { .. } => "ModelResponse",
            Event::CodeExecutionStarted { .. } => "CodeExecutionStarted",
            Event::CodeExecutionCompleted { .. } => "CodeExecutionCompleted",
            Event::BridgeCallReceived { .. } => "BridgeCallReceived",
            Event::CallFinalized { .. } => "CallFinalized",
            Event::CallFailed { .. } => "CallFailed",
            Event::SchedulerWarning { .. } => "SchedulerWarning",
        }
    }

    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Event::CallStarted { call_id, .. }
            | Event::IterationStarted { call_id, .. }
            | Event::ModelResponse { call_id, .. }
            | Event::CodeExecutionStarted { call_id, .. }
            | Event::CodeExecutionCompleted { call_id, .. }
            | Event::BridgeCallReceived { call_id, .. }
            | Event::CallFinalized { call_id, .. }
            | Event::CallFailed { call_id, .. } => Some(call_id),
            Event::SchedulerWarning { call_id, .. } => call_id.as_ref(),
        }
    }

    /// Terminal event for a call.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::CallFinalized { .. } | Event::CallFailed { .. })
    }
}

/// Bounded, lossy pub/sub for [`Event`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size.max(1));
        Self { sender }
    }

    /// Publish to all subscribers. Send errors (no subscribers) are ignored.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
