//! The scheduler's work queue and the commands that flow through it.
//!
//! Every mutation of scheduler state happens inside a command handler;
//! background tasks only ever enqueue. The queue is bounded (enqueue applies
//! backpressure) and closed exactly once to end the scheduler loop.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::events::{Event, EventBus, WarningCode};
use crate::ids::{BridgeRequestId, CallId, CompletionId};
use crate::submit::SubmitPayload;
use crate::tools::ToolSpec;

#[derive(Debug, Clone)]
pub enum Command {
    StartCall {
        call_id: CallId,
        depth: u32,
        query: String,
        context: String,
        parent_bridge_request_id: Option<BridgeRequestId>,
        tools: Vec<ToolSpec>,
        output_schema: Option<serde_json::Value>,
    },
    GenerateStep {
        call_id: CallId,
    },
    ExecuteCode {
        call_id: CallId,
        code: String,
    },
    CodeExecuted {
        call_id: CallId,
        output: String,
    },
    HandleBridgeCall {
        call_id: CallId,
        bridge_request_id: BridgeRequestId,
        method: String,
        args: Vec<serde_json::Value>,
    },
    Finalize {
        call_id: CallId,
        payload: SubmitPayload,
    },
    FailCall {
        call_id: CallId,
        error: EngineError,
    },
}

impl Command {
    pub fn call_id(&self) -> &CallId {
        match self {
            Command::StartCall { call_id, .. }
            | Command::GenerateStep { call_id }
            | Command::ExecuteCode { call_id, .. }
            | Command::CodeExecuted { call_id, .. }
            | Command::HandleBridgeCall { call_id, .. }
            | Command::Finalize { call_id, .. }
            | Command::FailCall { call_id, .. } => call_id,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Command::StartCall { .. } => "StartCall",
            Command::GenerateStep { .. } => "GenerateStep",
            Command::ExecuteCode { .. } => "ExecuteCode",
            Command::CodeExecuted { .. } => "CodeExecuted",
            Command::HandleBridgeCall { .. } => "HandleBridgeCall",
            Command::Finalize { .. } => "Finalize",
            Command::FailCall { .. } => "FailCall",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("command queue is closed")]
pub struct QueueClosed;

/// Sender half of the bounded work queue.
#[derive(Clone)]
pub struct CommandQueue {
    tx: mpsc::Sender<Command>,
    closed: CancellationToken,
    completion_id: CompletionId,
    events: EventBus,
}

/// Receiver half, consumed by the scheduler loop.
pub struct CommandReceiver {
    rx: mpsc::Receiver<Command>,
    closed: CancellationToken,
}

impl CommandQueue {
    pub fn bounded(
        capacity: usize,
        completion_id: CompletionId,
        events: EventBus,
    ) -> (CommandQueue, CommandReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        (
            CommandQueue {
                tx,
                closed: closed.clone(),
                completion_id,
                events,
            },
            CommandReceiver { rx, closed },
        )
    }

    /// Enqueue a command the caller cannot proceed without. An error here is
    /// an invariant breach the caller must escalate to shutdown.
    pub async fn enqueue(&self, command: Command) -> Result<(), QueueClosed> {
        if self.closed.is_cancelled() {
            return Err(QueueClosed);
        }
        self.tx.send(command).await.map_err(|_| QueueClosed)
    }

    /// Best-effort enqueue for shutdown-adjacent paths: a closed queue drops
    /// the command and publishes a `QUEUE_CLOSED` warning instead of failing.
    pub async fn enqueue_or_warn(&self, command: Command) {
        let tag = command.tag();
        let call_id = command.call_id().clone();
        if self.enqueue(command).await.is_err() {
            tracing::debug!(call_id = %call_id, command = tag, "dropped command, queue closed");
            self.events.publish(Event::SchedulerWarning {
                completion_id: self.completion_id.clone(),
                code: WarningCode::QueueClosed,
                message: format!("dropped {tag} for call {call_id}: queue closed"),
                call_id: Some(call_id),
                command_tag: Some(tag),
            });
        }
    }

    /// Close the queue. Idempotent; wakes the scheduler loop.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl CommandReceiver {
    /// Next command, or `None` once the queue is closed. Commands already
    /// buffered when `close` is called are discarded: post-shutdown work is
    /// stale by definition.
    pub async fn next(&mut self) -> Option<Command> {
        tokio::select! {
            _ = self.closed.cancelled() => None,
            command = self.rx.recv() => command,
        }
    }
}
