//! ExecuteCode / CodeExecuted: the sandbox side of one REPL round.

use super::Scheduler;
use crate::commands::Command;
use crate::error::EngineError;
use crate::events::{Event, WarningCode};
use crate::ids::CallId;

impl Scheduler {
    /// Fork the execution into the call scope; results come back as
    /// commands. User-code failures are output for the model, not call
    /// failures.
    pub(super) async fn handle_execute_code(&self, call_id: CallId, code: String) {
        let Some((scope, depth)) = self.with_call(&call_id, |context| (context.scope.clone(), context.depth))
        else {
            self.warn_stale(&call_id, "ExecuteCode");
            return;
        };

        self.publish(Event::CodeExecutionStarted {
            completion_id: self.runtime.completion_id.clone(),
            call_id: call_id.clone(),
            depth,
            code: code.clone(),
        });

        let queue = self.runtime.queue.clone();
        let sandbox = scope.sandbox();
        scope.spawn(async move {
            let command = match sandbox.execute(&code).await {
                Ok(output) => Command::CodeExecuted { call_id, output },
                Err(err) if err.is_exec_error() => Command::CodeExecuted {
                    call_id,
                    output: format!("Error: {err}"),
                },
                Err(err) => Command::FailCall {
                    call_id,
                    error: EngineError::Sandbox(err),
                },
            };
            queue.enqueue_or_warn(command).await;
        });
    }

    /// Record the output, refresh the variable snapshot, loop.
    pub(super) async fn handle_code_executed(&self, call_id: CallId, output: String) {
        let max_chars = self.runtime.config.max_execution_output_chars;
        let Some((sandbox, depth)) = self.with_call(&call_id, |context| {
            context.code_executed_at_least_once = true;
            context.attach_execution_output(&output, max_chars);
            (context.scope.sandbox(), context.depth)
        }) else {
            self.warn_stale(&call_id, "CodeExecuted");
            return;
        };

        self.publish(Event::CodeExecutionCompleted {
            completion_id: self.runtime.completion_id.clone(),
            call_id: call_id.clone(),
            depth,
            output,
        });

        // Synchronous refresh: the next prompt must see current variables.
        match sandbox.list_variables().await {
            Ok(variables) => {
                self.with_call(&call_id, |context| context.variable_snapshot = variables);
            }
            Err(err) => {
                self.warn(
                    WarningCode::VariableSyncFailed,
                    format!("variable snapshot for call {call_id} failed: {err}"),
                    Some(call_id.clone()),
                    None,
                );
            }
        }

        self.runtime
            .queue
            .enqueue_or_warn(Command::GenerateStep { call_id })
            .await;
    }
}
