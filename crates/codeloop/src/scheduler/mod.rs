//! The scheduler: a single consumer over the command queue.
//!
//! One handler runs at a time; everything forked (sandbox executions,
//! bridge dispatch, tool handlers) talks back exclusively by enqueuing
//! commands or resolving bridge futures. `call_states` is only ever written
//! here.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use crate::call::{CallContext, CallScope};
use crate::commands::{Command, CommandReceiver};
use crate::error::{EngineError, SandboxError};
use crate::events::{Event, WarningCode};
use crate::ids::{BridgeRequestId, CallId};
use crate::runtime::{CompletionResult, CompletionRuntime};
use crate::sandbox::SandboxEnv;
use crate::schema::validate_against;
use crate::submit::{Answer, SubmitPayload};
use crate::tools::ToolSpec;

mod bridge_call;
mod execute;
mod generate;

/// Drive one completion to its end: consume commands until the queue closes,
/// then sweep anything that leaked.
pub async fn run_scheduler(runtime: Arc<CompletionRuntime>, mut receiver: CommandReceiver) {
    let scheduler = Scheduler { runtime };
    while let Some(command) = receiver.next().await {
        scheduler.dispatch(command).await;
    }
    scheduler.cleanup().await;
}

pub(crate) struct Scheduler {
    runtime: Arc<CompletionRuntime>,
}

impl Scheduler {
    async fn dispatch(&self, command: Command) {
        debug!(
            completion_id = %self.runtime.completion_id,
            call_id = %command.call_id(),
            command = command.tag(),
            "dispatching"
        );
        match command {
            Command::StartCall {
                call_id,
                depth,
                query,
                context,
                parent_bridge_request_id,
                tools,
                output_schema,
            } => {
                self.handle_start_call(
                    call_id,
                    depth,
                    query,
                    context,
                    parent_bridge_request_id,
                    tools,
                    output_schema,
                )
                .await;
            }
            Command::GenerateStep { call_id } => self.handle_generate_step(call_id).await,
            Command::ExecuteCode { call_id, code } => self.handle_execute_code(call_id, code).await,
            Command::CodeExecuted { call_id, output } => self.handle_code_executed(call_id, output).await,
            Command::HandleBridgeCall {
                call_id,
                bridge_request_id,
                method,
                args,
            } => {
                self.handle_bridge_call(call_id, bridge_request_id, method, args)
                    .await;
            }
            Command::Finalize { call_id, payload } => self.handle_finalize(call_id, payload).await,
            Command::FailCall { call_id, error } => self.handle_fail_call(call_id, error).await,
        }
    }

    // ---- shared plumbing -------------------------------------------------

    /// Run a closure against a call's mutable state. `None` means the call
    /// is gone (finalized or failed) and the current command is stale.
    fn with_call<R>(&self, call_id: &CallId, f: impl FnOnce(&mut CallContext) -> R) -> Option<R> {
        let mut states = self
            .runtime
            .call_states
            .lock()
            .expect("call states lock poisoned");
        states.get_mut(call_id).map(f)
    }

    fn publish(&self, event: Event) {
        self.runtime.events.publish(event);
    }

    fn warn(
        &self,
        code: WarningCode,
        message: String,
        call_id: Option<CallId>,
        command_tag: Option<&'static str>,
    ) {
        debug!(code = code.as_str(), message = %message, "scheduler warning");
        self.publish(Event::SchedulerWarning {
            completion_id: self.runtime.completion_id.clone(),
            code,
            message,
            call_id,
            command_tag,
        });
    }

    fn warn_stale(&self, call_id: &CallId, command_tag: &'static str) {
        self.warn(
            WarningCode::StaleCommandDropped,
            format!("{command_tag} for unknown call {call_id} dropped"),
            Some(call_id.clone()),
            Some(command_tag),
        );
    }

    /// Terminal bookkeeping for the root call.
    fn root_teardown(&self, result: CompletionResult) {
        let swept = self.runtime.bridge.fail_all("completion ended");
        if swept > 0 {
            debug!(swept, "failed bridge futures still pending at completion end");
        }
        self.runtime.resolve_result(result);
        self.runtime.queue.close();
    }

    /// Fail a call that never made it into `call_states`.
    fn fail_unregistered_call(
        &self,
        call_id: &CallId,
        depth: u32,
        parent_bridge_request_id: Option<BridgeRequestId>,
        error: EngineError,
    ) {
        self.publish(Event::CallFailed {
            completion_id: self.runtime.completion_id.clone(),
            call_id: call_id.clone(),
            depth,
            error: error.clone(),
        });
        match parent_bridge_request_id {
            Some(parent) => {
                self.runtime.bridge.resolve(parent, Err(error.to_string()));
            }
            None => self.root_teardown(Err(error)),
        }
    }

    // ---- StartCall -------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn handle_start_call(
        &self,
        call_id: CallId,
        depth: u32,
        query: String,
        context: String,
        parent_bridge_request_id: Option<BridgeRequestId>,
        tools: Vec<ToolSpec>,
        output_schema: Option<serde_json::Value>,
    ) {
        if depth == 0 {
            info!(
                completion_id = %self.runtime.completion_id,
                call_id = %call_id,
                query_len = query.len(),
                context_len = context.len(),
                max_iterations = self.runtime.config.max_iterations,
                max_llm_calls = self.runtime.config.max_llm_calls,
                structured = output_schema.is_some(),
                "completion started"
            );
        }

        let env = SandboxEnv {
            completion_id: self.runtime.completion_id.clone(),
            call_id: call_id.clone(),
            depth,
            bridge: self.runtime.bridge_handler.clone(),
            tools: tools.clone(),
            events: self.runtime.events.clone(),
            config: self.runtime.config.clone(),
        };
        let sandbox = match self.runtime.sandbox_factory.create(env).await {
            Ok(sandbox) => sandbox,
            Err(err) => {
                self.fail_unregistered_call(
                    &call_id,
                    depth,
                    parent_bridge_request_id,
                    EngineError::Sandbox(err),
                );
                return;
            }
        };
        let scope = CallScope::new(sandbox.clone());

        let injected: Result<(), SandboxError> = async {
            sandbox.set_variable("query", &json!(query.clone())).await?;
            sandbox.set_variable("context", &json!(context.clone())).await?;
            Ok(())
        }
        .await;
        if let Err(err) = injected {
            scope.close();
            self.fail_unregistered_call(
                &call_id,
                depth,
                parent_bridge_request_id,
                EngineError::Sandbox(err),
            );
            return;
        }

        let context_state = CallContext::new(
            call_id.clone(),
            depth,
            query,
            context,
            scope,
            parent_bridge_request_id,
            tools,
            output_schema,
        );
        self.runtime
            .call_states
            .lock()
            .expect("call states lock poisoned")
            .insert(call_id.clone(), context_state);

        self.publish(Event::CallStarted {
            completion_id: self.runtime.completion_id.clone(),
            call_id: call_id.clone(),
            depth,
        });

        let step = Command::GenerateStep {
            call_id: call_id.clone(),
        };
        if self.runtime.queue.enqueue(step).await.is_err() {
            // Startup enqueues are fatal for the call.
            self.handle_fail_call(
                call_id,
                EngineError::unknown("command queue closed during call startup"),
            )
            .await;
        }
    }

    // ---- Finalize --------------------------------------------------------

    async fn handle_finalize(&self, call_id: CallId, payload: SubmitPayload) {
        let Some(context) = self
            .runtime
            .call_states
            .lock()
            .expect("call states lock poisoned")
            .remove(&call_id)
        else {
            self.warn_stale(&call_id, "Finalize");
            return;
        };

        // Resolve the payload to a concrete value while the sandbox is
        // still alive; `variable` reads `__vars` here.
        let resolved: Result<serde_json::Value, EngineError> = match payload {
            SubmitPayload::Answer(text) => {
                if context.is_structured() {
                    Err(EngineError::OutputValidation {
                        message: "plain `answer` submitted in structured mode".to_string(),
                        raw: text,
                    })
                } else {
                    Ok(json!(text))
                }
            }
            SubmitPayload::Value(value) => {
                if context.is_structured() {
                    Ok(value)
                } else {
                    Err(EngineError::OutputValidation {
                        message: "structured `value` submitted in plain mode".to_string(),
                        raw: value.to_string(),
                    })
                }
            }
            SubmitPayload::Variable(name) => {
                match context.scope.sandbox().get_variable(&name).await {
                    Ok(serde_json::Value::Null) => {
                        self.warn(
                            WarningCode::SubmitResolveFailed,
                            format!("SUBMIT variable `{name}` is not set in the sandbox"),
                            Some(call_id.clone()),
                            None,
                        );
                        Err(EngineError::OutputValidation {
                            message: format!("SUBMIT variable `{name}` is not set"),
                            raw: name,
                        })
                    }
                    Ok(value) => Ok(value),
                    Err(err) => {
                        self.warn(
                            WarningCode::SubmitResolveFailed,
                            format!("reading SUBMIT variable `{name}` failed: {err}"),
                            Some(call_id.clone()),
                            None,
                        );
                        Err(EngineError::OutputValidation {
                            message: format!("reading SUBMIT variable `{name}` failed: {err}"),
                            raw: name,
                        })
                    }
                }
            }
        };

        // Root structured output must decode through the schema before the
        // call may finalize.
        let resolved = resolved.and_then(|value| {
            if context.is_structured() && !context.is_sub_call() {
                let schema = context
                    .output_schema
                    .as_ref()
                    .expect("structured mode implies a schema");
                validate_against(schema, &value).map_err(|message| EngineError::OutputValidation {
                    raw: value.to_string(),
                    message,
                })?;
            }
            Ok(value)
        });

        let value = match resolved {
            Ok(value) => value,
            Err(error) => {
                self.conclude_failed(context, error);
                return;
            }
        };

        let answer = if context.is_structured() {
            Answer::Structured(value.clone())
        } else {
            Answer::Text(match &value {
                serde_json::Value::String(text) => text.clone(),
                other => other.to_string(),
            })
        };

        self.publish(Event::CallFinalized {
            completion_id: self.runtime.completion_id.clone(),
            call_id: context.call_id.clone(),
            depth: context.depth,
            answer: answer.clone(),
        });
        context.scope.close();

        match context.parent_bridge_request_id {
            Some(parent) => {
                // Structured sub-call results validate at this boundary, not
                // inside the child.
                let outcome = if let Some(schema) = &context.output_schema {
                    validate_against(schema, &value)
                        .map(|()| value)
                        .map_err(|message| format!("sub-call result failed schema validation: {message}"))
                } else {
                    Ok(value)
                };
                self.runtime.bridge.resolve(parent, outcome);
            }
            None => self.root_teardown(Ok(answer)),
        }
    }

    // ---- FailCall --------------------------------------------------------

    async fn handle_fail_call(&self, call_id: CallId, error: EngineError) {
        let removed = self
            .runtime
            .call_states
            .lock()
            .expect("call states lock poisoned")
            .remove(&call_id);
        match removed {
            Some(context) => self.conclude_failed(context, error),
            None => {
                self.warn_stale(&call_id, "FailCall");
                // A root that failed before registration still has to end
                // the completion.
                if call_id == self.runtime.root_call_id && self.runtime.result_pending() {
                    self.root_teardown(Err(error));
                }
            }
        }
    }

    /// Shared terminal path for a failed call whose state was removed.
    fn conclude_failed(&self, context: CallContext, error: EngineError) {
        self.publish(Event::CallFailed {
            completion_id: self.runtime.completion_id.clone(),
            call_id: context.call_id.clone(),
            depth: context.depth,
            error: error.clone(),
        });
        context.scope.close();
        match context.parent_bridge_request_id {
            Some(parent) => {
                self.runtime.bridge.resolve(parent, Err(error.to_string()));
            }
            None => self.root_teardown(Err(error)),
        }
    }

    // ---- shutdown sweep --------------------------------------------------

    async fn cleanup(&self) {
        let leaked: Vec<(CallId, CallContext)> = {
            let mut states = self
                .runtime
                .call_states
                .lock()
                .expect("call states lock poisoned");
            states.drain().collect()
        };
        for (call_id, context) in leaked {
            self.warn(
                WarningCode::CallScopeCleanup,
                format!("call {call_id} was still open at scheduler exit"),
                Some(call_id),
                None,
            );
            context.scope.close();
        }
        let swept = self.runtime.bridge.fail_all("scheduler shut down");
        if swept > 0 {
            debug!(swept, "bridge futures failed by scheduler shutdown");
        }
        // No-op when the root already resolved the completion.
        self.runtime.resolve_result(Err(EngineError::unknown(
            "scheduler terminated before the root call finalized",
        )));
        debug!(completion_id = %self.runtime.completion_id, "scheduler loop ended");
    }
}
