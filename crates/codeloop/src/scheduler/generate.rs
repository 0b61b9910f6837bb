//! GenerateStep: one REPL round, plus the extract fallback.

use tracing::debug;

use super::Scheduler;
use crate::budget::BudgetResource;
use crate::commands::Command;
use crate::error::EngineError;
use crate::events::{Event, WarningCode};
use crate::ids::CallId;
use crate::model::{ModelError, ModelRequest, ModelResponse, ToolChoice};
use crate::submit::{SubmitOutcome, extract_code_block, extract_submit};

impl Scheduler {
    pub(super) async fn handle_generate_step(&self, call_id: CallId) {
        if self.with_call(&call_id, |_| ()).is_none() {
            self.warn_stale(&call_id, "GenerateStep");
            return;
        }
        match self.generate_step_inner(&call_id).await {
            Ok(()) => {}
            Err(error) if error.is_iteration_exhaustion() => {
                self.extract_fallback(&call_id).await;
            }
            Err(error) => {
                self.runtime
                    .queue
                    .enqueue_or_warn(Command::FailCall { call_id, error })
                    .await;
            }
        }
    }

    async fn generate_step_inner(&self, call_id: &CallId) -> Result<(), EngineError> {
        let config = self.runtime.config.clone();
        let budget = &self.runtime.budget;

        // Budget gate and prompt assembly under one short lock.
        let (request, iteration) = {
            let mut states = self
                .runtime
                .call_states
                .lock()
                .expect("call states lock poisoned");
            let context = states
                .get_mut(call_id)
                .ok_or_else(|| EngineError::CallStateMissing {
                    call_id: call_id.clone(),
                })?;

            if context.iteration >= config.max_iterations {
                return Err(EngineError::budget(
                    BudgetResource::Iterations,
                    call_id.clone(),
                    budget.iterations_remaining(),
                ));
            }
            if budget.time_exhausted() {
                return Err(EngineError::budget(BudgetResource::Time, call_id.clone(), 0));
            }
            if budget.tokens_exhausted() {
                return Err(EngineError::budget(BudgetResource::Tokens, call_id.clone(), 0));
            }
            if !budget.try_consume_iteration() {
                return Err(EngineError::budget(BudgetResource::Iterations, call_id.clone(), 0));
            }
            if !budget.try_consume_llm_call() {
                return Err(EngineError::budget(BudgetResource::LlmCalls, call_id.clone(), 0));
            }
            (self.runtime.prompts.step_request(context), context.iteration)
        };

        let depth = request.depth;
        self.publish(Event::IterationStarted {
            completion_id: self.runtime.completion_id.clone(),
            call_id: call_id.clone(),
            depth,
            iteration,
            budget: budget.snapshot(),
        });

        let response = self.call_model(call_id, request, true).await?;

        if let Some(used) = response.usage.as_ref().and_then(|usage| usage.billable()) {
            budget.record_tokens(used);
        }
        self.publish(Event::ModelResponse {
            completion_id: self.runtime.completion_id.clone(),
            call_id: call_id.clone(),
            depth,
            text: response.text.clone(),
            usage: response.usage.clone(),
        });

        match extract_submit(&response) {
            SubmitOutcome::Found(payload) => {
                let structured = self
                    .with_call(call_id, |context| context.is_structured())
                    .unwrap_or(false);
                if let Err(message) = payload.compatible_with_mode(structured) {
                    self.note_invalid_submit(call_id, &response, &message).await;
                    return Ok(());
                }
                if extract_code_block(&response.text).is_some() {
                    self.warn(
                        WarningCode::MixedSubmitAndCode,
                        format!("call {call_id} emitted SUBMIT and a code block; code discarded"),
                        Some(call_id.clone()),
                        None,
                    );
                }
                self.runtime
                    .queue
                    .enqueue_or_warn(Command::Finalize {
                        call_id: call_id.clone(),
                        payload,
                    })
                    .await;
                Ok(())
            }
            SubmitOutcome::Invalid(message) => {
                self.note_invalid_submit(call_id, &response, &message).await;
                Ok(())
            }
            SubmitOutcome::Missing => self.continue_without_submit(call_id, &response).await,
        }
    }

    /// Invalid SUBMIT: tell the model what was wrong and loop.
    async fn note_invalid_submit(&self, call_id: &CallId, response: &ModelResponse, message: &str) {
        self.warn(
            WarningCode::SubmitInvalid,
            format!("call {call_id}: {message}"),
            Some(call_id.clone()),
            None,
        );
        let max_chars = self.runtime.config.max_execution_output_chars;
        self.with_call(call_id, |context| {
            let raw = if response.text.is_empty() {
                "[SUBMIT tool call with invalid parameters]".to_string()
            } else {
                response.text.clone()
            };
            context.push_response(raw);
            context.attach_execution_output(&format!("Error: invalid SUBMIT call: {message}"), max_chars);
            context.iteration += 1;
            context.consecutive_stalls = 0;
        });
        self.runtime
            .queue
            .enqueue_or_warn(Command::GenerateStep {
                call_id: call_id.clone(),
            })
            .await;
    }

    /// No SUBMIT in the response: execute a code block or handle a stall.
    async fn continue_without_submit(
        &self,
        call_id: &CallId,
        response: &ModelResponse,
    ) -> Result<(), EngineError> {
        if let Some(code) = extract_code_block(&response.text) {
            self.with_call(call_id, |context| {
                context.push_response(response.text.clone());
                context.iteration += 1;
                context.consecutive_stalls = 0;
            });
            self.runtime
                .queue
                .enqueue_or_warn(Command::ExecuteCode {
                    call_id: call_id.clone(),
                    code,
                })
                .await;
            return Ok(());
        }

        let config = &self.runtime.config;
        let stalled_out = self
            .with_call(call_id, |context| {
                context.push_response(response.text.clone());
                context.iteration += 1;
                if response.text.len() <= config.stall_response_max_chars {
                    context.consecutive_stalls += 1;
                } else {
                    context.consecutive_stalls = 0;
                }
                context.consecutive_stalls >= config.stall_consecutive_limit
            })
            .unwrap_or(false);

        if stalled_out {
            self.warn(
                WarningCode::StallDetectedEarlyExtract,
                format!(
                    "call {call_id} stalled {} times in a row; forcing extract",
                    config.stall_consecutive_limit
                ),
                Some(call_id.clone()),
                None,
            );
            return Err(EngineError::budget(
                BudgetResource::Iterations,
                call_id.clone(),
                self.runtime.budget.iterations_remaining(),
            ));
        }

        self.runtime
            .queue
            .enqueue_or_warn(Command::GenerateStep {
                call_id: call_id.clone(),
            })
            .await;
        Ok(())
    }

    /// One model invocation through the concurrency permit, with the
    /// single text-only retry on structured toolkit failure.
    pub(super) async fn call_model(
        &self,
        call_id: &CallId,
        request: ModelRequest,
        allow_degraded_retry: bool,
    ) -> Result<ModelResponse, EngineError> {
        let _permit = self
            .runtime
            .llm_permits
            .acquire()
            .await
            .map_err(|_| EngineError::unknown("llm permit closed"))?;

        match self.runtime.model.generate(request.clone()).await {
            Ok(response) => Ok(response),
            Err(ModelError::Toolkit { message }) if allow_degraded_retry => {
                self.warn(
                    WarningCode::ToolkitDegraded,
                    format!("call {call_id}: tool-enabled generation failed ({message}); retrying text-only"),
                    Some(call_id.clone()),
                    None,
                );
                if !self.runtime.budget.try_consume_llm_call() {
                    return Err(EngineError::budget(BudgetResource::LlmCalls, call_id.clone(), 0));
                }
                let mut degraded = request;
                degraded.toolkit = Vec::new();
                degraded.tool_choice = ToolChoice::None;
                self.runtime
                    .model
                    .generate(degraded)
                    .await
                    .map_err(|err| EngineError::unknown_with_cause("text-only retry failed", err))
            }
            Err(err) => Err(EngineError::unknown_with_cause("model call failed", err)),
        }
    }

    /// Iteration budget is gone: one last forced-SUBMIT model call over the
    /// transcript, or the call fails with `NoFinalAnswer`.
    async fn extract_fallback(&self, call_id: &CallId) {
        let max_iterations = self.runtime.config.max_iterations;
        let fail = |error: EngineError| Command::FailCall {
            call_id: call_id.clone(),
            error,
        };
        let no_answer = EngineError::NoFinalAnswer {
            call_id: call_id.clone(),
            max_iterations,
        };

        // The extract call consumes its own LLM-call slot.
        if !self.runtime.budget.try_consume_llm_call() {
            self.runtime.queue.enqueue_or_warn(fail(no_answer)).await;
            return;
        }

        let Some((request, structured)) = self.with_call(call_id, |context| {
            (
                self.runtime.prompts.extract_request(context),
                context.is_structured(),
            )
        }) else {
            self.warn_stale(call_id, "GenerateStep");
            return;
        };
        let depth = request.depth;

        debug!(call_id = %call_id, "running extract fallback");
        let response = match self.call_model(call_id, request, false).await {
            Ok(response) => response,
            Err(error) => {
                debug!(call_id = %call_id, %error, "extract model call failed");
                self.runtime.queue.enqueue_or_warn(fail(no_answer)).await;
                return;
            }
        };

        if let Some(used) = response.usage.as_ref().and_then(|usage| usage.billable()) {
            self.runtime.budget.record_tokens(used);
        }
        self.publish(Event::ModelResponse {
            completion_id: self.runtime.completion_id.clone(),
            call_id: call_id.clone(),
            depth,
            text: response.text.clone(),
            usage: response.usage.clone(),
        });

        match extract_submit(&response) {
            SubmitOutcome::Found(payload) if payload.compatible_with_mode(structured).is_ok() => {
                self.runtime
                    .queue
                    .enqueue_or_warn(Command::Finalize {
                        call_id: call_id.clone(),
                        payload,
                    })
                    .await;
            }
            _ => {
                self.runtime.queue.enqueue_or_warn(fail(no_answer)).await;
            }
        }
    }
}
