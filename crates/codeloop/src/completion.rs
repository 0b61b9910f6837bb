//! Public completion API.
//!
//! `complete` runs one completion to its final answer; `stream` hands back
//! a lazily-consumed event receiver that ends with the root call's terminal
//! event.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::commands::Command;
use crate::config::Config;
use crate::error::EngineError;
use crate::events::Event;
use crate::model::LanguageModel;
use crate::prompts::PromptSet;
use crate::runtime::{CompletionResult, CompletionRuntime};
use crate::sandbox::SandboxFactory;
use crate::sandbox::process::ProcessSandboxFactory;
use crate::scheduler::run_scheduler;
use crate::tools::ToolSpec;

#[derive(Clone, Debug)]
pub struct CompleteOptions {
    pub query: String,
    pub context: String,
    pub depth: u32,
    pub tools: Vec<ToolSpec>,
    pub output_schema: Option<serde_json::Value>,
}

impl CompleteOptions {
    pub fn new(query: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            context: context.into(),
            depth: 0,
            tools: Vec::new(),
            output_schema: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    /// Switch the run to structured output mode.
    pub fn with_output_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }
}

pub struct Engine {
    config: Arc<Config>,
    model: Arc<dyn LanguageModel>,
    sandbox_factory: Arc<dyn SandboxFactory>,
    prompts: Arc<PromptSet>,
}

impl Engine {
    /// An engine backed by worker subprocesses (`config.worker_path`).
    pub fn new(config: Config, model: Arc<dyn LanguageModel>) -> Self {
        Self {
            config: Arc::new(config),
            model,
            sandbox_factory: Arc::new(ProcessSandboxFactory),
            prompts: Arc::new(PromptSet::default()),
        }
    }

    pub fn with_sandbox_factory(mut self, sandbox_factory: Arc<dyn SandboxFactory>) -> Self {
        self.sandbox_factory = sandbox_factory;
        self
    }

    pub fn with_prompts(mut self, prompts: PromptSet) -> Self {
        self.prompts = Arc::new(prompts);
        self
    }

    fn validate_options(options: &CompleteOptions) -> Result<(), EngineError> {
        for tool in &options.tools {
            tool.validate()
                .map_err(|err| EngineError::unknown(err.to_string()))?;
        }
        Ok(())
    }

    fn root_command(runtime: &CompletionRuntime, options: CompleteOptions) -> Command {
        Command::StartCall {
            call_id: runtime.root_call_id.clone(),
            depth: options.depth,
            query: options.query,
            context: options.context,
            parent_bridge_request_id: None,
            tools: options.tools,
            output_schema: options.output_schema,
        }
    }

    /// Run one completion and wait for its answer.
    pub async fn complete(&self, options: CompleteOptions) -> CompletionResult {
        Self::validate_options(&options)?;
        let (runtime, receiver, result_rx) = CompletionRuntime::new(
            self.config.clone(),
            self.model.clone(),
            self.sandbox_factory.clone(),
            self.prompts.clone(),
        );
        runtime
            .queue
            .enqueue(Self::root_command(&runtime, options))
            .await
            .map_err(|_| EngineError::unknown("fresh command queue rejected the root call"))?;

        let scheduler = tokio::spawn(run_scheduler(runtime.clone(), receiver));
        let result = result_rx
            .await
            .unwrap_or_else(|_| Err(EngineError::unknown("scheduler ended without a result")));
        // Let the cleanup sweep finish before handing the result back.
        let _ = scheduler.await;
        result
    }

    /// Run one completion, streaming its events. The channel yields every
    /// event up to and including the root call's terminal event; the final
    /// answer rides on `CallFinalized`.
    pub async fn stream(&self, options: CompleteOptions) -> Result<mpsc::Receiver<Event>, EngineError> {
        Self::validate_options(&options)?;
        let (runtime, receiver, _result_rx) = CompletionRuntime::new(
            self.config.clone(),
            self.model.clone(),
            self.sandbox_factory.clone(),
            self.prompts.clone(),
        );

        // Subscribe before the first command is processed so no event is
        // missed.
        let mut events_rx = runtime.events.subscribe();
        let root_call_id = runtime.root_call_id.clone();
        let (tx, rx) = mpsc::channel(self.config.event_buffer_capacity.max(1));

        runtime
            .queue
            .enqueue(Self::root_command(&runtime, options))
            .await
            .map_err(|_| EngineError::unknown("fresh command queue rejected the root call"))?;
        tokio::spawn(run_scheduler(runtime.clone(), receiver));

        tokio::spawn(async move {
            loop {
                match events_rx.recv().await {
                    Ok(event) => {
                        let terminal_root =
                            event.is_terminal() && event.call_id() == Some(&root_call_id);
                        if tx.send(event).await.is_err() {
                            break;
                        }
                        if terminal_root {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event stream lagged; events lost");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}
