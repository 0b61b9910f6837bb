//! codeloop: a recursive LLM orchestration engine.
//!
//! The engine drives a language model through a REPL-style loop: the model
//! proposes a code snippet, a sandboxed worker runs it, the output is
//! appended to the transcript, and the loop repeats until the model emits a
//! SUBMIT tool call or a budget runs out. Sandboxed code may itself call
//! `llm_query`, spawning nested completions under depth and budget
//! accounting.
//!
//! Entry points are [`Engine::complete`] and [`Engine::stream`]; everything
//! else is the machinery behind them: a single-consumer command scheduler,
//! per-call scopes owning worker subprocesses, and a bridge that turns
//! sandbox suspensions into scheduler commands.

pub mod bridge;
pub mod budget;
pub mod call;
pub mod commands;
pub mod completion;
pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod mock_model;
pub mod model;
pub mod prompts;
pub mod runtime;
pub mod sandbox;
pub mod scheduler;
pub mod schema;
pub mod submit;
pub mod tools;

pub use completion::{CompleteOptions, Engine};
pub use config::Config;
pub use error::{EngineError, SandboxError};
pub use events::{Event, EventBus, WarningCode};
pub use ids::{BridgeRequestId, CallId, CompletionId};
pub use model::{LanguageModel, ModelError, ModelRequest, ModelResponse, TokenUsage, ToolCall};
pub use prompts::PromptSet;
pub use runtime::{CompletionResult, CompletionRuntime};
pub use scheduler::run_scheduler;
pub use submit::{Answer, SubmitOutcome, SubmitPayload};
pub use tools::{ToolHandler, ToolSpec};
