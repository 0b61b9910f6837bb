//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use codeloop_protocol::{SandboxMode, effective_frame_limit};
use serde::{Deserialize, Serialize};

/// All recognized engine options. `Default` gives a configuration suitable
/// for interactive use; tests tighten the budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Config {
    /// Per-call iteration cap.
    pub max_iterations: u32,
    /// Maximum recursion depth for bridge-initiated sub-calls.
    pub max_depth: u32,
    /// Completion-wide cap on model invocations.
    pub max_llm_calls: u64,
    /// Completion-wide token budget; `None` is unlimited.
    pub max_total_tokens: Option<u64>,
    /// Completion-wide wall-clock budget.
    pub max_time_ms: Option<u64>,
    /// Capacity of the outgoing-model-call permit.
    pub concurrency: usize,
    pub command_queue_capacity: usize,
    pub event_buffer_capacity: usize,
    /// Execution output is truncated to this many characters before it is
    /// appended to the transcript.
    pub max_execution_output_chars: usize,
    /// A response with no code and no SUBMIT counts as a stall only when it
    /// is at most this many characters.
    pub stall_response_max_chars: usize,
    /// Consecutive stalls that trigger the extract fallback early.
    pub stall_consecutive_limit: u32,
    pub enable_llm_query_batched: bool,
    pub max_batch_queries: usize,
    pub bridge_retry_base_delay_ms: u64,
    pub bridge_tool_retry_count: u32,
    pub bridge_timeout_ms: u64,
    pub sandbox_mode: SandboxMode,
    pub execute_timeout_ms: u64,
    pub set_var_timeout_ms: u64,
    pub get_var_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub max_frame_bytes: usize,
    pub max_bridge_concurrency: usize,
    pub incoming_frame_queue_capacity: usize,
    /// Path to the sandbox worker binary.
    pub worker_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_depth: 2,
            max_llm_calls: 50,
            max_total_tokens: None,
            max_time_ms: None,
            concurrency: 4,
            command_queue_capacity: 64,
            event_buffer_capacity: 256,
            max_execution_output_chars: 20_000,
            stall_response_max_chars: 120,
            stall_consecutive_limit: 3,
            enable_llm_query_batched: true,
            max_batch_queries: 16,
            bridge_retry_base_delay_ms: 200,
            bridge_tool_retry_count: 2,
            bridge_timeout_ms: 300_000,
            sandbox_mode: SandboxMode::Permissive,
            execute_timeout_ms: 120_000,
            set_var_timeout_ms: 10_000,
            get_var_timeout_ms: 10_000,
            shutdown_grace_ms: 2_000,
            max_frame_bytes: 8 * 1024 * 1024,
            max_bridge_concurrency: 8,
            incoming_frame_queue_capacity: 256,
            worker_path: PathBuf::from("codeloop-worker"),
        }
    }
}

impl Config {
    /// The frame limit actually sent to workers, clamped to the hard cap.
    pub fn frame_limit(&self) -> usize {
        effective_frame_limit(self.max_frame_bytes)
    }

    pub fn execute_timeout(&self) -> Duration {
        Duration::from_millis(self.execute_timeout_ms)
    }

    pub fn set_var_timeout(&self) -> Duration {
        Duration::from_millis(self.set_var_timeout_ms)
    }

    pub fn get_var_timeout(&self) -> Duration {
        Duration::from_millis(self.get_var_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn bridge_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_timeout_ms)
    }

    pub fn max_time(&self) -> Option<Duration> {
        self.max_time_ms.map(Duration::from_millis)
    }
}
