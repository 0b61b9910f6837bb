//! Per-call state and the scoped resource that bounds a call's lifetime.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::ids::{BridgeRequestId, CallId};
use crate::sandbox::Sandbox;
use crate::tools::ToolSpec;

/// A scoped resource tied to one call. Closing it cancels every task forked
/// into the scope and tears the sandbox down; closing is idempotent.
pub struct CallScope {
    token: CancellationToken,
    sandbox: Arc<dyn Sandbox>,
    closed: AtomicBool,
}

impl CallScope {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Arc<Self> {
        Arc::new(Self {
            token: CancellationToken::new(),
            sandbox,
            closed: AtomicBool::new(false),
        })
    }

    pub fn sandbox(&self) -> Arc<dyn Sandbox> {
        self.sandbox.clone()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Fork work into the scope. The future is dropped the moment the scope
    /// closes.
    pub fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return;
        }
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = future => {}
            }
        });
    }

    /// Close the scope. Returns `true` for the call that actually closed it,
    /// `false` for every later call.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        // Teardown is detached: the closer must not wait on worker exit.
        let sandbox = self.sandbox.clone();
        tokio::spawn(async move {
            sandbox.shutdown().await;
        });
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// One REPL round: what the model said and what running its code printed.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub assistant_response: String,
    pub execution_output: Option<String>,
}

/// Mutable state for one call. Owned by the scheduler; forked tasks never
/// touch it.
pub struct CallContext {
    pub call_id: CallId,
    pub depth: u32,
    pub query: String,
    pub context: String,
    pub iteration: u32,
    pub transcript: Vec<TranscriptEntry>,
    pub scope: Arc<CallScope>,
    pub parent_bridge_request_id: Option<BridgeRequestId>,
    pub tools: Vec<ToolSpec>,
    pub output_schema: Option<serde_json::Value>,
    pub code_executed_at_least_once: bool,
    pub consecutive_stalls: u32,
    /// Cached `list_variables` snapshot, refreshed after each execution.
    pub variable_snapshot: BTreeMap<String, String>,
}

impl CallContext {
    pub fn new(
        call_id: CallId,
        depth: u32,
        query: String,
        context: String,
        scope: Arc<CallScope>,
        parent_bridge_request_id: Option<BridgeRequestId>,
        tools: Vec<ToolSpec>,
        output_schema: Option<serde_json::Value>,
    ) -> Self {
        Self {
            call_id,
            depth,
            query,
            context,
            iteration: 0,
            transcript: Vec::new(),
            scope,
            parent_bridge_request_id,
            tools,
            output_schema,
            code_executed_at_least_once: false,
            consecutive_stalls: 0,
            variable_snapshot: BTreeMap::new(),
        }
    }

    pub fn is_structured(&self) -> bool {
        self.output_schema.is_some()
    }

    pub fn is_sub_call(&self) -> bool {
        self.parent_bridge_request_id.is_some()
    }

    pub fn push_response(&mut self, assistant_response: String) {
        self.transcript.push(TranscriptEntry {
            assistant_response,
            execution_output: None,
        });
    }

    /// Attach execution output to the latest round, truncating visibly.
    pub fn attach_execution_output(&mut self, output: &str, max_chars: usize) {
        let truncated = truncate_output(output, max_chars);
        match self.transcript.last_mut() {
            Some(entry) => entry.execution_output = Some(truncated),
            None => self.transcript.push(TranscriptEntry {
                assistant_response: String::new(),
                execution_output: Some(truncated),
            }),
        }
    }

    pub fn find_tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|tool| tool.name == name)
    }
}

fn truncate_output(output: &str, max_chars: usize) -> String {
    if output.chars().count() <= max_chars {
        return output.to_string();
    }
    let kept: String = output.chars().take(max_chars).collect();
    format!("{kept}\n[Output truncated]")
}

/// The shared call-state map. The scheduler owns writes; observers may take
/// short read locks.
pub type CallStates = Arc<Mutex<std::collections::HashMap<CallId, CallContext>>>;
