//! Sandbox instances owned by calls.
//!
//! The scheduler talks to sandboxes only through the [`Sandbox`] trait so
//! the whole engine can run against [`mock::MockSandbox`] in tests;
//! production uses [`process::ProcessSandbox`], one worker subprocess per
//! call.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bridge::BridgeHandler;
use crate::config::Config;
use crate::error::SandboxError;
use crate::events::EventBus;
use crate::ids::{CallId, CompletionId};
use crate::tools::ToolSpec;

pub mod mock;
pub mod process;

/// Everything a factory needs to wire a sandbox to its owning call.
#[derive(Clone)]
pub struct SandboxEnv {
    pub completion_id: CompletionId,
    pub call_id: CallId,
    pub depth: u32,
    pub bridge: Arc<dyn BridgeHandler>,
    pub tools: Vec<ToolSpec>,
    pub events: EventBus,
    pub config: Arc<Config>,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run one snippet; the output is what `print` accumulated. User-code
    /// failures come back as [`SandboxError::Exec`], infrastructure
    /// failures as other variants.
    async fn execute(&self, code: &str) -> Result<String, SandboxError>;

    async fn set_variable(&self, name: &str, value: &serde_json::Value) -> Result<(), SandboxError>;

    async fn get_variable(&self, name: &str) -> Result<serde_json::Value, SandboxError>;

    /// Names mapped to short previews, in stable order.
    async fn list_variables(&self) -> Result<BTreeMap<String, String>, SandboxError>;

    /// Begin graceful teardown. Idempotent; never fails.
    async fn shutdown(&self);
}

#[async_trait]
pub trait SandboxFactory: Send + Sync {
    async fn create(&self, env: SandboxEnv) -> Result<Arc<dyn Sandbox>, SandboxError>;
}
