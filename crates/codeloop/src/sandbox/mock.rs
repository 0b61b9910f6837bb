//! Scriptable in-process sandbox for tests.
//!
//! Mirrors the worker's observable behavior without a subprocess: executions
//! are recorded, outputs are scripted, and a scripted step may route through
//! the bridge handler exactly the way worker code awaiting `llm_query`
//! would.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Sandbox, SandboxEnv, SandboxFactory};
use crate::bridge::BridgeHandler;
use crate::error::SandboxError;
use crate::ids::CallId;

/// What the next `execute` call should do.
#[derive(Clone)]
pub enum ScriptedExec {
    /// Succeed with this output.
    Output(String),
    /// Fail with this sandbox error.
    Fail(SandboxError),
    /// Behave like code that awaits a bridge call: dispatch through the
    /// handler and use the result as output. A failed bridge call surfaces
    /// as an uncaught exception, i.e. an execution error.
    Bridge {
        method: String,
        args: Vec<serde_json::Value>,
    },
    /// Behave like code that assigns into `__vars` before printing.
    SetVarThen {
        name: String,
        value: serde_json::Value,
        output: String,
    },
}

pub struct MockSandbox {
    call_id: CallId,
    bridge: Arc<dyn BridgeHandler>,
    executions: Mutex<Vec<String>>,
    script: Mutex<VecDeque<ScriptedExec>>,
    vars: Mutex<BTreeMap<String, serde_json::Value>>,
    shutdowns: Mutex<u32>,
}

impl MockSandbox {
    pub fn new(call_id: CallId, bridge: Arc<dyn BridgeHandler>, script: Vec<ScriptedExec>) -> Self {
        Self {
            call_id,
            bridge,
            executions: Mutex::new(Vec::new()),
            script: Mutex::new(script.into_iter().collect()),
            vars: Mutex::new(BTreeMap::new()),
            shutdowns: Mutex::new(0),
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.executions.lock().expect("executions lock poisoned").clone()
    }

    pub fn execution_count(&self) -> usize {
        self.executions.lock().expect("executions lock poisoned").len()
    }

    pub fn shutdown_count(&self) -> u32 {
        *self.shutdowns.lock().expect("shutdowns lock poisoned")
    }

    pub fn set_var_for_test(&self, name: &str, value: serde_json::Value) {
        self.vars
            .lock()
            .expect("vars lock poisoned")
            .insert(name.to_string(), value);
    }
}

fn preview(value: &serde_json::Value) -> String {
    let mut text = value.to_string();
    if text.len() > 120 {
        text.truncate(117);
        text.push_str("...");
    }
    text
}

#[async_trait]
impl Sandbox for MockSandbox {
    async fn execute(&self, code: &str) -> Result<String, SandboxError> {
        self.executions
            .lock()
            .expect("executions lock poisoned")
            .push(code.to_string());
        let step = self
            .script
            .lock()
            .expect("script lock poisoned")
            .pop_front()
            .unwrap_or(ScriptedExec::Output(String::new()));
        match step {
            ScriptedExec::Output(output) => Ok(output),
            ScriptedExec::Fail(err) => Err(err),
            ScriptedExec::Bridge { method, args } => {
                match self.bridge.handle(&self.call_id, &method, args).await {
                    Ok(value) => Ok(match value {
                        serde_json::Value::String(text) => text,
                        other => other.to_string(),
                    }),
                    Err(message) => Err(SandboxError::Exec {
                        message,
                        stack: None,
                    }),
                }
            }
            ScriptedExec::SetVarThen { name, value, output } => {
                self.vars.lock().expect("vars lock poisoned").insert(name, value);
                Ok(output)
            }
        }
    }

    async fn set_variable(&self, name: &str, value: &serde_json::Value) -> Result<(), SandboxError> {
        self.vars
            .lock()
            .expect("vars lock poisoned")
            .insert(name.to_string(), value.clone());
        Ok(())
    }

    async fn get_variable(&self, name: &str) -> Result<serde_json::Value, SandboxError> {
        Ok(self
            .vars
            .lock()
            .expect("vars lock poisoned")
            .get(name)
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    }

    async fn list_variables(&self) -> Result<BTreeMap<String, String>, SandboxError> {
        Ok(self
            .vars
            .lock()
            .expect("vars lock poisoned")
            .iter()
            .map(|(name, value)| (name.clone(), preview(value)))
            .collect())
    }

    async fn shutdown(&self) {
        *self.shutdowns.lock().expect("shutdowns lock poisoned") += 1;
    }
}

/// Hands out [`MockSandbox`]es and keeps them reachable for assertions.
#[derive(Default)]
pub struct MockSandboxFactory {
    scripts: Mutex<VecDeque<Vec<ScriptedExec>>>,
    created: Mutex<Vec<Arc<MockSandbox>>>,
    fail_creation: Mutex<bool>,
}

impl MockSandboxFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the exec script for the next created sandbox.
    pub fn push_script(&self, script: Vec<ScriptedExec>) {
        self.scripts
            .lock()
            .expect("scripts lock poisoned")
            .push_back(script);
    }

    /// Make the next `create` fail (sandbox creation failure path).
    pub fn fail_next_creation(&self) {
        *self.fail_creation.lock().expect("fail lock poisoned") = true;
    }

    pub fn created(&self) -> Vec<Arc<MockSandbox>> {
        self.created.lock().expect("created lock poisoned").clone()
    }

    pub fn total_executions(&self) -> usize {
        self.created().iter().map(|sandbox| sandbox.execution_count()).sum()
    }
}

#[async_trait]
impl SandboxFactory for MockSandboxFactory {
    async fn create(&self, env: SandboxEnv) -> Result<Arc<dyn Sandbox>, SandboxError> {
        if std::mem::take(&mut *self.fail_creation.lock().expect("fail lock poisoned")) {
            return Err(SandboxError::Spawn("scripted creation failure".to_string()));
        }
        let script = self
            .scripts
            .lock()
            .expect("scripts lock poisoned")
            .pop_front()
            .unwrap_or_default();
        let sandbox = Arc::new(MockSandbox::new(env.call_id.clone(), env.bridge.clone(), script));
        self.created
            .lock()
            .expect("created lock poisoned")
            .push(sandbox.clone());
        Ok(sandbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeOutcome;

    struct StaticBridge;

    #[async_trait]
    impl BridgeHandler for StaticBridge {
        async fn handle(&self, _caller: &CallId, method: &str, _args: Vec<serde_json::Value>) -> BridgeOutcome {
            match method {
                "llm_query" => Ok(serde_json::json!("bridged answer")),
                other => Err(format!("unknown method {other}")),
            }
        }
    }

    #[tokio::test]
    async fn scripted_outputs_play_in_order() {
        let sandbox = MockSandbox::new(
            CallId::from("m"),
            Arc::new(StaticBridge),
            vec![
                ScriptedExec::Output("first".into()),
                ScriptedExec::Fail(SandboxError::Disconnected),
            ],
        );
        assert_eq!(sandbox.execute("a()").await.unwrap(), "first");
        assert!(sandbox.execute("b()").await.is_err());
        assert_eq!(sandbox.executed(), vec!["a()".to_string(), "b()".to_string()]);
    }

    #[tokio::test]
    async fn bridge_step_routes_through_handler() {
        let sandbox = MockSandbox::new(
            CallId::from("m"),
            Arc::new(StaticBridge),
            vec![ScriptedExec::Bridge {
                method: "llm_query".into(),
                args: vec![serde_json::json!("q")],
            }],
        );
        assert_eq!(sandbox.execute("await llm_query('q')").await.unwrap(), "bridged answer");
    }

    #[tokio::test]
    async fn variables_round_trip_with_previews() {
        let sandbox = MockSandbox::new(CallId::from("m"), Arc::new(StaticBridge), vec![]);
        sandbox
            .set_variable("answer", &serde_json::json!({"n": 4}))
            .await
            .unwrap();
        assert_eq!(sandbox.get_variable("answer").await.unwrap(), serde_json::json!({"n": 4}));
        let vars = sandbox.list_variables().await.unwrap();
        assert_eq!(vars.get("answer").unwrap(), "{\"n\":4}");
        assert_eq!(sandbox.get_variable("missing").await.unwrap(), serde_json::Value::Null);
    }
}
