//! User-defined tool descriptors.
//!
//! Tools surface in two places: as toolkit entries offered to the model and
//! as async bindings inside the sandbox. Handlers run on forked tasks under
//! the owning call's scope, with a per-tool timeout and a retry policy.

use std::fmt;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

use crate::submit::SUBMIT_TOOL_NAME;

/// Names the sandbox injects itself; user tools may not shadow them.
pub const RESERVED_BINDINGS: &[&str] = &["print", "__vars", "llm_query", "llm_query_batched"];

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static identifier pattern compiles"));

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolSpecError {
    #[error("tool name `{0}` is not a valid identifier")]
    InvalidName(String),
    #[error("tool name `{0}` clashes with a reserved binding")]
    ReservedName(String),
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, args: Vec<serde_json::Value>) -> eyre::Result<serde_json::Value>;
}

#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameter_names: Vec<String>,
    pub parameters_schema: serde_json::Value,
    pub returns_schema: serde_json::Value,
    pub timeout: Duration,
    pub usage_examples: Vec<String>,
    pub handler: Arc<dyn ToolHandler>,
}

impl fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("parameter_names", &self.parameter_names)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ToolSpec {
    /// A minimal spec with permissive schemas; callers fill in the rest.
    pub fn new(name: impl Into<String>, description: impl Into<String>, handler: Arc<dyn ToolHandler>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameter_names: Vec::new(),
            parameters_schema: serde_json::json!({"type": "object"}),
            returns_schema: serde_json::json!({}),
            timeout: Duration::from_secs(30),
            usage_examples: Vec::new(),
            handler,
        }
    }

    /// Validate the name against identifier rules and reserved bindings.
    pub fn validate(&self) -> Result<(), ToolSpecError> {
        if !IDENTIFIER.is_match(&self.name) {
            return Err(ToolSpecError::InvalidName(self.name.clone()));
        }
        if RESERVED_BINDINGS.contains(&self.name.as_str()) || self.name == SUBMIT_TOOL_NAME {
            return Err(ToolSpecError::ReservedName(self.name.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        async fn handle(&self, args: Vec<serde_json::Value>) -> eyre::Result<serde_json::Value> {
            Ok(serde_json::Value::Array(args))
        }
    }

    fn spec(name: &str) -> ToolSpec {
        ToolSpec::new(name, "echoes args", Arc::new(EchoTool))
    }

    #[test]
    fn valid_identifier_passes() {
        assert!(spec("lookup_user").validate().is_ok());
        assert!(spec("_private").validate().is_ok());
    }

    #[test]
    fn invalid_identifiers_rejected() {
        assert_eq!(
            spec("bad-name").validate(),
            Err(ToolSpecError::InvalidName("bad-name".into()))
        );
        assert!(spec("1st").validate().is_err());
        assert!(spec("").validate().is_err());
    }

    #[test]
    fn reserved_bindings_rejected() {
        for reserved in RESERVED_BINDINGS {
            assert_eq!(
                spec(reserved).validate(),
                Err(ToolSpecError::ReservedName((*reserved).to_string()))
            );
        }
        assert!(spec(SUBMIT_TOOL_NAME).validate().is_err());
    }

    #[tokio::test]
    async fn handler_round_trips_args() {
        let tool = spec("echo");
        let result = tool
            .handler
            .handle(vec![serde_json::json!(1), serde_json::json!("two")])
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!([1, "two"]));
    }
}
