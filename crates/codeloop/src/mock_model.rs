//! Scripted language model for tests.
//!
//! Plays a fixed list of responses in order and records every request it
//! receives, so tests can assert both what the engine asked and how often.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use crate::model::{LanguageModel, ModelError, ModelRequest, ModelResponse, TokenUsage, ToolCall};
use crate::submit::SUBMIT_TOOL_NAME;

#[derive(Default)]
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<ModelResponse, ModelError>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<ModelResponse>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(responses.into_iter().map(Ok).collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Script including failures, for degraded-toolkit and transport tests.
    pub fn with_results(results: Vec<Result<ModelResponse, ModelError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(results.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().expect("requests lock poisoned").clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().expect("requests lock poisoned").len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let index = {
            let mut requests = self.requests.lock().expect("requests lock poisoned");
            requests.push(request);
            requests.len() - 1
        };
        self.script
            .lock()
            .expect("script lock poisoned")
            .pop_front()
            .unwrap_or(Err(ModelError::ScriptExhausted { index }))
    }
}

/// A plain text response.
pub fn text_response(text: impl Into<String>) -> ModelResponse {
    ModelResponse {
        text: text.into(),
        ..ModelResponse::default()
    }
}

/// A response carrying a fenced code block.
pub fn code_response(code: impl Into<String>) -> ModelResponse {
    text_response(format!("```js\n{}\n```", code.into()))
}

/// A SUBMIT with a plain `answer`.
pub fn submit_answer(answer: impl Into<String>) -> ModelResponse {
    ModelResponse {
        tool_calls: vec![ToolCall {
            name: SUBMIT_TOOL_NAME.into(),
            arguments: json!({"answer": answer.into()}),
        }],
        ..ModelResponse::default()
    }
}

/// A SUBMIT with a structured `value`.
pub fn submit_value(value: serde_json::Value) -> ModelResponse {
    ModelResponse {
        tool_calls: vec![ToolCall {
            name: SUBMIT_TOOL_NAME.into(),
            arguments: json!({"value": value}),
        }],
        ..ModelResponse::default()
    }
}

/// A SUBMIT naming a sandbox variable.
pub fn submit_variable(name: impl Into<String>) -> ModelResponse {
    ModelResponse {
        tool_calls: vec![ToolCall {
            name: SUBMIT_TOOL_NAME.into(),
            arguments: json!({"variable": name.into()}),
        }],
        ..ModelResponse::default()
    }
}

/// Attach a total-token usage figure to a response.
pub fn with_usage(mut response: ModelResponse, total_tokens: u64) -> ModelResponse {
    response.usage = Some(TokenUsage {
        total_tokens: Some(total_tokens),
        ..TokenUsage::default()
    });
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ToolChoice;

    fn request() -> ModelRequest {
        ModelRequest {
            system_prompt: "s".into(),
            messages: vec![],
            depth: 0,
            is_sub_call: false,
            toolkit: vec![],
            tool_choice: ToolChoice::Auto,
            model_override: None,
        }
    }

    #[tokio::test]
    async fn plays_script_in_order_then_exhausts() {
        let model = ScriptedModel::new(vec![text_response("one"), submit_answer("two")]);
        assert_eq!(model.generate(request()).await.unwrap().text, "one");
        let second = model.generate(request()).await.unwrap();
        assert_eq!(second.tool_calls[0].name, SUBMIT_TOOL_NAME);
        assert!(matches!(
            model.generate(request()).await,
            Err(ModelError::ScriptExhausted { index: 2 })
        ));
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn records_requests_for_inspection() {
        let model = ScriptedModel::new(vec![text_response("ok")]);
        let mut req = request();
        req.depth = 3;
        model.generate(req).await.unwrap();
        assert_eq!(model.requests()[0].depth, 3);
    }

    #[test]
    fn helpers_build_expected_shapes() {
        assert!(code_response("print(4)").text.contains("```js"));
        let usage = with_usage(text_response("t"), 42);
        assert_eq!(usage.usage.unwrap().billable(), Some(42));
        let var = submit_variable("result");
        assert_eq!(var.tool_calls[0].arguments["variable"], "result");
    }
}
