//! The language-model collaborator.
//!
//! The engine drives any implementation of [`LanguageModel`]; the HTTP
//! client behind it is outside the core. Tests use the scripted model in
//! [`crate::mock_model`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: MessageRole,
    pub content: String,
}

/// Token accounting reported by a model response, when available.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub reasoning_tokens: Option<u64>,
    pub cached_input_tokens: Option<u64>,
}

impl TokenUsage {
    /// The figure charged against the token budget.
    pub fn billable(&self) -> Option<u64> {
        self.total_tokens
            .or_else(|| match (self.input_tokens, self.output_tokens) {
                (Some(i), Some(o)) => Some(i + o),
                (Some(n), None) | (None, Some(n)) => Some(n),
                (None, None) => None,
            })
    }
}

/// A structured tool invocation in a model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    pub usage: Option<TokenUsage>,
    pub tool_calls: Vec<ToolCall>,
}

/// A tool surface offered to the model for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolkitEntry {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum ToolChoice {
    /// The model decides whether to call a tool.
    #[default]
    Auto,
    /// Tool-call resolution disabled; text only.
    None,
    /// The model must call the named tool.
    Required(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub messages: Vec<PromptMessage>,
    pub depth: u32,
    pub is_sub_call: bool,
    pub toolkit: Vec<ToolkitEntry>,
    pub tool_choice: ToolChoice,
    /// Named-model override requested through bridge options.
    pub model_override: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    /// Structured failure of tool-enabled generation; the scheduler retries
    /// once in text-only mode.
    #[error("toolkit generation failed: {message}")]
    Toolkit { message: String },
    #[error("model transport failed: {message}")]
    Transport { message: String },
    #[error("scripted model has no response for request {index}")]
    ScriptExhausted { index: usize },
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billable_prefers_total() {
        let usage = TokenUsage {
            input_tokens: Some(10),
            output_tokens: Some(5),
            total_tokens: Some(100),
            ..TokenUsage::default()
        };
        assert_eq!(usage.billable(), Some(100));
    }

    #[test]
    fn billable_sums_partials() {
        let usage = TokenUsage {
            input_tokens: Some(10),
            output_tokens: Some(5),
            ..TokenUsage::default()
        };
        assert_eq!(usage.billable(), Some(15));
        assert_eq!(TokenUsage::default().billable(), None);
    }
}
