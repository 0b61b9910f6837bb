//! SUBMIT finalization protocol.
//!
//! The model finalizes a call by emitting a tool call named `SUBMIT` whose
//! parameters carry exactly one of `answer`, `value`, or `variable`.
//! Extraction is a pure function of the response so it can be retried and
//! tested in isolation.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::ModelResponse;

/// Reserved finalization tool name.
pub const SUBMIT_TOOL_NAME: &str = "SUBMIT";

/// The final result of a completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Answer {
    /// Plain mode.
    Text(String),
    /// Structured mode; already validated against the output schema.
    Structured(serde_json::Value),
}

impl Answer {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Answer::Text(text) => Some(text),
            Answer::Structured(_) => None,
        }
    }
}

/// What the model asked to finalize with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubmitPayload {
    Answer(String),
    Value(serde_json::Value),
    /// Resolved against the sandbox's `__vars` at finalize time.
    Variable(String),
}

impl SubmitPayload {
    /// `answer` belongs to plain mode, `value` to structured mode;
    /// `variable` is legal in both.
    pub fn compatible_with_mode(&self, structured: bool) -> Result<(), String> {
        match self {
            SubmitPayload::Answer(_) if structured => {
                Err("SUBMIT used `answer` but this run expects a structured `value`".to_string())
            }
            SubmitPayload::Value(_) if !structured => {
                Err("SUBMIT used `value` but this run expects a plain `answer`".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Outcome of scanning one model response for a SUBMIT call.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Found(SubmitPayload),
    Missing,
    Invalid(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubmitParams {
    answer: Option<String>,
    value: Option<serde_json::Value>,
    variable: Option<String>,
}

/// Extract the SUBMIT call from a response.
pub fn extract_submit(response: &ModelResponse) -> SubmitOutcome {
    let mut submits = response
        .tool_calls
        .iter()
        .filter(|call| call.name == SUBMIT_TOOL_NAME);

    let Some(submit) = submits.next() else {
        return SubmitOutcome::Missing;
    };
    if submits.next().is_some() {
        return SubmitOutcome::Invalid("multiple SUBMIT calls in one response".to_string());
    }

    let params: SubmitParams = match serde_json::from_value(submit.arguments.clone()) {
        Ok(params) => params,
        Err(err) => {
            return SubmitOutcome::Invalid(format!(
                "SUBMIT parameters must be an object with exactly one of `answer`, `value`, `variable`: {err}"
            ));
        }
    };

    match (params.answer, params.value, params.variable) {
        (Some(answer), None, None) => SubmitOutcome::Found(SubmitPayload::Answer(answer)),
        (None, Some(value), None) => SubmitOutcome::Found(SubmitPayload::Value(value)),
        (None, None, Some(variable)) => {
            if variable.trim().is_empty() {
                SubmitOutcome::Invalid("SUBMIT `variable` must be a non-empty name".to_string())
            } else {
                SubmitOutcome::Found(SubmitPayload::Variable(variable))
            }
        }
        (None, None, None) => {
            SubmitOutcome::Invalid("SUBMIT carried none of `answer`, `value`, `variable`".to_string())
        }
        _ => SubmitOutcome::Invalid(
            "SUBMIT must carry exactly one of `answer`, `value`, `variable`".to_string(),
        ),
    }
}

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[a-zA-Z0-9_+-]*[ \t]*\r?\n(.*?)```").expect("static fence pattern compiles")
});

/// First fenced code block in a response body, if any.
pub fn extract_code_block(text: &str) -> Option<String> {
    CODE_FENCE
        .captures(text)
        .map(|caps| caps[1].trim_end_matches(['\r', '\n']).to_string())
        .filter(|code| !code.trim().is_empty())
}
