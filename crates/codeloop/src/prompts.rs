//! Prompt assembly.
//!
//! The template text is replaceable collaborator data; the assembly rules
//! (transcript rendering, SUBMIT offering, forced extract) are part of the
//! engine and are what the tests pin down.

use serde_json::json;

use crate::call::CallContext;
use crate::model::{MessageRole, ModelRequest, PromptMessage, ToolChoice, ToolkitEntry};
use crate::submit::SUBMIT_TOOL_NAME;
use crate::tools::ToolSpec;

/// Contexts shorter than this are trivial enough to offer SUBMIT from the
/// first iteration.
const TRIVIAL_CONTEXT_CHARS: usize = 200;

/// Iterations before SUBMIT is offered on non-trivial contexts.
const SUBMIT_AFTER_ITERATION: u32 = 3;

/// Marker prefixed to execution output in the rendered transcript.
pub const EXECUTION_OUTPUT_MARKER: &str = "[Execution Output]";

/// Replaceable prompt text.
#[derive(Debug, Clone)]
pub struct PromptSet {
    pub system_template: String,
    pub repl_instructions: String,
    pub extract_instructions: String,
    pub one_shot_system: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            system_template: "You are a careful assistant that solves tasks by writing small \
                              JavaScript snippets and observing their output."
                .to_string(),
            repl_instructions: "Respond with either one fenced code block to execute, or a SUBMIT \
                                tool call to finalize. Code runs in a persistent sandbox: `print(...)` \
                                captures output, `__vars` persists values across snippets, and \
                                `await llm_query(query, context)` delegates a sub-question."
                .to_string(),
            extract_instructions: "The iteration budget is spent. Read the transcript and finalize \
                                   now by calling SUBMIT with your best answer. Do not write code."
                .to_string(),
            one_shot_system: "Answer the question directly and concisely from the provided context."
                .to_string(),
        }
    }
}

impl PromptSet {
    /// Whether this step's toolkit should include SUBMIT.
    pub fn submit_offered(&self, context: &CallContext) -> bool {
        context.context.len() < TRIVIAL_CONTEXT_CHARS
            || (context.code_executed_at_least_once && context.iteration >= SUBMIT_AFTER_ITERATION)
    }

    /// The toolkit entry for the finalization tool.
    pub fn submit_tool(&self) -> ToolkitEntry {
        ToolkitEntry {
            name: SUBMIT_TOOL_NAME.to_string(),
            description: "Finalize this task with exactly one of: `answer` (plain text), `value` \
                          (structured result), or `variable` (name of a sandbox variable holding \
                          the result)."
                .to_string(),
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "answer": {"type": "string"},
                    "value": {},
                    "variable": {"type": "string"},
                },
                "additionalProperties": false,
            }),
        }
    }

    fn tool_entries(&self, tools: &[ToolSpec]) -> Vec<ToolkitEntry> {
        tools
            .iter()
            .map(|tool| ToolkitEntry {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters_schema: tool.parameters_schema.clone(),
            })
            .collect()
    }

    fn render_task_message(&self, context: &CallContext) -> String {
        let mut message = format!("[Task]\n{}\n\n[Context]\n{}", context.query, context.context);
        if !context.variable_snapshot.is_empty() {
            message.push_str("\n\n[Sandbox Variables]");
            for (name, preview) in &context.variable_snapshot {
                message.push_str(&format!("\n{name} = {preview}"));
            }
        }
        message
    }

    fn render_transcript(&self, context: &CallContext, messages: &mut Vec<PromptMessage>) {
        for entry in &context.transcript {
            messages.push(PromptMessage {
                role: MessageRole::Assistant,
                content: entry.assistant_response.clone(),
            });
            if let Some(output) = &entry.execution_output {
                messages.push(PromptMessage {
                    role: MessageRole::User,
                    content: format!("{EXECUTION_OUTPUT_MARKER}\n{output}"),
                });
            }
        }
    }

    /// The regular REPL step request.
    pub fn step_request(&self, context: &CallContext) -> ModelRequest {
        let mut messages = vec![PromptMessage {
            role: MessageRole::User,
            content: self.render_task_message(context),
        }];
        self.render_transcript(context, &mut messages);

        let mut toolkit = self.tool_entries(&context.tools);
        if self.submit_offered(context) {
            toolkit.push(self.submit_tool());
        }

        ModelRequest {
            system_prompt: format!("{}\n\n{}", self.system_template, self.repl_instructions),
            messages,
            depth: context.depth,
            is_sub_call: context.is_sub_call(),
            toolkit,
            tool_choice: ToolChoice::Auto,
            model_override: None,
        }
    }

    /// The last-chance extract request: SUBMIT only, forced.
    pub fn extract_request(&self, context: &CallContext) -> ModelRequest {
        let mut messages = vec![PromptMessage {
            role: MessageRole::User,
            content: self.render_task_message(context),
        }];
        self.render_transcript(context, &mut messages);
        messages.push(PromptMessage {
            role: MessageRole::User,
            content: self.extract_instructions.clone(),
        });

        ModelRequest {
            system_prompt: self.system_template.clone(),
            messages,
            depth: context.depth,
            is_sub_call: context.is_sub_call(),
            toolkit: vec![self.submit_tool()],
            tool_choice: ToolChoice::Required(SUBMIT_TOOL_NAME.to_string()),
            model_override: None,
        }
    }

    /// A one-shot sub-call request (depth limit reached or named model
    /// override): no sandbox, no tools, plain text back.
    pub fn one_shot_request(
        &self,
        query: &str,
        context: &str,
        depth: u32,
        model_override: Option<String>,
    ) -> ModelRequest {
        ModelRequest {
            system_prompt: self.one_shot_system.clone(),
            messages: vec![PromptMessage {
                role: MessageRole::User,
                content: format!("[Task]\n{query}\n\n[Context]\n{context}"),
            }],
            depth,
            is_sub_call: true,
            toolkit: Vec::new(),
            tool_choice: ToolChoice::None,
            model_override,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::bridge::{BridgeHandler, BridgeOutcome};
    use crate::call::CallScope;
    use crate::ids::CallId;
    use crate::sandbox::mock::MockSandbox;

    struct NullBridge;

    #[async_trait]
    impl BridgeHandler for NullBridge {
        async fn handle(&self, _caller: &CallId, _method: &str, _args: Vec<serde_json::Value>) -> BridgeOutcome {
            Err("none".to_string())
        }
    }

    fn context_with(context_text: &str) -> CallContext {
        let sandbox = Arc::new(MockSandbox::new(CallId::from("c"), Arc::new(NullBridge), vec![]));
        CallContext::new(
            CallId::from("c"),
            0,
            "2+2".into(),
            context_text.into(),
            CallScope::new(sandbox),
            None,
            vec![],
            None,
        )
    }

    #[test]
    fn submit_offered_for_trivial_context() {
        let prompts = PromptSet::default();
        let context = context_with("2+2=4");
        assert!(prompts.submit_offered(&context));
        let request = prompts.step_request(&context);
        assert!(request.toolkit.iter().any(|tool| tool.name == SUBMIT_TOOL_NAME));
    }

    #[test]
    fn submit_withheld_until_exploration_on_large_context() {
        let prompts = PromptSet::default();
        let mut context = context_with(&"x".repeat(500));
        assert!(!prompts.submit_offered(&context));

        context.code_executed_at_least_once = true;
        context.iteration = 2;
        assert!(!prompts.submit_offered(&context));

        context.iteration = 3;
        assert!(prompts.submit_offered(&context));
    }

    #[test]
    fn submit_requires_execution_on_large_context() {
        let prompts = PromptSet::default();
        let mut context = context_with(&"x".repeat(500));
        context.iteration = 5;
        context.code_executed_at_least_once = false;
        assert!(!prompts.submit_offered(&context));
    }

    #[test]
    fn transcript_renders_execution_output_marker() {
        let prompts = PromptSet::default();
        let mut context = context_with("2+2=4");
        context.push_response("```js\nprint(4)\n```".into());
        context.attach_execution_output("4", 1000);
        let request = prompts.step_request(&context);
        let rendered: Vec<_> = request.messages.iter().map(|m| m.content.as_str()).collect();
        assert!(rendered.iter().any(|m| m.contains(EXECUTION_OUTPUT_MARKER) && m.contains('4')));
    }

    #[test]
    fn variable_snapshot_is_rendered_in_order() {
        let prompts = PromptSet::default();
        let mut context = context_with("2+2=4");
        context.variable_snapshot.insert("b".into(), "2".into());
        context.variable_snapshot.insert("a".into(), "1".into());
        let request = prompts.step_request(&context);
        let task = &request.messages[0].content;
        let a_pos = task.find("a = 1").unwrap();
        let b_pos = task.find("b = 2").unwrap();
        assert!(a_pos < b_pos);
    }

    #[test]
    fn extract_request_forces_submit() {
        let prompts = PromptSet::default();
        let context = context_with("2+2=4");
        let request = prompts.extract_request(&context);
        assert_eq!(request.tool_choice, ToolChoice::Required(SUBMIT_TOOL_NAME.to_string()));
        assert_eq!(request.toolkit.len(), 1);
        assert!(
            request
                .messages
                .last()
                .unwrap()
                .content
                .contains("finalize now")
                || request.messages.last().unwrap().content.contains("SUBMIT")
        );
    }

    #[test]
    fn one_shot_request_disables_tools() {
        let prompts = PromptSet::default();
        let request = prompts.one_shot_request("sub-q", "sub-ctx", 2, Some("fast-model".into()));
        assert_eq!(request.tool_choice, ToolChoice::None);
        assert!(request.toolkit.is_empty());
        assert!(request.is_sub_call);
        assert_eq!(request.model_override.as_deref(), Some("fast-model"));
    }
}
