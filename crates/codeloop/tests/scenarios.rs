//! End-to-end scheduler scenarios against the scripted model and the mock
//! sandbox factory.

use std::sync::Arc;

use codeloop::budget::BudgetResource;
use codeloop::commands::Command;
use codeloop::mock_model::{
    ScriptedModel, code_response, submit_answer, submit_value, submit_variable, text_response,
    with_usage,
};
use codeloop::model::{ModelError, ModelResponse, ToolCall, ToolChoice};
use codeloop::runtime::CompletionRuntime;
use codeloop::sandbox::mock::{MockSandboxFactory, ScriptedExec};
use codeloop::scheduler::run_scheduler;
use codeloop::submit::SUBMIT_TOOL_NAME;
use codeloop::{
    Answer, CallId, Config, EngineError, Event, PromptSet, SandboxError, WarningCode,
};
use serde_json::json;

struct Run {
    result: Result<Answer, EngineError>,
    events: Vec<Event>,
    runtime: Arc<CompletionRuntime>,
}

impl Run {
    fn tags(&self) -> Vec<&'static str> {
        self.events.iter().map(Event::tag).collect()
    }

    fn warnings(&self) -> Vec<WarningCode> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::SchedulerWarning { code, .. } => Some(*code),
                _ => None,
            })
            .collect()
    }

    fn answer_text(&self) -> &str {
        match &self.result {
            Ok(Answer::Text(text)) => text,
            other => panic!("expected a plain answer, got {other:?}"),
        }
    }
}

struct Harness {
    config: Config,
    model: Arc<ScriptedModel>,
    factory: Arc<MockSandboxFactory>,
    query: String,
    context: String,
    output_schema: Option<serde_json::Value>,
    tools: Vec<codeloop::ToolSpec>,
    pre_commands: Vec<Command>,
}

impl Harness {
    fn new(model: Arc<ScriptedModel>) -> Self {
        Self {
            config: Config::default(),
            model,
            factory: Arc::new(MockSandboxFactory::new()),
            query: "2+2".to_string(),
            context: "2+2=4".to_string(),
            output_schema: None,
            tools: Vec::new(),
            pre_commands: Vec::new(),
        }
    }

    async fn run(self) -> Run {
        let (runtime, receiver, result_rx) = CompletionRuntime::new(
            Arc::new(self.config),
            self.model.clone(),
            self.factory.clone(),
            Arc::new(PromptSet::default()),
        );
        let mut events_rx = runtime.events.subscribe();

        for command in self.pre_commands {
            runtime.queue.enqueue(command).await.expect("pre-command enqueues");
        }
        runtime
            .queue
            .enqueue(Command::StartCall {
                call_id: runtime.root_call_id.clone(),
                depth: 0,
                query: self.query,
                context: self.context,
                parent_bridge_request_id: None,
                tools: self.tools,
                output_schema: self.output_schema,
            })
            .await
            .expect("root call enqueues");

        let scheduler = tokio::spawn(run_scheduler(runtime.clone(), receiver));
        let result = tokio::time::timeout(std::time::Duration::from_secs(10), result_rx)
            .await
            .expect("completion finishes in time")
            .unwrap_or_else(|_| Err(EngineError::unknown("result channel dropped")));
        scheduler.await.expect("scheduler task joins");

        let mut events = Vec::new();
        while let Ok(event) = events_rx.try_recv() {
            events.push(event);
        }
        Run {
            result,
            events,
            runtime,
        }
    }
}

// ---- spec scenarios -------------------------------------------------------

#[tokio::test]
async fn plain_submit_finishes_without_executing() {
    let model = ScriptedModel::new(vec![submit_answer("4")]);
    let harness = Harness::new(model.clone());
    let factory = harness.factory.clone();
    let run = harness.run().await;

    assert_eq!(run.answer_text(), "4");
    assert_eq!(model.call_count(), 1);
    assert_eq!(factory.total_executions(), 0);
    assert_eq!(
        run.tags(),
        vec!["CallStarted", "IterationStarted", "ModelResponse", "CallFinalized"]
    );
}

#[tokio::test]
async fn code_then_submit_loop() {
    let model = ScriptedModel::new(vec![code_response("print(4)"), submit_answer("4")]);
    let harness = Harness::new(model.clone());
    let factory = harness.factory.clone();
    factory.push_script(vec![ScriptedExec::Output("4".to_string())]);
    let run = harness.run().await;

    assert_eq!(run.answer_text(), "4");
    let sandboxes = factory.created();
    assert_eq!(sandboxes.len(), 1);
    assert_eq!(sandboxes[0].executed(), vec!["print(4)".to_string()]);

    // The second request shows the model its execution output.
    let second = &model.requests()[1];
    let rendered: Vec<&str> = second.messages.iter().map(|m| m.content.as_str()).collect();
    assert!(
        rendered
            .iter()
            .any(|m| m.contains("[Execution Output]") && m.contains('4')),
        "transcript was {rendered:?}"
    );

    assert_eq!(
        run.tags(),
        vec![
            "CallStarted",
            "IterationStarted",
            "ModelResponse",
            "CodeExecutionStarted",
            "CodeExecutionCompleted",
            "IterationStarted",
            "ModelResponse",
            "CallFinalized",
        ]
    );
}

#[tokio::test]
async fn iteration_budget_triggers_extract_fallback() {
    let model = ScriptedModel::new(vec![
        code_response("step1()"),
        code_response("step2()"),
        submit_answer("extracted"),
    ]);
    let mut harness = Harness::new(model.clone());
    harness.config.max_iterations = 2;
    harness.factory.push_script(vec![
        ScriptedExec::Output("one".to_string()),
        ScriptedExec::Output("two".to_string()),
    ]);
    let run = harness.run().await;

    assert_eq!(run.answer_text(), "extracted");
    assert_eq!(model.call_count(), 3);
    let extract = &model.requests()[2];
    assert_eq!(
        extract.tool_choice,
        ToolChoice::Required(SUBMIT_TOOL_NAME.to_string())
    );
    assert!(
        extract
            .messages
            .last()
            .unwrap()
            .content
            .to_lowercase()
            .contains("finalize"),
        "extract prompt was {:?}",
        extract.messages.last().unwrap().content
    );
}

#[tokio::test]
async fn mixed_submit_and_code_prefers_the_tool() {
    let mixed = ModelResponse {
        text: "```js\nprint('x')\n```".to_string(),
        tool_calls: vec![ToolCall {
            name: SUBMIT_TOOL_NAME.to_string(),
            arguments: json!({"answer": "tool-wins"}),
        }],
        ..ModelResponse::default()
    };
    let model = ScriptedModel::new(vec![mixed]);
    let harness = Harness::new(model);
    let factory = harness.factory.clone();
    let run = harness.run().await;

    assert_eq!(run.answer_text(), "tool-wins");
    assert_eq!(factory.total_executions(), 0);
    assert!(run.warnings().contains(&WarningCode::MixedSubmitAndCode));
}

#[tokio::test]
async fn stale_commands_are_dropped_with_a_warning() {
    let model = ScriptedModel::new(vec![submit_answer("ok")]);
    let mut harness = Harness::new(model);
    harness.pre_commands.push(Command::GenerateStep {
        call_id: CallId::from("stale"),
    });
    let run = harness.run().await;

    assert_eq!(run.answer_text(), "ok");
    let stale = run.events.iter().find_map(|event| match event {
        Event::SchedulerWarning {
            code: WarningCode::StaleCommandDropped,
            command_tag,
            call_id,
            ..
        } => Some((*command_tag, call_id.clone())),
        _ => None,
    });
    let (command_tag, call_id) = stale.expect("stale warning emitted");
    assert_eq!(command_tag, Some("GenerateStep"));
    assert_eq!(call_id, Some(CallId::from("stale")));
}

#[tokio::test]
async fn recursive_bridge_spawns_a_nested_call() {
    // Root writes code that awaits llm_query; the child runs a full REPL
    // call of its own and its SUBMIT resolves the bridge.
    let model = ScriptedModel::new(vec![
        code_response("const r = await llm_query('sub-q', 'sub-ctx'); print(r)"),
        submit_answer("child-says-hi"),
        submit_answer("done"),
    ]);
    let mut harness = Harness::new(model.clone());
    harness.config.max_depth = 2;
    harness.factory.push_script(vec![ScriptedExec::Bridge {
        method: "llm_query".to_string(),
        args: vec![json!("sub-q"), json!("sub-ctx")],
    }]);
    let factory = harness.factory.clone();
    let run = harness.run().await;

    assert_eq!(run.answer_text(), "done");
    // Root sandbox plus one for the nested call.
    assert_eq!(factory.created().len(), 2);

    let child_started = run.events.iter().any(
        |event| matches!(event, Event::CallStarted { depth: 1, .. }),
    );
    let child_finalized = run.events.iter().any(|event| {
        matches!(
            event,
            Event::CallFinalized { depth: 1, answer: Answer::Text(text), .. } if text == "child-says-hi"
        )
    });
    assert!(child_started, "nested CallStarted missing: {:?}", run.tags());
    assert!(child_finalized, "nested CallFinalized missing");

    // The bridge answer flowed back into the root transcript.
    let last_root_request = model.requests().last().unwrap().clone();
    assert!(
        last_root_request
            .messages
            .iter()
            .any(|m| m.content.contains("child-says-hi")),
        "root transcript missing bridge result"
    );
}

// ---- §8 properties --------------------------------------------------------

#[tokio::test]
async fn runtime_state_is_empty_after_completion() {
    let model = ScriptedModel::new(vec![code_response("print(1)"), submit_answer("1")]);
    let harness = Harness::new(model);
    harness.factory.push_script(vec![ScriptedExec::Output("1".to_string())]);
    let run = harness.run().await;

    assert!(run.result.is_ok());
    assert!(run.runtime.call_states.lock().unwrap().is_empty());
    assert_eq!(run.runtime.bridge.pending_count(), 0);
    assert!(run.runtime.queue.is_closed());
}

#[tokio::test]
async fn event_sequences_are_deterministic() {
    let mut sequences = Vec::new();
    for _ in 0..2 {
        let model = ScriptedModel::new(vec![code_response("print(4)"), submit_answer("4")]);
        let harness = Harness::new(model);
        harness.factory.push_script(vec![ScriptedExec::Output("4".to_string())]);
        let run = harness.run().await;
        sequences.push(run.tags());
    }
    assert_eq!(sequences[0], sequences[1]);
}

#[tokio::test]
async fn llm_call_budget_is_never_exceeded() {
    let model = ScriptedModel::new(vec![
        code_response("a()"),
        code_response("b()"),
        code_response("c()"),
    ]);
    let mut harness = Harness::new(model.clone());
    harness.config.max_llm_calls = 2;
    harness
        .factory
        .push_script(vec![
            ScriptedExec::Output(String::new()),
            ScriptedExec::Output(String::new()),
        ]);
    let run = harness.run().await;

    match run.result {
        Err(EngineError::BudgetExhausted { resource, .. }) => {
            assert_eq!(resource, BudgetResource::LlmCalls);
        }
        other => panic!("expected llm call exhaustion, got {other:?}"),
    }
    assert!(model.call_count() <= 2, "made {} calls", model.call_count());
}

#[tokio::test]
async fn token_budget_fails_the_next_iteration() {
    let model = ScriptedModel::new(vec![with_usage(code_response("x()"), 200)]);
    let mut harness = Harness::new(model);
    harness.config.max_total_tokens = Some(100);
    harness.factory.push_script(vec![ScriptedExec::Output("ran".to_string())]);
    let run = harness.run().await;

    // The over-budget response was still delivered (its code executed).
    assert!(
        run.events
            .iter()
            .any(|event| matches!(event, Event::CodeExecutionCompleted { .. }))
    );
    match run.result {
        Err(EngineError::BudgetExhausted { resource, .. }) => {
            assert_eq!(resource, BudgetResource::Tokens);
        }
        other => panic!("expected token exhaustion, got {other:?}"),
    }
}

#[tokio::test]
async fn structured_mode_returns_validated_values() {
    let schema = json!({
        "type": "object",
        "properties": {"total": {"type": "number"}},
        "required": ["total"],
    });
    let model = ScriptedModel::new(vec![submit_value(json!({"total": 7}))]);
    let mut harness = Harness::new(model);
    harness.output_schema = Some(schema);
    let run = harness.run().await;

    assert_eq!(run.result.unwrap(), Answer::Structured(json!({"total": 7})));
}

#[tokio::test]
async fn structured_mode_rejects_schema_violations() {
    let schema = json!({
        "type": "object",
        "properties": {"total": {"type": "number"}},
        "required": ["total"],
    });
    let model = ScriptedModel::new(vec![submit_value(json!({"total": "seven"}))]);
    let mut harness = Harness::new(model);
    harness.output_schema = Some(schema);
    let run = harness.run().await;

    match run.result {
        Err(EngineError::OutputValidation { .. }) => {}
        other => panic!("expected output validation failure, got {other:?}"),
    }
}

// ---- additional behaviors -------------------------------------------------

#[tokio::test]
async fn stalls_force_an_early_extract() {
    let model = ScriptedModel::new(vec![
        text_response("hmm"),
        text_response("thinking"),
        submit_answer("final"),
    ]);
    let mut harness = Harness::new(model.clone());
    harness.config.stall_consecutive_limit = 2;
    harness.context = "x".repeat(500);
    let run = harness.run().await;

    assert_eq!(run.answer_text(), "final");
    assert!(run.warnings().contains(&WarningCode::StallDetectedEarlyExtract));
    assert_eq!(
        model.requests()[2].tool_choice,
        ToolChoice::Required(SUBMIT_TOOL_NAME.to_string())
    );
}

#[tokio::test]
async fn invalid_submit_feeds_back_and_loops() {
    let invalid = ModelResponse {
        tool_calls: vec![ToolCall {
            name: SUBMIT_TOOL_NAME.to_string(),
            arguments: json!({"answer": "a", "value": 1}),
        }],
        ..ModelResponse::default()
    };
    let model = ScriptedModel::new(vec![invalid, submit_answer("fixed")]);
    let harness = Harness::new(model.clone());
    let run = harness.run().await;

    assert_eq!(run.answer_text(), "fixed");
    assert!(run.warnings().contains(&WarningCode::SubmitInvalid));
    // The retry prompt carries the synthetic error note.
    assert!(
        model.requests()[1]
            .messages
            .iter()
            .any(|m| m.content.contains("invalid SUBMIT")),
        "no synthetic note in retry prompt"
    );
}

#[tokio::test]
async fn execution_errors_return_to_the_model_not_the_caller() {
    let model = ScriptedModel::new(vec![code_response("boom()"), submit_answer("recovered")]);
    let harness = Harness::new(model.clone());
    harness.factory.push_script(vec![ScriptedExec::Fail(SandboxError::Exec {
        message: "ReferenceError: boom is not defined".to_string(),
        stack: None,
    })]);
    let run = harness.run().await;

    assert_eq!(run.answer_text(), "recovered");
    assert!(
        model.requests()[1]
            .messages
            .iter()
            .any(|m| m.content.contains("Error: ReferenceError")),
        "error output missing from transcript"
    );
}

#[tokio::test]
async fn sandbox_infrastructure_errors_fail_the_call() {
    let model = ScriptedModel::new(vec![code_response("x()")]);
    let harness = Harness::new(model);
    harness
        .factory
        .push_script(vec![ScriptedExec::Fail(SandboxError::Disconnected)]);
    let run = harness.run().await;

    match run.result {
        Err(EngineError::Sandbox(SandboxError::Disconnected)) => {}
        other => panic!("expected sandbox failure, got {other:?}"),
    }
}

#[tokio::test]
async fn sandbox_creation_failure_fails_the_completion() {
    let model = ScriptedModel::new(vec![submit_answer("never")]);
    let harness = Harness::new(model.clone());
    harness.factory.fail_next_creation();
    let run = harness.run().await;

    match run.result {
        Err(EngineError::Sandbox(SandboxError::Spawn(_))) => {}
        other => panic!("expected spawn failure, got {other:?}"),
    }
    assert_eq!(model.call_count(), 0);
}

#[tokio::test]
async fn depth_limit_uses_one_shot_sub_calls() {
    let model = ScriptedModel::new(vec![
        code_response("print(await llm_query('direct', 'ctx'))"),
        text_response("one-shot answer"),
        submit_answer("done"),
    ]);
    let mut harness = Harness::new(model.clone());
    harness.config.max_depth = 1;
    harness.factory.push_script(vec![ScriptedExec::Bridge {
        method: "llm_query".to_string(),
        args: vec![json!("direct"), json!("ctx")],
    }]);
    let factory = harness.factory.clone();
    let run = harness.run().await;

    assert_eq!(run.answer_text(), "done");
    // One-shot sub-calls never create a second sandbox.
    assert_eq!(factory.created().len(), 1);
    // The one-shot request was marked as a sub-call with no tools.
    let one_shot = &model.requests()[1];
    assert!(one_shot.is_sub_call);
    assert!(one_shot.toolkit.is_empty());
    assert!(
        model.requests().last().unwrap().messages.iter().any(|m| m.content.contains("one-shot answer")),
        "one-shot answer missing from root transcript"
    );
}

#[tokio::test]
async fn batched_queries_resolve_in_input_order() {
    let model = ScriptedModel::new(vec![
        code_response("print(await llm_query_batched(['q1', 'q2']))"),
        text_response("a1"),
        text_response("a2"),
        submit_answer("done"),
    ]);
    let mut harness = Harness::new(model.clone());
    harness.config.max_depth = 1;
    harness.config.concurrency = 1;
    harness.factory.push_script(vec![ScriptedExec::Bridge {
        method: "llm_query_batched".to_string(),
        args: vec![json!(["q1", "q2"])],
    }]);
    let run = harness.run().await;

    assert_eq!(run.answer_text(), "done");
    let transcript_request = model.requests().last().unwrap().clone();
    assert!(
        transcript_request
            .messages
            .iter()
            .any(|m| m.content.contains("a1") && m.content.contains("a2")),
        "batched results missing from transcript"
    );
}

#[tokio::test]
async fn batched_bridge_respects_the_disable_flag() {
    let model = ScriptedModel::new(vec![
        code_response("await llm_query_batched(['q'])"),
        submit_answer("recovered"),
    ]);
    let mut harness = Harness::new(model);
    harness.config.enable_llm_query_batched = false;
    harness.factory.push_script(vec![ScriptedExec::Bridge {
        method: "llm_query_batched".to_string(),
        args: vec![json!(["q"])],
    }]);
    let run = harness.run().await;

    // The bridge failure surfaced as an execution error and the model
    // recovered on the next turn.
    assert_eq!(run.answer_text(), "recovered");
}

#[tokio::test]
async fn user_tools_run_with_retries() {
    use async_trait::async_trait;
    use codeloop::{ToolHandler, ToolSpec};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyTool {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl ToolHandler for FlakyTool {
        async fn handle(&self, args: Vec<serde_json::Value>) -> eyre::Result<serde_json::Value> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                eyre::bail!("transient failure");
            }
            Ok(json!({"echo": args}))
        }
    }

    let tool = ToolSpec::new(
        "lookup",
        "echoes its arguments",
        Arc::new(FlakyTool {
            attempts: AtomicU32::new(0),
        }),
    );

    let model = ScriptedModel::new(vec![
        code_response("print(await lookup('key'))"),
        submit_answer("done"),
    ]);
    let mut harness = Harness::new(model);
    harness.config.bridge_tool_retry_count = 1;
    harness.config.bridge_retry_base_delay_ms = 1;
    harness.tools = vec![tool];
    harness.factory.push_script(vec![ScriptedExec::Bridge {
        method: "lookup".to_string(),
        args: vec![json!("key")],
    }]);
    let run = harness.run().await;

    assert_eq!(run.answer_text(), "done");
}

#[tokio::test]
async fn unknown_bridge_methods_fail_the_await() {
    let model = ScriptedModel::new(vec![
        code_response("await mystery()"),
        submit_answer("recovered"),
    ]);
    let harness = Harness::new(model.clone());
    harness.factory.push_script(vec![ScriptedExec::Bridge {
        method: "mystery".to_string(),
        args: vec![],
    }]);
    let run = harness.run().await;

    assert_eq!(run.answer_text(), "recovered");
    assert!(
        model.requests()[1]
            .messages
            .iter()
            .any(|m| m.content.contains("unknown bridge method")),
        "bridge error missing from transcript"
    );
}

#[tokio::test]
async fn toolkit_failures_degrade_to_text_only() {
    let model = ScriptedModel::with_results(vec![
        Err(ModelError::Toolkit {
            message: "tool schema rejected".to_string(),
        }),
        Ok(submit_answer("after-degrade")),
    ]);
    let harness = Harness::new(model.clone());
    let run = harness.run().await;

    assert_eq!(run.answer_text(), "after-degrade");
    assert!(run.warnings().contains(&WarningCode::ToolkitDegraded));
    // Retry went out without a toolkit.
    assert!(model.requests()[1].toolkit.is_empty());
    assert_eq!(model.requests()[1].tool_choice, ToolChoice::None);
}

#[tokio::test]
async fn submit_variable_reads_the_sandbox() {
    let model = ScriptedModel::new(vec![
        code_response("__vars.result = 'computed value'"),
        submit_variable("result"),
    ]);
    let harness = Harness::new(model);
    harness.factory.push_script(vec![ScriptedExec::SetVarThen {
        name: "result".to_string(),
        value: json!("computed value"),
        output: String::new(),
    }]);
    let run = harness.run().await;

    assert_eq!(run.answer_text(), "computed value");
}

#[tokio::test]
async fn submit_variable_missing_fails_with_a_warning() {
    let model = ScriptedModel::new(vec![submit_variable("ghost")]);
    let harness = Harness::new(model);
    let run = harness.run().await;

    assert!(run.warnings().contains(&WarningCode::SubmitResolveFailed));
    match run.result {
        Err(EngineError::OutputValidation { message, .. }) => {
            assert!(message.contains("ghost"));
        }
        other => panic!("expected output validation failure, got {other:?}"),
    }
}

#[tokio::test]
async fn no_final_answer_when_extract_cannot_submit() {
    let model = ScriptedModel::new(vec![
        code_response("a()"),
        code_response("b()"),
        text_response("I refuse to finalize"),
    ]);
    let mut harness = Harness::new(model);
    harness.config.max_iterations = 2;
    harness.factory.push_script(vec![
        ScriptedExec::Output(String::new()),
        ScriptedExec::Output(String::new()),
    ]);
    let run = harness.run().await;

    match run.result {
        Err(EngineError::NoFinalAnswer { max_iterations, .. }) => {
            assert_eq!(max_iterations, 2);
        }
        other => panic!("expected NoFinalAnswer, got {other:?}"),
    }
}

#[tokio::test]
async fn per_call_iteration_counter_respects_the_cap() {
    let model = ScriptedModel::new(vec![
        code_response("a()"),
        code_response("b()"),
        submit_answer("done"),
    ]);
    let mut harness = Harness::new(model);
    harness.config.max_iterations = 5;
    harness.factory.push_script(vec![
        ScriptedExec::Output(String::new()),
        ScriptedExec::Output(String::new()),
    ]);
    let run = harness.run().await;

    assert!(run.result.is_ok());
    let max_seen = run
        .events
        .iter()
        .filter_map(|event| match event {
            Event::IterationStarted { iteration, .. } => Some(*iteration),
            _ => None,
        })
        .max()
        .unwrap();
    assert!(max_seen < 5);
}

#[tokio::test]
async fn sandboxes_are_shut_down_at_completion_end() {
    let model = ScriptedModel::new(vec![code_response("print(1)"), submit_answer("1")]);
    let harness = Harness::new(model);
    harness.factory.push_script(vec![ScriptedExec::Output("1".to_string())]);
    let factory = harness.factory.clone();
    let run = harness.run().await;

    assert!(run.result.is_ok());
    // Scope closure triggers a detached shutdown; give it a beat.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    for sandbox in factory.created() {
        assert_eq!(sandbox.shutdown_count(), 1);
    }
}
