//! HandleBridgeCall: requests from sandboxed code.
//!
//! `llm_query` either becomes a nested call (a full REPL loop of its own)
//! or, at the depth limit or under a named-model override, a one-shot model
//! call inside the caller's scope. `llm_query_batched` fans out one-shots.
//! Anything else is a user tool.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::debug;

use super::Scheduler;
use crate::commands::Command;
use crate::events::Event;
use crate::ids::{BridgeRequestId, CallId};
use crate::runtime::CompletionRuntime;
use crate::schema::validate_against;
use crate::tools::ToolSpec;

/// Recognized keys of the optional `llm_query` options object.
#[derive(Debug, Default, Clone, PartialEq)]
struct LlmQueryOptions {
    model: Option<String>,
    response_format: Option<Value>,
}

fn parse_options(value: &Value) -> Result<LlmQueryOptions, String> {
    let Value::Object(map) = value else {
        return Err("llm_query options must be an object".to_string());
    };
    let mut options = LlmQueryOptions::default();
    for (key, entry) in map {
        match key.as_str() {
            "model" => {
                options.model = Some(
                    entry
                        .as_str()
                        .ok_or("llm_query option `model` must be a string")?
                        .to_string(),
                );
            }
            "response_format" => {
                if !entry.is_object() {
                    return Err("llm_query option `response_format` must be a schema object".to_string());
                }
                options.response_format = Some(entry.clone());
            }
            other => return Err(format!("unknown llm_query option `{other}`")),
        }
    }
    Ok(options)
}

fn parse_llm_query_args(args: &[Value]) -> Result<(String, String, LlmQueryOptions), String> {
    if args.is_empty() || args.len() > 3 {
        return Err("llm_query takes (query, context?, options?)".to_string());
    }
    let query = args[0]
        .as_str()
        .filter(|text| !text.trim().is_empty())
        .ok_or("llm_query requires a non-empty query string")?
        .to_string();
    let context = match args.get(1) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(_) => return Err("llm_query context must be a string".to_string()),
    };
    let options = match args.get(2) {
        None | Some(Value::Null) => LlmQueryOptions::default(),
        Some(value) => parse_options(value)?,
    };
    Ok((query, context, options))
}

fn parse_batched_args(args: &[Value], max_batch: usize) -> Result<(Vec<String>, Vec<String>), String> {
    if args.is_empty() || args.len() > 2 {
        return Err("llm_query_batched takes (queries, contexts?)".to_string());
    }
    let Value::Array(raw_queries) = &args[0] else {
        return Err("llm_query_batched requires an array of query strings".to_string());
    };
    if raw_queries.is_empty() {
        return Err("llm_query_batched requires at least one query".to_string());
    }
    if raw_queries.len() > max_batch {
        return Err(format!(
            "llm_query_batched is limited to {max_batch} queries, got {}",
            raw_queries.len()
        ));
    }
    let mut queries = Vec::with_capacity(raw_queries.len());
    for query in raw_queries {
        let query = query
            .as_str()
            .filter(|text| !text.trim().is_empty())
            .ok_or("llm_query_batched queries must be non-empty strings")?;
        queries.push(query.to_string());
    }
    let contexts = match args.get(1) {
        None | Some(Value::Null) => vec![String::new(); queries.len()],
        Some(Value::Array(raw_contexts)) => {
            if raw_contexts.len() != queries.len() {
                return Err("llm_query_batched contexts must match queries in length".to_string());
            }
            let mut contexts = Vec::with_capacity(raw_contexts.len());
            for context in raw_contexts {
                contexts.push(
                    context
                        .as_str()
                        .ok_or("llm_query_batched contexts must be strings")?
                        .to_string(),
                );
            }
            contexts
        }
        Some(_) => return Err("llm_query_batched contexts must be an array of strings".to_string()),
    };
    Ok((queries, contexts))
}

/// One direct model call on behalf of sandboxed code: reserves budget,
/// takes a permit, optionally decodes against a response schema.
async fn one_shot_sub_call(
    runtime: &Arc<CompletionRuntime>,
    query: &str,
    context: &str,
    depth: u32,
    options: &LlmQueryOptions,
) -> Result<Value, String> {
    if !runtime.budget.try_consume_llm_call() {
        return Err("LLM call budget exhausted".to_string());
    }
    let request = runtime
        .prompts
        .one_shot_request(query, context, depth, options.model.clone());
    let response = {
        let _permit = runtime
            .llm_permits
            .acquire()
            .await
            .map_err(|_| "engine is shutting down".to_string())?;
        runtime
            .model
            .generate(request)
            .await
            .map_err(|err| err.to_string())?
    };
    if let Some(used) = response.usage.as_ref().and_then(|usage| usage.billable()) {
        runtime.budget.record_tokens(used);
    }
    match &options.response_format {
        None => Ok(json!(response.text)),
        Some(schema) => {
            let value: Value = serde_json::from_str(&response.text)
                .map_err(|err| format!("sub-call response is not valid JSON: {err}"))?;
            validate_against(schema, &value)
                .map_err(|message| format!("sub-call result failed schema validation: {message}"))?;
            Ok(value)
        }
    }
}

impl Scheduler {
    pub(super) async fn handle_bridge_call(
        &self,
        call_id: CallId,
        bridge_request_id: BridgeRequestId,
        method: String,
        args: Vec<Value>,
    ) {
        let Some((depth, scope, tools)) = self.with_call(&call_id, |context| {
            (context.depth, context.scope.clone(), context.tools.clone())
        }) else {
            self.warn_stale(&call_id, "HandleBridgeCall");
            self.runtime
                .bridge
                .resolve(bridge_request_id, Err("caller call no longer exists".to_string()));
            return;
        };

        self.publish(Event::BridgeCallReceived {
            completion_id: self.runtime.completion_id.clone(),
            call_id: call_id.clone(),
            depth,
            method: method.clone(),
        });

        match method.as_str() {
            "llm_query" => {
                self.bridge_llm_query(call_id, bridge_request_id, depth, &scope, tools, &args)
                    .await;
            }
            "llm_query_batched" => {
                self.bridge_llm_query_batched(bridge_request_id, depth, &scope, &args);
            }
            _ => {
                self.bridge_user_tool(bridge_request_id, &scope, &tools, &method, args);
            }
        }
    }

    async fn bridge_llm_query(
        &self,
        call_id: CallId,
        bridge_request_id: BridgeRequestId,
        depth: u32,
        scope: &Arc<crate::call::CallScope>,
        tools: Vec<ToolSpec>,
        args: &[Value],
    ) {
        let (query, context, options) = match parse_llm_query_args(args) {
            Ok(parsed) => parsed,
            Err(message) => {
                self.runtime.bridge.resolve(bridge_request_id, Err(message));
                return;
            }
        };

        let child_depth = depth + 1;
        let one_shot = child_depth >= self.runtime.config.max_depth || options.model.is_some();
        if one_shot {
            debug!(caller = %call_id, child_depth, model = ?options.model, "one-shot sub-call");
            let runtime = self.runtime.clone();
            scope.spawn(async move {
                let outcome = one_shot_sub_call(&runtime, &query, &context, child_depth, &options).await;
                runtime.bridge.resolve(bridge_request_id, outcome);
            });
            return;
        }

        let child = Command::StartCall {
            call_id: CallId::generate(),
            depth: child_depth,
            query,
            context,
            parent_bridge_request_id: Some(bridge_request_id),
            tools,
            output_schema: options.response_format,
        };
        if self.runtime.queue.enqueue(child).await.is_err() {
            self.runtime
                .bridge
                .resolve(bridge_request_id, Err("scheduler is shutting down".to_string()));
        }
    }

    fn bridge_llm_query_batched(
        &self,
        bridge_request_id: BridgeRequestId,
        depth: u32,
        scope: &Arc<crate::call::CallScope>,
        args: &[Value],
    ) {
        if !self.runtime.config.enable_llm_query_batched {
            self.runtime
                .bridge
                .resolve(bridge_request_id, Err("llm_query_batched is disabled".to_string()));
            return;
        }
        let (queries, contexts) = match parse_batched_args(args, self.runtime.config.max_batch_queries) {
            Ok(parsed) => parsed,
            Err(message) => {
                self.runtime.bridge.resolve(bridge_request_id, Err(message));
                return;
            }
        };

        // All items run concurrently; the LLM permit bounds actual
        // parallelism. Results keep input order; any failure fails the
        // whole bridge call.
        let runtime = self.runtime.clone();
        scope.spawn(async move {
            let items = queries.iter().zip(contexts.iter()).map(|(query, context)| {
                let runtime = runtime.clone();
                async move {
                    one_shot_sub_call(&runtime, query, context, depth + 1, &LlmQueryOptions::default()).await
                }
            });
            let results = futures::future::join_all(items).await;
            let mut values = Vec::with_capacity(results.len());
            for (index, result) in results.into_iter().enumerate() {
                match result {
                    Ok(value) => values.push(value),
                    Err(message) => {
                        runtime
                            .bridge
                            .resolve(bridge_request_id, Err(format!("batch item {index}: {message}")));
                        return;
                    }
                }
            }
            runtime.bridge.resolve(bridge_request_id, Ok(Value::Array(values)));
        });
    }

    fn bridge_user_tool(
        &self,
        bridge_request_id: BridgeRequestId,
        scope: &Arc<crate::call::CallScope>,
        tools: &[ToolSpec],
        method: &str,
        args: Vec<Value>,
    ) {
        let Some(tool) = tools.iter().find(|tool| tool.name == method).cloned() else {
            self.runtime.bridge.resolve(
                bridge_request_id,
                Err(format!("unknown bridge method `{method}`")),
            );
            return;
        };

        let runtime = self.runtime.clone();
        let retries = runtime.config.bridge_tool_retry_count;
        let base_delay = Duration::from_millis(runtime.config.bridge_retry_base_delay_ms);
        scope.spawn(async move {
            let attempts = retries + 1;
            let mut last_error = String::new();
            for attempt in 0..attempts {
                if attempt > 0 {
                    tokio::time::sleep(base_delay * 2u32.saturating_pow(attempt - 1)).await;
                }
                match tokio::time::timeout(tool.timeout, tool.handler.handle(args.clone())).await {
                    Ok(Ok(value)) => {
                        runtime.bridge.resolve(bridge_request_id, Ok(value));
                        return;
                    }
                    Ok(Err(err)) => last_error = err.to_string(),
                    Err(_) => {
                        last_error = format!("tool `{}` timed out after {:?}", tool.name, tool.timeout);
                    }
                }
                debug!(tool = %tool.name, attempt, error = %last_error, "tool attempt failed");
            }
            runtime.bridge.resolve(
                bridge_request_id,
                Err(format!(
                    "tool `{}` failed after {attempts} attempts: {last_error}",
                    tool.name
                )),
            );
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_query_args_validate() {
        let (query, context, options) =
            parse_llm_query_args(&[json!("q"), json!("ctx")]).unwrap();
        assert_eq!((query.as_str(), context.as_str()), ("q", "ctx"));
        assert_eq!(options, LlmQueryOptions::default());

        assert!(parse_llm_query_args(&[]).is_err());
        assert!(parse_llm_query_args(&[json!("")]).is_err());
        assert!(parse_llm_query_args(&[json!(42)]).is_err());
        assert!(parse_llm_query_args(&[json!("q"), json!(7)]).is_err());

        let (_, context, _) = parse_llm_query_args(&[json!("q")]).unwrap();
        assert_eq!(context, "");
        let (_, context, _) = parse_llm_query_args(&[json!("q"), Value::Null]).unwrap();
        assert_eq!(context, "");
    }

    #[test]
    fn llm_query_options_reject_unknown_keys() {
        let options =
            parse_llm_query_args(&[json!("q"), json!("c"), json!({"model": "fast"})]).unwrap().2;
        assert_eq!(options.model.as_deref(), Some("fast"));

        assert!(parse_llm_query_args(&[json!("q"), json!("c"), json!({"temperature": 1})]).is_err());
        assert!(parse_llm_query_args(&[json!("q"), json!("c"), json!({"model": 3})]).is_err());
        assert!(parse_llm_query_args(&[json!("q"), json!("c"), json!("opts")]).is_err());

        let options = parse_llm_query_args(&[
            json!("q"),
            json!("c"),
            json!({"response_format": {"type": "object"}}),
        ])
        .unwrap()
        .2;
        assert!(options.response_format.is_some());
    }

    #[test]
    fn batched_args_validate() {
        let (queries, contexts) = parse_batched_args(&[json!(["a", "b"])], 8).unwrap();
        assert_eq!(queries, vec!["a", "b"]);
        assert_eq!(contexts, vec!["", ""]);

        let (_, contexts) = parse_batched_args(&[json!(["a"]), json!(["c1"])], 8).unwrap();
        assert_eq!(contexts, vec!["c1"]);

        assert!(parse_batched_args(&[json!([])], 8).is_err());
        assert!(parse_batched_args(&[json!(["a", ""])], 8).is_err());
        assert!(parse_batched_args(&[json!(["a", "b", "c"])], 2).is_err());
        assert!(parse_batched_args(&[json!(["a"]), json!(["c1", "c2"])], 8).is_err());
        assert!(parse_batched_args(&[json!("not-an-array")], 8).is_err());
    }
}
