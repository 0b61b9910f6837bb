//! The QuickJS execution environment.
//!
//! User code runs inside one persistent `AsyncContext` per worker. A JS
//! prelude installs `print`, the persistent `__vars` object, and the bridge
//! bindings; every bridge-capable binding funnels through one native async
//! function so the Rust side has a single suspension point to manage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use codeloop_protocol::SandboxMode;
use rquickjs::function::{Async, Func};
use rquickjs::{AsyncContext, AsyncRuntime, CatchResultExt, Function, Promise, async_with};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// A bridge call the JS side is suspended on.
pub type BridgeWaiter = oneshot::Sender<Result<serde_json::Value, String>>;

/// Outbound bridge request surfaced to the IPC loop.
#[derive(Debug)]
pub struct OutboundBridgeCall {
    pub request_id: u64,
    pub method: String,
    pub args: Vec<serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum SandboxInitError {
    #[error("quickjs runtime creation failed: {0}")]
    Runtime(rquickjs::Error),
    #[error("prelude evaluation failed: {0}")]
    Prelude(String),
    #[error("tool name `{0}` is not a valid identifier")]
    BadToolName(String),
}

/// What `execute` observed.
#[derive(Debug)]
pub enum ExecOutcome {
    /// Whatever `print` accumulated, newline-joined.
    Output(String),
    /// The code threw (or was refused by the strict-mode blocklist).
    Error { message: String, stack: Option<String> },
}

struct BridgeState {
    next_id: AtomicU64,
    waiters: Mutex<HashMap<u64, BridgeWaiter>>,
    outbound: mpsc::UnboundedSender<OutboundBridgeCall>,
    mode: SandboxMode,
}

pub struct JsSandbox {
    context: AsyncContext,
    _runtime: AsyncRuntime,
    print_buffer: Arc<Mutex<Vec<String>>>,
    bridge: Arc<BridgeState>,
    mode: SandboxMode,
}

const PRELUDE: &str = r#"
globalThis.__vars = {};

globalThis.print = function (...args) {
    __print(args.map(a => (typeof a === "string" ? a : JSON.stringify(a))).join(" "));
};
globalThis.console = { log: print, info: print, warn: print, error: print };

globalThis.__bridge = async function (method, args) {
    const raw = await __bridge_call(method, JSON.stringify(args));
    const parsed = JSON.parse(raw);
    if (parsed.error !== undefined) {
        throw new Error(parsed.error);
    }
    return parsed.value;
};

globalThis.llm_query = function (query, context, options) {
    const args = [query];
    if (context !== undefined) args.push(context);
    if (options !== undefined) args.push(options);
    return __bridge("llm_query", args);
};

globalThis.llm_query_batched = function (queries, contexts) {
    const args = [queries];
    if (contexts !== undefined) args.push(contexts);
    return __bridge("llm_query_batched", args);
};

globalThis.__vars_set = function (name, json) {
    try {
        __vars[name] = JSON.parse(json);
        return "";
    } catch (e) {
        return String(e);
    }
};

globalThis.__vars_get = function (name) {
    try {
        const value = __vars[name];
        const json = JSON.stringify(value === undefined ? null : value);
        return json === undefined ? "null" : json;
    } catch (e) {
        return "null";
    }
};

globalThis.__vars_list = function () {
    const out = {};
    for (const key of Object.keys(__vars).sort()) {
        let preview;
        try {
            preview = JSON.stringify(__vars[key]);
        } catch (e) {
            preview = "<unserializable>";
        }
        if (preview === undefined) preview = "<unserializable>";
        if (preview.length > 120) preview = preview.slice(0, 117) + "...";
        out[key] = preview;
    }
    return JSON.stringify(out);
};
"#;

/// Source patterns refused outright in strict mode.
fn blocklist() -> &'static [regex::Regex] {
    use std::sync::OnceLock;
    static PATTERNS: OnceLock<Vec<regex::Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"\bimport\s*\(",
            r"\brequire\s*\(",
            r"\beval\s*\(",
            r"\bFunction\s*\(",
            r"new\s+Function\b",
        ]
        .iter()
        .map(|pattern| regex::Regex::new(pattern).expect("static blocklist pattern compiles"))
        .collect()
    })
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl JsSandbox {
    /// Build the context, install the prelude and tool bindings.
    pub async fn new(
        mode: SandboxMode,
        tool_names: &[String],
        outbound: mpsc::UnboundedSender<OutboundBridgeCall>,
    ) -> Result<Self, SandboxInitError> {
        let runtime = AsyncRuntime::new().map_err(SandboxInitError::Runtime)?;
        let context = AsyncContext::full(&runtime)
            .await
            .map_err(SandboxInitError::Runtime)?;

        let print_buffer: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let bridge = Arc::new(BridgeState {
            next_id: AtomicU64::new(1),
            waiters: Mutex::new(HashMap::new()),
            outbound,
            mode,
        });

        for name in tool_names {
            if !is_identifier(name) {
                return Err(SandboxInitError::BadToolName(name.clone()));
            }
        }

        let install_buffer = print_buffer.clone();
        let install_bridge = bridge.clone();
        let tool_source = tool_names
            .iter()
            .map(|name| {
                format!("globalThis.{name} = (...args) => __bridge({name:?}, args);\n")
            })
            .collect::<String>();

        let installed: Result<(), String> = async_with!(context => |ctx| {
            let result = (|| -> Result<(), rquickjs::Error> {
                let buffer = install_buffer.clone();
                ctx.globals().set(
                    "__print",
                    Func::from(move |text: String| {
                        buffer.lock().expect("print buffer lock poisoned").push(text);
                    }),
                )?;

                let state = install_bridge.clone();
                ctx.globals().set(
                    "__bridge_call",
                    Func::from(Async(move |method: String, args_json: String| {
                        let state = state.clone();
                        async move { Ok::<String, rquickjs::Error>(state.call(method, args_json).await) }
                    })),
                )?;

                let _: rquickjs::Value = ctx.eval(PRELUDE)?;
                if !tool_source.is_empty() {
                    let _: rquickjs::Value = ctx.eval(tool_source.as_str())?;
                }
                Ok(())
            })();
            result.catch(&ctx).map_err(|err| err.to_string())
        })
        .await;
        installed.map_err(SandboxInitError::Prelude)?;

        Ok(Self {
            context,
            _runtime: runtime,
            print_buffer,
            bridge,
            mode,
        })
    }

    /// Run one snippet to completion (including every `await` it performs).
    pub async fn execute(&self, code: &str) -> ExecOutcome {
        if self.mode == SandboxMode::Strict
            && let Some(pattern) = blocklist().iter().find(|pattern| pattern.is_match(code))
        {
            return ExecOutcome::Error {
                message: format!("dynamic code loading is not allowed in strict mode ({pattern})"),
                stack: None,
            };
        }

        self.print_buffer
            .lock()
            .expect("print buffer lock poisoned")
            .clear();

        let wrapped = format!("(async () => {{\n{code}\n}})()");
        let result: Result<(), (String, Option<String>)> = async_with!(self.context => |ctx| {
            let evaluated = async {
                let promise = ctx.eval::<Promise, _>(wrapped.as_str())?;
                promise.into_future::<()>().await
            }
            .await;
            evaluated.catch(&ctx).map_err(|err| match err {
                rquickjs::CaughtError::Exception(exception) => (
                    exception
                        .message()
                        .unwrap_or_else(|| "uncaught exception".to_string()),
                    exception.stack(),
                ),
                other => (other.to_string(), None),
            })
        })
        .await;

        match result {
            Ok(()) => ExecOutcome::Output(
                self.print_buffer
                    .lock()
                    .expect("print buffer lock poisoned")
                    .join("\n"),
            ),
            Err((message, stack)) => ExecOutcome::Error { message, stack },
        }
    }

    pub async fn set_var(&self, name: &str, value: &serde_json::Value) -> Result<(), String> {
        let json = value.to_string();
        let name = name.to_string();
        async_with!(self.context => |ctx| {
            let result = (|| -> Result<String, rquickjs::Error> {
                let setter: Function = ctx.globals().get("__vars_set")?;
                setter.call((name.as_str(), json.as_str()))
            })();
            match result.catch(&ctx) {
                Ok(error) if error.is_empty() => Ok(()),
                Ok(error) => Err(error),
                Err(err) => Err(err.to_string()),
            }
        })
        .await
    }

    pub async fn get_var(&self, name: &str) -> Result<serde_json::Value, String> {
        let name = name.to_string();
        let name_for_error = name.clone();
        let json: String = async_with!(self.context => |ctx| {
            let result = (|| -> Result<String, rquickjs::Error> {
                let getter: Function = ctx.globals().get("__vars_get")?;
                getter.call((name.as_str(),))
            })();
            result.catch(&ctx).map_err(|err| err.to_string())
        })
        .await?;
        serde_json::from_str(&json)
            .map_err(|err| format!("variable `{name_for_error}` is not serializable: {err}"))
    }

    pub async fn list_vars(&self) -> Result<std::collections::BTreeMap<String, String>, String> {
        let json: String = async_with!(self.context => |ctx| {
            let result = (|| -> Result<String, rquickjs::Error> {
                let lister: Function = ctx.globals().get("__vars_list")?;
                lister.call(())
            })();
            result.catch(&ctx).map_err(|err| err.to_string())
        })
        .await?;
        serde_json::from_str(&json).map_err(|err| format!("variable listing is not serializable: {err}"))
    }

    /// Deliver a bridge resolution from the host.
    pub fn resolve_bridge(&self, request_id: u64, outcome: Result<serde_json::Value, String>) {
        let waiter = self
            .bridge
            .waiters
            .lock()
            .expect("bridge waiters lock poisoned")
            .remove(&request_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => tracing::warn!(request_id, "bridge resolution for unknown request dropped"),
        }
    }

    /// Reject every suspended bridge await (shutdown path).
    pub fn reject_all_bridges(&self, message: &str) {
        let drained: Vec<BridgeWaiter> = {
            let mut waiters = self
                .bridge
                .waiters
                .lock()
                .expect("bridge waiters lock poisoned");
            waiters.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(message.to_string()));
        }
    }
}

impl BridgeState {
    /// The single native suspension point behind every bridge binding.
    /// Returns a JSON envelope: `{"value": ...}` or `{"error": "..."}`.
    async fn call(self: Arc<Self>, method: String, args_json: String) -> String {
        if self.mode == SandboxMode::Strict {
            return serde_json::json!({
                "error": format!("{method} is unavailable in strict mode"),
            })
            .to_string();
        }
        let args: Vec<serde_json::Value> = match serde_json::from_str(&args_json) {
            Ok(args) => args,
            Err(err) => {
                return serde_json::json!({
                    "error": format!("bridge arguments are not serializable: {err}"),
                })
                .to_string();
            }
        };

        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("bridge waiters lock poisoned")
            .insert(request_id, tx);

        if self
            .outbound
            .send(OutboundBridgeCall {
                request_id,
                method,
                args,
            })
            .is_err()
        {
            self.waiters
                .lock()
                .expect("bridge waiters lock poisoned")
                .remove(&request_id);
            return serde_json::json!({"error": "worker is shutting down"}).to_string();
        }

        match rx.await {
            Ok(Ok(value)) => serde_json::json!({"value": value}).to_string(),
            Ok(Err(message)) => serde_json::json!({"error": message}).to_string(),
            Err(_) => serde_json::json!({"error": "bridge call abandoned"}).to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sandbox(mode: SandboxMode) -> (JsSandbox, mpsc::UnboundedReceiver<OutboundBridgeCall>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sandbox = JsSandbox::new(mode, &[], tx).await.expect("sandbox builds");
        (sandbox, rx)
    }

    #[tokio::test]
    async fn print_captures_output() {
        let (sandbox, _rx) = sandbox(SandboxMode::Permissive).await;
        match sandbox.execute("print(4)").await {
            ExecOutcome::Output(output) => assert_eq!(output, "4"),
            other => panic!("unexpected outcome {other:?}"),
        }
        match sandbox.execute("print('a', {b: 1})").await {
            ExecOutcome::Output(output) => assert_eq!(output, "a {\"b\":1}"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn output_resets_between_executions() {
        let (sandbox, _rx) = sandbox(SandboxMode::Permissive).await;
        sandbox.execute("print('first')").await;
        match sandbox.execute("print('second')").await {
            ExecOutcome::Output(output) => assert_eq!(output, "second"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn exceptions_become_exec_errors() {
        let (sandbox, _rx) = sandbox(SandboxMode::Permissive).await;
        match sandbox.execute("nope()").await {
            ExecOutcome::Error { message, .. } => {
                assert!(message.contains("nope"), "message was {message:?}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn vars_persist_across_executions() {
        let (sandbox, _rx) = sandbox(SandboxMode::Permissive).await;
        sandbox.execute("__vars.count = 41").await;
        sandbox.execute("__vars.count += 1").await;
        assert_eq!(sandbox.get_var("count").await.unwrap(), serde_json::json!(42));
        let listing = sandbox.list_vars().await.unwrap();
        assert_eq!(listing.get("count").unwrap(), "42");
    }

    #[tokio::test]
    async fn host_set_var_is_visible_to_code() {
        let (sandbox, _rx) = sandbox(SandboxMode::Permissive).await;
        sandbox
            .set_var("greeting", &serde_json::json!("hello"))
            .await
            .unwrap();
        match sandbox.execute("print(__vars.greeting)").await {
            ExecOutcome::Output(output) => assert_eq!(output, "hello"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_var_reads_as_null() {
        let (sandbox, _rx) = sandbox(SandboxMode::Permissive).await;
        assert_eq!(sandbox.get_var("missing").await.unwrap(), serde_json::Value::Null);
    }

    #[tokio::test]
    async fn bridge_call_suspends_until_resolution() {
        let (sandbox, mut rx) = sandbox(SandboxMode::Permissive).await;
        let sandbox = Arc::new(sandbox);

        let exec = {
            let sandbox = sandbox.clone();
            tokio::spawn(async move {
                sandbox
                    .execute("const answer = await llm_query('sub-q', 'sub-ctx'); print(answer)")
                    .await
            })
        };

        let call = rx.recv().await.expect("bridge call emitted");
        assert_eq!(call.method, "llm_query");
        assert_eq!(call.args, vec![serde_json::json!("sub-q"), serde_json::json!("sub-ctx")]);
        sandbox.resolve_bridge(call.request_id, Ok(serde_json::json!("resolved!")));

        match exec.await.unwrap() {
            ExecOutcome::Output(output) => assert_eq!(output, "resolved!"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_bridge_call_throws_and_is_catchable() {
        let (sandbox, mut rx) = sandbox(SandboxMode::Permissive).await;
        let sandbox = Arc::new(sandbox);

        let exec = {
            let sandbox = sandbox.clone();
            tokio::spawn(async move {
                sandbox
                    .execute(
                        "try { await llm_query('q'); } catch (e) { print('caught: ' + e.message); }",
                    )
                    .await
            })
        };

        let call = rx.recv().await.expect("bridge call emitted");
        sandbox.resolve_bridge(call.request_id, Err("sub-call failed".to_string()));

        match exec.await.unwrap() {
            ExecOutcome::Output(output) => assert_eq!(output, "caught: sub-call failed"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn strict_mode_blocks_bridge_and_dynamic_loading() {
        let (sandbox, _rx) = sandbox(SandboxMode::Strict).await;
        match sandbox.execute("await llm_query('q')").await {
            ExecOutcome::Error { message, .. } => assert!(message.contains("strict mode")),
            other => panic!("unexpected outcome {other:?}"),
        }
        match sandbox.execute("const m = await import('fs')").await {
            ExecOutcome::Error { message, .. } => assert!(message.contains("not allowed")),
            other => panic!("unexpected outcome {other:?}"),
        }
        match sandbox.execute("eval('1+1')").await {
            ExecOutcome::Error { message, .. } => assert!(message.contains("not allowed")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_bindings_route_through_bridge() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sandbox = Arc::new(
            JsSandbox::new(SandboxMode::Permissive, &["lookup".to_string()], tx)
                .await
                .expect("sandbox builds"),
        );

        let exec = {
            let sandbox = sandbox.clone();
            tokio::spawn(async move {
                sandbox.execute("print(await lookup('key', 2))").await
            })
        };

        let call = rx.recv().await.expect("bridge call emitted");
        assert_eq!(call.method, "lookup");
        assert_eq!(call.args, vec![serde_json::json!("key"), serde_json::json!(2)]);
        sandbox.resolve_bridge(call.request_id, Ok(serde_json::json!({"found": true})));

        match exec.await.unwrap() {
            ExecOutcome::Output(output) => assert_eq!(output, "{\"found\":true}"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_tool_names_are_refused() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = JsSandbox::new(SandboxMode::Permissive, &["bad-name".to_string()], tx)
            .await
            .err()
            .expect("must refuse");
        assert!(matches!(err, SandboxInitError::BadToolName(_)));
    }
}
