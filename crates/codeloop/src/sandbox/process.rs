//! Worker-subprocess sandbox host.
//!
//! One worker process per call, newline-delimited JSON frames over
//! stdin/stdout. The host multiplexes requests by id, times each request
//! out independently, forwards bridge calls through the configured
//! [`BridgeHandler`], and walks the worker through
//! `alive → shutting_down → dead`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use codeloop_protocol::{HostFrame, ToolBinding, WorkerFrame, WorkerLogLevel, encode_frame, decode_frame};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Sandbox, SandboxEnv, SandboxFactory};
use crate::bridge::BridgeHandler;
use crate::config::Config;
use crate::error::SandboxError;
use crate::events::{Event, EventBus, WarningCode};
use crate::ids::{CallId, CompletionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Health {
    Alive,
    ShuttingDown,
    Dead,
}

struct Shared {
    call_id: CallId,
    completion_id: CompletionId,
    config: Arc<Config>,
    events: EventBus,
    health: Mutex<Health>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<WorkerFrame, SandboxError>>>>,
    /// Cancelling this makes the supervisor kill the process outright.
    kill: CancellationToken,
    /// Cancelling this starts the graceful grace-period countdown.
    graceful: CancellationToken,
}

impl Shared {
    fn health(&self) -> Health {
        *self.health.lock().expect("health lock poisoned")
    }

    /// Transition to `Dead`, failing every pending request. Idempotent.
    fn kill_with(&self, reason: &SandboxError) {
        {
            let mut health = self.health.lock().expect("health lock poisoned");
            if *health == Health::Dead {
                return;
            }
            *health = Health::Dead;
        }
        debug!(call_id = %self.call_id, %reason, "sandbox worker declared dead");
        self.fail_all_pending(reason);
        self.kill.cancel();
    }

    fn fail_all_pending(&self, reason: &SandboxError) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(reason.clone()));
        }
    }
}

/// A live worker subprocess owned by one call.
pub struct ProcessSandbox {
    shared: Arc<Shared>,
    writer_tx: mpsc::Sender<String>,
    next_request_id: AtomicU64,
}

impl ProcessSandbox {
    pub async fn spawn(env: SandboxEnv) -> Result<Self, SandboxError> {
        let config = env.config.clone();
        let mut child = Command::new(&config.worker_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| SandboxError::Spawn(format!("{}: {err}", config.worker_path.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Spawn("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Spawn("worker stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Spawn("worker stderr unavailable".to_string()))?;

        let shared = Arc::new(Shared {
            call_id: env.call_id.clone(),
            completion_id: env.completion_id.clone(),
            config: config.clone(),
            events: env.events.clone(),
            health: Mutex::new(Health::Alive),
            pending: Mutex::new(HashMap::new()),
            kill: CancellationToken::new(),
            graceful: CancellationToken::new(),
        });

        let (writer_tx, writer_rx) = mpsc::channel::<String>(32);
        let (inbound_tx, inbound_rx) = mpsc::channel::<WorkerFrame>(config.incoming_frame_queue_capacity.max(1));

        tokio::spawn(write_loop(shared.clone(), writer_rx, stdin));
        tokio::spawn(read_loop(shared.clone(), stdout, inbound_tx));
        tokio::spawn(dispatch_loop(
            shared.clone(),
            inbound_rx,
            env.bridge.clone(),
            writer_tx.clone(),
        ));
        tokio::spawn(drain_stderr(env.call_id.clone(), stderr));
        tokio::spawn(supervise(shared.clone(), child));

        let sandbox = Self {
            shared,
            writer_tx,
            next_request_id: AtomicU64::new(1),
        };

        let init = HostFrame::Init {
            call_id: env.call_id.to_string(),
            depth: env.depth,
            sandbox_mode: config.sandbox_mode,
            max_frame_bytes: config.frame_limit(),
            tools: env
                .tools
                .iter()
                .map(|tool| ToolBinding {
                    name: tool.name.clone(),
                })
                .collect(),
        };
        sandbox.send_frame(&init).await?;
        Ok(sandbox)
    }

    async fn send_frame(&self, frame: &HostFrame) -> Result<(), SandboxError> {
        let line = encode_frame(frame, self.shared.config.frame_limit()).map_err(frame_error_to_sandbox)?;
        self.writer_tx
            .send(line)
            .await
            .map_err(|_| SandboxError::Disconnected)
    }

    /// Send one request frame and await its matching response.
    async fn request(
        &self,
        build: impl FnOnce(u64) -> HostFrame,
        timeout: Duration,
    ) -> Result<WorkerFrame, SandboxError> {
        match self.shared.health() {
            Health::Alive => {}
            Health::ShuttingDown | Health::Dead => {
                return Err(SandboxError::Unavailable("worker is shut down".to_string()));
            }
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .expect("pending lock poisoned")
            .insert(request_id, tx);

        let frame = build(request_id);
        if let Err(err) = self.send_frame(&frame).await {
            self.shared
                .pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SandboxError::Disconnected),
            Err(_) => {
                // A stuck worker cannot be trusted with the next request.
                let reason = SandboxError::Timeout(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
                self.shared.kill_with(&reason);
                Err(reason)
            }
        }
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn execute(&self, code: &str) -> Result<String, SandboxError> {
        let code = code.to_string();
        let response = self
            .request(
                move |request_id| HostFrame::ExecRequest { request_id, code },
                self.shared.config.execute_timeout(),
            )
            .await?;
        match response {
            WorkerFrame::ExecResult { output, .. } => Ok(output),
            WorkerFrame::ExecError { message, stack, .. } => Err(SandboxError::Exec { message, stack }),
            other => {
                let reason = SandboxError::BadFrame(format!("unexpected response to execute: {other:?}"));
                self.shared.kill_with(&reason);
                Err(reason)
            }
        }
    }

    async fn set_variable(&self, name: &str, value: &serde_json::Value) -> Result<(), SandboxError> {
        let name = name.to_string();
        let value = value.clone();
        let response = self
            .request(
                move |request_id| HostFrame::SetVar {
                    request_id,
                    name,
                    value,
                },
                self.shared.config.set_var_timeout(),
            )
            .await?;
        match response {
            WorkerFrame::SetVarAck { .. } => Ok(()),
            WorkerFrame::SetVarError { message, .. } => Err(SandboxError::Exec { message, stack: None }),
            other => {
                let reason = SandboxError::BadFrame(format!("unexpected response to set_variable: {other:?}"));
                self.shared.kill_with(&reason);
                Err(reason)
            }
        }
    }

    async fn get_variable(&self, name: &str) -> Result<serde_json::Value, SandboxError> {
        let name = name.to_string();
        let response = self
            .request(
                move |request_id| HostFrame::GetVarRequest { request_id, name },
                self.shared.config.get_var_timeout(),
            )
            .await?;
        match response {
            WorkerFrame::GetVarResult { value, .. } => Ok(value),
            other => {
                let reason = SandboxError::BadFrame(format!("unexpected response to get_variable: {other:?}"));
                self.shared.kill_with(&reason);
                Err(reason)
            }
        }
    }

    async fn list_variables(&self) -> Result<std::collections::BTreeMap<String, String>, SandboxError> {
        let response = self
            .request(
                |request_id| HostFrame::ListVarsRequest { request_id },
                self.shared.config.get_var_timeout(),
            )
            .await?;
        match response {
            WorkerFrame::ListVarsResult { variables, .. } => Ok(variables),
            other => {
                let reason = SandboxError::BadFrame(format!("unexpected response to list_variables: {other:?}"));
                self.shared.kill_with(&reason);
                Err(reason)
            }
        }
    }

    async fn shutdown(&self) {
        {
            let mut health = self.shared.health.lock().expect("health lock poisoned");
            match *health {
                Health::Alive => *health = Health::ShuttingDown,
                Health::ShuttingDown | Health::Dead => return,
            }
        }
        let _ = self.send_frame(&HostFrame::Shutdown {}).await;
        self.shared
            .fail_all_pending(&SandboxError::Unavailable("worker is shut down".to_string()));
        self.shared.graceful.cancel();
    }
}

fn frame_error_to_sandbox(err: codeloop_protocol::FrameError) -> SandboxError {
    match err {
        codeloop_protocol::FrameError::TooLarge { size, limit } => SandboxError::FrameTooLarge { size, limit },
        codeloop_protocol::FrameError::Malformed(err) => SandboxError::BadFrame(err.to_string()),
    }
}

async fn write_loop(shared: Arc<Shared>, mut rx: mpsc::Receiver<String>, mut stdin: tokio::process::ChildStdin) {
    while let Some(line) = rx.recv().await {
        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        if write.await.is_err() {
            shared.kill_with(&SandboxError::Disconnected);
            break;
        }
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    stdout: tokio::process::ChildStdout,
    inbound_tx: mpsc::Sender<WorkerFrame>,
) {
    let limit = shared.config.frame_limit();
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let frame: WorkerFrame = match decode_frame(&line, limit) {
                    Ok(frame) => frame,
                    Err(err) => {
                        shared.kill_with(&frame_error_to_sandbox(err));
                        break;
                    }
                };
                match inbound_tx.try_send(frame) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // The worker is outpacing the host; it cannot be
                        // trusted to back off.
                        shared.events.publish(Event::SchedulerWarning {
                            completion_id: shared.completion_id.clone(),
                            code: WarningCode::QueueOverloadedFatal,
                            message: format!(
                                "worker for call {} overflowed the inbound frame queue",
                                shared.call_id
                            ),
                            call_id: Some(shared.call_id.clone()),
                            command_tag: None,
                        });
                        shared.kill_with(&SandboxError::Unavailable(
                            "inbound frame queue overflow".to_string(),
                        ));
                        break;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            Ok(None) => {
                if shared.health() == Health::Alive {
                    shared.kill_with(&SandboxError::Disconnected);
                }
                break;
            }
            Err(err) => {
                shared.kill_with(&SandboxError::BadFrame(format!("ipc read failed: {err}")));
                break;
            }
        }
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut inbound_rx: mpsc::Receiver<WorkerFrame>,
    bridge: Arc<dyn BridgeHandler>,
    writer_tx: mpsc::Sender<String>,
) {
    let bridge_permits = Arc::new(Semaphore::new(shared.config.max_bridge_concurrency.max(1)));
    while let Some(frame) = inbound_rx.recv().await {
        match frame {
            WorkerFrame::BridgeCall {
                request_id,
                method,
                args,
            } => {
                let shared = shared.clone();
                let bridge = bridge.clone();
                let writer_tx = writer_tx.clone();
                let permits = bridge_permits.clone();
                tokio::spawn(async move {
                    let Ok(_permit) = permits.acquire().await else {
                        return;
                    };
                    let outcome = tokio::time::timeout(
                        shared.config.bridge_timeout(),
                        bridge.handle(&shared.call_id, &method, args),
                    )
                    .await
                    .unwrap_or_else(|_| Err(format!("bridge call `{method}` timed out")));

                    let reply = match outcome {
                        Ok(result) => HostFrame::BridgeResult { request_id, result },
                        Err(message) => HostFrame::BridgeFailed { request_id, message },
                    };
                    let line = match encode_frame(&reply, shared.config.frame_limit()) {
                        Ok(line) => line,
                        Err(_) => {
                            // Oversized results degrade instead of killing the worker.
                            let fallback = HostFrame::BridgeFailed {
                                request_id,
                                message: "Result too large".to_string(),
                            };
                            match encode_frame(&fallback, shared.config.frame_limit()) {
                                Ok(line) => line,
                                Err(_) => return,
                            }
                        }
                    };
                    let _ = writer_tx.send(line).await;
                });
            }
            WorkerFrame::WorkerLog { level, message } => match level {
                WorkerLogLevel::Debug => debug!(call_id = %shared.call_id, "worker: {message}"),
                WorkerLogLevel::Info => tracing::info!(call_id = %shared.call_id, "worker: {message}"),
                WorkerLogLevel::Warn => warn!(call_id = %shared.call_id, "worker: {message}"),
                WorkerLogLevel::Error => tracing::error!(call_id = %shared.call_id, "worker: {message}"),
            },
            response => {
                let Some(request_id) = response.request_id() else {
                    continue;
                };
                let sender = shared
                    .pending
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(&request_id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(Ok(response));
                    }
                    None => {
                        // Stale after a timeout already failed the request.
                        warn!(call_id = %shared.call_id, request_id, "response for unknown request dropped");
                    }
                }
            }
        }
    }
}

async fn drain_stderr(call_id: CallId, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(call_id = %call_id, "worker stderr: {line}");
    }
}

/// Owns the child process handle: waits for exit, applies the graceful
/// grace period, and escalates to SIGTERM then SIGKILL.
async fn supervise(shared: Arc<Shared>, mut child: Child) {
    let grace = shared.config.shutdown_grace();
    let status = tokio::select! {
        status = child.wait() => status.ok(),
        _ = shared.kill.cancelled() => {
            let _ = child.start_kill();
            child.wait().await.ok()
        }
        _ = shared.graceful.cancelled() => {
            graceful_stop(&shared, &mut child, grace).await
        }
    };

    let was_expected = shared.health() != Health::Alive;
    if !was_expected {
        shared.kill_with(&SandboxError::WorkerExited {
            status: status.and_then(|s| s.code()),
        });
    } else {
        let mut health = shared.health.lock().expect("health lock poisoned");
        *health = Health::Dead;
    }
    debug!(call_id = %shared.call_id, ?status, "sandbox worker exited");
}

async fn graceful_stop(shared: &Arc<Shared>, child: &mut Child, grace: Duration) -> Option<std::process::ExitStatus> {
    // Phase 1: the Shutdown frame was already sent; give the worker a grace
    // period to exit on its own.
    tokio::select! {
        status = child.wait() => return status.ok(),
        _ = shared.kill.cancelled() => {
            let _ = child.start_kill();
            return child.wait().await.ok();
        }
        _ = tokio::time::sleep(grace) => {}
    }

    // Phase 2: SIGTERM, one more grace period.
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
        tokio::select! {
            status = child.wait() => return status.ok(),
            _ = tokio::time::sleep(grace) => {}
        }
    }

    // Phase 3: SIGKILL.
    let _ = child.start_kill();
    child.wait().await.ok()
}

/// Spawns one [`ProcessSandbox`] per call.
pub struct ProcessSandboxFactory;

#[async_trait]
impl SandboxFactory for ProcessSandboxFactory {
    async fn create(&self, env: SandboxEnv) -> Result<Arc<dyn Sandbox>, SandboxError> {
        Ok(Arc::new(ProcessSandbox::spawn(env).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeOutcome;

    struct NoBridge;

    #[async_trait]
    impl BridgeHandler for NoBridge {
        async fn handle(&self, _caller: &CallId, _method: &str, _args: Vec<serde_json::Value>) -> BridgeOutcome {
            Err("no bridge in this test".to_string())
        }
    }

    fn env_with_worker(path: &str) -> SandboxEnv {
        let config = Config {
            worker_path: path.into(),
            execute_timeout_ms: 500,
            ..Config::default()
        };
        SandboxEnv {
            completion_id: CompletionId::generate(),
            call_id: CallId::from("proc-test"),
            depth: 0,
            bridge: Arc::new(NoBridge),
            tools: Vec::new(),
            events: EventBus::new(8),
            config: Arc::new(config),
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let env = env_with_worker("/nonexistent/codeloop-worker-binary");
        let err = ProcessSandbox::spawn(env).await.err().expect("spawn must fail");
        assert!(matches!(err, SandboxError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn echoing_worker_is_killed_for_bad_frames() {
        // `cat` echoes our host frames back; they do not decode as worker
        // frames, which must be fatal.
        let env = env_with_worker("/bin/cat");
        let sandbox = ProcessSandbox::spawn(env).await.expect("cat spawns");
        let err = sandbox.execute("print(1)").await.err().expect("execute must fail");
        assert!(
            matches!(
                err,
                SandboxError::BadFrame(_)
                    | SandboxError::Disconnected
                    | SandboxError::Timeout(_)
                    | SandboxError::Unavailable(_)
            ),
            "unexpected error: {err:?}"
        );
        // Subsequent requests fail synchronously.
        let err = sandbox.get_variable("x").await.err().expect("dead worker");
        assert!(matches!(err, SandboxError::Unavailable(_) | SandboxError::Disconnected));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn requests_after_shutdown_fail() {
        let env = env_with_worker("/bin/cat");
        let sandbox = ProcessSandbox::spawn(env).await.expect("cat spawns");
        sandbox.shutdown().await;
        let err = sandbox.execute("print(1)").await.err().expect("must fail");
        assert!(matches!(err, SandboxError::Unavailable(_)));
        // Idempotent.
        sandbox.shutdown().await;
    }
}
