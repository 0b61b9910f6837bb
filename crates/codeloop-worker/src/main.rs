//! The sandbox worker process.
//!
//! Standalone subprocess with no knowledge of the orchestration engine: it
//! reads host frames from stdin, writes worker frames to stdout, and runs
//! untrusted code in an embedded QuickJS context. Logs go to stderr so
//! stdout stays a clean frame channel.

use std::process::ExitCode;
use std::sync::Arc;

use codeloop_protocol::{
    HostFrame, MAX_FRAME_BYTES_HARD_CAP, WorkerFrame, decode_frame, effective_frame_limit,
    encode_frame,
};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::sandbox::{ExecOutcome, JsSandbox, OutboundBridgeCall, SandboxInitError};

mod sandbox;

#[derive(Debug, Error)]
enum WorkerError {
    #[error("stdin read failed: {0}")]
    Stdin(std::io::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("sandbox initialization failed: {0}")]
    Init(#[from] SandboxInitError),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("worker exiting: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Encode a frame, or substitute a same-request error frame when the
/// payload exceeds the wire limit.
fn encode_or_degrade(frame: WorkerFrame, limit: usize) -> Option<String> {
    match encode_frame(&frame, limit) {
        Ok(line) => Some(line),
        Err(_) => {
            let fallback = match frame {
                WorkerFrame::ExecResult { request_id, .. } => WorkerFrame::ExecError {
                    request_id,
                    message: "execution output exceeds the frame size limit".to_string(),
                    stack: None,
                },
                WorkerFrame::GetVarResult { request_id, .. } => WorkerFrame::GetVarResult {
                    request_id,
                    value: serde_json::Value::Null,
                },
                WorkerFrame::ListVarsResult { request_id, .. } => WorkerFrame::ListVarsResult {
                    request_id,
                    variables: Default::default(),
                },
                other => {
                    debug!(?other, "dropping oversized frame");
                    return None;
                }
            };
            encode_frame(&fallback, limit).ok()
        }
    }
}

async fn run() -> Result<(), WorkerError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    // The first frame must be Init; it carries the wire limit.
    let first = lines
        .next_line()
        .await
        .map_err(WorkerError::Stdin)?
        .ok_or_else(|| WorkerError::Protocol("host closed before init".to_string()))?;
    let init: HostFrame = decode_frame(&first, MAX_FRAME_BYTES_HARD_CAP)
        .map_err(|err| WorkerError::Protocol(err.to_string()))?;
    let HostFrame::Init {
        call_id,
        depth,
        sandbox_mode,
        max_frame_bytes,
        tools,
    } = init
    else {
        return Err(WorkerError::Protocol("first frame was not init".to_string()));
    };
    let limit = effective_frame_limit(max_frame_bytes);
    info!(call_id = %call_id, depth, ?sandbox_mode, limit, "worker initialized");

    // Writer task: owns stdout, writes pre-encoded lines.
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            let write = async {
                stdout.write_all(line.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await
            };
            if write.await.is_err() {
                break;
            }
        }
    });

    let tool_names: Vec<String> = tools.into_iter().map(|tool| tool.name).collect();
    let (bridge_tx, mut bridge_rx) = mpsc::unbounded_channel::<OutboundBridgeCall>();
    let js = Arc::new(JsSandbox::new(sandbox_mode, &tool_names, bridge_tx).await?);

    // Forward bridge suspensions as frames; an unsendably large argument
    // payload fails the await instead of the whole worker.
    {
        let out_tx = out_tx.clone();
        let js = js.clone();
        tokio::spawn(async move {
            while let Some(call) = bridge_rx.recv().await {
                let frame = WorkerFrame::BridgeCall {
                    request_id: call.request_id,
                    method: call.method,
                    args: call.args,
                };
                match encode_frame(&frame, limit) {
                    Ok(line) => {
                        if out_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        if let WorkerFrame::BridgeCall { request_id, .. } = frame {
                            js.resolve_bridge(request_id, Err(format!("bridge call rejected: {err}")));
                        }
                    }
                }
            }
        });
    }

    loop {
        let Some(line) = lines.next_line().await.map_err(WorkerError::Stdin)? else {
            // Host is gone; nothing useful left to do.
            js.reject_all_bridges("host disconnected");
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }
        let frame: HostFrame =
            decode_frame(&line, limit).map_err(|err| WorkerError::Protocol(err.to_string()))?;
        match frame {
            HostFrame::Init { .. } => {
                return Err(WorkerError::Protocol("duplicate init frame".to_string()));
            }
            HostFrame::ExecRequest { request_id, code } => {
                // Executions run off the frame loop so BridgeResult frames
                // can resolve awaits inside the running code.
                let js = js.clone();
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let frame = match js.execute(&code).await {
                        ExecOutcome::Output(output) => WorkerFrame::ExecResult { request_id, output },
                        ExecOutcome::Error { message, stack } => WorkerFrame::ExecError {
                            request_id,
                            message,
                            stack,
                        },
                    };
                    if let Some(line) = encode_or_degrade(frame, limit) {
                        let _ = out_tx.send(line).await;
                    }
                });
            }
            HostFrame::SetVar {
                request_id,
                name,
                value,
            } => {
                let js = js.clone();
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let frame = match js.set_var(&name, &value).await {
                        Ok(()) => WorkerFrame::SetVarAck { request_id },
                        Err(message) => WorkerFrame::SetVarError { request_id, message },
                    };
                    if let Some(line) = encode_or_degrade(frame, limit) {
                        let _ = out_tx.send(line).await;
                    }
                });
            }
            HostFrame::GetVarRequest { request_id, name } => {
                let js = js.clone();
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let value = match js.get_var(&name).await {
                        Ok(value) => value,
                        Err(message) => {
                            debug!(name = %name, message = %message, "get_var degraded to null");
                            serde_json::Value::Null
                        }
                    };
                    let frame = WorkerFrame::GetVarResult { request_id, value };
                    if let Some(line) = encode_or_degrade(frame, limit) {
                        let _ = out_tx.send(line).await;
                    }
                });
            }
            HostFrame::ListVarsRequest { request_id } => {
                let js = js.clone();
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let variables = js.list_vars().await.unwrap_or_default();
                    let frame = WorkerFrame::ListVarsResult {
                        request_id,
                        variables,
                    };
                    if let Some(line) = encode_or_degrade(frame, limit) {
                        let _ = out_tx.send(line).await;
                    }
                });
            }
            HostFrame::BridgeResult { request_id, result } => {
                js.resolve_bridge(request_id, Ok(result));
            }
            HostFrame::BridgeFailed { request_id, message } => {
                js.resolve_bridge(request_id, Err(message));
            }
            HostFrame::Shutdown {} => {
                info!("shutdown requested");
                js.reject_all_bridges("worker shutting down");
                return Ok(());
            }
        }
    }
}
