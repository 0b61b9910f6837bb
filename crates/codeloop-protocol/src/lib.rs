//! Wire protocol between the sandbox host and the sandbox worker process.
//!
//! Every message is a single JSON object on its own line. Host→worker and
//! worker→host frames are distinct tagged unions; a frame that fails to
//! decode, carries an unknown tag, or exceeds the configured size limit is
//! grounds for the host to kill the worker.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Absolute upper bound on a serialized frame. Configured limits clamp here.
pub const MAX_FRAME_BYTES_HARD_CAP: usize = 64 * 1024 * 1024;

/// How the worker treats bridge bindings and dynamic code loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    /// Bridge functions are live and tool bindings are installed.
    #[default]
    Permissive,
    /// Bridge bindings throw; dynamic-loading source patterns are refused.
    Strict,
}

/// A tool name the worker must expose as an async binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolBinding {
    pub name: String,
}

/// Frames sent from the host to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    Init {
        call_id: String,
        depth: u32,
        sandbox_mode: SandboxMode,
        max_frame_bytes: usize,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tools: Vec<ToolBinding>,
    },
    ExecRequest {
        request_id: u64,
        code: String,
    },
    SetVar {
        request_id: u64,
        name: String,
        value: serde_json::Value,
    },
    GetVarRequest {
        request_id: u64,
        name: String,
    },
    ListVarsRequest {
        request_id: u64,
    },
    BridgeResult {
        request_id: u64,
        result: serde_json::Value,
    },
    BridgeFailed {
        request_id: u64,
        message: String,
    },
    Shutdown {},
}

/// Severity of a `WorkerLog` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Frames sent from the worker back to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    ExecResult {
        request_id: u64,
        output: String,
    },
    ExecError {
        request_id: u64,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    SetVarAck {
        request_id: u64,
    },
    SetVarError {
        request_id: u64,
        message: String,
    },
    GetVarResult {
        request_id: u64,
        value: serde_json::Value,
    },
    /// Variable names mapped to short value previews. A `BTreeMap` keeps the
    /// ordering stable across runs.
    ListVarsResult {
        request_id: u64,
        variables: BTreeMap<String, String>,
    },
    BridgeCall {
        request_id: u64,
        method: String,
        args: Vec<serde_json::Value>,
    },
    WorkerLog {
        level: WorkerLogLevel,
        message: String,
    },
}

impl WorkerFrame {
    /// The request id this frame answers, if it answers one.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            WorkerFrame::ExecResult { request_id, .. }
            | WorkerFrame::ExecError { request_id, .. }
            | WorkerFrame::SetVarAck { request_id }
            | WorkerFrame::SetVarError { request_id, .. }
            | WorkerFrame::GetVarResult { request_id, .. }
            | WorkerFrame::ListVarsResult { request_id, .. } => Some(*request_id),
            WorkerFrame::BridgeCall { .. } | WorkerFrame::WorkerLog { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("frame is not valid JSON or has an unknown shape: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Clamp a configured frame limit to the hard cap.
pub fn effective_frame_limit(configured: usize) -> usize {
    configured.min(MAX_FRAME_BYTES_HARD_CAP)
}

/// Serialize a frame to its wire line (no trailing newline), enforcing the
/// size limit. Non-serializable payloads surface as `Malformed`.
pub fn encode_frame<T: Serialize>(frame: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let line = serde_json::to_string(frame)?;
    let limit = effective_frame_limit(max_frame_bytes);
    if line.len() > limit {
        return Err(FrameError::TooLarge {
            size: line.len(),
            limit,
        });
    }
    Ok(line)
}

/// Parse one wire line into a frame, enforcing the size limit first so an
/// oversized line is rejected without being fed to the JSON parser.
pub fn decode_frame<T: DeserializeOwned>(line: &str, max_frame_bytes: usize) -> Result<T, FrameError> {
    let limit = effective_frame_limit(max_frame_bytes);
    if line.len() > limit {
        return Err(FrameError::TooLarge {
            size: line.len(),
            limit,
        });
    }
    Ok(serde_json::from_str(line)?)
}
