//! Wire protocol between the control plane and runners.
//!
//! Runners pull work with `POST /api/v1/runner/next` (body:
//! [`crate::session::SessionFilter`], response: [`InferenceRequest`] or
//! 204) and push frames with `POST /api/v1/runner/response` (body:
//! [`TaskResponse`]). All optional fields serialize as absent rather
//! than empty so receivers can tell "no tool calls yet" from "an empty
//! tool-call list".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{SessionMode, SessionSummary};

/// A runner work item derived from a session awaiting a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Session this work belongs to.
    pub session_id: String,
    /// Interaction the response will be streamed into.
    pub interaction_id: String,
    /// Session owner, echoed back on every response frame.
    pub owner: String,
    /// Model to run.
    pub model: String,
    /// Full chat history flattened through the model's template.
    pub prompt: String,
    /// Whether the subprocess call should stream.
    pub stream: bool,
}

/// Frame kind within a response stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResponseKind {
    /// Incremental delta, or the stream-done marker when `done` is set.
    Stream,
    /// Terminal frame carrying the full result or an error.
    Result,
}

/// One frame of the streaming response protocol.
///
/// Exactly one frame per request has `kind == Result`; it is always the
/// last frame and is always preceded by an empty `Stream` frame with
/// `done == true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub session_id: String,
    pub interaction_id: String,
    pub owner: String,
    pub kind: TaskResponseKind,
    /// Delta content for stream frames; full concatenation for the
    /// result frame.
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResponse {
    /// True for the terminal frame of a stream.
    pub fn is_result(&self) -> bool {
        self.kind == TaskResponseKind::Result
    }
}

/// Token and latency accounting for a completed request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub duration_ms: i64,
}

/// An OpenAI-compatible tool call, fully aggregated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Position within the choice; used to merge id-less continuation
    /// deltas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    pub function: ToolCallFunction,
}

/// The function half of a tool call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// JSON-encoded arguments, concatenated from streamed fragments.
    pub arguments: String,
}

/// Observability snapshot of one model instance on a runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInstanceState {
    /// Instance ID.
    pub id: String,
    /// Bound model name.
    pub model: String,
    /// Mode the instance serves.
    pub mode: SessionMode,
    /// Session that caused this instance to boot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_session_id: Option<String>,
    /// Session currently being processed, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_session_id: Option<String>,
    /// Recent jobs, newest first, bounded.
    #[serde(default)]
    pub job_history: Vec<SessionSummary>,
    /// Configured TTL in seconds.
    pub ttl_secs: u64,
    /// Last activity timestamp, if there has been any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    /// Whether the instance has been idle longer than its TTL.
    pub stale: bool,
    /// Estimated memory requirement of the bound model.
    pub memory_bytes: u64,
}
