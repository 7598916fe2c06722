//! Streaming-response plumbing: SSE framing and tool-call aggregation.

use std::collections::HashMap;

use super::client::ToolCallDelta;
use crate::protocol::{ToolCall, ToolCallFunction};

/// End-of-stream sentinel emitted by OpenAI-compatible servers.
pub const SSE_DONE: &str = "[DONE]";

/// Incremental parser for an SSE byte stream.
///
/// Chunks may split events arbitrarily; bytes are buffered until a
/// blank-line event boundary and the `data:` payloads are handed out
/// one at a time.
#[derive(Debug, Default)]
pub struct SseBuffer {
    buffer: String,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
    }

    /// Pop the next complete `data:` payload, if one is buffered.
    pub fn next_data(&mut self) -> Option<String> {
        loop {
            let boundary = self.buffer.find("\n\n")?;
            let event: String = self.buffer.drain(..boundary + 2).collect();

            for line in event.lines() {
                if let Some(data) = line.strip_prefix("data:") {
                    return Some(data.trim_start().to_string());
                }
            }
            // Comment or keep-alive event; keep scanning.
        }
    }
}

/// Merges streamed tool-call fragments into complete calls.
///
/// Fragments are keyed by tool-call id; name and argument pieces are
/// concatenated in arrival order. Fragments without an id continue the
/// most recent call sharing their index. Completed calls come back in
/// first-seen order, though the order carries no meaning: each call is
/// self-identified.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: Vec<ToolCall>,
    by_id: HashMap<String, usize>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb one streamed fragment.
    pub fn absorb(&mut self, delta: &ToolCallDelta) {
        let slot = match &delta.id {
            Some(id) => match self.by_id.get(id) {
                Some(&idx) => idx,
                None => {
                    self.calls.push(ToolCall {
                        id: id.clone(),
                        kind: String::new(),
                        index: delta.index,
                        function: ToolCallFunction::default(),
                    });
                    let idx = self.calls.len() - 1;
                    self.by_id.insert(id.clone(), idx);
                    idx
                }
            },
            // Continuation without an id: attach to the most recent
            // call with the same index, falling back to the last call.
            None => {
                let found = match delta.index {
                    Some(index) => self
                        .calls
                        .iter()
                        .rposition(|c| c.index == Some(index))
                        .or(self.calls.len().checked_sub(1)),
                    None => self.calls.len().checked_sub(1),
                };
                match found {
                    Some(idx) => idx,
                    None => return,
                }
            }
        };

        let call = &mut self.calls[slot];
        if let Some(kind) = &delta.kind {
            if call.kind.is_empty() {
                call.kind = kind.clone();
            }
        }
        if call.index.is_none() {
            call.index = delta.index;
        }
        if let Some(function) = &delta.function {
            if let Some(name) = &function.name {
                call.function.name.push_str(name);
            }
            if let Some(arguments) = &function.arguments {
                call.function.arguments.push_str(arguments);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// The aggregated calls, first-seen order.
    pub fn into_calls(self) -> Vec<ToolCall> {
        self.calls
    }
}
