//! SSE stream filtering.
//!
//! Reads a live upstream event stream line by line and suppresses phantom
//! tool-use events while everything else passes through verbatim. The
//! state machine is `idle → in_phantom_open → in_phantom_body → (done)`;
//! anything off that path is passthrough. The shadow id is parsed out of
//! the argument fragments accumulated between open and close.
//!
//! Chunk boundaries are arbitrary: a `data:` line can be split across two
//! network reads, so a byte-level [`LineBuffer`] sits in front of the
//! filter.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use shadowgate_protocol::ExpansionCall;

use crate::adapters::PHANTOM_TOOL_NAME;
use crate::adapters::ProviderAdapter;
use crate::adapters::SseEventKind;

/// One suppressed phantom call, exposed after the stream completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuppressedCall {
    pub tool_use_id: String,
    /// Absent when the argument JSON never parsed.
    pub shadow_id: Option<String>,
}

impl SuppressedCall {
    pub fn into_expansion_call(self) -> Option<ExpansionCall> {
        self.shadow_id.map(|shadow_id| ExpansionCall {
            tool_use_id: self.tool_use_id,
            shadow_id,
        })
    }
}

/// Accumulates raw bytes and yields complete lines (without terminators).
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Any trailing bytes not yet terminated by a newline.
    pub fn remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(rest)
    }
}

enum FilterState {
    Idle,
    InPhantom {
        index: Option<i64>,
        tool_use_id: String,
        arguments: String,
    },
}

pub struct StreamFilter {
    adapter: Arc<dyn ProviderAdapter>,
    state: FilterState,
    suppressed: Vec<SuppressedCall>,
    /// `event:` lines held until the following `data:` line decides
    /// whether the whole event passes or is suppressed.
    pending_event_lines: Vec<String>,
    /// The `[DONE]` sentinel, withheld until `finish` so a follow-up
    /// round trip can splice in before the stream closes.
    pending_done: Option<String>,
    last_data_suppressed: bool,
}

impl StreamFilter {
    pub fn new(adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            adapter,
            state: FilterState::Idle,
            suppressed: Vec::new(),
            pending_event_lines: Vec::new(),
            pending_done: None,
            last_data_suppressed: false,
        }
    }

    /// Process one SSE line; returns the lines to emit to the client.
    pub fn process_line(&mut self, line: &str) -> Vec<String> {
        if line.trim().is_empty() {
            // Event separator. Swallow it when it closes a suppressed
            // event so the client never sees an empty frame.
            if self.last_data_suppressed {
                self.last_data_suppressed = false;
                return Vec::new();
            }
            return self.emit(line);
        }

        let Some(payload) = line.strip_prefix("data:") else {
            if line.starts_with("event:") {
                self.pending_event_lines.push(line.to_string());
                return Vec::new();
            }
            // Comments, ids, retry fields: passthrough.
            return self.emit(line);
        };
        let payload = payload.trim_start();

        if payload == "[DONE]" {
            self.pending_done = Some(line.to_string());
            self.pending_event_lines.clear();
            return Vec::new();
        }

        match self.adapter.classify_sse_event(payload) {
            SseEventKind::ToolUseStart {
                index,
                id,
                name,
                fragment,
            } if name == PHANTOM_TOOL_NAME => {
                self.state = FilterState::InPhantom {
                    index,
                    tool_use_id: id,
                    arguments: fragment.unwrap_or_default(),
                };
                self.suppress()
            }
            SseEventKind::ToolUseDelta { index, fragment } => {
                if let FilterState::InPhantom {
                    index: open_index,
                    arguments,
                    ..
                } = &mut self.state
                    && indexes_match(*open_index, index)
                {
                    arguments.push_str(&fragment);
                    return self.suppress();
                }
                self.emit(line)
            }
            SseEventKind::ToolUseStop { index } => {
                if let FilterState::InPhantom {
                    index: open_index, ..
                } = &self.state
                    && indexes_match(*open_index, index)
                {
                    self.close_phantom();
                    return self.suppress();
                }
                self.emit(line)
            }
            SseEventKind::ToolUseComplete {
                id,
                name,
                arguments,
            } if name == PHANTOM_TOOL_NAME => {
                self.suppressed.push(SuppressedCall {
                    tool_use_id: id,
                    shadow_id: arguments["id"].as_str().map(str::to_string),
                });
                self.suppress()
            }
            _ => self.emit(line),
        }
    }

    /// Flush anything withheld; call only when no follow-up round trip
    /// will run.
    pub fn finish(&mut self) -> Vec<String> {
        // An unterminated phantom block at stream end still counts.
        if matches!(self.state, FilterState::InPhantom { .. }) {
            self.close_phantom();
        }
        let mut lines = Vec::new();
        if let Some(done) = self.pending_done.take() {
            lines.push(done);
            lines.push(String::new());
        }
        lines
    }

    pub fn has_suppressed(&self) -> bool {
        !self.suppressed.is_empty()
    }

    pub fn take_suppressed(&mut self) -> Vec<SuppressedCall> {
        std::mem::take(&mut self.suppressed)
    }

    fn close_phantom(&mut self) {
        if let FilterState::InPhantom {
            tool_use_id,
            arguments,
            ..
        } = std::mem::replace(&mut self.state, FilterState::Idle)
        {
            let shadow_id = serde_json::from_str::<JsonValue>(&arguments)
                .ok()
                .and_then(|parsed| parsed["id"].as_str().map(str::to_string));
            if shadow_id.is_none() {
                tracing::warn!(tool_use_id, "phantom call with unparseable arguments");
            }
            self.suppressed.push(SuppressedCall {
                tool_use_id,
                shadow_id,
            });
        }
    }

    fn emit(&mut self, line: &str) -> Vec<String> {
        let mut lines = std::mem::take(&mut self.pending_event_lines);
        lines.push(line.to_string());
        self.last_data_suppressed = false;
        lines
    }

    fn suppress(&mut self) -> Vec<String> {
        self.pending_event_lines.clear();
        self.last_data_suppressed = true;
        Vec::new()
    }
}

fn indexes_match(open: Option<i64>, event: Option<i64>) -> bool {
    match (open, event) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}
