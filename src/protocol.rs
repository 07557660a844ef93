//! Claude CLI `stream-json` protocol.
//!
//! The CLI prints one JSON record per line on stdout. Records we care about:
//! - `system` / `init`: carries the resumable session id
//! - `assistant`: text and tool_use content blocks
//! - `user`: tool_result content blocks
//! - `result`: end of turn, with cumulative cost
//!
//! Anything else is reported as [`ParsedLine::Unrecognized`] and dropped by
//! the engine. Parsing is a pure function of the input lines.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool name the CLI uses for interactive multiple-choice questions
pub const ASK_USER_QUESTION_TOOL: &str = "AskUserQuestion";

/// Typed event produced from the CLI output.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Session started; `resume_token` continues it on the next turn.
    Init { resume_token: String },
    Text { content: String },
    ToolUse { name: String, input: Value },
    ToolResult { content: String, is_error: bool },
    AskUserQuestion(AskUserQuestion),
    /// Terminal record for the turn.
    Complete { cost: Option<f64> },
    /// Stream-ending failure (non-zero exit, cancellation, IO).
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskUserQuestion {
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_select: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Outcome of parsing one complete output line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Blank,
    /// A known record; may map to zero or more events.
    Events(Vec<AgentEvent>),
    /// Well-formed JSON with a record type we do not handle.
    Unrecognized(String),
    /// Not JSON, or JSON that does not fit the record shape.
    Malformed(String),
}

// Raw record shapes as emitted by the CLI

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawRecord {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        #[serde(default)]
        message: RawMessage,
    },
    User {
        #[serde(default)]
        message: RawMessage,
    },
    Result {
        #[serde(default)]
        total_cost_usd: Option<f64>,
    },
    #[serde(other)]
    Unrecognized,
}

#[derive(Debug, Default, Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: RawContent,
}

/// User messages may carry a plain string instead of blocks.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<RawBlock>),
}

impl Default for RawContent {
    fn default() -> Self {
        RawContent::Blocks(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Other,
}

/// Parse one complete line of CLI output.
pub fn parse_line(line: &str) -> ParsedLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ParsedLine::Blank;
    }

    // The pty wrapper can leave stray control output ahead of the record
    let json = match trimmed.find('{') {
        Some(0) => trimmed,
        Some(idx) => &trimmed[idx..],
        None => return ParsedLine::Malformed(truncate_for_log(trimmed)),
    };

    let value: Value = match serde_json::from_str(json) {
        Ok(v) => v,
        Err(e) => return ParsedLine::Malformed(format!("{}: {}", e, truncate_for_log(json))),
    };

    let record = match RawRecord::deserialize(&value) {
        Ok(r) => r,
        Err(e) => return ParsedLine::Malformed(format!("{}: {}", e, truncate_for_log(json))),
    };

    match record {
        RawRecord::System {
            subtype,
            session_id,
        } => match (subtype.as_deref(), session_id) {
            (Some("init"), Some(id)) => ParsedLine::Events(vec![AgentEvent::Init {
                resume_token: id,
            }]),
            _ => ParsedLine::Events(Vec::new()),
        },
        RawRecord::Assistant { message } => ParsedLine::Events(assistant_events(message.content)),
        RawRecord::User { message } => ParsedLine::Events(user_events(message.content)),
        RawRecord::Result { total_cost_usd } => ParsedLine::Events(vec![AgentEvent::Complete {
            cost: total_cost_usd,
        }]),
        RawRecord::Unrecognized => ParsedLine::Unrecognized(
            value
                .get("type")
                .and_then(|t| t.as_str())
                .unwrap_or("<missing>")
                .to_string(),
        ),
    }
}

fn assistant_events(content: RawContent) -> Vec<AgentEvent> {
    let blocks = match content {
        RawContent::Text(text) if !text.is_empty() => {
            return vec![AgentEvent::Text { content: text }]
        }
        RawContent::Text(_) => return Vec::new(),
        RawContent::Blocks(blocks) => blocks,
    };

    blocks
        .into_iter()
        .filter_map(|block| match block {
            RawBlock::Text { text } if !text.is_empty() => Some(AgentEvent::Text { content: text }),
            RawBlock::ToolUse { name, input } => Some(tool_use_event(name, input)),
            _ => None,
        })
        .collect()
}

fn tool_use_event(name: String, input: Value) -> AgentEvent {
    if name == ASK_USER_QUESTION_TOOL {
        match AskUserQuestion::deserialize(&input) {
            Ok(question) => return AgentEvent::AskUserQuestion(question),
            Err(e) => tracing::debug!("AskUserQuestion input did not parse ({}), forwarding as tool_use", e),
        }
    }
    AgentEvent::ToolUse { name, input }
}

fn user_events(content: RawContent) -> Vec<AgentEvent> {
    let RawContent::Blocks(blocks) = content else {
        return Vec::new();
    };
    blocks
        .into_iter()
        .filter_map(|block| match block {
            RawBlock::ToolResult { content, is_error } => Some(AgentEvent::ToolResult {
                content: tool_result_text(&content),
                is_error: is_error.unwrap_or(false),
            }),
            _ => None,
        })
        .collect()
}

/// Tool results are either a string or a list of `{type: text, text}` blocks.
fn tool_result_text(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

fn truncate_for_log(s: &str) -> String {
    const MAX: usize = 200;
    if s.chars().count() <= MAX {
        s.to_string()
    } else {
        let head: String = s.chars().take(MAX).collect();
        format!("{}...", head)
    }
}

/// Reassembles complete lines from arbitrary read chunks.
///
/// Bytes are buffered until a newline arrives, so multi-byte UTF-8 split
/// across reads is decoded intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(clean_line(&raw[..raw.len() - 1]));
        }
        lines
    }

    /// Flush the trailing partial line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        let line = clean_line(&raw);
        if line.trim().is_empty() {
            None
        } else {
            Some(line)
        }
    }
}

fn clean_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    strip_ansi(text.trim_end_matches('\r'))
}

/// Strip ANSI escape sequences (CSI and OSC) that a pty may inject.
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            match chars.peek() {
                Some('[') => {
                    chars.next();
                    while let Some(&ch) = chars.peek() {
                        chars.next();
                        if ch.is_ascii_alphabetic() || ch == '~' {
                            break;
                        }
                    }
                }
                Some(']') => {
                    // OSC runs to BEL or ESC \
                    chars.next();
                    while let Some(ch) = chars.next() {
                        if ch == '\x07' {
                            break;
                        }
                        if ch == '\x1b' {
                            if chars.peek() == Some(&'\\') {
                                chars.next();
                            }
                            break;
                        }
                    }
                }
                _ => {
                    chars.next();
                }
            }
            continue;
        }
        if c == '\r' {
            continue;
        }
        out.push(c);
    }
    out
}
