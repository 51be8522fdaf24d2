//! Response parsing: a worker's free-form reply -> structured completion.
//!
//! Workers type into a chat UI, so replies arrive as unstructured text. The
//! extraction rules are tried in order and the first match wins; the order
//! is deliberate, since a reply can contain both markers and an embedded
//! JSON object. Nothing here ever fails a dispatch: when every rule falls
//! through, the whole reply is treated as plain content.

use serde_json::Value;
use uuid::Uuid;

use crate::protocol::{
    CompletionReply, ToolCall, ToolFunction, CONTENT_CLOSE, CONTENT_OPEN, RESPONSE_DONE,
    TOOL_CALLS_CLOSE, TOOL_CALLS_OPEN,
};

/// Why the completion ended, in OpenAI vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Error,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::ToolCalls => "tool_calls",
            Self::Length => "length",
            Self::Error => "error",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "stop" => Some(Self::Stop),
            "tool_calls" => Some(Self::ToolCalls),
            "length" => Some(Self::Length),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// A parsed completion, ready for the OpenAI response envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResult {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
}

impl CompletionResult {
    fn text(content: String) -> Self {
        Self {
            content,
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
        }
    }
}

/// Parse a worker's completion reply.
///
/// Structured fields on the frame take precedence: an explicit tool-call
/// array replaces whatever the text ladder found, and an explicit finish
/// reason wins over the derived one.
pub fn parse_completion(reply: &CompletionReply) -> CompletionResult {
    let mut result = parse_text(&reply.content);

    if let Some(explicit) = reply.tool_calls.as_ref().filter(|calls| !calls.is_empty()) {
        let normalized: Vec<ToolCall> = explicit.iter().filter_map(normalize_tool_value).collect();
        if !normalized.is_empty() {
            result.tool_calls = normalized;
        }
    }

    result.finish_reason = reply
        .finish_reason
        .as_deref()
        .and_then(FinishReason::parse)
        .unwrap_or(if result.tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        });

    result
}

/// Run the extraction ladder over raw reply text.
pub fn parse_text(raw: &str) -> CompletionResult {
    if let Some(result) = parse_markers(raw) {
        return result;
    }
    if let Some(result) = parse_bare_object(raw) {
        return result;
    }
    if let Some(result) = parse_fenced_json(raw) {
        return result;
    }
    CompletionResult::text(raw.to_string())
}

/// Rule 1: marker-delimited reply.
fn parse_markers(raw: &str) -> Option<CompletionResult> {
    let content = extract_between(raw, CONTENT_OPEN, CONTENT_CLOSE);
    let tool_block = extract_between(raw, TOOL_CALLS_OPEN, TOOL_CALLS_CLOSE);

    let tool_calls = match tool_block {
        Some(block) => match serde_json::from_str::<Vec<Value>>(block) {
            Ok(values) => values
                .iter()
                .filter_map(normalize_tool_value)
                .collect::<Vec<_>>(),
            // Malformed tool JSON must not abort the dispatch; give the
            // later rules a chance instead.
            Err(_) => return None,
        },
        None => Vec::new(),
    };

    let content = match content {
        Some(inner) => inner.to_string(),
        None if !tool_calls.is_empty() => String::new(),
        // Sentinel without a content pair: everything before it.
        None => raw
            .split_once(RESPONSE_DONE)
            .map(|(before, _)| before.trim().to_string())?,
    };

    let finish_reason = if tool_calls.is_empty() {
        FinishReason::Stop
    } else {
        FinishReason::ToolCalls
    };
    Some(CompletionResult {
        content,
        tool_calls,
        finish_reason,
    })
}

/// Rule 2: the whole trimmed reply is one JSON object.
fn parse_bare_object(raw: &str) -> Option<CompletionResult> {
    let trimmed = raw.trim();
    if !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    from_object(&value)
}

/// Rule 3: the last ```json fence in the reply.
fn parse_fenced_json(raw: &str) -> Option<CompletionResult> {
    let fence_start = raw.rfind("```json")?;
    let body = &raw[fence_start + "```json".len()..];
    let body = body.strip_prefix('\n').unwrap_or(body);
    let end = body.find("```")?;
    let value: Value = serde_json::from_str(body[..end].trim()).ok()?;
    from_object(&value)
}

/// Shared rule 2/3 semantics: read `content`, `tool_calls`, `finish_reason`
/// fields directly from a parsed object.
fn from_object(value: &Value) -> Option<CompletionResult> {
    let object = value.as_object()?;

    let content = object
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let tool_calls: Vec<ToolCall> = object
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| calls.iter().filter_map(normalize_tool_value).collect())
        .unwrap_or_default();
    let finish_reason = object
        .get("finish_reason")
        .and_then(Value::as_str)
        .and_then(FinishReason::parse)
        .unwrap_or(if tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        });

    Some(CompletionResult {
        content,
        tool_calls,
        finish_reason,
    })
}

/// Normalize one tool-call element to the OpenAI output shape.
///
/// Accepts both the flat `{name, arguments}` form workers produce and the
/// nested `{function: {name, arguments}}` form; arguments may be a JSON
/// object (compacted to a string) or already a string. Elements without a
/// function name are dropped.
fn normalize_tool_value(value: &Value) -> Option<ToolCall> {
    let function = value.get("function").unwrap_or(value);
    let name = function.get("name")?.as_str()?.to_string();

    let arguments = match function.get("arguments") {
        Some(Value::String(s)) => s.clone(),
        Some(other @ Value::Object(_)) => serde_json::to_string(other).ok()?,
        Some(Value::Null) | None => "{}".to_string(),
        Some(other) => serde_json::to_string(other).ok()?,
    };

    let id = value
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("call_{}", &Uuid::new_v4().simple().to_string()[..12]));

    Some(ToolCall {
        id,
        kind: "function".to_string(),
        function: ToolFunction { name, arguments },
    })
}

fn extract_between<'a>(raw: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = raw.find(open)? + open.len();
    let end = raw[start..].find(close)? + start;
    Some(&raw[start..end])
}
