//! OpenAI-shaped request and response envelopes for the HTTP surface.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::broker::parse::CompletionResult;
use crate::protocol::ChatMessage;

/// Body of `POST /v1/chat/completions`. Unknown fields are ignored so
/// off-the-shelf OpenAI clients can send their full parameter set.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Accepted for compatibility; responses are always buffered.
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Option<Vec<Value>>,
}

/// Rough token estimate: four characters per token, floor of one for
/// non-empty text. Workers sit behind chat UIs that expose no real usage
/// numbers, so the envelope carries this approximation instead.
pub fn estimate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        0
    } else {
        ((text.len() / 4) as u32).max(1)
    }
}

/// Build the non-streaming completion envelope.
pub fn completion_envelope(
    request_id: &str,
    model: &str,
    request: &ChatCompletionRequest,
    result: &CompletionResult,
) -> Value {
    let prompt_text: String = request
        .messages
        .iter()
        .map(|m| m.text())
        .collect::<Vec<_>>()
        .join(" ");
    let prompt_tokens = estimate_tokens(&prompt_text);
    let completion_tokens = estimate_tokens(&result.content);

    let mut message = json!({
        "role": "assistant",
        "content": result.content,
    });
    if !result.tool_calls.is_empty() {
        message["tool_calls"] = serde_json::to_value(&result.tool_calls).unwrap_or(Value::Null);
    }

    json!({
        "id": format!("chatcmpl-{request_id}"),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": result.finish_reason.as_str(),
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        },
    })
}

/// Static model list for `GET /v1/models`. The broker does no per-model
/// routing; the list exists so OpenAI clients that probe it keep working.
pub fn model_list() -> Value {
    json!({
        "object": "list",
        "data": [
            {
                "id": "gpt-3.5-turbo",
                "object": "model",
                "created": 1_677_615_200,
                "owned_by": "openai",
            },
            {
                "id": "gpt-4",
                "object": "model",
                "created": 1_667_615_200,
                "owned_by": "openai",
            },
        ],
    })
}
