//! Request normalization: inbound completion request -> forwarded frame.
//!
//! The remote worker drives a chat UI that keeps its own conversation
//! context, so replaying the whole transcript would duplicate history and
//! destabilize the UI. The projection keeps every system message in order
//! and only the last user turn; assistant and tool history is dropped.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::DispatchError;
use crate::gateway::openai::ChatCompletionRequest;
use crate::protocol::{
    ChatMessage, ForwardedRequest, Role, CONTENT_CLOSE, CONTENT_OPEN, RESPONSE_DONE,
    TOOL_CALLS_CLOSE, TOOL_CALLS_OPEN,
};

/// Reply-format instruction injected when the caller supplied no system
/// prompt. Without it the worker's free-form output has no framing for the
/// response parser to cut on.
fn format_instruction() -> String {
    format!(
        "Wrap your entire answer between {CONTENT_OPEN} and {CONTENT_CLOSE}. \
         If you need to call tools, append {TOOL_CALLS_OPEN}[...]{TOOL_CALLS_CLOSE} \
         containing a JSON array of objects with \"name\" and \"arguments\". \
         Always end your reply with {RESPONSE_DONE}."
    )
}

/// A completion request projected onto the worker wire shape, with the
/// payload fingerprints needed for the per-worker cache decision.
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    pub model: String,
    pub system_messages: Vec<ChatMessage>,
    pub user_message: ChatMessage,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stream: bool,
    pub tools: Option<Vec<Value>>,
    pub system_digest: String,
    pub tools_digest: Option<String>,
}

impl NormalizedRequest {
    /// Build the wire frame for one dispatch attempt.
    ///
    /// When the chosen worker's cache already holds the current system
    /// prompt (or tools catalogue), the payload is elided and the matching
    /// flag set; the two caches are decided independently.
    pub fn forwarded(
        &self,
        request_id: &str,
        system_cached: bool,
        tools_cached: bool,
    ) -> ForwardedRequest {
        let mut messages = Vec::new();
        if !system_cached {
            messages.extend(self.system_messages.iter().cloned());
        }
        messages.push(self.user_message.clone());

        ForwardedRequest {
            request_id: request_id.to_string(),
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: self.stream,
            tools: if tools_cached { None } else { self.tools.clone() },
            system_cached,
            tools_cached,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Normalize an inbound completion request.
///
/// Fails with `missing_user` when the request carries no non-empty user
/// message; everything else about the request passes through verbatim.
pub fn normalize_request(req: &ChatCompletionRequest) -> Result<NormalizedRequest, DispatchError> {
    let mut system_messages: Vec<ChatMessage> = req
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .cloned()
        .collect();

    let user_message = req
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .cloned()
        .ok_or(DispatchError::MissingUser)?;
    if user_message.text().is_empty() {
        return Err(DispatchError::MissingUser);
    }

    if system_messages.is_empty() {
        system_messages.push(ChatMessage::system(format_instruction()));
    }

    let system_digest = digest_value(&serde_json::to_value(&system_messages).unwrap_or(Value::Null));
    let tools_digest = req
        .tools
        .as_ref()
        .map(|tools| digest_value(&Value::Array(tools.clone())));

    Ok(NormalizedRequest {
        model: req.model.clone(),
        system_messages,
        user_message,
        temperature: req.temperature,
        max_tokens: req.max_tokens,
        stream: req.stream,
        tools: req.tools.clone(),
        system_digest,
        tools_digest,
    })
}

/// SHA-256 over the canonical JSON encoding, hex-encoded.
///
/// Only needs to be collision-resistant to accident, not adversaries: the
/// digest equates a payload with the one previously sent to a worker.
fn digest_value(value: &Value) -> String {
    let canonical = serde_json::to_string(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
