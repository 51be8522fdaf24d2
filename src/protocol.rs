//! Wire protocol between the broker and worker agents.
//!
//! One full-duplex text-framed WebSocket connection per worker; every frame
//! is a JSON object with a `type` discriminator. Inbound frames form a
//! tagged union dispatched on the tag; unknown tags are tolerated and
//! answered with an `error` frame rather than terminating the session.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Sentinel markers the worker embeds in its free-form reply text.
///
/// These are literal byte sequences, not structured fields: the worker's
/// chat front-end has no native framing, so the reply channel carries them
/// inline and the response parser cuts on them.
pub const CONTENT_OPEN: &str = "<content>";
pub const CONTENT_CLOSE: &str = "</content>";
pub const TOOL_CALLS_OPEN: &str = "<tool_calls>";
pub const TOOL_CALLS_CLOSE: &str = "</tool_calls>";
pub const RESPONSE_DONE: &str = "<response_done>";

/// Broker-assigned opaque worker identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    /// Mint a fresh id. The short hex suffix keeps log lines readable.
    pub fn generate() -> Self {
        Self(format!("worker_{}", &Uuid::new_v4().simple().to_string()[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mint a request id, globally unique for the process lifetime.
pub fn mint_request_id() -> String {
    format!("req_{}", &Uuid::new_v4().simple().to_string()[..8])
}

/// Message role in a chat transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single chat message. `content` may be absent on assistant turns that
/// carried only tool calls; forwarded messages always set it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(content.into()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
        }
    }

    /// Message text, empty when the field was absent.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// A normalized tool call in the OpenAI output shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    /// Arguments as a JSON-encoded string, per the OpenAI contract.
    pub arguments: String,
}

/// The wire payload sent to a worker for one dispatch.
///
/// Fields elided by the per-worker cache policy are absent, not null; the
/// `*_cached` flags tell the worker to reuse what it already holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardedRequest {
    pub request_id: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Informational only; responses are always buffered.
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub system_cached: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub tools_cached: bool,
    pub timestamp: DateTime<Utc>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A worker's reply payload as routed through the rendezvous table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionReply {
    pub content: String,
    pub tool_calls: Option<Vec<Value>>,
    pub finish_reason: Option<String>,
    pub error: Option<Value>,
}

/// Frames the broker writes to a worker.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerFrame {
    ConnectionEstablished {
        worker_id: String,
        timestamp: DateTime<Utc>,
        message: String,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
    CompletionRequest(ForwardedRequest),
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl BrokerFrame {
    pub fn connection_established(worker_id: &WorkerId) -> Self {
        Self::ConnectionEstablished {
            worker_id: worker_id.to_string(),
            timestamp: Utc::now(),
            message: "connection established, ready for requests".to_string(),
        }
    }

    pub fn heartbeat() -> Self {
        Self::Heartbeat {
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Frames a worker writes to the broker.
///
/// `Unknown` absorbs any unrecognized `type` tag so the session can answer
/// with an error frame instead of dropping the connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    Register {
        #[serde(default)]
        worker_id: Option<String>,
        #[serde(default)]
        metadata: HashMap<String, String>,
    },
    ClientReady,
    HeartbeatResponse,
    CompletionResponse {
        request_id: String,
        #[serde(default)]
        content: String,
        #[serde(default)]
        tool_calls: Option<Vec<Value>>,
        #[serde(default)]
        finish_reason: Option<String>,
        #[serde(default)]
        error: Option<Value>,
    },
    ClientLog {
        #[serde(default)]
        level: Option<String>,
        message: String,
    },
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_frame_dispatches_on_type_tag() {
        let frame: WorkerFrame = serde_json::from_str(r#"{"type":"client_ready"}"#).unwrap();
        assert!(matches!(frame, WorkerFrame::ClientReady));

        let frame: WorkerFrame =
            serde_json::from_str(r#"{"type":"heartbeat_response","timestamp":"x"}"#).unwrap();
        assert!(matches!(frame, WorkerFrame::HeartbeatResponse));
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let frame: WorkerFrame =
            serde_json::from_str(r#"{"type":"telemetry","data":42}"#).unwrap();
        assert!(matches!(frame, WorkerFrame::Unknown));
    }

    #[test]
    fn test_completion_response_defaults() {
        let frame: WorkerFrame = serde_json::from_str(
            r#"{"type":"completion_response","request_id":"req_1","content":"hi"}"#,
        )
        .unwrap();
        match frame {
            WorkerFrame::CompletionResponse {
                request_id,
                content,
                tool_calls,
                finish_reason,
                error,
            } => {
                assert_eq!(request_id, "req_1");
                assert_eq!(content, "hi");
                assert!(tool_calls.is_none());
                assert!(finish_reason.is_none());
                assert!(error.is_none());
            }
            other => panic!("expected CompletionResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_forwarded_request_elides_cached_fields() {
        let req = ForwardedRequest {
            request_id: "req_1".to_string(),
            model: "gpt-4".to_string(),
            messages: vec![ChatMessage::user("hi")],
            temperature: None,
            max_tokens: None,
            stream: false,
            tools: None,
            system_cached: true,
            tools_cached: false,
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(BrokerFrame::CompletionRequest(req)).unwrap();
        assert_eq!(value["type"], "completion_request");
        assert_eq!(value["system_cached"], true);
        // Absent, not null.
        assert!(value.get("tools").is_none());
        assert!(value.get("tools_cached").is_none());
        assert!(value.get("temperature").is_none());
    }

    #[test]
    fn test_minted_ids_are_prefixed_and_unique() {
        let a = mint_request_id();
        let b = mint_request_id();
        assert!(a.starts_with("req_"));
        assert_ne!(a, b);
        assert!(WorkerId::generate().as_str().starts_with("worker_"));
    }
}
