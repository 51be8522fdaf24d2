//! Worker sessions over the WebSocket endpoint.
//!
//! One session per connected worker. The session registers the worker on
//! accept, then multiplexes two activities over the socket: reading inbound
//! frames and ticking the broker-initiated heartbeat. Writes from the
//! session and from dispatchers share one mutex-guarded sink so frames
//! never interleave. Teardown cancels the worker's rendezvous slots and
//! deregisters it; both steps are idempotent, so racing a dispatcher's own
//! cleanup is harmless.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;

use crate::broker::{Broker, WorkerLink};
use crate::error::LinkError;
use crate::gateway::GatewayState;
use crate::protocol::{BrokerFrame, CompletionReply, WorkerFrame, WorkerId};

/// Serialized write half of a worker socket.
struct WsLink {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl WorkerLink for WsLink {
    async fn send(&self, frame: BrokerFrame) -> Result<(), LinkError> {
        let payload = serde_json::to_string(&frame).map_err(|e| LinkError {
            reason: format!("frame serialization failed: {e}"),
        })?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(payload.into()))
            .await
            .map_err(|e| LinkError {
                reason: e.to_string(),
            })
    }
}

/// `GET /ws`: upgrade and run a worker session.
pub async fn worker_socket(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    let metadata = connection_metadata(&headers);
    ws.on_upgrade(move |socket| worker_session(state.broker, socket, metadata))
}

/// Capture connection metadata from the upgrade request.
fn connection_metadata(headers: &HeaderMap) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    for key in ["user-agent", "origin"] {
        if let Some(value) = headers.get(key).and_then(|v| v.to_str().ok()) {
            metadata.insert(key.to_string(), value.to_string());
        }
    }
    metadata
}

async fn worker_session(
    broker: Arc<Broker>,
    socket: WebSocket,
    metadata: HashMap<String, String>,
) {
    let (sink, mut stream) = socket.split();
    let link: Arc<WsLink> = Arc::new(WsLink {
        sink: Mutex::new(sink),
    });

    let worker_id = match broker.registry().register(link.clone(), metadata).await {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!("rejecting worker connection: {}", e);
            let _ = link.send(BrokerFrame::error(e.to_string())).await;
            return;
        }
    };

    if link
        .send(BrokerFrame::connection_established(&worker_id))
        .await
        .is_err()
    {
        broker.registry().remove(&worker_id).await;
        return;
    }

    let period = broker.config().heartbeat_interval;
    let mut heartbeat =
        tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if link.send(BrokerFrame::heartbeat()).await.is_err() {
                    tracing::debug!(worker_id = %worker_id, "heartbeat write failed");
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&broker, &worker_id, link.as_ref(), text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary / ping / pong: nothing to do
                    Some(Err(e)) => {
                        tracing::debug!(worker_id = %worker_id, "socket read error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    // Teardown: fail this worker's in-flight slots first, then deregister.
    broker.rendezvous().cancel_for_worker(&worker_id).await;
    broker.registry().remove(&worker_id).await;
    tracing::info!(worker_id = %worker_id, "worker session closed");
}

async fn handle_frame(broker: &Broker, worker_id: &WorkerId, link: &WsLink, raw: &str) {
    let frame = match serde_json::from_str::<WorkerFrame>(raw) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(worker_id = %worker_id, "malformed frame: {}", e);
            let _ = link.send(BrokerFrame::error("invalid JSON frame")).await;
            return;
        }
    };

    match frame {
        WorkerFrame::Register {
            worker_id: supplied_id,
            mut metadata,
        } => {
            if let Some(supplied) = supplied_id {
                metadata.insert("worker_id".to_string(), supplied);
            }
            broker.registry().merge_metadata(worker_id, metadata).await;
            // Re-ack so the handshake is idempotent from the worker's view.
            let _ = link.send(BrokerFrame::connection_established(worker_id)).await;
        }
        WorkerFrame::ClientReady => {
            broker.registry().mark_ready(worker_id).await;
            tracing::info!(worker_id = %worker_id, "worker ready");
        }
        WorkerFrame::HeartbeatResponse => {
            broker.registry().touch(worker_id).await;
        }
        WorkerFrame::CompletionResponse {
            request_id,
            content,
            tool_calls,
            finish_reason,
            error,
        } => {
            let reply = CompletionReply {
                content,
                tool_calls,
                finish_reason,
                error,
            };
            let delivered = broker.rendezvous().deposit(&request_id, Ok(reply)).await;
            if !delivered {
                tracing::warn!(
                    worker_id = %worker_id,
                    request_id = %request_id,
                    "stray reply for unknown or closed slot, discarding"
                );
            }
        }
        WorkerFrame::ClientLog { level, message } => {
            // Worker-side diagnostics land in the broker log under a
            // dedicated target; nothing is reflected back.
            tracing::info!(
                target: "chatrelay::worker_log",
                worker_id = %worker_id,
                level = level.as_deref().unwrap_or("info"),
                "{}",
                message
            );
        }
        WorkerFrame::Unknown => {
            let kind = serde_json::from_str::<serde_json::Value>(raw)
                .ok()
                .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
                .unwrap_or_else(|| "<missing>".to_string());
            tracing::warn!(worker_id = %worker_id, frame_type = %kind, "unknown frame type");
            let _ = link
                .send(BrokerFrame::error(format!("unknown message type: {kind}")))
                .await;
        }
    }
}
