//! End-to-end tests: a real bound gateway, a scripted WebSocket worker, and
//! the dispatch path between them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use chatrelay::broker::Broker;
use chatrelay::config::BrokerConfig;
use chatrelay::gateway::{self, GatewayState};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

fn test_config() -> BrokerConfig {
    BrokerConfig {
        acquire_wait: Duration::from_secs(2),
        response_wait: Duration::from_secs(5),
        ..BrokerConfig::default()
    }
}

async fn start_broker(config: BrokerConfig) -> (SocketAddr, Arc<Broker>) {
    let broker = Arc::new(Broker::new(config));
    let state = GatewayState {
        broker: Arc::clone(&broker),
    };
    let (addr, _server) = gateway::start_server("127.0.0.1:0".parse().unwrap(), state)
        .await
        .expect("failed to start test server");
    (addr, broker)
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// A scripted worker: connects, acks the handshake, and lets tests drive
/// the frame exchange by hand.
struct TestWorker {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestWorker {
    async fn connect(addr: SocketAddr) -> Self {
        let (socket, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("worker failed to connect");
        let mut worker = Self { socket };
        let hello = worker.next_frame().await;
        assert_eq!(hello["type"], "connection_established");
        assert!(hello["worker_id"].as_str().unwrap().starts_with("worker_"));
        worker
    }

    /// Connect and signal readiness, making the worker selectable.
    async fn connect_ready(addr: SocketAddr) -> Self {
        let mut worker = Self::connect(addr).await;
        worker.send(json!({"type": "client_ready"})).await;
        worker
    }

    async fn send(&mut self, frame: Value) {
        self.socket
            .send(Message::Text(frame.to_string().into()))
            .await
            .expect("worker send failed");
    }

    /// Next JSON frame from the broker, answering heartbeats transparently.
    async fn next_frame(&mut self) -> Value {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), self.socket.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .expect("socket read failed");
            if !message.is_text() {
                continue;
            }
            let frame: Value = {
                let text = message.to_text().unwrap();
                serde_json::from_str(text).expect("frame is not JSON")
            };
            if frame["type"] == "heartbeat" {
                self.send(json!({"type": "heartbeat_response"})).await;
                continue;
            }
            return frame;
        }
    }

    /// Wait for a `completion_request` and return it.
    async fn expect_completion_request(&mut self) -> Value {
        let frame = self.next_frame().await;
        assert_eq!(frame["type"], "completion_request", "got: {frame}");
        frame
    }

    async fn reply(&mut self, request_id: &str, content: &str) {
        self.send(json!({
            "type": "completion_response",
            "request_id": request_id,
            "content": content,
            "tool_calls": null,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
        .await;
    }

    async fn close(mut self) {
        let _ = self.socket.close(None).await;
    }
}

fn completion_body(content: &str) -> Value {
    json!({
        "model": "gpt-3.5-turbo",
        "messages": [{"role": "user", "content": content}],
    })
}

async fn post_completion(addr: SocketAddr, body: Value) -> reqwest::Response {
    client()
        .post(format!("http://{addr}/v1/chat/completions"))
        .json(&body)
        .send()
        .await
        .unwrap()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_one_shot_dispatch() {
    let (addr, _broker) = start_broker(test_config()).await;
    let mut worker = TestWorker::connect_ready(addr).await;

    let http = tokio::spawn(async move { post_completion(addr, completion_body("hi")).await });

    let request = worker.expect_completion_request().await;
    let messages = request["messages"].as_array().unwrap();
    // No caller-supplied system prompt: the broker injects the reply-format
    // instruction, then the last user turn.
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "system");
    assert_eq!(messages[1]["role"], "user");
    assert_eq!(messages[1]["content"], "hi");

    let request_id = request["request_id"].as_str().unwrap().to_string();
    worker.reply(&request_id, "hello").await;

    let response = http.await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["id"], format!("chatcmpl-{request_id}"));
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "hello");
    assert!(body["choices"][0]["message"].get("tool_calls").is_none());
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert!(body["usage"]["total_tokens"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_marker_delimited_reply() {
    let (addr, _broker) = start_broker(test_config()).await;
    let mut worker = TestWorker::connect_ready(addr).await;

    let http = tokio::spawn(async move { post_completion(addr, completion_body("hi")).await });

    let request = worker.expect_completion_request().await;
    let request_id = request["request_id"].as_str().unwrap().to_string();
    worker
        .reply(&request_id, "<content>x</content><response_done>")
        .await;

    let response = http.await.unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "x");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn test_fenced_json_tool_call() {
    let (addr, _broker) = start_broker(test_config()).await;
    let mut worker = TestWorker::connect_ready(addr).await;

    let body = json!({
        "model": "gpt-4",
        "messages": [{"role": "user", "content": "call the tool"}],
        "tools": [{
            "type": "function",
            "function": {"name": "f", "parameters": {"type": "object"}},
        }],
    });
    let http = tokio::spawn(async move { post_completion(addr, body).await });

    let request = worker.expect_completion_request().await;
    assert_eq!(request["tools"].as_array().unwrap().len(), 1);
    let request_id = request["request_id"].as_str().unwrap().to_string();
    worker
        .reply(
            &request_id,
            "```json\n{\"content\":\"\",\"tool_calls\":[{\"name\":\"f\",\"arguments\":{\"a\":1}}],\"finish_reason\":\"tool_calls\"}\n```",
        )
        .await;

    let response = http.await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
    let calls = body["choices"][0]["message"]["tool_calls"].as_array().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["type"], "function");
    assert_eq!(calls[0]["function"]["name"], "f");
    assert_eq!(calls[0]["function"]["arguments"], "{\"a\":1}");
    assert!(calls[0]["id"].as_str().unwrap().starts_with("call_"));
}

#[tokio::test]
async fn test_system_prompt_cache_elision() {
    let (addr, _broker) = start_broker(test_config()).await;
    let mut worker = TestWorker::connect_ready(addr).await;

    let body = json!({
        "model": "gpt-4",
        "messages": [
            {"role": "system", "content": "always answer in French"},
            {"role": "user", "content": "hello"},
        ],
    });

    // First send carries the system prompt inline.
    let http = tokio::spawn({
        let body = body.clone();
        async move { post_completion(addr, body).await }
    });
    let request = worker.expect_completion_request().await;
    assert!(request.get("system_cached").is_none());
    assert_eq!(request["messages"].as_array().unwrap().len(), 2);
    let id = request["request_id"].as_str().unwrap().to_string();
    worker.reply(&id, "bonjour").await;
    assert_eq!(http.await.unwrap().status(), 200);

    // Same prompt again: elided, flagged, and still correct end to end.
    let http = tokio::spawn({
        let body = body.clone();
        async move { post_completion(addr, body).await }
    });
    let request = worker.expect_completion_request().await;
    assert_eq!(request["system_cached"], true);
    let messages = request["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["role"], "user");
    let id = request["request_id"].as_str().unwrap().to_string();
    worker.reply(&id, "re-bonjour").await;
    let response = http.await.unwrap();
    let body_json: Value = response.json().await.unwrap();
    assert_eq!(body_json["choices"][0]["message"]["content"], "re-bonjour");

    // A different prompt restores inline carriage.
    let changed = json!({
        "model": "gpt-4",
        "messages": [
            {"role": "system", "content": "always answer in German"},
            {"role": "user", "content": "hello"},
        ],
    });
    let http = tokio::spawn(async move { post_completion(addr, changed).await });
    let request = worker.expect_completion_request().await;
    assert!(request.get("system_cached").is_none());
    assert_eq!(request["messages"].as_array().unwrap().len(), 2);
    let id = request["request_id"].as_str().unwrap().to_string();
    worker.reply(&id, "guten Tag").await;
    assert_eq!(http.await.unwrap().status(), 200);
}

#[tokio::test]
async fn test_response_timeout_returns_504_and_worker_survives() {
    let (addr, broker) = start_broker(BrokerConfig {
        response_wait: Duration::from_millis(400),
        ..test_config()
    })
    .await;
    let mut worker = TestWorker::connect_ready(addr).await;

    let http = tokio::spawn(async move { post_completion(addr, completion_body("hi")).await });
    let request = worker.expect_completion_request().await;
    let stale_id = request["request_id"].as_str().unwrap().to_string();

    // Never reply; the caller times out.
    let response = http.await.unwrap();
    assert_eq!(response.status(), 504);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "timeout");

    // A late reply is a stray and must not break anything.
    worker.reply(&stale_id, "too late").await;

    // The worker went back to idle and serves the next dispatch.
    let http = tokio::spawn(async move { post_completion(addr, completion_body("again")).await });
    let request = worker.expect_completion_request().await;
    let id = request["request_id"].as_str().unwrap().to_string();
    worker.reply(&id, "prompt this time").await;
    let response = http.await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body["choices"][0]["message"]["content"],
        "prompt this time"
    );
    assert_eq!(broker.rendezvous().pending().await, 0);
}

#[tokio::test]
async fn test_worker_loss_mid_dispatch_returns_502() {
    let (addr, broker) = start_broker(test_config()).await;
    let mut worker = TestWorker::connect_ready(addr).await;

    let http = tokio::spawn(async move { post_completion(addr, completion_body("hi")).await });
    worker.expect_completion_request().await;

    // The worker vanishes while the dispatch is in flight.
    worker.close().await;

    let response = http.await.unwrap();
    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "worker_gone");

    // The registry no longer lists the worker and nothing leaked.
    let stats: Value = client()
        .get(format!("http://{addr}/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total_workers"], 0);
    assert_eq!(stats["pending_requests"], 0);
    assert_eq!(broker.registry().snapshot().await.total, 0);
}

#[tokio::test]
async fn test_no_worker_returns_503() {
    let (addr, _broker) = start_broker(BrokerConfig {
        acquire_wait: Duration::from_millis(200),
        ..test_config()
    })
    .await;

    let response = post_completion(addr, completion_body("hi")).await;
    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "no_worker");
}

#[tokio::test]
async fn test_concurrent_dispatches_use_distinct_workers() {
    let (addr, _broker) = start_broker(test_config()).await;
    let mut first = TestWorker::connect_ready(addr).await;
    let mut second = TestWorker::connect_ready(addr).await;

    let http_one = tokio::spawn(async move { post_completion(addr, completion_body("one")).await });
    let http_two = tokio::spawn(async move { post_completion(addr, completion_body("two")).await });

    // Each worker is claimed for exactly one of the two dispatches.
    let request_a = first.expect_completion_request().await;
    let request_b = second.expect_completion_request().await;
    assert_ne!(request_a["request_id"], request_b["request_id"]);

    let mut seen: Vec<&str> = [&request_a, &request_b]
        .iter()
        .map(|r| {
            r["messages"].as_array().unwrap().last().unwrap()["content"]
                .as_str()
                .unwrap()
        })
        .collect();
    seen.sort();
    assert_eq!(seen, vec!["one", "two"]);

    let id_a = request_a["request_id"].as_str().unwrap().to_string();
    first.reply(&id_a, "ok").await;
    let id_b = request_b["request_id"].as_str().unwrap().to_string();
    second.reply(&id_b, "ok").await;

    for handle in [http_one, http_two] {
        let response = handle.await.unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["choices"][0]["message"]["content"], "ok");
    }
}

#[tokio::test]
async fn test_heartbeat_keeps_worker_alive_and_silence_evicts() {
    let (addr, broker) = start_broker(BrokerConfig {
        heartbeat_interval: Duration::from_millis(200),
        liveness_window: Duration::from_millis(800),
        ..test_config()
    })
    .await;
    let _eviction = broker.start_eviction();

    let mut worker = TestWorker::connect_ready(addr).await;

    // Pump heartbeat responses for longer than the liveness window; the
    // worker must survive the whole stretch.
    let _ = tokio::time::timeout(Duration::from_millis(1200), worker.next_frame()).await;
    assert_eq!(broker.registry().snapshot().await.total, 1);

    // Go silent. The eviction tick clears the worker within one window.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if broker.registry().snapshot().await.total == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "silent worker was never evicted"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ---------------------------------------------------------------------------
// Session behavior
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unknown_frame_type_is_answered_not_fatal() {
    let (addr, _broker) = start_broker(test_config()).await;
    let mut worker = TestWorker::connect_ready(addr).await;

    worker.send(json!({"type": "telemetry", "data": 42})).await;
    let error = worker.next_frame().await;
    assert_eq!(error["type"], "error");
    assert!(error["message"].as_str().unwrap().contains("telemetry"));

    // The session survived: a dispatch still round-trips.
    let http = tokio::spawn(async move { post_completion(addr, completion_body("ping")).await });
    let request = worker.expect_completion_request().await;
    let id = request["request_id"].as_str().unwrap().to_string();
    worker.reply(&id, "pong").await;
    assert_eq!(http.await.unwrap().status(), 200);
}

#[tokio::test]
async fn test_register_frame_merges_metadata_and_reacks() {
    let (addr, broker) = start_broker(test_config()).await;
    let mut worker = TestWorker::connect(addr).await;

    worker
        .send(json!({
            "type": "register",
            "worker_id": "userscript-7",
            "metadata": {"front_end": "chat-web"},
        }))
        .await;
    let ack = worker.next_frame().await;
    assert_eq!(ack["type"], "connection_established");

    // Still READY until client_ready arrives.
    assert_eq!(broker.registry().snapshot().await.idle, 0);
    worker.send(json!({"type": "client_ready"})).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if broker.registry().snapshot().await.idle == 1 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "worker never went idle");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_stats_and_health_reflect_pool() {
    let (addr, _broker) = start_broker(test_config()).await;

    let health: Value = client()
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "degraded");

    let worker = TestWorker::connect_ready(addr).await;
    // Wait for the ready frame to take effect.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let stats: Value = client()
            .get(format!("http://{addr}/stats"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if stats["idle_workers"] == 1 {
            assert_eq!(stats["total_workers"], 1);
            assert_eq!(stats["busy_workers"], 0);
            let workers = stats["workers"].as_array().unwrap();
            assert_eq!(workers.len(), 1);
            assert_eq!(workers[0]["status"], "idle");
            assert!(workers[0]["id"].as_str().unwrap().starts_with("worker_"));
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "stats never settled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let health: Value = client()
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");

    worker.close().await;
}

#[tokio::test]
async fn test_capacity_ceiling_rejects_extra_workers() {
    let (addr, _broker) = start_broker(BrokerConfig {
        max_workers: 1,
        ..test_config()
    })
    .await;

    let _first = TestWorker::connect_ready(addr).await;

    // The second connection is answered with an error frame instead of a
    // connection_established.
    let (mut socket, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("no frame")
        .expect("closed")
        .expect("read failed");
    let frame: Value = serde_json::from_str(message.to_text().unwrap()).unwrap();
    assert_eq!(frame["type"], "error");
    assert!(frame["message"].as_str().unwrap().contains("capacity"));
}
