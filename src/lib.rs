//! chatrelay - OpenAI-compatible completion broker over WebSocket workers.
//!
//! HTTP callers post chat completions; a pool of worker agents (browser
//! userscripts driving third-party chat front-ends) holds persistent
//! WebSocket connections to the broker and executes them. The broker
//! normalizes each request, picks an idle worker, forwards a wire frame,
//! and correlates the worker's reply back to the waiting caller.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      chatrelay                        │
//! │                                                       │
//! │  POST /v1/chat/completions ──▶ Broker::dispatch       │
//! │                                  │                    │
//! │        WorkerRegistry ◀── claim ─┤                    │
//! │        RendezvousTable ◀─ open ──┘                    │
//! │                                                       │
//! │  GET /ws ──▶ WorkerSession (reader + heartbeat)       │
//! │        completion_response ──▶ RendezvousTable        │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod gateway;
pub mod protocol;

pub use broker::Broker;
pub use config::Config;
pub use error::{DispatchError, Error};
