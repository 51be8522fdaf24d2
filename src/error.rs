//! Error types for chatrelay.
//!
//! `DispatchError` carries the caller-observable kinds from the dispatch
//! path; the gateway maps them onto HTTP statuses. Registry and config
//! failures get their own enums so they can be handled where they occur
//! instead of unwinding across the transport boundary.

use thiserror::Error;

/// Top-level error for binary startup paths.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration resolution failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("invalid listen address {addr}: {reason}")]
    InvalidListenAddr { addr: String, reason: String },
}

/// Worker registry failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("worker capacity exhausted ({limit} connected)")]
    CapacityExhausted { limit: usize },
}

/// A write to a worker's transport failed.
///
/// Produced by `WorkerLink` implementations; the dispatcher and session
/// translate it into `DispatchError::Transport` or a teardown.
#[derive(Debug, Clone, Error)]
#[error("worker link send failed: {reason}")]
pub struct LinkError {
    pub reason: String,
}

/// Errors observable by completion callers.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The request carried no user message to forward.
    #[error("no user message found in the request")]
    MissingUser,

    /// No worker became idle within the acquisition window.
    #[error("no idle worker available after {waited_ms} ms")]
    NoWorker { waited_ms: u64 },

    /// Transmission to a claimed worker failed and the retry was exhausted.
    #[error("failed to transmit request to worker: {reason}")]
    Transport { reason: String },

    /// The assigned worker disconnected or was evicted before replying.
    #[error("assigned worker disconnected before replying")]
    WorkerGone,

    /// The response wait elapsed with no reply deposited.
    #[error("worker did not reply within {waited_secs} s")]
    Timeout { waited_secs: u64 },

    /// A rendezvous slot already existed for a freshly minted request id.
    /// Should not happen: ids are broker-minted.
    #[error("duplicate request id {0}")]
    DuplicateRequestId(String),

    /// The worker replied, but with an error payload instead of content.
    #[error("worker reported an error: {message}")]
    WorkerReported { message: String },
}

impl DispatchError {
    /// Stable machine-readable kind, used in the HTTP error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingUser => "missing_user",
            Self::NoWorker { .. } => "no_worker",
            Self::Transport { .. } => "transport_error",
            Self::WorkerGone => "worker_gone",
            Self::Timeout { .. } => "timeout",
            Self::DuplicateRequestId(_) => "duplicate_id",
            Self::WorkerReported { .. } => "worker_error",
        }
    }
}
