//! Worker registry: the set of live workers and their scheduling state.
//!
//! All reads and writes go through one lock. Status transitions:
//! READY -> IDLE on the explicit ready signal, IDLE -> BUSY atomically with
//! selection, BUSY -> IDLE on release, any -> removed on disconnect or
//! liveness failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::broker::WorkerLink;
use crate::error::RegistryError;
use crate::protocol::WorkerId;

/// Scheduling status of a connected worker.
///
/// A freshly connected worker is READY but not selectable until it signals
/// `client_ready`; the userscript uses the gap to finish wiring up its page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Ready,
    Idle,
    Busy,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
        }
    }
}

pub(crate) struct Worker {
    pub link: Arc<dyn WorkerLink>,
    pub status: WorkerStatus,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: Instant,
    pub last_activity: Instant,
    pub metadata: HashMap<String, String>,
    /// Fingerprint of the last system prompt transmitted to this worker.
    /// Only updated on successful transmit; independent of `tools_digest`.
    pub system_prompt_digest: Option<String>,
    /// Fingerprint of the last tools catalogue transmitted to this worker.
    pub tools_digest: Option<String>,
}

/// A worker claimed for one dispatch, with the cache state snapshotted at
/// claim time so the forwarded frame can elide fresh payloads.
pub struct ClaimedWorker {
    pub id: WorkerId,
    pub link: Arc<dyn WorkerLink>,
    pub system_prompt_digest: Option<String>,
    pub tools_digest: Option<String>,
}

/// Worker counts for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
}

/// One worker's row in the stats listing.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub id: String,
    pub status: String,
    pub connected_at: DateTime<Utc>,
    pub seconds_since_heartbeat: u64,
    pub seconds_since_activity: u64,
    pub metadata: HashMap<String, String>,
}

pub struct WorkerRegistry {
    max_workers: usize,
    liveness_window: Duration,
    pub(crate) workers: RwLock<HashMap<WorkerId, Worker>>,
}

impl WorkerRegistry {
    pub fn new(max_workers: usize, liveness_window: Duration) -> Self {
        Self {
            max_workers,
            liveness_window,
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Admit a new worker in state READY and return its broker-assigned id.
    pub async fn register(
        &self,
        link: Arc<dyn WorkerLink>,
        metadata: HashMap<String, String>,
    ) -> Result<WorkerId, RegistryError> {
        let mut workers = self.workers.write().await;
        if workers.len() >= self.max_workers {
            return Err(RegistryError::CapacityExhausted {
                limit: self.max_workers,
            });
        }
        let id = WorkerId::generate();
        let now = Instant::now();
        workers.insert(
            id.clone(),
            Worker {
                link,
                status: WorkerStatus::Ready,
                connected_at: Utc::now(),
                last_heartbeat: now,
                last_activity: now,
                metadata,
                system_prompt_digest: None,
                tools_digest: None,
            },
        );
        tracing::info!(worker_id = %id, total = workers.len(), "worker registered");
        Ok(id)
    }

    /// Merge metadata from a worker's `register` frame into its record.
    pub async fn merge_metadata(&self, id: &WorkerId, extra: HashMap<String, String>) {
        if let Some(worker) = self.workers.write().await.get_mut(id) {
            worker.metadata.extend(extra);
            worker.last_activity = Instant::now();
        }
    }

    /// Transition READY or BUSY to IDLE. No-op when already IDLE or when the
    /// worker is gone.
    pub async fn mark_ready(&self, id: &WorkerId) {
        if let Some(worker) = self.workers.write().await.get_mut(id) {
            worker.status = WorkerStatus::Idle;
            worker.last_activity = Instant::now();
        }
    }

    /// Select one IDLE worker and transition it to BUSY atomically.
    ///
    /// Tie-break is most-recently-heartbeat-first: warm workers keep getting
    /// work and workers that may have drifted are biased against. Workers
    /// outside the liveness window are never returned. O(n) over the pool.
    pub async fn claim_idle(&self) -> Option<ClaimedWorker> {
        let now = Instant::now();
        let mut workers = self.workers.write().await;
        let id = workers
            .iter()
            .filter(|(_, w)| {
                w.status == WorkerStatus::Idle
                    && now.duration_since(w.last_heartbeat) < self.liveness_window
            })
            .max_by_key(|(_, w)| w.last_heartbeat)
            .map(|(id, _)| id.clone())?;

        let worker = workers.get_mut(&id)?;
        worker.status = WorkerStatus::Busy;
        worker.last_activity = now;
        Some(ClaimedWorker {
            id,
            link: Arc::clone(&worker.link),
            system_prompt_digest: worker.system_prompt_digest.clone(),
            tools_digest: worker.tools_digest.clone(),
        })
    }

    /// Transition BUSY back to IDLE. Called exactly once per successful
    /// claim; a no-op when the worker disconnected in the meantime.
    pub async fn release(&self, id: &WorkerId) {
        if let Some(worker) = self.workers.write().await.get_mut(id) {
            if worker.status == WorkerStatus::Busy {
                worker.status = WorkerStatus::Idle;
            }
            worker.last_activity = Instant::now();
        }
    }

    /// Record a heartbeat response.
    pub async fn touch(&self, id: &WorkerId) {
        if let Some(worker) = self.workers.write().await.get_mut(id) {
            let now = Instant::now();
            worker.last_heartbeat = now;
            worker.last_activity = now;
        }
    }

    /// Update the per-worker payload fingerprints after a successful
    /// transmit. A request without a tools catalogue leaves the tools
    /// fingerprint untouched.
    pub async fn commit_digests(
        &self,
        id: &WorkerId,
        system_digest: String,
        tools_digest: Option<String>,
    ) {
        if let Some(worker) = self.workers.write().await.get_mut(id) {
            worker.system_prompt_digest = Some(system_digest);
            if let Some(tools) = tools_digest {
                worker.tools_digest = Some(tools);
            }
        }
    }

    /// Remove a worker. Returns whether it was present, making session
    /// teardown idempotent.
    pub async fn remove(&self, id: &WorkerId) -> bool {
        let removed = self.workers.write().await.remove(id).is_some();
        if removed {
            tracing::info!(worker_id = %id, "worker removed");
        }
        removed
    }

    /// Drop every worker whose last heartbeat precedes `now` minus the
    /// liveness window. Returns the evicted ids so the caller can fail any
    /// rendezvous slots still assigned to them.
    pub async fn evict_stale(&self, now: Instant) -> Vec<WorkerId> {
        let mut workers = self.workers.write().await;
        let stale: Vec<WorkerId> = workers
            .iter()
            .filter(|(_, w)| now.duration_since(w.last_heartbeat) >= self.liveness_window)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            workers.remove(id);
        }
        stale
    }

    /// Per-worker rows for the stats endpoint.
    pub async fn list(&self) -> Vec<WorkerSummary> {
        let now = Instant::now();
        self.workers
            .read()
            .await
            .iter()
            .map(|(id, worker)| WorkerSummary {
                id: id.to_string(),
                status: worker.status.to_string(),
                connected_at: worker.connected_at,
                seconds_since_heartbeat: now.duration_since(worker.last_heartbeat).as_secs(),
                seconds_since_activity: now.duration_since(worker.last_activity).as_secs(),
                metadata: worker.metadata.clone(),
            })
            .collect()
    }

    /// Current worker counts.
    pub async fn snapshot(&self) -> RegistrySnapshot {
        let workers = self.workers.read().await;
        let mut idle = 0;
        let mut busy = 0;
        for worker in workers.values() {
            match worker.status {
                WorkerStatus::Idle => idle += 1,
                WorkerStatus::Busy => busy += 1,
                WorkerStatus::Ready => {}
            }
        }
        RegistrySnapshot {
            total: workers.len(),
            idle,
            busy,
        }
    }
}
