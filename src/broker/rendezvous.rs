//! Rendezvous table: one-shot mailboxes correlating replies with waiters.
//!
//! Each in-flight dispatch opens a slot keyed by its request id; the worker
//! session that receives the matching `completion_response` deposits into
//! it and the waiting dispatcher wakes. Slots have exactly one producer and
//! one consumer and are removed once consumed. The table has its own lock,
//! disjoint from the registry's, and the lock is never held across the
//! actual wait.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};

use crate::error::DispatchError;
use crate::protocol::{CompletionReply, WorkerId};

/// What lands in a slot: a reply payload or a terminal error kind.
pub(crate) type SlotResult = Result<CompletionReply, DispatchError>;

struct Slot {
    worker_id: WorkerId,
    opened_at: Instant,
    tx: oneshot::Sender<SlotResult>,
}

/// Consumer end of an open slot, held by the dispatcher while it waits.
#[derive(Debug)]
pub struct SlotHandle {
    request_id: String,
    rx: oneshot::Receiver<SlotResult>,
}

impl SlotHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

#[derive(Default)]
pub struct RendezvousTable {
    slots: Mutex<HashMap<String, Slot>>,
}

impl RendezvousTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new empty slot for `request_id`, assigned to `worker_id`.
    ///
    /// Ids are broker-minted, so a collision indicates a bug rather than
    /// bad input; it is surfaced instead of silently replacing the slot.
    pub async fn open(
        &self,
        request_id: &str,
        worker_id: WorkerId,
    ) -> Result<SlotHandle, DispatchError> {
        let mut slots = self.slots.lock().await;
        if slots.contains_key(request_id) {
            return Err(DispatchError::DuplicateRequestId(request_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        slots.insert(
            request_id.to_string(),
            Slot {
                worker_id,
                opened_at: Instant::now(),
                tx,
            },
        );
        Ok(SlotHandle {
            request_id: request_id.to_string(),
            rx,
        })
    }

    /// Deposit an outcome and wake the waiter. Returns false for a stray:
    /// a reply whose slot is unknown or already closed. Strays are the
    /// caller's to log; they are never fatal.
    pub async fn deposit(&self, request_id: &str, outcome: SlotResult) -> bool {
        let slot = self.slots.lock().await.remove(request_id);
        match slot {
            Some(slot) => {
                // Send fails only if the waiter already went away (caller
                // hung up); the outcome is discarded either way.
                let _ = slot.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Block until a deposit occurs or `wait` elapses. On timeout the slot
    /// is removed so a late reply becomes a stray.
    pub async fn await_reply(&self, handle: SlotHandle, wait: Duration) -> SlotResult {
        match tokio::time::timeout(wait, handle.rx).await {
            Ok(Ok(outcome)) => outcome,
            // The sender was dropped without a deposit: slot was closed
            // under us, which only happens on worker teardown races.
            Ok(Err(_)) => Err(DispatchError::WorkerGone),
            Err(_) => {
                self.close(&handle.request_id).await;
                Err(DispatchError::Timeout {
                    waited_secs: wait.as_secs(),
                })
            }
        }
    }

    /// Fail every slot assigned to `worker_id` with `worker_gone`. Used by
    /// session teardown and stale-worker eviction; one sweep per worker.
    pub async fn cancel_for_worker(&self, worker_id: &WorkerId) {
        let cancelled: Vec<Slot> = {
            let mut slots = self.slots.lock().await;
            let ids: Vec<String> = slots
                .iter()
                .filter(|(_, slot)| &slot.worker_id == worker_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| slots.remove(&id))
                .collect()
        };
        for slot in cancelled {
            tracing::debug!(
                worker_id = %worker_id,
                waited_ms = slot.opened_at.elapsed().as_millis() as u64,
                "cancelling slot for departed worker"
            );
            let _ = slot.tx.send(Err(DispatchError::WorkerGone));
        }
    }

    /// Remove a slot after a terminal outcome. Idempotent.
    pub async fn close(&self, request_id: &str) {
        self.slots.lock().await.remove(request_id);
    }

    /// Number of slots currently awaiting a reply.
    pub async fn pending(&self) -> usize {
        self.slots.lock().await.len()
    }
}
