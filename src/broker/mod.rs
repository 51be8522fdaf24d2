//! The request-dispatch broker.
//!
//! Owns the two pieces of shared state and the dispatch path over them:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                   Broker                      │
//! │                                               │
//! │  WorkerRegistry     liveness, status, caches  │
//! │  RendezvousTable    request-id -> reply slot  │
//! │                                               │
//! │  dispatch()   normalize -> claim -> send      │
//! │               -> await -> parse               │
//! │  eviction     periodic stale-worker sweep     │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Registry and rendezvous state are guarded by separate locks so that
//! dispatching never stalls behind registration or heartbeat bookkeeping.
//! Neither lock is held across transport I/O or a rendezvous wait. The
//! broker is a first-class object passed by handle to sessions and the
//! gateway; there is no module-level state.

mod dispatch;
pub mod normalize;
pub mod parse;
mod registry;
mod rendezvous;

pub use dispatch::Dispatched;
pub use registry::{ClaimedWorker, RegistrySnapshot, WorkerRegistry, WorkerStatus, WorkerSummary};
pub use rendezvous::{RendezvousTable, SlotHandle};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::BrokerConfig;
use crate::error::LinkError;
use crate::protocol::BrokerFrame;

/// Outbound half of a worker's transport.
///
/// Implementations must serialize writes so frames never interleave; the
/// WebSocket session does this with a mutex around the write half. Tests
/// substitute channel-backed stubs.
#[async_trait]
pub trait WorkerLink: Send + Sync {
    async fn send(&self, frame: BrokerFrame) -> Result<(), LinkError>;
}

/// The broker: worker pool state plus the dispatch path over it.
pub struct Broker {
    config: BrokerConfig,
    registry: WorkerRegistry,
    rendezvous: RendezvousTable,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let registry = WorkerRegistry::new(config.max_workers, config.liveness_window);
        Self {
            config,
            registry,
            rendezvous: RendezvousTable::new(),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn rendezvous(&self) -> &RendezvousTable {
        &self.rendezvous
    }

    /// Spawn the periodic eviction task.
    ///
    /// Runs at half the liveness window so a dead worker is removed within
    /// one window of its last heartbeat; `dispatch` additionally sweeps
    /// opportunistically before each claim.
    pub fn start_eviction(self: &Arc<Self>) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        let period = self.config.liveness_window / 2;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                broker.sweep_stale().await;
            }
        })
    }

    /// Evict workers whose heartbeat fell outside the liveness window and
    /// fail any rendezvous slot still assigned to them.
    pub(crate) async fn sweep_stale(&self) {
        let evicted = self.registry.evict_stale(std::time::Instant::now()).await;
        for worker_id in evicted {
            tracing::warn!(worker_id = %worker_id, "evicting stale worker");
            self.rendezvous.cancel_for_worker(&worker_id).await;
        }
    }
}
