//! The dispatch path: one HTTP completion call end to end.

use std::time::{Duration, Instant};

use crate::broker::normalize::{normalize_request, NormalizedRequest};
use crate::broker::parse::{parse_completion, CompletionResult};
use crate::broker::registry::ClaimedWorker;
use crate::broker::Broker;
use crate::error::DispatchError;
use crate::gateway::openai::ChatCompletionRequest;
use crate::protocol::{mint_request_id, BrokerFrame};

/// How often the claim loop re-polls for an idle worker.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A finished dispatch: the broker-minted request id plus the parsed result.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub request_id: String,
    pub result: CompletionResult,
}

impl Broker {
    /// Dispatch one completion request to an idle worker and await the
    /// parsed reply.
    ///
    /// Many dispatches may run concurrently; each acquires at most one
    /// worker and a worker handles at most one dispatch at any instant. On
    /// every exit path the rendezvous slot is closed and, when the worker
    /// still exists, it is released exactly once.
    pub async fn dispatch(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<Dispatched, DispatchError> {
        let normalized = normalize_request(request)?;

        // One retry on a fresh worker when the first transmit fails.
        let mut attempts = 0;
        let acquire_deadline = Instant::now() + self.config().acquire_wait;
        loop {
            attempts += 1;
            let claimed = self.acquire_worker(acquire_deadline).await?;
            match self.dispatch_to(&normalized, claimed).await {
                Err(DispatchError::Transport { reason }) if attempts < 2 => {
                    tracing::warn!(reason = %reason, "transmit failed, retrying on another worker");
                }
                outcome => return outcome,
            }
        }
    }

    /// Poll for an idle worker until the acquisition deadline, sweeping
    /// stale workers before each attempt.
    async fn acquire_worker(&self, deadline: Instant) -> Result<ClaimedWorker, DispatchError> {
        let started = Instant::now();
        loop {
            self.sweep_stale().await;
            if let Some(claimed) = self.registry().claim_idle().await {
                return Ok(claimed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(DispatchError::NoWorker {
                    waited_ms: now.duration_since(started).as_millis() as u64,
                });
            }
            tokio::time::sleep(CLAIM_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Run one attempt against a claimed worker.
    async fn dispatch_to(
        &self,
        normalized: &NormalizedRequest,
        claimed: ClaimedWorker,
    ) -> Result<Dispatched, DispatchError> {
        let request_id = mint_request_id();

        let system_cached =
            claimed.system_prompt_digest.as_deref() == Some(normalized.system_digest.as_str());
        let tools_cached = normalized.tools_digest.is_some()
            && claimed.tools_digest == normalized.tools_digest;
        let frame = normalized.forwarded(&request_id, system_cached, tools_cached);

        tracing::info!(
            request_id = %request_id,
            worker_id = %claimed.id,
            system_cached,
            tools_cached,
            "dispatching completion request"
        );

        let handle = match self.rendezvous().open(&request_id, claimed.id.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                self.registry().release(&claimed.id).await;
                return Err(e);
            }
        };

        if let Err(e) = claimed.link.send(BrokerFrame::CompletionRequest(frame)).await {
            self.rendezvous().close(&request_id).await;
            // A failed write means the transport is broken: drop the worker
            // now instead of releasing it back into the idle pool, so the
            // retry lands on a different one. Session teardown, if it also
            // fires, is idempotent.
            self.registry().remove(&claimed.id).await;
            self.rendezvous().cancel_for_worker(&claimed.id).await;
            return Err(DispatchError::Transport {
                reason: e.to_string(),
            });
        }

        // Successful transmit commits the worker's payload caches. A reply
        // arriving after a later timeout never touches them again.
        self.registry()
            .commit_digests(
                &claimed.id,
                normalized.system_digest.clone(),
                normalized.tools_digest.clone(),
            )
            .await;

        let outcome = self
            .rendezvous()
            .await_reply(handle, self.config().response_wait)
            .await;

        match outcome {
            Ok(reply) => {
                self.registry().release(&claimed.id).await;
                if let Some(error) = reply.error.as_ref() {
                    let message = error
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("unspecified worker error")
                        .to_string();
                    return Err(DispatchError::WorkerReported { message });
                }
                let result = parse_completion(&reply);
                tracing::info!(
                    request_id = %request_id,
                    content_len = result.content.len(),
                    tool_calls = result.tool_calls.len(),
                    finish_reason = result.finish_reason.as_str(),
                    "completion finished"
                );
                Ok(Dispatched { request_id, result })
            }
            Err(DispatchError::Timeout { waited_secs }) => {
                // The worker may still answer later; that reply will be a
                // stray. Give the worker back so it stays selectable.
                tracing::warn!(
                    request_id = %request_id,
                    worker_id = %claimed.id,
                    waited_secs,
                    "response wait elapsed"
                );
                self.registry().release(&claimed.id).await;
                Err(DispatchError::Timeout { waited_secs })
            }
            Err(err) => {
                // worker_gone and friends: teardown already removed the
                // worker and swept its slots.
                Err(err)
            }
        }
    }
}
