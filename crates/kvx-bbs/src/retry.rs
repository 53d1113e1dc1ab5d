// ai
//! 🔁 RetryableBulkSink — "have you tried turning the write thread pool off and on again?"
//!
//! 🎬 The cluster is busy. Not down, just busy. It answers a bulk call with
//! 429 and a polite note about its queue. Maybe the whole call bounced; maybe
//! only three items out of a thousand did. Either way, the answer is the same:
//! wait a bit (per the [`BackoffPolicy`]), then send what bounced. Only what bounced.
//!
//! 🧠 Knowledge graph:
//! - whole-request rejection → the sink returned an error wrapping [`crate::error::Rejected`]
//! - item-level rejection → an item came back with status 429
//! - anything else → not our problem, straight to the caller
//! - every retry bumps `bulk_retries`; running out of retries is fatal
//!
//! ⚠️ Outcomes are merged back into the original operation order. Item `n` of
//! the response always answers operation `n` of the request, no matter how
//! many rounds it took to get there. 🦆

use std::time::Duration;

use anyhow::anyhow;
use tracing::{debug, warn};

use crate::backends::{BulkSink, Refresher};
use crate::backoff::BackoffPolicy;
use crate::common::{BulkItemOutcome, BulkRequest, BulkResponse};
use crate::error::{BulkByScrollError, is_rejected};
use crate::status::WorkerState;

/// 🔁 Wraps a [`BulkSink`] with bounded, backoff-governed retries.
#[derive(Debug)]
pub struct RetryableBulkSink<K> {
    sink: K,
    policy: BackoffPolicy,
}

impl<K: BulkSink> RetryableBulkSink<K> {
    pub fn new(sink: K, policy: BackoffPolicy) -> Self {
        Self { sink, policy }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    pub fn into_inner(self) -> K {
        self.sink
    }

    /// 📬 Submit with retries.
    ///
    /// `Ok(None)` means the run was cancelled before any attempt produced a
    /// response. A cancel between rounds of item-level retries returns what
    /// was collected so far, with the still-rejected items left as failures.
    pub(crate) async fn submit(
        &mut self,
        request: &BulkRequest,
        state: &mut WorkerState,
    ) -> Result<Option<BulkResponse>, BulkByScrollError> {
        let mut backoff = self.policy.iter();
        let mut outcomes: Vec<Option<BulkItemOutcome>> = vec![None; request.operations.len()];
        let mut pending: Vec<usize> = (0..request.operations.len()).collect();
        let mut took = Duration::ZERO;

        loop {
            let attempt = BulkRequest {
                operations: pending
                    .iter()
                    .map(|&slot| request.operations[slot].clone())
                    .collect(),
                timeout: request.timeout,
                wait_for_active_shards: request.wait_for_active_shards.clone(),
            };

            let rejected = match self.sink.submit(&attempt).await {
                Ok(response) => {
                    if response.items.len() != pending.len() {
                        return Err(BulkByScrollError::BulkFailed(anyhow!(
                            "💀 bulk response had {} items for {} operations. Someone is miscounting, and it isn't us.",
                            response.items.len(),
                            pending.len()
                        )));
                    }
                    took += response.took;
                    let mut rejected = Vec::new();
                    for (&slot, item) in pending.iter().zip(response.items) {
                        if item.failure().is_some_and(|failure| failure.is_rejected_execution()) {
                            rejected.push(slot);
                        }
                        outcomes[slot] = Some(item);
                    }
                    if rejected.is_empty() {
                        break;
                    }
                    rejected
                }
                Err(err) if is_rejected(&err) => {
                    let Some(delay) = backoff.next() else {
                        return Err(BulkByScrollError::BulkFailed(err.context(format!(
                            "bulk request still rejected after {} retries",
                            self.policy.max_retries()
                        ))));
                    };
                    warn!(
                        retry_in_ms = delay.as_millis() as u64,
                        operations = pending.len(),
                        "🚦 bulk request rejected, backing off: {err:#}"
                    );
                    state.count_bulk_retry();
                    if !state.handle().nap(delay).await {
                        return Ok(merge(outcomes, took));
                    }
                    continue;
                }
                Err(err) => return Err(BulkByScrollError::BulkFailed(err)),
            };

            let Some(delay) = backoff.next() else {
                let sample = rejected
                    .first()
                    .and_then(|&slot| outcomes[slot].as_ref())
                    .and_then(BulkItemOutcome::failure)
                    .map(|failure| failure.cause.clone())
                    .unwrap_or_default();
                return Err(BulkByScrollError::BulkFailed(anyhow!(
                    "{} bulk items still rejected after {} retries: {sample}",
                    rejected.len(),
                    self.policy.max_retries()
                )));
            };
            debug!(
                retry_in_ms = delay.as_millis() as u64,
                rejected = rejected.len(),
                "🚦 some bulk items were rejected, resending just those"
            );
            state.count_bulk_retry();
            pending = rejected;
            if !state.handle().nap(delay).await {
                return Ok(merge(outcomes, took));
            }
        }

        Ok(merge(outcomes, took))
    }
}

impl<K: Refresher> RetryableBulkSink<K> {
    /// 🔄 Refreshes are not retried. One shot, at the very end.
    pub async fn refresh(&mut self, indices: &[String]) -> anyhow::Result<()> {
        self.sink.refresh(indices).await
    }
}

/// 🧩 Every slot filled means a complete response; any hole means nothing was ever answered.
fn merge(outcomes: Vec<Option<BulkItemOutcome>>, took: Duration) -> Option<BulkResponse> {
    let items = outcomes.into_iter().collect::<Option<Vec<_>>>()?;
    Some(BulkResponse { items, took })
}
