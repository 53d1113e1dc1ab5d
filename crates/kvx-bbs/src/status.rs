// ai
//! 📊 Status — the counters, the brakes, and the big red button.
//!
//! 🧠 Knowledge graph:
//! - [`BulkByScrollStatus`]: the serializable snapshot of a run's counters.
//! - [`WorkerState`]: the coordinator's private, mutable copy. Only the batch
//!   path touches it, one batch at a time, so it needs no locks.
//! - [`RunHandle`]: the only thing shared with the outside world. It carries the
//!   cancel flag, the current throttle, and a watch channel of status snapshots.
//!
//! ⚠️ Throttling is pacing, not rate limiting. The next batch may start no
//! earlier than `last_batch_start + last_batch_size / requests_per_second`.
//! Go over once, and the next batch just waits a bit longer. 🦆

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Notify, watch};

/// 📊 Everything a run has counted so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkByScrollStatus {
    /// 📏 documents the run expects to process, capped by max-docs
    pub total: u64,
    pub updated: u64,
    pub created: u64,
    pub deleted: u64,
    pub batches: u64,
    pub version_conflicts: u64,
    pub noops: u64,
    pub bulk_retries: u64,
    pub search_retries: u64,
    /// ⏳ cumulative time spent sleeping for the throttle
    #[serde(serialize_with = "serialize_millis")]
    pub throttled: Duration,
    /// 🚦 `None` means unthrottled
    pub requests_per_second: Option<f32>,
    /// 🛑 why the run was cancelled, if it was
    pub canceled: Option<String>,
}

impl BulkByScrollStatus {
    /// ✅ Documents the run is done with, one way or another.
    pub fn successfully_processed(&self) -> u64 {
        self.created + self.updated + self.deleted + self.noops
    }
}

pub(crate) fn serialize_millis<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

// ============================================================
// 🛑 RunHandle — the outside world's remote control
// ============================================================

#[derive(Debug)]
struct HandleInner {
    cancelled: AtomicBool,
    reason: OnceLock<String>,
    /// f32 bits; `f32::INFINITY` means unthrottled
    requests_per_second: AtomicU32,
    wake: Notify,
    status: watch::Sender<BulkByScrollStatus>,
}

/// 🛑 Cancel, rethrottle, and peek at a run from any thread.
///
/// Clone it as much as you like; every clone controls the same run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    inner: Arc<HandleInner>,
}

impl Default for RunHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl RunHandle {
    pub fn new() -> Self {
        let (status, _) = watch::channel(BulkByScrollStatus::default());
        Self {
            inner: Arc::new(HandleInner {
                cancelled: AtomicBool::new(false),
                reason: OnceLock::new(),
                requests_per_second: AtomicU32::new(f32::INFINITY.to_bits()),
                wake: Notify::new(),
                status,
            }),
        }
    }

    /// 🛑 Ask the run to stop at its next decision point. First reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.inner.reason.set(reason.into());
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.wake.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.inner.reason.get().cloned()
    }

    /// 🚦 Change the pace. `None`, zero, negative, or infinite means "as fast as you can".
    /// Applies to the next throttle computation, including one already sleeping.
    pub fn rethrottle(&self, requests_per_second: Option<f32>) {
        let normalized = normalize_rps(requests_per_second);
        self.inner
            .requests_per_second
            .store(normalized.unwrap_or(f32::INFINITY).to_bits(), Ordering::SeqCst);
        self.inner.wake.notify_waiters();
    }

    pub fn requests_per_second(&self) -> Option<f32> {
        let value = f32::from_bits(self.inner.requests_per_second.load(Ordering::SeqCst));
        normalize_rps(Some(value))
    }

    /// 📊 The latest published snapshot.
    pub fn status(&self) -> BulkByScrollStatus {
        self.inner.status.borrow().clone()
    }

    /// 📡 Follow status updates as they are published.
    pub fn subscribe(&self) -> watch::Receiver<BulkByScrollStatus> {
        self.inner.status.subscribe()
    }

    pub(crate) fn publish(&self, status: &BulkByScrollStatus) {
        self.inner.status.send_replace(status.clone());
    }

    /// 😴 Sleep for `delay` unless cancelled first. `false` means a cancel cut it short.
    pub(crate) async fn nap(&self, delay: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            let woken = self.inner.wake.notified();
            tokio::pin!(woken);
            // -- 🔔 register before checking the flag, or a cancel can slip between the two
            woken.as_mut().enable();
            if self.is_cancelled() {
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                _ = woken => {}
            }
        }
    }
}

fn normalize_rps(requests_per_second: Option<f32>) -> Option<f32> {
    requests_per_second.filter(|rps| rps.is_finite() && *rps > 0.0)
}

/// ⏱️ How long to wait before starting the next batch.
///
/// `last_batch_started` is when processing of the most recent fully-processed
/// batch began; `last_batch_size` is how many hits it carried.
pub fn throttle_wait(
    requests_per_second: Option<f32>,
    last_batch_started: Instant,
    last_batch_size: usize,
    now: Instant,
) -> Duration {
    let Some(rps) = normalize_rps(requests_per_second) else {
        return Duration::ZERO;
    };
    // -- 🐌 absurdly small rates overflow Duration; they just mean "wait forever"
    let budget = Duration::try_from_secs_f64(last_batch_size as f64 / f64::from(rps))
        .unwrap_or(Duration::MAX);
    match last_batch_started.checked_add(budget) {
        Some(deadline) => deadline.saturating_duration_since(now),
        None => Duration::MAX,
    }
}

/// ⏰ Longest single throttle sleep before the deadline is recomputed.
const MAX_THROTTLE_NAP: Duration = Duration::from_secs(60 * 60);

// ============================================================
// 📊 WorkerState — the coordinator's private ledger
// ============================================================

/// 📊 The run's mutable counters. Owned by exactly one coordinator.
#[derive(Debug)]
pub(crate) struct WorkerState {
    pub(crate) status: BulkByScrollStatus,
    handle: RunHandle,
}

impl WorkerState {
    pub(crate) fn new(handle: RunHandle) -> Self {
        let status = BulkByScrollStatus {
            requests_per_second: handle.requests_per_second(),
            ..Default::default()
        };
        Self { status, handle }
    }

    pub(crate) fn handle(&self) -> &RunHandle {
        &self.handle
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    pub(crate) fn successfully_processed(&self) -> u64 {
        self.status.successfully_processed()
    }

    pub(crate) fn set_total(&mut self, total: u64) {
        self.status.total = total;
    }

    pub(crate) fn count_batch(&mut self) {
        self.status.batches += 1;
    }

    pub(crate) fn count_created(&mut self) {
        self.status.created += 1;
    }

    pub(crate) fn count_updated(&mut self) {
        self.status.updated += 1;
    }

    pub(crate) fn count_deleted(&mut self) {
        self.status.deleted += 1;
    }

    pub(crate) fn count_noop(&mut self) {
        self.status.noops += 1;
    }

    pub(crate) fn count_version_conflict(&mut self) {
        self.status.version_conflicts += 1;
    }

    pub(crate) fn count_bulk_retry(&mut self) {
        self.status.bulk_retries += 1;
    }

    pub(crate) fn count_search_retry(&mut self) {
        self.status.search_retries += 1;
    }

    pub(crate) fn count_throttled(&mut self, slept: Duration) {
        self.status.throttled += slept;
    }

    /// 📡 Refresh the derived fields and push a snapshot to the handle.
    pub(crate) fn publish(&mut self) {
        self.status.requests_per_second = self.handle.requests_per_second();
        self.status.canceled = self.handle.cancel_reason();
        self.handle.publish(&self.status);
    }

    /// 😴 Sleep off the throttle for the batch that just finished.
    ///
    /// Wakes early on cancel, and recomputes the deadline on rethrottle.
    pub(crate) async fn throttle(&mut self, last_batch_started: Instant, last_batch_size: usize) {
        let began = Instant::now();
        loop {
            let woken = self.handle.inner.wake.notified();
            tokio::pin!(woken);
            woken.as_mut().enable();
            if self.is_cancelled() {
                break;
            }
            let wait = throttle_wait(
                self.handle.requests_per_second(),
                last_batch_started,
                last_batch_size,
                Instant::now(),
            );
            if wait.is_zero() {
                break;
            }
            tokio::select! {
                // -- ⏰ capped, so a "forever" wait is just a long series of naps
                _ = tokio::time::sleep(wait.min(MAX_THROTTLE_NAP)) => {
                    if wait <= MAX_THROTTLE_NAP {
                        break;
                    }
                }
                // -- 🚦 cancel or rethrottle: go around and recompute
                _ = woken => {}
            }
        }
        let slept = began.elapsed();
        if !slept.is_zero() {
            self.count_throttled(slept);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_unthrottled_means_no_waiting() {
        let now = Instant::now();
        assert_eq!(throttle_wait(None, now, 1000, now), Duration::ZERO);
        assert_eq!(throttle_wait(Some(f32::INFINITY), now, 1000, now), Duration::ZERO);
        assert_eq!(throttle_wait(Some(0.0), now, 1000, now), Duration::ZERO);
    }

    #[test]
    fn the_one_where_the_budget_is_size_over_rate_minus_time_already_spent() {
        let started = Instant::now();
        // -- 100 docs at 50/s = 2s budget; 500ms already spent processing
        let wait = throttle_wait(Some(50.0), started, 100, started + Duration::from_millis(500));
        assert_eq!(wait, Duration::from_millis(1500));
    }

    #[test]
    fn the_one_where_slow_batches_owe_nothing() {
        let started = Instant::now();
        let wait = throttle_wait(Some(50.0), started, 100, started + Duration::from_secs(5));
        assert_eq!(wait, Duration::ZERO);
    }

    #[test]
    fn the_one_where_a_glacial_rate_saturates_instead_of_exploding() {
        let started = Instant::now();
        assert_eq!(throttle_wait(Some(1e-20), started, 10, started), Duration::MAX);
        assert_eq!(throttle_wait(Some(f32::MIN_POSITIVE), started, usize::MAX, started), Duration::MAX);
    }

    #[test]
    fn the_one_where_the_first_cancel_reason_sticks() {
        let handle = RunHandle::new();
        assert!(!handle.is_cancelled());
        handle.cancel("by user request");
        handle.cancel("by a second, less polite user");
        assert!(handle.is_cancelled());
        assert_eq!(handle.cancel_reason().as_deref(), Some("by user request"));
    }

    #[test]
    fn the_one_where_rethrottle_normalizes_nonsense() {
        let handle = RunHandle::new();
        assert_eq!(handle.requests_per_second(), None);
        handle.rethrottle(Some(25.0));
        assert_eq!(handle.requests_per_second(), Some(25.0));
        handle.rethrottle(Some(-3.0));
        assert_eq!(handle.requests_per_second(), None);
    }

    #[test]
    fn the_one_where_published_snapshots_reach_the_handle() {
        let handle = RunHandle::new();
        let mut state = WorkerState::new(handle.clone());
        state.count_created();
        state.count_noop();
        state.count_batch();
        state.publish();
        let status = handle.status();
        assert_eq!(status.created, 1);
        assert_eq!(status.batches, 1);
        assert_eq!(status.successfully_processed(), 2);
    }

    #[tokio::test]
    async fn the_one_where_rethrottle_to_unlimited_ends_the_wait() {
        let handle = RunHandle::new();
        handle.rethrottle(Some(1.0));
        let mut state = WorkerState::new(handle.clone());
        let throttler = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            throttler.rethrottle(None);
        });
        let started = Instant::now();
        state.throttle(started, 1000).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!handle.is_cancelled());
    }

    #[tokio::test]
    async fn the_one_where_a_nap_reports_being_interrupted() {
        let handle = RunHandle::new();
        assert!(handle.nap(Duration::from_millis(1)).await);
        handle.cancel("wake up");
        assert!(!handle.nap(Duration::from_secs(600)).await);
    }

    #[tokio::test]
    async fn the_one_where_cancel_cuts_a_throttle_nap_short() {
        let handle = RunHandle::new();
        handle.rethrottle(Some(1.0));
        let mut state = WorkerState::new(handle.clone());
        let canceller = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel("enough");
        });
        let started = Instant::now();
        // -- 🐌 1000 docs at 1/s would be a 16 minute nap
        state.throttle(started, 1000).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(state.status.throttled > Duration::ZERO);
    }
}
