// ai
//! 🎬 *[a cursor opens. ten thousand documents hold their breath.]*
//! *[somewhere, a bulk endpoint cracks its knuckles.]*
//! *[the operator types `cancel`, then thinks better of it. backspace. backspace.]*
//!
//! 🧠 The coordinator — the state machine that drives one bulk-by-scroll run
//! from first search to final refresh.
//!
//! ```text
//!   Start ──▶ Scrolled ──▶ Prepare ──▶ Submit ──▶ Bulked ──▶ NextScroll ──┐
//!     │          │  ▲         │  │        │          │                     │
//!     │          │  └─────────┼──┼────────┼──────────┼─────────────────────┘
//!     │          ▼            ▼  └──▶ NextScroll     ▼
//!     └──────▶ Refresh ◀──────┴───────────────── Refresh ──▶ Done
//! ```
//!
//! Every arrow is one `match` arm in [`BulkByScroll::run`]. No recursion, no
//! callback pyramids: each step returns the next [`State`] and the loop goes
//! around again. `Done` is reached exactly once, from anywhere, and the cursor
//! is closed on the way out no matter how we got there.
//!
//! ⚠️ Batches never overlap. The counters in [`WorkerState`] are touched by one
//! batch at a time, which is why they have no locks. The cancel flag is the
//! only thing the outside world can poke mid-run, and it's an atomic. 🦆

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backends::{BulkSink, Refresher, ScrollSource};
use crate::common::{
    BulkFailure, BulkItemOutcome, BulkItemSuccess, BulkRequest, BulkResponse, GetResult,
    MatchedDocument, OpType, ScrollBatch, SearchFailure, WriteOperation, WriteResult,
};
use crate::error::{BulkByScrollError, is_rejected};
use crate::request::BulkByScrollRequest;
use crate::retry::RetryableBulkSink;
use crate::status::{BulkByScrollStatus, RunHandle, WorkerState, serialize_millis};

/// 🏁 What a run hands back when it finishes without a fatal error.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    #[serde(serialize_with = "serialize_millis")]
    pub took: Duration,
    pub status: BulkByScrollStatus,
    pub bulk_failures: Vec<BulkFailure>,
    pub search_failures: Vec<SearchFailure>,
    pub timed_out: bool,
    /// 📸 "before" snapshots, when capture of old docs is on
    pub old_docs: Vec<GetResult>,
    /// 📸 "after" snapshots, when capture of new docs is on
    pub new_docs: Vec<GetResult>,
}

/// 📦 A batch that has been built and is on its way to the sink.
#[derive(Debug)]
struct PreparedBatch {
    started: Instant,
    /// hits processed in this batch, noops included; feeds the throttle
    size: usize,
    request: BulkRequest,
    /// the hit each operation came from, same order as `request.operations`
    originals: Vec<MatchedDocument>,
}

/// 🧾 Whatever non-fatal trouble the run is carrying to the finish line.
#[derive(Debug, Default)]
struct Finish {
    bulk_failures: Vec<BulkFailure>,
    search_failures: Vec<SearchFailure>,
    timed_out: bool,
}

#[derive(Debug)]
enum State {
    Start,
    Scrolled {
        batch: ScrollBatch,
        last_batch: Option<(Instant, usize)>,
    },
    Prepare(ScrollBatch),
    Submit(PreparedBatch),
    Bulked {
        prepared: PreparedBatch,
        response: BulkResponse,
    },
    NextScroll {
        batch_started: Instant,
        batch_size: usize,
    },
    Refresh(Finish),
    Done(Result<Finish, BulkByScrollError>),
}

impl State {
    /// 🛑 Cancelled: done, no error, nothing extra to report.
    fn cancelled() -> Self {
        State::Done(Ok(Finish::default()))
    }
}

enum ScrollCall {
    Start,
    Next(String),
}

/// 🚀 One bulk-by-scroll run. Build it, then [`run`](Self::run) or [`start`](Self::start) it.
#[derive(Debug)]
pub struct BulkByScroll<S, K> {
    request: BulkByScrollRequest,
    source: S,
    sink: RetryableBulkSink<K>,
    state: WorkerState,
    destinations: BTreeSet<String>,
    scroll_id: Option<String>,
    old_docs: Vec<GetResult>,
    new_docs: Vec<GetResult>,
}

impl<S, K> BulkByScroll<S, K>
where
    S: ScrollSource,
    K: BulkSink + Refresher,
{
    /// 🏗️ Validates the request up front. Nothing touches the network until `run`.
    pub fn new(
        request: BulkByScrollRequest,
        source: S,
        sink: K,
        handle: RunHandle,
    ) -> Result<Self, BulkByScrollError> {
        let request = request.validate()?;
        let sink = RetryableBulkSink::new(sink, request.backoff);
        Ok(Self {
            request,
            source,
            sink,
            state: WorkerState::new(handle),
            destinations: BTreeSet::new(),
            scroll_id: None,
            old_docs: Vec::new(),
            new_docs: Vec::new(),
        })
    }

    /// 🛑 The handle this run answers to.
    pub fn handle(&self) -> RunHandle {
        self.state.handle().clone()
    }

    /// 🧵 Spawn the run and call `on_done` exactly once with its outcome.
    pub fn start<F>(self, on_done: F) -> tokio::task::JoinHandle<()>
    where
        S: 'static,
        K: 'static,
        F: FnOnce(Result<RunResult, BulkByScrollError>) + Send + 'static,
    {
        tokio::spawn(async move {
            let outcome = self.run().await;
            on_done(outcome);
        })
    }

    /// 🔄 Drive the state machine to `Done`, close the cursor, report.
    pub async fn run(mut self) -> Result<RunResult, BulkByScrollError> {
        let started = Instant::now();
        info!(
            flavor = self.request.flavor.name(),
            indices = ?self.request.search.indices,
            batch_size = self.request.search.size,
            max_docs = ?self.request.max_docs,
            "🚀 bulk by scroll starting"
        );

        let mut state = State::Start;
        let outcome = loop {
            state = match state {
                State::Start => self.on_start().await,
                State::Scrolled { batch, last_batch } => {
                    self.on_scroll_response(batch, last_batch).await
                }
                State::Prepare(batch) => self.prepare_batch(batch),
                State::Submit(prepared) => self.submit(prepared).await,
                State::Bulked { prepared, response } => self.on_bulk_response(prepared, response),
                State::NextScroll {
                    batch_started,
                    batch_size,
                } => self.next_scroll(batch_started, batch_size).await,
                State::Refresh(finish) => self.refresh(finish).await,
                State::Done(outcome) => break outcome,
            };
        };

        self.finish(started, outcome).await
    }

    async fn on_start(&mut self) -> State {
        if self.state.is_cancelled() {
            return State::cancelled();
        }
        match self.search(ScrollCall::Start).await {
            Ok(Some(batch)) => State::Scrolled {
                batch,
                last_batch: None,
            },
            Ok(None) => State::cancelled(),
            Err(err) => State::Done(Err(err)),
        }
    }

    async fn on_scroll_response(
        &mut self,
        batch: ScrollBatch,
        last_batch: Option<(Instant, usize)>,
    ) -> State {
        if self.state.is_cancelled() {
            return State::cancelled();
        }
        if !batch.search_failures.is_empty() || batch.timed_out {
            warn!(
                failures = batch.search_failures.len(),
                timed_out = batch.timed_out,
                "💀 search reported trouble, wrapping up without touching this page"
            );
            return State::Refresh(Finish {
                bulk_failures: Vec::new(),
                search_failures: batch.search_failures,
                timed_out: batch.timed_out,
            });
        }

        let total = match self.request.max_docs {
            Some(max_docs) => batch.total_hits.min(max_docs),
            None => batch.total_hits,
        };
        self.state.set_total(total);
        self.state.publish();

        if let Some((batch_started, batch_size)) = last_batch {
            self.state.throttle(batch_started, batch_size).await;
        }
        State::Prepare(batch)
    }

    fn prepare_batch(&mut self, batch: ScrollBatch) -> State {
        if self.state.is_cancelled() {
            return State::cancelled();
        }
        if batch.hits.is_empty() {
            debug!("📭 empty page, the scroll has run dry");
            return State::Refresh(Finish::default());
        }

        let started = Instant::now();
        self.state.count_batch();
        let mut hits = batch.hits;
        if let Some(max_docs) = self.request.max_docs {
            let remaining = max_docs.saturating_sub(self.state.successfully_processed());
            let remaining = usize::try_from(remaining).unwrap_or(usize::MAX);
            if remaining < hits.len() {
                debug!(remaining, "🧢 truncating batch to stay under max_docs");
                hits.truncate(remaining);
            }
        }

        let mut operations = Vec::with_capacity(hits.len());
        let mut originals = Vec::with_capacity(hits.len());
        for hit in &hits {
            if let Err(err) = self.request.flavor.accept(hit) {
                return State::Done(Err(err));
            }
            let built = match self.request.flavor.build(hit, self.request.script.as_ref()) {
                Ok(built) => built,
                Err(err) => return State::Done(Err(err)),
            };
            match built.operation {
                Some(operation) => {
                    operations.push(operation);
                    originals.push(hit.clone());
                }
                None => self.state.count_noop(),
            }
        }

        if operations.is_empty() {
            debug!(hits = hits.len(), "🫥 nothing to write in this batch");
            self.state.publish();
            if self.max_docs_reached() {
                return State::Refresh(Finish::default());
            }
            return State::NextScroll {
                batch_started: started,
                batch_size: hits.len(),
            };
        }

        State::Submit(PreparedBatch {
            started,
            size: hits.len(),
            request: BulkRequest {
                operations,
                timeout: self.request.timeout,
                wait_for_active_shards: self.request.wait_for_active_shards.clone(),
            },
            originals,
        })
    }

    async fn submit(&mut self, prepared: PreparedBatch) -> State {
        if self.state.is_cancelled() {
            return State::cancelled();
        }
        debug!(
            operations = prepared.request.operations.len(),
            "📬 submitting bulk request"
        );
        match self.sink.submit(&prepared.request, &mut self.state).await {
            Ok(Some(response)) => State::Bulked { prepared, response },
            Ok(None) => State::cancelled(),
            Err(err) => State::Done(Err(err)),
        }
    }

    fn on_bulk_response(&mut self, prepared: PreparedBatch, response: BulkResponse) -> State {
        let mut failures = Vec::new();
        let written = response
            .items
            .into_iter()
            .zip(&prepared.request.operations)
            .zip(&prepared.originals);
        for ((item, operation), original) in written {
            let BulkItemOutcome {
                op_type,
                index,
                id,
                outcome,
            } = item;
            let success = match outcome {
                Ok(success) => success,
                Err(failure) => {
                    if failure.is_version_conflict() {
                        self.state.count_version_conflict();
                        if !self.request.abort_on_version_conflict {
                            continue;
                        }
                    }
                    failures.push(failure);
                    continue;
                }
            };
            match (op_type, success.result) {
                (_, WriteResult::Noop) => self.state.count_noop(),
                (OpType::Index | OpType::Create, WriteResult::Created) => {
                    self.state.count_created()
                }
                (OpType::Index | OpType::Create | OpType::Update, _) => {
                    self.state.count_updated()
                }
                (OpType::Delete, _) => self.state.count_deleted(),
            }
            self.capture(original, operation, id, &success);
            self.destinations.insert(index);
        }
        self.state.publish();

        if self.state.is_cancelled() {
            return State::cancelled();
        }
        if !failures.is_empty() {
            warn!(failures = failures.len(), "💀 bulk items failed, wrapping up");
            return State::Refresh(Finish {
                bulk_failures: failures,
                ..Default::default()
            });
        }
        if self.max_docs_reached() {
            debug!("🧢 max_docs reached");
            return State::Refresh(Finish::default());
        }
        State::NextScroll {
            batch_started: prepared.started,
            batch_size: prepared.size,
        }
    }

    async fn next_scroll(&mut self, batch_started: Instant, batch_size: usize) -> State {
        if self.state.is_cancelled() {
            return State::cancelled();
        }
        let Some(scroll_id) = self.scroll_id.clone() else {
            return State::Done(Err(BulkByScrollError::SearchFailed(anyhow!(
                "💀 the search returned no scroll id, so there is no next page to ask for"
            ))));
        };
        match self.search(ScrollCall::Next(scroll_id)).await {
            Ok(Some(batch)) => State::Scrolled {
                batch,
                last_batch: Some((batch_started, batch_size)),
            },
            Ok(None) => State::cancelled(),
            Err(err) => State::Done(Err(err)),
        }
    }

    async fn refresh(&mut self, finish: Finish) -> State {
        if self.state.is_cancelled() || !self.request.refresh || self.destinations.is_empty() {
            return State::Done(Ok(finish));
        }
        let indices: Vec<String> = self.destinations.iter().cloned().collect();
        debug!(?indices, "🔄 refreshing destination indices");
        match self.sink.refresh(&indices).await {
            Ok(()) => State::Done(Ok(finish)),
            // -- a refresh failure replaces whatever partial failures we were carrying
            Err(err) => State::Done(Err(BulkByScrollError::RefreshFailed(err))),
        }
    }

    /// 🏁 Close the cursor (best effort), then build the result.
    async fn finish(
        mut self,
        started: Instant,
        outcome: Result<Finish, BulkByScrollError>,
    ) -> Result<RunResult, BulkByScrollError> {
        if let Some(scroll_id) = self.scroll_id.take() {
            if let Err(err) = self.source.close(&scroll_id).await {
                warn!("⚠️ failed to close scroll [{scroll_id}], the cluster will expire it eventually: {err:#}");
            }
        }
        self.state.publish();
        let took = started.elapsed();
        let status = self.state.status.clone();

        match outcome {
            Ok(finish) => {
                info!(
                    took_ms = took.as_millis() as u64,
                    created = status.created,
                    updated = status.updated,
                    deleted = status.deleted,
                    noops = status.noops,
                    version_conflicts = status.version_conflicts,
                    canceled = ?status.canceled,
                    "🏁 bulk by scroll finished"
                );
                Ok(RunResult {
                    took,
                    status,
                    bulk_failures: finish.bulk_failures,
                    search_failures: finish.search_failures,
                    timed_out: finish.timed_out,
                    old_docs: self.old_docs,
                    new_docs: self.new_docs,
                })
            }
            Err(err) => {
                warn!("💀 bulk by scroll failed after {}ms: {err}", took.as_millis());
                Err(err)
            }
        }
    }

    /// 🔍 Start or continue the scroll, retrying rejections under the backoff policy.
    /// `Ok(None)` means a cancel interrupted the backoff.
    async fn search(&mut self, call: ScrollCall) -> Result<Option<ScrollBatch>, BulkByScrollError> {
        let mut backoff = self.request.backoff.iter();
        loop {
            let result = match &call {
                ScrollCall::Start => self.source.start(&self.request.search).await,
                ScrollCall::Next(scroll_id) => {
                    self.source
                        .next(scroll_id, self.request.search.keep_alive)
                        .await
                }
            };
            match result {
                Ok(batch) => {
                    if let Some(scroll_id) = &batch.scroll_id {
                        self.scroll_id = Some(scroll_id.clone());
                    }
                    debug!(hits = batch.hits.len(), total = batch.total_hits, "📄 scroll page received");
                    return Ok(Some(batch));
                }
                Err(err) if is_rejected(&err) => {
                    let Some(delay) = backoff.next() else {
                        return Err(BulkByScrollError::SearchFailed(err.context(format!(
                            "search still rejected after {} retries",
                            self.request.backoff.max_retries()
                        ))));
                    };
                    warn!(
                        retry_in_ms = delay.as_millis() as u64,
                        "🚦 search rejected, backing off: {err:#}"
                    );
                    self.state.count_search_retry();
                    if !self.state.handle().nap(delay).await {
                        return Ok(None);
                    }
                }
                Err(err) => return Err(BulkByScrollError::SearchFailed(err)),
            }
        }
    }

    fn max_docs_reached(&self) -> bool {
        self.request
            .max_docs
            .is_some_and(|max_docs| self.state.successfully_processed() >= max_docs)
    }

    /// 📸 Record before/after snapshots for one written operation, up to the cap.
    fn capture(
        &mut self,
        original: &MatchedDocument,
        operation: &WriteOperation,
        id: Option<String>,
        success: &BulkItemSuccess,
    ) {
        let capture = &self.request.capture;
        if capture.old && self.old_docs.len() < capture.max_docs {
            let source = original
                .parse_source()
                .ok()
                .map(|source| capture.old_filter.apply(&source));
            self.old_docs.push(GetResult {
                index: original.index.clone(),
                id: original.id.clone(),
                version: original.version,
                seq_no: original.seq_no,
                primary_term: original.primary_term,
                source,
            });
        }
        if capture.new && self.new_docs.len() < capture.max_docs {
            let snapshot = match &success.get {
                Some(get) => GetResult {
                    source: get.source.as_ref().map(|source| capture.new_filter.apply(source)),
                    ..get.clone()
                },
                None => GetResult {
                    index: operation.index().to_string(),
                    id: id
                        .or_else(|| operation.id().map(str::to_string))
                        .unwrap_or_default(),
                    version: success.version,
                    seq_no: success.seq_no,
                    primary_term: success.primary_term,
                    source: operation.source().map(|source| capture.new_filter.apply(source)),
                },
            };
            self.new_docs.push(snapshot);
        }
    }
}
