//! # Previously, on Kravex...
//!
//! 🎬 The cluster was down for maintenance. The tests still had to run. Someone
//! had to pretend to be a search engine, convincingly enough to fool a state
//! machine, and cheaply enough to do it ten thousand times a CI run.
//!
//! That someone was this module.
//!
//! `in_mem` provides an in-memory [`ScrollSource`], [`BulkSink`] and
//! [`Refresher`]. The source pages through a `Vec` of hits. The sink keeps a
//! tiny document store so it can honestly answer "created" versus "updated".
//! Both keep a journal behind an `Arc<Mutex<...>>` so tests can inspect what
//! happened after handing the backends off to a run. Both can be told to
//! misbehave on cue: rejected requests, failed items, failed pages, failed refreshes.
//!
//! 🦆
//!
//! ⚠️ This is for tests and dry runs. If you're deploying this to prod as your
//! actual datastore, please also deploy a therapist.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::backends::{BulkSink, Refresher, ScrollSource};
use crate::common::{
    BulkFailure, BulkItemOutcome, BulkItemSuccess, BulkRequest, BulkResponse, GetResult,
    JSON_CONTENT_TYPE, MatchedDocument, ScrollBatch, SearchFailure, SearchRequest,
    WriteOperation, WriteResult,
};
use crate::error::Rejected;

// ============================================================
// 🔍 InMemoryScrollSource
// ============================================================

/// 📄 One document as written in a config file for a dry run.
#[derive(Debug, Deserialize, Clone)]
pub struct InMemoryDocument {
    pub index: String,
    pub id: String,
    #[serde(default)]
    pub routing: Option<String>,
    pub source: Value,
}

/// 🔧 Config for the in-memory source: the documents, inline. That's it.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct InMemorySourceConfig {
    #[serde(default)]
    pub documents: Vec<InMemoryDocument>,
}

/// 📒 Everything the in-memory source was asked to do.
#[derive(Debug, Default, Clone)]
pub struct ScrollJournal {
    pub starts: u32,
    pub nexts: u32,
    /// 🎟️ every scroll id that was closed, in order
    pub closed: Vec<String>,
}

#[derive(Debug, Default)]
struct ScrollScript {
    /// page number (0 = first page) → failures reported with that page
    failing_pages: HashMap<usize, Vec<SearchFailure>>,
    timed_out_pages: Vec<usize>,
    /// 🚦 how many upcoming start/next calls bounce with `Rejected`
    rejections: u32,
    start_error: Option<String>,
    close_error: Option<String>,
}

/// 📦 A scroll cursor over a `Vec`. Pages come out in order, `page_size` at a time.
#[derive(Debug, Clone)]
pub struct InMemoryScrollSource {
    documents: Arc<Vec<MatchedDocument>>,
    page_size: usize,
    /// 📏 when set, pages are this big no matter what the request asked for
    fixed_page_size: Option<usize>,
    next_page: usize,
    script: Arc<Mutex<ScrollScript>>,
    journal: Arc<Mutex<ScrollJournal>>,
}

impl InMemoryScrollSource {
    pub fn new(documents: Vec<MatchedDocument>) -> Self {
        Self {
            documents: Arc::new(documents),
            page_size: 0,
            fixed_page_size: None,
            next_page: 0,
            script: Arc::new(Mutex::new(ScrollScript::default())),
            journal: Arc::new(Mutex::new(ScrollJournal::default())),
        }
    }

    /// 🏗️ Build from config — turns the inline JSON documents into hits.
    pub fn from_config(config: InMemorySourceConfig) -> Result<Self> {
        let documents = config
            .documents
            .into_iter()
            .map(|doc| {
                Ok(MatchedDocument {
                    index: doc.index,
                    id: doc.id,
                    routing: doc.routing,
                    version: Some(1),
                    seq_no: Some(0),
                    primary_term: Some(1),
                    source: Some(serde_json::to_string(&doc.source)?),
                    content_type: JSON_CONTENT_TYPE.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(documents))
    }

    /// 📏 Serve `page_size` hits per page, ignoring the request's size. Cursors don't always listen.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.fixed_page_size = Some(page_size);
        self
    }

    /// 💀 Report `failure` on page `page` (0-based) instead of serving hits normally.
    pub async fn fail_page(&self, page: usize, failure: SearchFailure) {
        self.script
            .lock()
            .await
            .failing_pages
            .entry(page)
            .or_default()
            .push(failure);
    }

    /// ⏱️ Flag page `page` as timed out.
    pub async fn time_out_page(&self, page: usize) {
        self.script.lock().await.timed_out_pages.push(page);
    }

    /// 🚦 Bounce the next `n` start/next calls with a retryable rejection.
    pub async fn reject_next_calls(&self, n: u32) {
        self.script.lock().await.rejections = n;
    }

    pub async fn fail_start(&self, reason: impl Into<String>) {
        self.script.lock().await.start_error = Some(reason.into());
    }

    pub async fn fail_close(&self, reason: impl Into<String>) {
        self.script.lock().await.close_error = Some(reason.into());
    }

    /// 📒 A copy of the journal. Shared across clones.
    pub async fn journal(&self) -> ScrollJournal {
        self.journal.lock().await.clone()
    }

    async fn serve_page(&mut self) -> Result<ScrollBatch> {
        let page = self.next_page;
        self.next_page += 1;

        let script = self.script.lock().await;
        let from = (page * self.page_size).min(self.documents.len());
        let to = (from + self.page_size).min(self.documents.len());
        Ok(ScrollBatch {
            scroll_id: Some(format!("mem-scroll-{page}")),
            hits: self.documents[from..to].to_vec(),
            total_hits: self.documents.len() as u64,
            search_failures: script.failing_pages.get(&page).cloned().unwrap_or_default(),
            timed_out: script.timed_out_pages.contains(&page),
        })
    }

    async fn take_rejection(&self) -> Result<()> {
        let mut script = self.script.lock().await;
        if script.rejections > 0 {
            script.rejections -= 1;
            return Err(Rejected::new("search thread pool queue is full").into());
        }
        Ok(())
    }
}

#[async_trait]
impl ScrollSource for InMemoryScrollSource {
    async fn start(&mut self, request: &SearchRequest) -> Result<ScrollBatch> {
        self.journal.lock().await.starts += 1;
        if let Some(reason) = self.script.lock().await.start_error.clone() {
            anyhow::bail!("💀 {reason}");
        }
        self.take_rejection().await?;
        self.page_size = self.fixed_page_size.unwrap_or(request.size).max(1);
        self.next_page = 0;
        self.serve_page().await
    }

    async fn next(&mut self, _scroll_id: &str, _keep_alive: Duration) -> Result<ScrollBatch> {
        self.journal.lock().await.nexts += 1;
        self.take_rejection().await?;
        self.serve_page().await
    }

    async fn close(&mut self, scroll_id: &str) -> Result<()> {
        self.journal.lock().await.closed.push(scroll_id.to_string());
        if let Some(reason) = self.script.lock().await.close_error.clone() {
            anyhow::bail!("💀 {reason}");
        }
        Ok(())
    }
}

// ============================================================
// 🕳️ InMemoryBulkSink
// ============================================================

/// 🔧 Config for the in-memory sink. Nothing to configure; it's RAM.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct InMemorySinkConfig {}

/// 📒 Everything the in-memory sink was asked to do.
#[derive(Debug, Default, Clone)]
pub struct BulkJournal {
    /// every submit call, including the ones that bounced
    pub attempts: u32,
    /// 📬 every request that was actually applied, in order
    pub submissions: Vec<BulkRequest>,
    pub refreshes: Vec<Vec<String>>,
}

impl BulkJournal {
    /// ✍️ Every operation that was applied, flattened across submissions.
    pub fn operations(&self) -> Vec<&WriteOperation> {
        self.submissions
            .iter()
            .flat_map(|request| request.operations.iter())
            .collect()
    }
}

#[derive(Debug, Clone)]
struct StoredDocument {
    version: i64,
    seq_no: i64,
    source: Map<String, Value>,
}

#[derive(Debug, Default)]
struct SinkState {
    journal: BulkJournal,
    store: BTreeMap<(String, String), StoredDocument>,
    next_seq_no: i64,
    auto_id: u64,
    /// 🚦 whole-request rejections still to hand out
    request_rejections: u32,
    /// 🚦 doc id → item-level 429s still to hand out
    item_rejections: HashMap<String, u32>,
    /// 💀 doc id → permanent (status, cause)
    item_failures: HashMap<String, (u16, String)>,
    fatal_error: Option<String>,
    refresh_error: Option<String>,
    return_documents: bool,
}

/// 📦 A sink that never forgets, with a tiny versioned document store inside.
///
/// Clone-able because tests need to peek inside after handing `self` off to
/// the run. Every clone shares the same store and journal.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBulkSink {
    state: Arc<Mutex<SinkState>>,
}

impl InMemoryBulkSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 📥 Seed the store so later index ops report `updated` instead of `created`.
    pub async fn with_existing(self, index: &str, id: &str, source: Value) -> Self {
        {
            let mut state = self.state.lock().await;
            let seq_no = state.next_seq_no;
            state.next_seq_no += 1;
            let source = match source {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            state.store.insert(
                (index.to_string(), id.to_string()),
                StoredDocument {
                    version: 1,
                    seq_no,
                    source,
                },
            );
        }
        self
    }

    /// 🚦 Bounce the next `n` submit calls as a whole with a retryable rejection.
    pub async fn reject_requests(self, n: u32) -> Self {
        self.state.lock().await.request_rejections = n;
        self
    }

    /// 🚦 Answer the item for `id` with a 429 the next `n` times it shows up.
    pub async fn reject_item(self, id: &str, n: u32) -> Self {
        self.state
            .lock()
            .await
            .item_rejections
            .insert(id.to_string(), n);
        self
    }

    /// 💀 Fail the item for `id` with `status` every time it shows up.
    pub async fn fail_item(self, id: &str, status: u16, cause: &str) -> Self {
        self.state
            .lock()
            .await
            .item_failures
            .insert(id.to_string(), (status, cause.to_string()));
        self
    }

    /// 💀 Fail every submit call with a non-retryable error.
    pub async fn fail_requests(self, reason: &str) -> Self {
        self.state.lock().await.fatal_error = Some(reason.to_string());
        self
    }

    pub async fn fail_refresh(self, reason: &str) -> Self {
        self.state.lock().await.refresh_error = Some(reason.to_string());
        self
    }

    /// 📸 Embed the stored document in every successful item, like `_source` on the response.
    pub async fn returning_documents(self) -> Self {
        self.state.lock().await.return_documents = true;
        self
    }

    pub async fn journal(&self) -> BulkJournal {
        self.state.lock().await.journal.clone()
    }

    /// 🔍 What the store currently holds for `index`/`id`.
    pub async fn document(&self, index: &str, id: &str) -> Option<Map<String, Value>> {
        self.state
            .lock()
            .await
            .store
            .get(&(index.to_string(), id.to_string()))
            .map(|doc| doc.source.clone())
    }

    pub async fn document_count(&self) -> usize {
        self.state.lock().await.store.len()
    }
}

impl SinkState {
    fn apply(&mut self, operation: &WriteOperation) -> BulkItemOutcome {
        let op_type = operation.op_type();
        let index = operation.index().to_string();
        let id = match operation.id() {
            Some(id) => id.to_string(),
            None => {
                self.auto_id += 1;
                format!("auto-{}", self.auto_id)
            }
        };
        let fail = |status: u16, cause: String| BulkItemOutcome {
            op_type,
            index: index.clone(),
            id: Some(id.clone()),
            outcome: Err(BulkFailure {
                index: index.clone(),
                id: Some(id.clone()),
                status,
                cause,
            }),
        };

        if let Some(left) = self.item_rejections.get_mut(&id) {
            if *left > 0 {
                *left -= 1;
                return fail(429, "es_rejected_execution_exception".to_string());
            }
        }
        if let Some((status, cause)) = self.item_failures.get(&id) {
            return fail(*status, cause.clone());
        }

        let key = (index.clone(), id.clone());
        let existing = self.store.get(&key).cloned();
        if let Some(conflict) = check_concurrency(operation, existing.as_ref()) {
            return fail(409, conflict);
        }

        let seq_no = self.next_seq_no;
        self.next_seq_no += 1;
        let (result, stored) = match operation {
            WriteOperation::Index(op) => {
                let version = match (op.version, op.version_type) {
                    (Some(v), crate::common::VersionType::External)
                    | (Some(v), crate::common::VersionType::ExternalGte) => v,
                    _ => existing.as_ref().map_or(1, |doc| doc.version + 1),
                };
                let result = if existing.is_some() {
                    WriteResult::Updated
                } else {
                    WriteResult::Created
                };
                let doc = StoredDocument {
                    version,
                    seq_no,
                    source: op.source.clone(),
                };
                self.store.insert(key, doc.clone());
                (result, Some(doc))
            }
            WriteOperation::Update(op) => match existing {
                Some(mut doc) => {
                    for (field, value) in &op.doc {
                        doc.source.insert(field.clone(), value.clone());
                    }
                    doc.version += 1;
                    doc.seq_no = seq_no;
                    self.store.insert(key, doc.clone());
                    (WriteResult::Updated, Some(doc))
                }
                None => return fail(404, "document_missing_exception".to_string()),
            },
            WriteOperation::Delete(_) => match self.store.remove(&key) {
                Some(doc) => (
                    WriteResult::Deleted,
                    Some(StoredDocument {
                        version: doc.version + 1,
                        seq_no,
                        source: Map::new(),
                    }),
                ),
                None => (WriteResult::NotFound, None),
            },
        };

        let get = match (&stored, self.return_documents, operation) {
            (Some(doc), true, WriteOperation::Index(_) | WriteOperation::Update(_)) => {
                Some(GetResult {
                    index: index.clone(),
                    id: id.clone(),
                    version: Some(doc.version),
                    seq_no: Some(doc.seq_no),
                    primary_term: Some(1),
                    source: Some(doc.source.clone()),
                })
            }
            _ => None,
        };

        BulkItemOutcome {
            op_type,
            index,
            id: Some(id),
            outcome: Ok(BulkItemSuccess {
                result,
                version: stored.as_ref().map(|doc| doc.version),
                seq_no: Some(seq_no),
                primary_term: Some(1),
                get,
            }),
        }
    }
}

/// 🔒 Optimistic concurrency: seq_no CAS and external versioning. Returns the conflict cause.
fn check_concurrency(operation: &WriteOperation, existing: Option<&StoredDocument>) -> Option<String> {
    let (if_seq_no, version, version_type) = match operation {
        WriteOperation::Index(op) => (op.if_seq_no, op.version, op.version_type),
        WriteOperation::Update(op) => (op.if_seq_no, None, crate::common::VersionType::Internal),
        WriteOperation::Delete(op) => (op.if_seq_no, op.version, op.version_type),
    };
    if let Some(expected) = if_seq_no {
        let actual = existing.map(|doc| doc.seq_no);
        if actual != Some(expected) {
            return Some(format!(
                "version_conflict_engine_exception: required seqNo [{expected}], current [{actual:?}]"
            ));
        }
    }
    if let (Some(version), Some(doc)) = (version, existing) {
        let conflict = match version_type {
            crate::common::VersionType::External => version <= doc.version,
            crate::common::VersionType::ExternalGte => version < doc.version,
            crate::common::VersionType::Internal => version != doc.version,
        };
        if conflict {
            return Some(format!(
                "version_conflict_engine_exception: current version [{}] vs provided [{version}]",
                doc.version
            ));
        }
    }
    if let WriteOperation::Index(op) = operation {
        if op.op_type == crate::common::IndexOpType::Create && existing.is_some() {
            return Some("version_conflict_engine_exception: document already exists".to_string());
        }
    }
    None
}

#[async_trait]
impl BulkSink for InMemoryBulkSink {
    async fn submit(&mut self, request: &BulkRequest) -> Result<BulkResponse> {
        let mut state = self.state.lock().await;
        state.journal.attempts += 1;
        if let Some(reason) = state.fatal_error.clone() {
            anyhow::bail!("💀 {reason}");
        }
        if state.request_rejections > 0 {
            state.request_rejections -= 1;
            return Err(Rejected::new("write thread pool queue is full").into());
        }
        let items = request
            .operations
            .iter()
            .map(|operation| state.apply(operation))
            .collect();
        state.journal.submissions.push(request.clone());
        Ok(BulkResponse {
            items,
            took: Duration::from_millis(1),
        })
    }
}

#[async_trait]
impl Refresher for InMemoryBulkSink {
    async fn refresh(&mut self, indices: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.journal.refreshes.push(indices.to_vec());
        if let Some(reason) = state.refresh_error.clone() {
            anyhow::bail!("💀 {reason}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{IndexOpType, IndexOperation, VersionType};
    use serde_json::json;

    fn docs(n: usize) -> Vec<MatchedDocument> {
        (0..n)
            .map(|i| MatchedDocument::new("src", i.to_string(), format!(r#"{{"n":{i}}}"#)))
            .collect()
    }

    fn search(size: usize) -> SearchRequest {
        SearchRequest {
            indices: vec!["src".into()],
            query: json!({"match_all": {}}),
            sort: vec![],
            size,
            keep_alive: Duration::from_secs(60),
        }
    }

    fn index_op(id: &str) -> WriteOperation {
        WriteOperation::Index(IndexOperation {
            index: "dest".into(),
            id: Some(id.into()),
            routing: None,
            version: None,
            version_type: VersionType::Internal,
            if_seq_no: None,
            if_primary_term: None,
            op_type: IndexOpType::Index,
            source: json!({"id": id}).as_object().cloned().unwrap_or_default(),
        })
    }

    fn bulk(ops: Vec<WriteOperation>) -> BulkRequest {
        BulkRequest {
            operations: ops,
            timeout: Duration::from_secs(1),
            wait_for_active_shards: "1".into(),
        }
    }

    #[tokio::test]
    async fn the_one_where_pages_come_out_in_order_and_then_run_dry() -> Result<()> {
        let mut source = InMemoryScrollSource::new(docs(5));
        let first = source.start(&search(2)).await?;
        assert_eq!(first.hits.len(), 2);
        assert_eq!(first.total_hits, 5);
        let second = source.next("mem-scroll-0", Duration::from_secs(1)).await?;
        assert_eq!(second.hits[0].id, "2");
        let third = source.next("mem-scroll-1", Duration::from_secs(1)).await?;
        assert_eq!(third.hits.len(), 1);
        let fourth = source.next("mem-scroll-2", Duration::from_secs(1)).await?;
        assert!(fourth.hits.is_empty());
        assert_eq!(source.journal().await.nexts, 3);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_page_reports_shard_trouble() -> Result<()> {
        let mut source = InMemoryScrollSource::new(docs(4));
        source.fail_page(1, SearchFailure::new("shard went fishing")).await;
        assert!(source.start(&search(2)).await?.search_failures.is_empty());
        let second = source.next("mem-scroll-0", Duration::from_secs(1)).await?;
        assert_eq!(second.search_failures.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_source_bounces_then_recovers() -> Result<()> {
        let mut source = InMemoryScrollSource::new(docs(1));
        source.reject_next_calls(1).await;
        let err = source.start(&search(1)).await.unwrap_err();
        assert!(crate::error::is_rejected(&err));
        assert_eq!(source.start(&search(1)).await?.hits.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_sink_knows_created_from_updated() -> Result<()> {
        let mut sink = InMemoryBulkSink::new()
            .with_existing("dest", "old", json!({"stale": true}))
            .await;
        let response = sink.submit(&bulk(vec![index_op("old"), index_op("new")])).await?;
        let results: Vec<_> = response
            .items
            .iter()
            .map(|item| item.outcome.as_ref().map(|ok| ok.result).ok())
            .collect();
        assert_eq!(
            results,
            vec![Some(WriteResult::Updated), Some(WriteResult::Created)]
        );
        assert_eq!(sink.document_count().await, 2);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_stale_seq_no_is_a_conflict() -> Result<()> {
        let mut sink = InMemoryBulkSink::new()
            .with_existing("dest", "1", json!({}))
            .await;
        let mut op = index_op("1");
        if let WriteOperation::Index(index) = &mut op {
            index.if_seq_no = Some(99);
        }
        let response = sink.submit(&bulk(vec![op])).await?;
        assert!(response.items[0].failure().is_some_and(BulkFailure::is_version_conflict));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_rejected_requests_are_not_applied() -> Result<()> {
        let mut sink = InMemoryBulkSink::new().reject_requests(1).await;
        assert!(sink.submit(&bulk(vec![index_op("1")])).await.is_err());
        sink.submit(&bulk(vec![index_op("1")])).await?;
        let journal = sink.journal().await;
        assert_eq!(journal.attempts, 2);
        assert_eq!(journal.submissions.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_config_documents_become_hits() -> Result<()> {
        let config: InMemorySourceConfig = serde_json::from_value(json!({
            "documents": [{"index": "a", "id": "1", "source": {"x": 1}}]
        }))?;
        let mut source = InMemoryScrollSource::from_config(config)?;
        let page = source.start(&search(10)).await?;
        assert_eq!(page.hits[0].parse_source()?["x"], 1);
        Ok(())
    }
}
