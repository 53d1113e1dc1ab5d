// ai
//! 📦 Common data structures — the cargo manifest of a bulk-by-scroll run.
//!
//! 🎬 COLD OPEN — INT. DATA CENTER — 3:47 AM
//!
//! A scroll page lands. Ten thousand `MatchedDocument`s blink awake, each one
//! clutching its `_seq_no` like a boarding pass. None of them know they are
//! about to be rewritten. Some of them will come back as `Delete`s. A few
//! will be told, gently, that they were a `noop` all along. 🦆
//!
//! This module holds the nouns. The verbs live in `flavors`, `retry` and
//! `coordinator`.
//!
//! 🧠 Knowledge graph:
//! - search side: [`SearchRequest`] → [`ScrollBatch`] of [`MatchedDocument`] + [`SearchFailure`]
//! - write side: [`WriteOperation`] → [`BulkRequest`] → [`BulkResponse`] of [`BulkItemOutcome`]
//! - capture side: [`GetResult`] snapshots, before and after

use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

/// 🎯 The content type we can actually parse `_source` as.
pub const JSON_CONTENT_TYPE: &str = "application/json";

// ============================================================
// 🔍 Search side
// ============================================================

/// 🔍 What to ask the search cursor for. Built once per run.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    /// 📚 indices to search. Empty means "all of them" and is generally a bad idea.
    pub indices: Vec<String>,
    pub query: Value,
    /// 🔃 sort clauses; `[{"_doc": "asc"}]` when the caller supplied none
    pub sort: Vec<Value>,
    /// 📦 hits per scroll page
    pub size: usize,
    /// ⏳ how long the server keeps the cursor warm between pages
    pub keep_alive: Duration,
}

/// 🎯 One search hit, about to be mutated.
///
/// Immutable once the search layer hands it over. Lives for exactly one batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatchedDocument {
    pub index: String,
    pub id: String,
    pub routing: Option<String>,
    pub version: Option<i64>,
    pub seq_no: Option<i64>,
    pub primary_term: Option<i64>,
    /// 📦 raw `_source` bytes; `None` when `_source` is disabled on the index
    pub source: Option<String>,
    pub content_type: String,
}

impl MatchedDocument {
    /// 🏗️ A JSON hit with a source. The common case, and the test-friendly one.
    pub fn new(index: impl Into<String>, id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            id: id.into(),
            source: Some(source.into()),
            content_type: JSON_CONTENT_TYPE.to_string(),
            ..Default::default()
        }
    }

    /// 🔧 Parse the raw source into a JSON object. Non-object sources are a hard no.
    pub fn parse_source(&self) -> anyhow::Result<Map<String, Value>> {
        let raw = self.source.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "💀 document [{}][{}] has no _source to parse",
                self.index,
                self.id
            )
        })?;
        match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => Ok(map),
            other => anyhow::bail!(
                "💀 document [{}][{}] has a _source that is not an object: {}",
                self.index,
                self.id,
                other
            ),
        }
    }
}

/// 💀 A per-shard search failure, reported alongside (not instead of) a response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchFailure {
    pub index: Option<String>,
    pub shard: Option<u32>,
    pub node: Option<String>,
    pub status: Option<u16>,
    pub reason: String,
}

impl SearchFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            index: None,
            shard: None,
            node: None,
            status: None,
            reason: reason.into(),
        }
    }
}

/// 📄 One page of hits from the cursor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScrollBatch {
    /// 🎟️ the cursor token for the *next* page; may change between pages
    pub scroll_id: Option<String>,
    pub hits: Vec<MatchedDocument>,
    /// 📊 total matched across the whole result set, not just this page
    pub total_hits: u64,
    pub search_failures: Vec<SearchFailure>,
    pub timed_out: bool,
}

// ============================================================
// ✍️ Write side
// ============================================================

/// 🔢 How the destination should interpret a supplied version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionType {
    #[default]
    Internal,
    External,
    ExternalGte,
}

impl VersionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionType::Internal => "internal",
            VersionType::External => "external",
            VersionType::ExternalGte => "external_gte",
        }
    }
}

/// 🏷️ `index` overwrites, `create` refuses to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexOpType {
    #[default]
    Index,
    Create,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexOperation {
    pub index: String,
    /// `None` lets the destination auto-generate one
    pub id: Option<String>,
    pub routing: Option<String>,
    pub version: Option<i64>,
    pub version_type: VersionType,
    pub if_seq_no: Option<i64>,
    pub if_primary_term: Option<i64>,
    pub op_type: IndexOpType,
    pub source: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOperation {
    pub index: String,
    pub id: String,
    pub routing: Option<String>,
    pub if_seq_no: Option<i64>,
    pub if_primary_term: Option<i64>,
    /// partial document merged into the stored one
    pub doc: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteOperation {
    pub index: String,
    pub id: String,
    pub routing: Option<String>,
    pub version: Option<i64>,
    pub version_type: VersionType,
    pub if_seq_no: Option<i64>,
    pub if_primary_term: Option<i64>,
}

/// ✍️ The mutation derived from a [`MatchedDocument`]. Consumed by the bulk sink.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOperation {
    Index(IndexOperation),
    Update(UpdateOperation),
    Delete(DeleteOperation),
}

impl WriteOperation {
    pub fn index(&self) -> &str {
        match self {
            WriteOperation::Index(op) => &op.index,
            WriteOperation::Update(op) => &op.index,
            WriteOperation::Delete(op) => &op.index,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            WriteOperation::Index(op) => op.id.as_deref(),
            WriteOperation::Update(op) => Some(&op.id),
            WriteOperation::Delete(op) => Some(&op.id),
        }
    }

    /// 📦 The body this operation writes, if it writes one at all.
    pub fn source(&self) -> Option<&Map<String, Value>> {
        match self {
            WriteOperation::Index(op) => Some(&op.source),
            WriteOperation::Update(op) => Some(&op.doc),
            WriteOperation::Delete(_) => None,
        }
    }

    pub fn op_type(&self) -> OpType {
        match self {
            WriteOperation::Index(op) if op.op_type == IndexOpType::Create => OpType::Create,
            WriteOperation::Index(_) => OpType::Index,
            WriteOperation::Update(_) => OpType::Update,
            WriteOperation::Delete(_) => OpType::Delete,
        }
    }
}

/// 📬 One bulk call's worth of operations plus the knobs the sink forwards.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkRequest {
    pub operations: Vec<WriteOperation>,
    pub timeout: Duration,
    pub wait_for_active_shards: String,
}

/// 🏷️ The action key a bulk item came back under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Index,
    Create,
    Update,
    Delete,
}

/// 📋 What the destination says it did with a successful item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteResult {
    Created,
    Updated,
    Deleted,
    NotFound,
    Noop,
}

/// 📸 A point-in-time view of a document. Used for before/after capture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GetResult {
    pub index: String,
    pub id: String,
    pub version: Option<i64>,
    pub seq_no: Option<i64>,
    pub primary_term: Option<i64>,
    pub source: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemSuccess {
    pub result: WriteResult,
    pub version: Option<i64>,
    pub seq_no: Option<i64>,
    pub primary_term: Option<i64>,
    /// 📸 the document as the destination stored it, when it was asked to return it
    pub get: Option<GetResult>,
}

/// 💀 A per-item write failure. Siblings in the same bulk call may have succeeded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkFailure {
    pub index: String,
    pub id: Option<String>,
    pub status: u16,
    pub cause: String,
}

/// 🚦 HTTP 409, a.k.a. "someone got there first".
pub const VERSION_CONFLICT_STATUS: u16 = 409;
/// 🚦 HTTP 429, a.k.a. "the write thread pool queue is full, come back later".
pub const TOO_MANY_REQUESTS_STATUS: u16 = 429;

impl BulkFailure {
    pub fn is_version_conflict(&self) -> bool {
        self.status == VERSION_CONFLICT_STATUS
    }

    pub fn is_rejected_execution(&self) -> bool {
        self.status == TOO_MANY_REQUESTS_STATUS
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemOutcome {
    pub op_type: OpType,
    pub index: String,
    pub id: Option<String>,
    pub outcome: Result<BulkItemSuccess, BulkFailure>,
}

impl BulkItemOutcome {
    pub fn failure(&self) -> Option<&BulkFailure> {
        self.outcome.as_ref().err()
    }
}

/// 📬 Ordered per-operation outcomes; item `n` answers operation `n`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BulkResponse {
    pub items: Vec<BulkItemOutcome>,
    pub took: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_a_source_parses_into_an_object() -> anyhow::Result<()> {
        let doc = MatchedDocument::new("idx", "1", r#"{"title":"hello","n":1}"#);
        let parsed = doc.parse_source()?;
        assert_eq!(parsed["title"], "hello");
        assert_eq!(parsed["n"], 1);
        Ok(())
    }

    #[test]
    fn the_one_where_an_array_source_is_not_welcome() {
        let doc = MatchedDocument::new("idx", "1", "[1,2,3]");
        assert!(doc.parse_source().is_err());
    }

    #[test]
    fn the_one_where_a_missing_source_cannot_be_parsed() {
        let doc = MatchedDocument {
            source: None,
            ..MatchedDocument::new("idx", "1", "{}")
        };
        assert!(doc.parse_source().is_err());
    }

    #[test]
    fn the_one_where_create_ops_report_their_own_type() {
        let op = WriteOperation::Index(IndexOperation {
            index: "dest".into(),
            id: Some("1".into()),
            routing: None,
            version: None,
            version_type: VersionType::Internal,
            if_seq_no: None,
            if_primary_term: None,
            op_type: IndexOpType::Create,
            source: Map::new(),
        });
        assert_eq!(op.op_type(), OpType::Create);
        assert_eq!(op.index(), "dest");
        assert_eq!(op.id(), Some("1"));
    }

    #[test]
    fn the_one_where_409_and_429_mean_different_things() {
        let conflict = BulkFailure {
            index: "i".into(),
            id: Some("1".into()),
            status: 409,
            cause: "version_conflict_engine_exception".into(),
        };
        let rejected = BulkFailure {
            status: 429,
            ..conflict.clone()
        };
        assert!(conflict.is_version_conflict());
        assert!(!conflict.is_rejected_execution());
        assert!(rejected.is_rejected_execution());
    }
}
