//! 🔌 Backends — where the real I/O happens.
//!
//! 🚰 The scroll source pours pages of hits, the bulk sink slurps up write
//! operations, and the refresher makes the result visible at the end.
//! And in between, we panic! (kidding, we use anyhow)
//!
//! 🎭 This module is the casting agency. Need to scroll a real cluster?
//! Need a pretend one that never leaves RAM? We've got a backend for that.
//!
//! 🦆 The duck is here because every file must have one. This is law. Do not question the duck.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::common::{BulkRequest, BulkResponse, ScrollBatch, SearchRequest};

pub mod common_config;
pub mod elasticsearch;
pub mod in_mem;

// 🎯 Re-export backend-specific types so callers can do `backends::InMemoryBulkSink`
// instead of spelunking into `backends::in_mem::InMemoryBulkSink`.
pub use common_config::{CommonSinkConfig, CommonSourceConfig};
pub use elasticsearch::{
    ElasticsearchBulkSink, ElasticsearchScrollSource, ElasticsearchSinkConfig,
    ElasticsearchSourceConfig,
};
pub use in_mem::{
    InMemoryBulkSink, InMemoryScrollSource, InMemorySinkConfig, InMemorySourceConfig,
};

// ===== Search cursor =====

/// 🔍 A resumable cursor over a search result set.
///
/// # Contract 📜
/// - `start` runs the search and returns the first page plus a cursor token.
/// - `next` pulls the page after the one identified by `scroll_id`.
/// - `close` releases server-side cursor state. It is called exactly once per
///   run that got a token, success or failure, and its errors are logged, never
///   surfaced to the run's outcome.
/// - Wrap overload failures in [`crate::error::Rejected`] so the caller can retry them.
#[async_trait]
pub trait ScrollSource: std::fmt::Debug + Send {
    async fn start(&mut self, request: &SearchRequest) -> Result<ScrollBatch>;
    async fn next(&mut self, scroll_id: &str, keep_alive: Duration) -> Result<ScrollBatch>;
    async fn close(&mut self, scroll_id: &str) -> Result<()>;
}

// ===== Bulk writes =====

/// 🕳️ A sink that applies a batch of write operations in one call.
///
/// Returns one outcome per operation, in operation order. A transport-level
/// overload (the whole call bounced) should come back as an error wrapping
/// [`crate::error::Rejected`]; a per-item overload comes back as an item with
/// status 429. Both get retried upstream. Anything else is someone else's problem.
#[async_trait]
pub trait BulkSink: std::fmt::Debug + Send {
    async fn submit(&mut self, request: &BulkRequest) -> Result<BulkResponse>;
}

/// 🔄 Makes recent writes visible to search. Called at most once, at the end of a run.
#[async_trait]
pub trait Refresher: std::fmt::Debug + Send {
    async fn refresh(&mut self, indices: &[String]) -> Result<()>;
}

// ===== Backend enums =====

/// 🎭 The many faces of a ScrollSource — a polymorphic casting call for data origins.
///
/// The enum dispatches to the concrete source, so the coordinator never needs
/// to know (or care) whether the hits came from RAM or a cluster of overworked nodes.
#[derive(Debug)]
pub enum SourceBackend {
    InMemory(InMemoryScrollSource),
    Elasticsearch(ElasticsearchScrollSource),
}

#[async_trait]
impl ScrollSource for SourceBackend {
    async fn start(&mut self, request: &SearchRequest) -> Result<ScrollBatch> {
        match self {
            SourceBackend::InMemory(source) => source.start(request).await,
            SourceBackend::Elasticsearch(source) => source.start(request).await,
        }
    }

    async fn next(&mut self, scroll_id: &str, keep_alive: Duration) -> Result<ScrollBatch> {
        match self {
            SourceBackend::InMemory(source) => source.next(scroll_id, keep_alive).await,
            SourceBackend::Elasticsearch(source) => source.next(scroll_id, keep_alive).await,
        }
    }

    async fn close(&mut self, scroll_id: &str) -> Result<()> {
        match self {
            SourceBackend::InMemory(source) => source.close(scroll_id).await,
            SourceBackend::Elasticsearch(source) => source.close(scroll_id).await,
        }
    }
}

/// 🎭 The many faces of a sink. Mirrors `SourceBackend` on the other end of the run.
#[derive(Debug)]
pub enum SinkBackend {
    InMemory(InMemoryBulkSink),
    Elasticsearch(ElasticsearchBulkSink),
}

#[async_trait]
impl BulkSink for SinkBackend {
    async fn submit(&mut self, request: &BulkRequest) -> Result<BulkResponse> {
        match self {
            SinkBackend::InMemory(sink) => sink.submit(request).await,
            SinkBackend::Elasticsearch(sink) => sink.submit(request).await,
        }
    }
}

#[async_trait]
impl Refresher for SinkBackend {
    async fn refresh(&mut self, indices: &[String]) -> Result<()> {
        match self {
            SinkBackend::InMemory(sink) => sink.refresh(indices).await,
            SinkBackend::Elasticsearch(sink) => sink.refresh(indices).await,
        }
    }
}
