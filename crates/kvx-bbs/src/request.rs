// ai
//! 📋 The request — everything a run needs to know before it starts.
//!
//! Built once, validated once, then read-only for the life of the run.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::backoff::BackoffPolicy;
use crate::common::SearchRequest;
use crate::error::BulkByScrollError;
use crate::flavors::Flavor;
use crate::script::BoundScript;
use crate::source_filter::SourceFilter;

/// ⏳ How long a bulk request waits for shards before giving up.
pub const DEFAULT_BULK_TIMEOUT: Duration = Duration::from_secs(60);

/// 📸 Before/after capture settings. Both flags off means nothing is captured.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CaptureConfig {
    #[serde(default)]
    pub old: bool,
    #[serde(default)]
    pub new: bool,
    /// 🧢 cap per list; old and new fill up independently
    #[serde(default = "default_capture_max_docs")]
    pub max_docs: usize,
    #[serde(default)]
    pub old_filter: SourceFilter,
    #[serde(default)]
    pub new_filter: SourceFilter,
}

fn default_capture_max_docs() -> usize {
    100
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            old: false,
            new: false,
            max_docs: default_capture_max_docs(),
            old_filter: SourceFilter::default(),
            new_filter: SourceFilter::default(),
        }
    }
}

impl CaptureConfig {
    pub fn is_enabled(&self) -> bool {
        self.old || self.new
    }
}

/// 🎯 One bulk-by-scroll run, fully described.
#[derive(Debug, Clone)]
pub struct BulkByScrollRequest {
    pub search: SearchRequest,
    pub flavor: Flavor,
    pub script: Option<BoundScript>,
    /// 🧢 stop after this many documents are successfully processed
    pub max_docs: Option<u64>,
    /// 🔄 refresh every written index once the run is done
    pub refresh: bool,
    /// 💥 report version conflicts as failures instead of just counting them
    pub abort_on_version_conflict: bool,
    pub timeout: Duration,
    pub wait_for_active_shards: String,
    pub backoff: BackoffPolicy,
    pub capture: CaptureConfig,
}

impl BulkByScrollRequest {
    /// 🏗️ Sensible defaults: match_all over `indices`, `_doc` order, 1000 per page.
    pub fn new(indices: Vec<String>, flavor: Flavor) -> Self {
        Self {
            search: SearchRequest {
                indices,
                query: json!({"match_all": {}}),
                sort: vec![default_sort()],
                size: 1000,
                keep_alive: Duration::from_secs(5 * 60),
            },
            flavor,
            script: None,
            max_docs: None,
            refresh: false,
            abort_on_version_conflict: false,
            timeout: DEFAULT_BULK_TIMEOUT,
            wait_for_active_shards: "1".to_string(),
            backoff: BackoffPolicy::default(),
            capture: CaptureConfig::default(),
        }
    }

    /// ✅ Catch misconfiguration before touching the network, and tidy up what can be tidied.
    pub fn validate(mut self) -> Result<Self, BulkByScrollError> {
        if self.search.size == 0 {
            return Err(BulkByScrollError::InvalidRequest(
                "batch size must be greater than 0".to_string(),
            ));
        }
        if self.max_docs == Some(0) {
            return Err(BulkByScrollError::InvalidRequest(
                "max_docs must be greater than 0 when set".to_string(),
            ));
        }
        if matches!(self.flavor, Flavor::DeleteByQuery) && self.script.is_some() {
            return Err(BulkByScrollError::InvalidRequest(
                "delete_by_query does not support scripts".to_string(),
            ));
        }
        if let Flavor::Reindex(dest) = &self.flavor {
            if dest.index.is_empty() {
                return Err(BulkByScrollError::InvalidRequest(
                    "reindex needs a destination index".to_string(),
                ));
            }
            if self.search.indices.contains(&dest.index) {
                return Err(BulkByScrollError::InvalidRequest(format!(
                    "reindex cannot write into an index it's reading from [{}]",
                    dest.index
                )));
            }
        }
        if self.search.sort.is_empty() {
            self.search.sort.push(default_sort());
        }
        // -- 🧢 no point fetching a page bigger than the whole job
        if let Some(max_docs) = self.max_docs {
            let cap = usize::try_from(max_docs).unwrap_or(usize::MAX);
            self.search.size = self.search.size.min(cap);
        }
        Ok(self)
    }
}

/// 🔃 Index order. The cheapest sort there is.
pub fn default_sort() -> Value {
    json!({"_doc": "asc"})
}
