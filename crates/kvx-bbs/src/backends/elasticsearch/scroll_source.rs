use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use serde_json::value::RawValue;
use tracing::debug;

use super::{Credentials, ElasticsearchSourceConfig, authorize, build_client, check_status, endpoint, render_cause};
use crate::backends::ScrollSource;
use crate::backends::common_config::duration_str;
use crate::common::{JSON_CONTENT_TYPE, MatchedDocument, ScrollBatch, SearchFailure, SearchRequest};

/// 📡 The source side of the Elasticsearch backend: a scroll cursor.
///
/// Asks for `version` and `seq_no_primary_term` on every hit, because the
/// write side needs them for optimistic concurrency. `_source` is borrowed as
/// a raw JSON slice and copied once; nobody parses it until a flavor needs to.
#[derive(Debug)]
pub struct ElasticsearchScrollSource {
    client: reqwest::Client,
    url: String,
    credentials: Credentials,
}

impl ElasticsearchScrollSource {
    pub fn new(config: ElasticsearchSourceConfig) -> Result<Self> {
        // -- ⏱️ search pages are small; a minute is plenty of rope
        let client = build_client(Duration::from_secs(60))?;
        Ok(Self {
            client,
            url: config.url,
            credentials: Credentials {
                username: config.username,
                password: config.password,
                api_key: config.api_key,
            },
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<ScrollBatch> {
        let response = authorize(request, &self.credentials)
            .send()
            .await
            .with_context(|| format!("💀 {what} never made it to the cluster. Check connectivity, check timeouts, check your feelings."))?;
        let response = check_status(response, what).await?;
        let body = response
            .text()
            .await
            .with_context(|| format!("💀 {what} response body went missing mid-flight"))?;
        parse_search_response(&body).with_context(|| format!("💀 {what} response could not be parsed"))
    }
}

#[async_trait]
impl ScrollSource for ElasticsearchScrollSource {
    async fn start(&mut self, request: &SearchRequest) -> Result<ScrollBatch> {
        let indices = if request.indices.is_empty() {
            "_all".to_string()
        } else {
            request.indices.join(",")
        };
        let url = endpoint(
            &self.url,
            &format!(
                "{indices}/_search?scroll={}&version=true&seq_no_primary_term=true",
                duration_str::to_es_time(request.keep_alive)
            ),
        );
        debug!("🔍 opening scroll on [{indices}] with page size {}", request.size);
        let body = json!({
            "query": request.query,
            "sort": request.sort,
            "size": request.size,
        });
        self.send(self.client.post(&url).json(&body), "scroll start").await
    }

    async fn next(&mut self, scroll_id: &str, keep_alive: Duration) -> Result<ScrollBatch> {
        let url = endpoint(&self.url, "_search/scroll");
        let body = json!({
            "scroll": duration_str::to_es_time(keep_alive),
            "scroll_id": scroll_id,
        });
        self.send(self.client.post(&url).json(&body), "scroll next").await
    }

    async fn close(&mut self, scroll_id: &str) -> Result<()> {
        let url = endpoint(&self.url, "_search/scroll");
        let response = authorize(
            self.client
                .delete(&url)
                .json(&json!({ "scroll_id": [scroll_id] })),
            &self.credentials,
        )
        .send()
        .await
        .context("💀 clear scroll never made it to the cluster")?;
        // -- 🗑️ 404 means the context already expired. Mission accomplished, technically.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("🗑️ scroll [{scroll_id}] was already gone");
            return Ok(());
        }
        check_status(response, "clear scroll").await?;
        Ok(())
    }
}

// ============================================================
// 📜 wire types
// ============================================================

#[derive(Debug, Deserialize)]
struct SearchResponseBody {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    #[serde(default)]
    timed_out: bool,
    #[serde(rename = "_shards", default)]
    shards: Option<ShardsBody>,
    hits: HitsBody,
}

#[derive(Debug, Deserialize)]
struct ShardsBody {
    #[serde(default)]
    failures: Vec<ShardFailureBody>,
}

#[derive(Debug, Deserialize)]
struct ShardFailureBody {
    index: Option<String>,
    shard: Option<u32>,
    node: Option<String>,
    status: Option<serde_json::Value>,
    #[serde(default)]
    reason: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TotalHits {
    Count(u64),
    Object { value: u64 },
}

#[derive(Debug, Deserialize)]
struct HitsBody {
    total: Option<TotalHits>,
    #[serde(default)]
    hits: Vec<HitBody>,
}

#[derive(Debug, Deserialize)]
struct HitBody {
    #[serde(rename = "_index")]
    index: String,
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_routing")]
    routing: Option<String>,
    #[serde(rename = "_version")]
    version: Option<i64>,
    #[serde(rename = "_seq_no")]
    seq_no: Option<i64>,
    #[serde(rename = "_primary_term")]
    primary_term: Option<i64>,
    #[serde(rename = "_source")]
    source: Option<Box<RawValue>>,
}

/// 🔧 Search/scroll response JSON → [`ScrollBatch`].
pub(crate) fn parse_search_response(body: &str) -> Result<ScrollBatch> {
    let parsed: SearchResponseBody = serde_json::from_str(body)?;
    let total_hits = match parsed.hits.total {
        Some(TotalHits::Count(n)) | Some(TotalHits::Object { value: n }) => n,
        None => parsed.hits.hits.len() as u64,
    };
    let search_failures = parsed
        .shards
        .map(|shards| shards.failures)
        .unwrap_or_default()
        .into_iter()
        .map(|failure| SearchFailure {
            index: failure.index,
            shard: failure.shard,
            node: failure.node,
            status: failure
                .status
                .as_ref()
                .and_then(|s| s.as_u64())
                .and_then(|s| u16::try_from(s).ok()),
            reason: render_cause(&failure.reason),
        })
        .collect();
    let hits = parsed
        .hits
        .hits
        .into_iter()
        .map(|hit| MatchedDocument {
            index: hit.index,
            id: hit.id,
            routing: hit.routing,
            version: hit.version,
            seq_no: hit.seq_no,
            primary_term: hit.primary_term,
            source: hit.source.map(|raw| raw.get().to_string()),
            content_type: JSON_CONTENT_TYPE.to_string(),
        })
        .collect();
    Ok(ScrollBatch {
        scroll_id: parsed.scroll_id,
        hits,
        total_hits,
        search_failures,
        timed_out: parsed.timed_out,
    })
}
