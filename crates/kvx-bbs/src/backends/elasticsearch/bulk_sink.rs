use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use super::{Credentials, ElasticsearchSinkConfig, authorize, build_client, check_status, endpoint, render_cause};
use crate::backends::common_config::duration_str;
use crate::backends::{BulkSink, Refresher};
use crate::common::{
    BulkFailure, BulkItemOutcome, BulkItemSuccess, BulkRequest, BulkResponse, GetResult, OpType,
    WriteOperation, WriteResult,
};
use crate::transforms::ElasticsearchBulk;

/// 📡 The sink side of the Elasticsearch backend — bulk writes and the final refresh.
///
/// Renders operations to NDJSON, POSTs them to `/_bulk`, and parses every item
/// back into a [`BulkItemOutcome`]. This function does not retry. Retries are
/// the retry layer's problem. Good luck to it.
#[derive(Debug)]
pub struct ElasticsearchBulkSink {
    client: reqwest::Client,
    url: String,
    credentials: Credentials,
}

impl ElasticsearchBulkSink {
    /// 🚀 Stand up a new sink and ping the cluster root to confirm it's alive and
    /// talking to us. If this fails, we fail loudly here, rather than quietly
    /// 50,000 docs later.
    pub async fn new(config: ElasticsearchSinkConfig) -> Result<Self> {
        let client = build_client(config.common_config.request_timeout)?;
        let credentials = Credentials {
            username: config.username,
            password: config.password,
            api_key: config.api_key,
        };
        let response = authorize(client.get(&config.url), &credentials)
            .send()
            .await
            .context("💀 Reached out to the cluster root to say hello. Got ghosted.")?;
        check_status(response, "connectivity ping").await?;
        debug!("✅ destination cluster at {} is home", config.url);
        Ok(Self {
            client,
            url: config.url,
            credentials,
        })
    }
}

#[async_trait]
impl BulkSink for ElasticsearchBulkSink {
    async fn submit(&mut self, request: &BulkRequest) -> Result<BulkResponse> {
        let body = ElasticsearchBulk::render_body(&request.operations)?;
        let wants_source = request
            .operations
            .iter()
            .any(|op| matches!(op, WriteOperation::Update(_)));
        let mut path = format!(
            "_bulk?timeout={}&wait_for_active_shards={}",
            duration_str::to_es_time(request.timeout),
            request.wait_for_active_shards
        );
        if wants_source {
            path.push_str("&_source=true");
        }
        debug!(
            "📡 Sending {} operations ({} bytes) to /_bulk",
            request.operations.len(),
            body.len()
        );
        let response = authorize(
            self.client
                .post(endpoint(&self.url, &path))
                // ⚠️ application/x-ndjson — not application/json. VERY important.
                .header("Content-Type", "application/x-ndjson")
                .body(body),
            &self.credentials,
        )
        .send()
        .await
        .context("💀 The bulk request never made it to the cluster. Check connectivity, check timeouts, and check your feelings.")?;
        let response = check_status(response, "bulk request").await?;
        let text = response
            .text()
            .await
            .context("💀 bulk response body went missing mid-flight")?;
        let parsed = parse_bulk_response(&text)?;
        if parsed.items.len() != request.operations.len() {
            anyhow::bail!(
                "💀 sent {} operations but got {} items back. Somebody can't count, and it isn't us.",
                request.operations.len(),
                parsed.items.len()
            );
        }
        trace!("🚀 Bulk request landed — documents have left the building, Elvis-style");
        Ok(parsed)
    }
}

#[async_trait]
impl Refresher for ElasticsearchBulkSink {
    async fn refresh(&mut self, indices: &[String]) -> Result<()> {
        let url = endpoint(&self.url, &format!("{}/_refresh", indices.join(",")));
        debug!("🔄 refreshing [{}]", indices.join(","));
        let response = authorize(self.client.post(&url), &self.credentials)
            .send()
            .await
            .context("💀 refresh never made it to the cluster")?;
        check_status(response, "refresh").await?;
        Ok(())
    }
}

// ============================================================
// 📜 wire types
// ============================================================

#[derive(Debug, Deserialize)]
struct BulkResponseBody {
    #[serde(default)]
    took: u64,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItemBody>>,
}

#[derive(Debug, Deserialize)]
struct BulkItemBody {
    #[serde(rename = "_index")]
    index: String,
    #[serde(rename = "_id")]
    id: Option<String>,
    #[serde(rename = "_version")]
    version: Option<i64>,
    result: Option<WriteResult>,
    #[serde(rename = "_seq_no")]
    seq_no: Option<i64>,
    #[serde(rename = "_primary_term")]
    primary_term: Option<i64>,
    status: u16,
    error: Option<Value>,
    get: Option<GetBody>,
}

#[derive(Debug, Deserialize)]
struct GetBody {
    #[serde(rename = "_seq_no")]
    seq_no: Option<i64>,
    #[serde(rename = "_primary_term")]
    primary_term: Option<i64>,
    #[serde(rename = "_source")]
    source: Option<Map<String, Value>>,
}

fn parse_op_type(key: &str) -> Result<OpType> {
    Ok(match key {
        "index" => OpType::Index,
        "create" => OpType::Create,
        "update" => OpType::Update,
        "delete" => OpType::Delete,
        other => anyhow::bail!("💀 bulk item came back under an unknown action '{other}'"),
    })
}

/// 🔧 `_bulk` response JSON → ordered [`BulkItemOutcome`]s.
pub(crate) fn parse_bulk_response(body: &str) -> Result<BulkResponse> {
    let parsed: BulkResponseBody =
        serde_json::from_str(body).context("💀 bulk response could not be parsed")?;
    let mut items = Vec::with_capacity(parsed.items.len());
    for entry in parsed.items {
        let (key, item) = entry
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("💀 bulk item with no action key"))?;
        let op_type = parse_op_type(&key)?;
        let outcome = match item.error {
            Some(cause) => Err(BulkFailure {
                index: item.index.clone(),
                id: item.id.clone(),
                status: item.status,
                cause: render_cause(&cause),
            }),
            None => Ok(BulkItemSuccess {
                result: item.result.unwrap_or(match op_type {
                    OpType::Delete => WriteResult::Deleted,
                    OpType::Update => WriteResult::Updated,
                    OpType::Index | OpType::Create => WriteResult::Created,
                }),
                version: item.version,
                seq_no: item.seq_no,
                primary_term: item.primary_term,
                get: item.get.map(|get| GetResult {
                    index: item.index.clone(),
                    id: item.id.clone().unwrap_or_default(),
                    version: item.version,
                    seq_no: get.seq_no,
                    primary_term: get.primary_term,
                    source: get.source,
                }),
            }),
        };
        items.push(BulkItemOutcome {
            op_type,
            index: item.index,
            id: item.id,
            outcome,
        });
    }
    Ok(BulkResponse {
        items,
        took: Duration::from_millis(parsed.took),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::CommonSinkConfig;
    use crate::common::{DeleteOperation, IndexOpType, IndexOperation, UpdateOperation, VersionType};
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn sink(server: &MockServer) -> Result<ElasticsearchBulkSink> {
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tagline": "You Know, for Search"})))
            .mount(server)
            .await;
        ElasticsearchBulkSink::new(ElasticsearchSinkConfig {
            url: server.uri(),
            username: Some("elastic".into()),
            password: Some("changeme".into()),
            api_key: None,
            common_config: CommonSinkConfig::default(),
        })
        .await
    }

    fn request() -> BulkRequest {
        BulkRequest {
            operations: vec![
                WriteOperation::Index(IndexOperation {
                    index: "dest".into(),
                    id: Some("1".into()),
                    routing: None,
                    version: None,
                    version_type: VersionType::Internal,
                    if_seq_no: None,
                    if_primary_term: None,
                    op_type: IndexOpType::Index,
                    source: Map::new(),
                }),
                WriteOperation::Delete(DeleteOperation {
                    index: "dest".into(),
                    id: "2".into(),
                    routing: None,
                    version: None,
                    version_type: VersionType::Internal,
                    if_seq_no: Some(4),
                    if_primary_term: Some(1),
                }),
            ],
            timeout: Duration::from_secs(30),
            wait_for_active_shards: "all".into(),
        }
    }

    #[test]
    fn the_one_where_mixed_results_are_sorted_into_wins_and_losses() -> Result<()> {
        let response = parse_bulk_response(
            r#"{"took": 12, "errors": true, "items": [
                {"index": {"_index": "dest", "_id": "1", "_version": 2, "result": "updated",
                           "_seq_no": 9, "_primary_term": 1, "status": 200}},
                {"delete": {"_index": "dest", "_id": "2", "status": 409,
                            "error": {"type": "version_conflict_engine_exception", "reason": "seq_no mismatch"}}}
            ]}"#,
        )?;
        assert_eq!(response.took, Duration::from_millis(12));
        let first = response.items[0].outcome.as_ref().map_err(|f| anyhow::anyhow!(f.cause.clone()))?;
        assert_eq!(first.result, WriteResult::Updated);
        assert_eq!(first.version, Some(2));
        let second = response.items[1].failure().ok_or_else(|| anyhow::anyhow!("expected a failure"))?;
        assert!(second.is_version_conflict());
        assert_eq!(second.cause, "version_conflict_engine_exception: seq_no mismatch");
        assert_eq!(response.items[1].op_type, OpType::Delete);
        Ok(())
    }

    #[test]
    fn the_one_where_update_items_bring_their_source_home() -> Result<()> {
        let response = parse_bulk_response(
            r#"{"took": 1, "items": [
                {"update": {"_index": "dest", "_id": "1", "_version": 3, "result": "updated", "status": 200,
                            "get": {"_seq_no": 5, "_primary_term": 1, "found": true, "_source": {"a": 1}}}}
            ]}"#,
        )?;
        let success = response.items[0].outcome.as_ref().map_err(|f| anyhow::anyhow!(f.cause.clone()))?;
        let get = success.get.as_ref().ok_or_else(|| anyhow::anyhow!("expected get"))?;
        assert_eq!(get.id, "1");
        assert_eq!(get.source.as_ref().map(|s| s["a"].clone()), Some(json!(1)));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_bulk_request_lands_and_comes_back_itemized() -> Result<()> {
        let server = MockServer::start().await;
        let mut sink = sink(&server).await?;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .and(query_param("timeout", "30000ms"))
            .and(query_param("wait_for_active_shards", "all"))
            .and(header("Content-Type", "application/x-ndjson"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "took": 3, "errors": false, "items": [
                    {"index": {"_index": "dest", "_id": "1", "_version": 1, "result": "created", "status": 201}},
                    {"delete": {"_index": "dest", "_id": "2", "_version": 2, "result": "deleted", "status": 200}}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = sink.submit(&request()).await?;
        assert_eq!(response.items.len(), 2);
        assert!(response.items.iter().all(|item| item.outcome.is_ok()));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_partial_updates_ask_for_their_source_back() -> Result<()> {
        let server = MockServer::start().await;
        let mut sink = sink(&server).await?;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .and(query_param("_source", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "took": 2, "errors": false, "items": [
                    {"update": {"_index": "dest", "_id": "7", "_version": 4, "result": "updated", "status": 200,
                                "get": {"_seq_no": 9, "_primary_term": 1, "found": true,
                                        "_source": {"title": "Dune", "read": true}}}}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut doc = serde_json::Map::new();
        doc.insert("read".into(), json!(true));
        let response = sink
            .submit(&BulkRequest {
                operations: vec![WriteOperation::Update(UpdateOperation {
                    index: "dest".into(),
                    id: "7".into(),
                    routing: None,
                    if_seq_no: Some(8),
                    if_primary_term: Some(1),
                    doc,
                })],
                timeout: Duration::from_secs(30),
                wait_for_active_shards: "1".into(),
            })
            .await?;
        let success = response.items[0].outcome.as_ref().map_err(|f| anyhow::anyhow!(f.cause.clone()))?;
        let get = success.get.as_ref().ok_or_else(|| anyhow::anyhow!("expected the updated source"))?;
        assert_eq!(get.source.as_ref().map(|s| s["read"].clone()), Some(json!(true)));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_whole_bulk_bounces_with_a_429() -> Result<()> {
        let server = MockServer::start().await;
        let mut sink = sink(&server).await?;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(429).set_body_string("es_rejected_execution_exception"))
            .mount(&server)
            .await;
        let err = sink.submit(&request()).await.unwrap_err();
        assert!(crate::error::is_rejected(&err));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_400_is_not_worth_retrying() -> Result<()> {
        let server = MockServer::start().await;
        let mut sink = sink(&server).await?;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(400).set_body_string("malformed action/metadata line"))
            .mount(&server)
            .await;
        let err = sink.submit(&request()).await.unwrap_err();
        assert!(!crate::error::is_rejected(&err));
        assert!(format!("{err:#}").contains("malformed"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_refresh_targets_exactly_the_written_indices() -> Result<()> {
        let server = MockServer::start().await;
        let mut sink = sink(&server).await?;
        Mock::given(method("POST"))
            .and(path("/a,b/_refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"_shards": {"failed": 0}})))
            .expect(1)
            .mount(&server)
            .await;
        sink.refresh(&["a".to_string(), "b".to_string()]).await?;
        Ok(())
    }
}
