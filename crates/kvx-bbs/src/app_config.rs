//! 🔧 App Configuration — the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." — every developer at 3am 🦆
//!
//! 🏗️ Powered by Figment, because manually parsing env vars is a form of
//! self-harm that even the borrow checker wouldn't approve of.
//!
//! 🧠 Knowledge graph:
//! - [`AppConfig`] = where to read ([`SourceConfig`]) + where to write ([`SinkConfig`])
//!   + what to do ([`JobConfig`]).
//! - [`JobConfig::to_request`] turns the job into a validated [`BulkByScrollRequest`].

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::backends::common_config::duration_str;
use crate::backends::{
    CommonSinkConfig, CommonSourceConfig, ElasticsearchSinkConfig, ElasticsearchSourceConfig,
    InMemorySinkConfig, InMemorySourceConfig,
};
use crate::backoff::BackoffPolicy;
use crate::common::SearchRequest;
use crate::error::BulkByScrollError;
use crate::flavors::{Flavor, ReindexDestination};
use crate::request::{BulkByScrollRequest, CaptureConfig};
use crate::script::{ScriptConfig, ScriptRegistry};

/// 📦 The AppConfig: one struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// 📡 Where the hits come from.
    pub source_config: SourceConfig,
    /// 🚰 Where the writes go.
    pub sink_config: SinkConfig,
    pub job: JobConfig,
}

/// 📡 Source backends, externally tagged: `[source_config.Elasticsearch]`.
#[derive(Debug, Deserialize, Clone)]
pub enum SourceConfig {
    InMemory(InMemorySourceConfig),
    Elasticsearch(ElasticsearchSourceConfig),
}

impl SourceConfig {
    pub fn common(&self) -> CommonSourceConfig {
        match self {
            SourceConfig::InMemory(_) => CommonSourceConfig::default(),
            SourceConfig::Elasticsearch(config) => config.common_config.clone(),
        }
    }
}

/// 🚰 Sink backends, externally tagged: `[sink_config.Elasticsearch]`.
#[derive(Debug, Deserialize, Clone)]
pub enum SinkConfig {
    InMemory(InMemorySinkConfig),
    Elasticsearch(ElasticsearchSinkConfig),
}

impl SinkConfig {
    pub fn common(&self) -> CommonSinkConfig {
        match self {
            SinkConfig::InMemory(_) => CommonSinkConfig::default(),
            SinkConfig::Elasticsearch(config) => config.common_config.clone(),
        }
    }
}

/// 🎭 Which kind of job this is.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlavorKind {
    #[default]
    Reindex,
    UpdateByQuery,
    DeleteByQuery,
}

/// 🎯 The job itself: what to match, what to do with it, how carefully.
#[derive(Debug, Deserialize, Clone)]
pub struct JobConfig {
    #[serde(default)]
    pub flavor: FlavorKind,
    /// 📚 indices to search
    pub indices: Vec<String>,
    /// 🚚 required for reindex, ignored otherwise
    #[serde(default)]
    pub dest: Option<ReindexDestination>,
    #[serde(default = "default_query")]
    pub query: Value,
    /// 🔃 empty means `_doc` order
    #[serde(default)]
    pub sort: Vec<Value>,
    #[serde(default)]
    pub max_docs: Option<u64>,
    #[serde(default)]
    pub refresh: bool,
    #[serde(default)]
    pub abort_on_version_conflict: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_initial", with = "duration_str")]
    pub retry_backoff_initial: Duration,
    /// 🚦 absent means unthrottled
    #[serde(default)]
    pub requests_per_second: Option<f32>,
    #[serde(default)]
    pub script: Option<ScriptConfig>,
    #[serde(default)]
    pub capture: CaptureConfig,
}

fn default_query() -> Value {
    json!({"match_all": {}})
}

fn default_max_retries() -> u32 {
    11
}

fn default_retry_backoff_initial() -> Duration {
    Duration::from_millis(500)
}

impl JobConfig {
    /// 🎭 Pick the flavor. Reindex without a destination is a config bug.
    pub fn flavor(&self) -> Result<Flavor, BulkByScrollError> {
        match self.flavor {
            FlavorKind::Reindex => self.dest.clone().map(Flavor::Reindex).ok_or_else(|| {
                BulkByScrollError::InvalidRequest(
                    "reindex needs a [job.dest] section with at least an index".to_string(),
                )
            }),
            FlavorKind::UpdateByQuery => Ok(Flavor::UpdateByQuery),
            FlavorKind::DeleteByQuery => Ok(Flavor::DeleteByQuery),
        }
    }

    /// 🏗️ Assemble and validate the run request.
    pub fn to_request(
        &self,
        source: &CommonSourceConfig,
        sink: &CommonSinkConfig,
        scripts: &ScriptRegistry,
    ) -> Result<BulkByScrollRequest, BulkByScrollError> {
        let script = self
            .script
            .as_ref()
            .map(|config| scripts.bind(config))
            .transpose()?;
        BulkByScrollRequest {
            search: SearchRequest {
                indices: self.indices.clone(),
                query: self.query.clone(),
                sort: self.sort.clone(),
                size: source.batch_size,
                keep_alive: source.scroll_keep_alive,
            },
            flavor: self.flavor()?,
            script,
            max_docs: self.max_docs,
            refresh: self.refresh,
            abort_on_version_conflict: self.abort_on_version_conflict,
            timeout: sink.request_timeout,
            wait_for_active_shards: sink.wait_for_active_shards.clone(),
            backoff: BackoffPolicy::exponential(self.retry_backoff_initial, self.max_retries),
            capture: self.capture.clone(),
        }
        .validate()
    }
}

/// 🚀 Load the config — from a file, from env vars, or from the sheer power of hoping.
///
/// 🔧 Merges environment variables (KVX_*) with an optional TOML file.
///
/// 📐 DESIGN NOTE (no cap, this is tribal knowledge):
///   - If `config_file_name` is None  → env vars only. No file. No assumptions. No pizza defaults.
///   - If `config_file_name` is Some  → env vars + TOML file, merged. TOML wins on conflicts.
///
/// 💀 Returns an error if config is unparseable. Check the error message though —
/// it's contextual, informative, and written with love. Or despair. Hard to tell at 3am.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    // 🏗️ Start with env vars as the base layer — like a good sourdough starter.
    let config = Figment::new().merge(Env::prefixed("KVX_"));

    // 🎯 Conditionally layer in TOML only if a file was actually provided.
    // Ancient proverb: "He who defaults to config.toml uninvited, deploys to production alone."
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (KVX_*). \
             The file exists in our hearts, but apparently not on disk.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (KVX_*). \
                 No file was provided — this one's all on the environment. Classic."
            .to_string(),
    };

    config.extract().context(context_msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{IndexOpType, VersionType};
    use crate::flavors::DestRouting;
    use std::io::Write;

    fn write_test_config(contents: &str) -> anyhow::Result<tempfile::NamedTempFile> {
        // 🧪 We write a real file here because Figment wants TOML from disk, like it's method acting.
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        file.write_all(contents.as_bytes())?;
        Ok(file)
    }

    #[test]
    fn the_one_where_a_full_reindex_job_parses() -> anyhow::Result<()> {
        let file = write_test_config(
            r#"
            [source_config.Elasticsearch]
            url = "http://localhost:9200"
            api_key = "c2VjcmV0"
            common_config = { batch_size = 250, scroll_keep_alive = "1m" }

            [sink_config.Elasticsearch]
            url = "http://localhost:9201"
            username = "elastic"
            password = "changeme"
            common_config = { request_timeout = "30s", wait_for_active_shards = "all" }

            [job]
            indices = ["books"]
            max_docs = 5000
            refresh = true
            requests_per_second = 500.0
            retry_backoff_initial = "250ms"
            query = { term = { genre = "scifi" } }

            [job.dest]
            index = "books-v2"
            op_type = "create"
            version_type = "external"
            routing = "=shelf-1"

            [job.script]
            id = "set_fields"
            params = { migrated = true }

            [job.capture]
            new = true
            max_docs = 10
            new_filter = { includes = ["title"] }
            "#,
        )?;

        let app_config = load_config(Some(file.path()))?;
        assert_eq!(app_config.source_config.common().batch_size, 250);
        assert_eq!(app_config.sink_config.common().wait_for_active_shards, "all");

        let job = &app_config.job;
        assert_eq!(job.flavor, FlavorKind::Reindex);
        assert_eq!(job.query, json!({"term": {"genre": "scifi"}}));
        assert_eq!(job.retry_backoff_initial, Duration::from_millis(250));
        assert_eq!(job.requests_per_second, Some(500.0));
        let Some(dest) = &job.dest else {
            panic!("💀 dest went missing between the TOML and the struct");
        };
        assert_eq!(dest.op_type, IndexOpType::Create);
        assert_eq!(dest.version_type, VersionType::External);
        assert_eq!(dest.routing, DestRouting::Fixed("shelf-1".into()));
        assert!(job.capture.new);
        assert_eq!(job.capture.new_filter.includes, vec!["title".to_string()]);

        let request = job.to_request(
            &app_config.source_config.common(),
            &app_config.sink_config.common(),
            &ScriptRegistry::with_builtins(),
        )?;
        assert_eq!(request.search.size, 250);
        assert_eq!(request.search.keep_alive, Duration::from_secs(60));
        assert_eq!(request.timeout, Duration::from_secs(30));
        assert_eq!(request.max_docs, Some(5000));
        assert_eq!(request.backoff, BackoffPolicy::exponential(Duration::from_millis(250), 11));
        assert_eq!(request.script.as_ref().map(|s| s.id.as_str()), Some("set_fields"));
        assert_eq!(request.search.sort, vec![crate::request::default_sort()]);
        Ok(())
    }

    #[test]
    fn the_one_where_defaults_show_up_uninvited_but_helpful() -> anyhow::Result<()> {
        let file = write_test_config(
            r#"
            [source_config.InMemory]
            [sink_config.InMemory]

            [job]
            flavor = "update_by_query"
            indices = ["books"]
            "#,
        )?;

        let app_config: AppConfig = Figment::new().merge(Toml::file(file.path())).extract()?;
        let job = app_config.job;
        assert_eq!(job.flavor, FlavorKind::UpdateByQuery);
        assert_eq!(job.query, json!({"match_all": {}}));
        assert_eq!(job.max_retries, 11);
        assert_eq!(job.retry_backoff_initial, Duration::from_millis(500));
        assert!(!job.refresh);
        assert!(!job.abort_on_version_conflict);
        assert!(job.requests_per_second.is_none());
        assert!(!job.capture.is_enabled());
        Ok(())
    }

    #[test]
    fn the_one_where_reindex_without_a_destination_is_a_config_bug() -> anyhow::Result<()> {
        let file = write_test_config(
            r#"
            [source_config.InMemory]
            [sink_config.InMemory]

            [job]
            indices = ["books"]
            "#,
        )?;
        let app_config = load_config(Some(file.path()))?;
        let err = app_config.job.flavor().unwrap_err();
        assert!(matches!(err, BulkByScrollError::InvalidRequest(_)));
        Ok(())
    }

    #[test]
    fn the_one_where_an_unknown_script_is_caught_before_the_run() -> anyhow::Result<()> {
        let file = write_test_config(
            r#"
            [source_config.InMemory]
            [sink_config.InMemory]

            [job]
            flavor = "update_by_query"
            indices = ["books"]
            script = { id = "make_it_better" }
            "#,
        )?;
        let app_config = load_config(Some(file.path()))?;
        let err = app_config
            .job
            .to_request(
                &CommonSourceConfig::default(),
                &CommonSinkConfig::default(),
                &ScriptRegistry::with_builtins(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("make_it_better"));
        Ok(())
    }
}
