//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 *[dramatic orchestral music swells]*
//! 🎬 "In a world where documents must be rewritten by the million..."
//! 🎬 "One supervisor dared to wire it all together."
//! 🎬 *[record scratch]* 🦆
//!
//! 📦 The Supervisor module — part middle manager, part helicopter parent.
//! It reads the config, builds the backends, hands them to the coordinator,
//! and stares at the progress bar while the coordinator does the actual work.
//!
//! 🔒 Crate-private. The outside world talks to [`crate::run`], not to us.

use anyhow::{Context, Result};
use tracing::info;

use crate::app_config::{AppConfig, SinkConfig, SourceConfig};
use crate::backends::{
    ElasticsearchBulkSink, ElasticsearchScrollSource, InMemoryBulkSink, InMemoryScrollSource,
    SinkBackend, SourceBackend,
};
use crate::coordinator::{BulkByScroll, RunResult};
use crate::flavors::Flavor;
use crate::progress::ProgressMetrics;
use crate::script::ScriptRegistry;
use crate::status::RunHandle;

/// 📦 The Supervisor: because even a state machine needs someone hovering over
/// it asking "is it done yet?" every time a batch lands.
pub(crate) struct Supervisor {
    /// 🔧 The sacred scrolls of configuration, passed down from main()
    app_config: AppConfig,
    scripts: ScriptRegistry,
    handle: RunHandle,
}

impl Supervisor {
    /// 🚀 Birth of a Supervisor. Built-in scripts only, until told otherwise.
    pub(crate) fn new(app_config: AppConfig, handle: RunHandle) -> Self {
        Self {
            app_config,
            scripts: ScriptRegistry::with_builtins(),
            handle,
        }
    }

    pub(crate) fn with_scripts(mut self, scripts: ScriptRegistry) -> Self {
        self.scripts = scripts;
        self
    }

    /// 🧵 Build everything, run it, keep the progress display fed until it's over.
    pub(crate) async fn run(self, mut progress: ProgressMetrics) -> Result<RunResult> {
        let job = &self.app_config.job;
        let request = job
            .to_request(
                &self.app_config.source_config.common(),
                &self.app_config.sink_config.common(),
                &self.scripts,
            )
            .context("💀 The job section of the config doesn't describe a runnable job")?;

        // 🚦 the configured rate is just the first rethrottle
        self.handle.rethrottle(job.requests_per_second);

        let source = build_source(&self.app_config.source_config)?;
        let sink = build_sink(&self.app_config.sink_config).await?;
        info!(
            "🚀 starting {} over {:?}{}",
            request.flavor.name(),
            request.search.indices,
            match &request.flavor {
                Flavor::Reindex(dest) => format!(" into [{}]", dest.index),
                _ => String::new(),
            }
        );

        let coordinator = BulkByScroll::new(request, source, sink, self.handle.clone())?;
        let mut updates = self.handle.subscribe();
        let run = coordinator.run();
        tokio::pin!(run);

        // 📊 every published snapshot moves the bar; the run itself never waits on us
        let outcome = loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                changed = updates.changed() => match changed {
                    Ok(()) => {
                        let status = updates.borrow_and_update().clone();
                        progress.update(&status);
                    }
                    Err(_) => break (&mut run).await,
                },
            }
        };

        progress.update(&self.handle.status());
        progress.finish();
        Ok(outcome?)
    }
}

/// 📡 Config in, scroll source out.
fn build_source(config: &SourceConfig) -> Result<SourceBackend> {
    Ok(match config {
        SourceConfig::InMemory(config) => SourceBackend::InMemory(
            InMemoryScrollSource::from_config(config.clone())
                .context("💀 The in-memory source documents don't serialize. Impressive, honestly.")?,
        ),
        SourceConfig::Elasticsearch(config) => SourceBackend::Elasticsearch(
            ElasticsearchScrollSource::new(config.clone())
                .context("💀 Couldn't build the Elasticsearch scroll source")?,
        ),
    })
}

/// 🚰 Config in, bulk sink out. The Elasticsearch sink pings the cluster on the way.
async fn build_sink(config: &SinkConfig) -> Result<SinkBackend> {
    Ok(match config {
        SinkConfig::InMemory(_) => SinkBackend::InMemory(InMemoryBulkSink::new()),
        SinkConfig::Elasticsearch(config) => SinkBackend::Elasticsearch(
            ElasticsearchBulkSink::new(config.clone())
                .await
                .context("💀 Couldn't reach the Elasticsearch sink")?,
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BulkByScrollError;

    fn in_memory_config(job: &str) -> Result<AppConfig> {
        let raw = format!(
            r#"
            [source_config.InMemory]
            documents = [
                {{ index = "books", id = "1", source = {{ title = "Dune" }} }},
                {{ index = "books", id = "2", source = {{ title = "Hyperion" }} }},
                {{ index = "books", id = "3", source = {{ title = "Solaris" }} }},
            ]

            [sink_config.InMemory]

            {job}
            "#
        );
        Ok(toml::from_str(&raw)?)
    }

    #[tokio::test]
    async fn the_one_where_an_in_memory_reindex_runs_end_to_end() -> Result<()> {
        let app_config = in_memory_config(
            r#"
            [job]
            indices = ["books"]
            refresh = true
            dest = { index = "books-v2" }
            script = { id = "set_fields", params = { migrated = true } }
            "#,
        )?;
        let handle = RunHandle::new();
        let result = Supervisor::new(app_config, handle.clone())
            .run(ProgressMetrics::hidden("reindex books → books-v2"))
            .await?;

        assert_eq!(result.status.total, 3);
        assert_eq!(result.status.created, 3);
        assert!(result.bulk_failures.is_empty());
        assert_eq!(handle.status().created, 3);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_config_rate_becomes_the_first_rethrottle() -> Result<()> {
        let app_config = in_memory_config(
            r#"
            [job]
            flavor = "delete_by_query"
            indices = ["books"]
            requests_per_second = 1000.0
            "#,
        )?;
        let handle = RunHandle::new();
        let result = Supervisor::new(app_config, handle.clone())
            .run(ProgressMetrics::hidden("delete_by_query books"))
            .await?;

        assert_eq!(handle.requests_per_second(), Some(1000.0));
        assert_eq!(result.status.requests_per_second, Some(1000.0));
        // -- 🗑️ the sink starts empty, so every seq_no-guarded delete is a conflict, quietly absorbed
        assert_eq!(result.status.total, 3);
        assert_eq!(result.status.version_conflicts, 3);
        assert!(result.bulk_failures.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_bad_job_never_reaches_a_backend() -> Result<()> {
        let app_config = in_memory_config(
            r#"
            [job]
            indices = ["books"]
            dest = { index = "books" }
            "#,
        )?;
        let err = Supervisor::new(app_config, RunHandle::new())
            .run(ProgressMetrics::hidden("reindex books → books"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BulkByScrollError>(),
            Some(BulkByScrollError::InvalidRequest(_))
        ));
        Ok(())
    }
}
