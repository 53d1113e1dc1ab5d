// ai
//! 🦀 kvx-bbs — bulk-by-scroll. Search a set of indices, rewrite every hit,
//! write the result back in batches. Reindex, update-by-query, delete-by-query:
//! same loop, three flavors.
//!
//! 🧠 Knowledge graph:
//! - [`app_config`] loads what to do, [`supervisors`] wires it up
//! - [`coordinator::BulkByScroll`] is the state machine doing the actual run
//! - [`status::RunHandle`] is how the outside world watches, cancels and rethrottles it
//! - [`backends`] hold the scroll sources and bulk sinks; [`flavors`] and
//!   [`script`] decide what each hit turns into
//!
//! 🦆 The duck supervises the supervisor.

pub mod app_config;
pub mod backends;
pub mod backoff;
pub mod common;
pub mod coordinator;
pub mod error;
pub mod flavors;
pub mod progress;
pub mod request;
pub mod retry;
pub mod script;
pub mod source_filter;
pub mod status;
mod supervisors;
mod transforms;

use anyhow::Result;

pub use app_config::{AppConfig, load_config};
pub use coordinator::{BulkByScroll, RunResult};
pub use error::BulkByScrollError;
pub use progress::ProgressMetrics;
pub use request::BulkByScrollRequest;
pub use script::ScriptRegistry;
pub use status::{BulkByScrollStatus, RunHandle};

use crate::supervisors::Supervisor;

/// 🚀 Run the configured job with the built-in scripts. Load it, do it.
pub async fn run(
    app_config: AppConfig,
    handle: RunHandle,
    progress: ProgressMetrics,
) -> Result<RunResult> {
    Supervisor::new(app_config, handle).run(progress).await
}

/// 🚀 Same as [`run`], with your own scripts registered.
pub async fn run_with_scripts(
    app_config: AppConfig,
    handle: RunHandle,
    scripts: ScriptRegistry,
    progress: ProgressMetrics,
) -> Result<RunResult> {
    Supervisor::new(app_config, handle)
        .with_scripts(scripts)
        .run(progress)
        .await
}
