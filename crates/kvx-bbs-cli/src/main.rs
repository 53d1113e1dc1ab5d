//! 🚀 kvx-bbs-cli — the front door, the bouncer, the maitre d' of bulk-by-scroll.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 This binary crate is the thin CLI wrapper that loads config, sets up
//! logging, wires Ctrl-C to a polite cancel, and then lets the real code do
//! the heavy lifting. Like a manager. 🦆

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{Table, presets::UTF8_FULL};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use kvx_bbs::{ProgressMetrics, RunHandle, RunResult};

/// 🎛️ Search, rewrite, bulk, repeat.
#[derive(Parser, Debug)]
#[command(name = "kvx-bbs", version, about)]
struct Args {
    /// 🔧 TOML config; env vars prefixed KVX_ fill in the rest
    #[arg(default_value = "kvx-bbs.toml", env = "KVX_BBS_CONFIG")]
    config: PathBuf,

    /// 🙈 no progress bar
    #[arg(long, short)]
    quiet: bool,

    /// 📦 print the final result as JSON instead of a table
    #[arg(long)]
    json: bool,
}

/// 🚀 main() — where it all begins. The genesis. The big bang.
///
/// 🔧 Steps:
/// 1. Init tracing (so we can see what goes wrong, and when)
/// 2. Parse args
/// 3. Load config (the moment of truth)
/// 4. Run the thing, with Ctrl-C meaning "stop after this batch, please"
/// 5. Print what happened (or cry)
#[tokio::main]
async fn main() -> Result<()> {
    // 📡 Set up tracing — because println! debugging is a lifestyle choice
    // we're trying to move past, like flip phones and cargo shorts
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // 🔒 Validate the config file exists before we get too emotionally attached
    let config_file = args.config.as_path();
    let config_file_path_which_is_validated_to_exist = match config_file.try_exists()
        .context(format!("💀 Configuration file may not exist, couldn't find it. Double check that it exists, or maybe, it's an issue with pwd/cwd and relative paths. In that case, use an absolute path, to be absolutely certain, you are not messing this up. Was checking here: '{}'", config_file.display()))?
    {
        true => Some(config_file),  // ✅ Found it! Better than finding my car keys
        false => None               // 💤 Not there. Env vars it is.
    };

    // 🔧 Load the config — this is the moment where we find out if the TOML is valid
    // or if someone put a tab where a space should be (looking at you, Kevin)
    let app_config = kvx_bbs::load_config(config_file_path_which_is_validated_to_exist)
        .context("💀 In kvx-bbs-cli, main, we couldn't load the config file, take a look at the file, make sure it's correct. Make sure you didn't forget something obvious, dumas")?;

    let job_name = describe(&app_config);
    let progress = if args.quiet {
        ProgressMetrics::hidden(job_name)
    } else {
        ProgressMetrics::new(job_name)
    };

    // 🛑 Ctrl-C asks nicely. The run finishes its current step and stops.
    let handle = RunHandle::new();
    let ctrl_c_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Ctrl-C received, cancelling after the current step");
            ctrl_c_handle.cancel("by user request");
        }
    });

    // 🚀 SEND IT. No take-backs. This is not a drill.
    let result = kvx_bbs::run(app_config, handle, progress).await;

    match result {
        Ok(result) => {
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&result)
                        .context("💀 The result refused to become JSON")?
                );
            } else {
                println!("{}", summary(&result));
            }
            if !result.bulk_failures.is_empty() || !result.search_failures.is_empty() || result.timed_out {
                // -- ⚠️ finished, but not cleanly; the table above says why
                std::process::exit(2);
            }
            Ok(())
        }
        Err(err) => {
            report(&err);
            // 🗑️ Exit with prejudice. Process exitus maximus.
            std::process::exit(1);
        }
    }
}

/// 🏷️ "reindex [books] → books-v2", for the progress bar's headline.
fn describe(app_config: &kvx_bbs::AppConfig) -> String {
    let job = &app_config.job;
    match (&job.flavor, &job.dest) {
        (kvx_bbs::app_config::FlavorKind::Reindex, Some(dest)) => {
            format!("reindex {:?} → {}", job.indices, dest.index)
        }
        (kvx_bbs::app_config::FlavorKind::UpdateByQuery, _) => {
            format!("update_by_query {:?}", job.indices)
        }
        (kvx_bbs::app_config::FlavorKind::DeleteByQuery, _) => {
            format!("delete_by_query {:?}", job.indices)
        }
        (kvx_bbs::app_config::FlavorKind::Reindex, None) => format!("reindex {:?}", job.indices),
    }
}

/// 🍽️ The final scoreboard.
fn summary(result: &RunResult) -> Table {
    let status = &result.status;
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["what", "how many"]);
    table.add_row(vec!["took".to_string(), format!("{:?}", result.took)]);
    table.add_row(vec!["total".to_string(), status.total.to_string()]);
    table.add_row(vec!["created".to_string(), status.created.to_string()]);
    table.add_row(vec!["updated".to_string(), status.updated.to_string()]);
    table.add_row(vec!["deleted".to_string(), status.deleted.to_string()]);
    table.add_row(vec!["noops".to_string(), status.noops.to_string()]);
    table.add_row(vec!["version conflicts".to_string(), status.version_conflicts.to_string()]);
    table.add_row(vec!["batches".to_string(), status.batches.to_string()]);
    table.add_row(vec!["bulk retries".to_string(), status.bulk_retries.to_string()]);
    table.add_row(vec!["search retries".to_string(), status.search_retries.to_string()]);
    table.add_row(vec!["throttled".to_string(), format!("{:?}", status.throttled)]);
    table.add_row(vec!["bulk failures".to_string(), result.bulk_failures.len().to_string()]);
    table.add_row(vec!["search failures".to_string(), result.search_failures.len().to_string()]);
    if result.timed_out {
        table.add_row(vec!["timed out".to_string(), "yes".to_string()]);
    }
    if let Some(reason) = &status.canceled {
        table.add_row(vec!["canceled".to_string(), reason.clone()]);
    }
    for failure in result.bulk_failures.iter().take(5) {
        table.add_row(vec![
            format!("✗ {}/{}", failure.index, failure.id.as_deref().unwrap_or("-")),
            format!("{} {}", failure.status, failure.cause),
        ]);
    }
    table
}

/// 💀 Error handling: the part where we find out what went wrong
/// and print it in a way that's helpful at 3am.
fn report(err: &anyhow::Error) {
    error!("💀 error: {}", err);
    // -- 🧅 peel the onion of sadness, one tear-jerking layer at a time
    let mut the_vibes_are_giving_connection_issues = false;
    for cause in err.chain().skip(1) {
        error!("⚠️  cause: {}", cause);
        // -- 🕵️ sniff the cause like a truffle pig hunting for connection problems
        let cause_str = cause.to_string();
        if cause_str.contains("error sending request")
            || cause_str.contains("connection refused")
            || cause_str.contains("Connection refused")
            || cause_str.contains("tcp connect error")
            || cause_str.contains("dns error")
        {
            the_vibes_are_giving_connection_issues = true;
        }
    }

    // -- 📡 if it smells like a connection problem, it's probably a connection problem
    if the_vibes_are_giving_connection_issues {
        error!(
            "🔧 hint: looks like the cluster isn't reachable. \
            Double-check that Elasticsearch is actually running. If you're using Docker, try: \
            `docker ps` to see what's up, or `docker compose up -d` to resurrect it. \
            Even servers need a nudge sometimes. ☕"
        );
    }
}
