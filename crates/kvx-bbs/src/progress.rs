// AI
//! 📊 progress.rs — "Are we there yet?" — every bulk job, every time, forever.
//!
//! 🚀 Turns the run's [`BulkByScrollStatus`] snapshots into a progress bar and a
//! table of counters. Created, updated, deleted, noops, conflicts, retries, all
//! of it, in a table so comfy it has lumbar support.
//!
//! ⚠️  Warning: Watching this progress bar will not make it go faster.
//! Neither will rethrottling to infinity. Okay, that one actually might.
//!
//! 🦆 The duck has nothing to do with this module. It's just vibing.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::status::BulkByScrollStatus;

/// 🔢 Formats a number with commas for the 3 people in the audience who like readability.
/// "1000000 docs" → "1,000,000 docs" — you're welcome, eyes.
fn format_number(n: u64) -> String {
    let s = n.to_string();
    // -- 🧵 pre-allocate like we know what we're doing (we do, we read the book)
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ Formats a Duration into MM:SS or HH:MM:SS.
/// If it shows HH:MM:SS, you should probably call your mom. It's been a while.
fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

/// 🚦 "unlimited" reads better than "inf" on a dashboard.
fn format_rps(requests_per_second: Option<f32>) -> String {
    match requests_per_second {
        Some(rps) => format!("{rps:.1} docs/s cap"),
        None => "unthrottled".to_string(),
    }
}

/// 📊 The brains behind the progress display.
///
/// Uses a sliding 5-second window for the docs/s rate so spikes don't scare you.
///
/// # Ancient Proverb
/// "He who reindexes without a progress bar, reindexes alone and in darkness."
pub struct ProgressMetrics {
    /// 🏷️ what are we even doing? "reindex src → dest", or similar
    job_name: String,
    progress_bar: ProgressBar,
    /// 🔄 sliding window of (timestamp, processed) for the rate
    rate_samples: VecDeque<(Instant, u64)>,
    start_time: Instant,
    last: BulkByScrollStatus,
}

impl std::fmt::Debug for ProgressMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- 🎭 custom Debug impl because ProgressBar is a diva and doesn't derive Debug
        f.debug_struct("ProgressMetrics")
            .field("job_name", &self.job_name)
            .field("last", &self.last)
            .finish()
    }
}

impl ProgressMetrics {
    /// 🚀 A progress display drawn to stderr.
    pub fn new(job_name: impl Into<String>) -> Self {
        Self::with_target(job_name, ProgressDrawTarget::stderr())
    }

    /// 🙈 Same thing, drawn nowhere. For tests and `--quiet`.
    pub fn hidden(job_name: impl Into<String>) -> Self {
        Self::with_target(job_name, ProgressDrawTarget::hidden())
    }

    fn with_target(job_name: impl Into<String>, target: ProgressDrawTarget) -> Self {
        // -- 🎨 total is unknown until the first page lands; 0 for now
        let progress_bar = ProgressBar::with_draw_target(Some(0), target);
        let style = ProgressStyle::default_bar()
            .template("{msg}\n| [{bar:40.cyan/blue}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        progress_bar.set_style(style);

        let start_time = Instant::now();
        let mut rate_samples = VecDeque::new();
        // -- 🔄 seed the rate window with t=0 so we don't divide by zero like animals
        rate_samples.push_back((start_time, 0u64));

        Self {
            job_name: job_name.into(),
            progress_bar,
            rate_samples,
            start_time,
            last: BulkByScrollStatus::default(),
        }
    }

    /// 🔄 Feed it the latest snapshot. Re-renders the table and moves the bar.
    pub fn update(&mut self, status: &BulkByScrollStatus) {
        self.last = status.clone();
        let processed = status.successfully_processed();
        let docs_per_sec = self.docs_per_sec(processed);
        self.progress_bar.set_length(status.total.max(processed));
        self.progress_bar.set_position(processed);
        self.progress_bar.set_message(self.render(docs_per_sec));
    }

    /// ✅ Mark the progress bar done. Ring the bell. We made it.
    pub fn finish(&self) {
        self.progress_bar.finish();
    }

    /// 📈 docs/s over the last 5 seconds.
    fn docs_per_sec(&mut self, processed: u64) -> f64 {
        let now = Instant::now();
        let window = Duration::from_secs(5);
        while let Some(&(timestamp, _)) = self.rate_samples.front() {
            if now.duration_since(timestamp) > window {
                self.rate_samples.pop_front();
            } else {
                break;
            }
        }
        self.rate_samples.push_back((now, processed));

        match self.rate_samples.front() {
            Some(&(oldest_time, oldest_processed)) => {
                let elapsed = now.duration_since(oldest_time).as_secs_f64();
                if elapsed > 0.0 {
                    processed.saturating_sub(oldest_processed) as f64 / elapsed
                } else {
                    // -- 💤 not enough elapsed time yet, maintain composure
                    0.0
                }
            }
            None => 0.0,
        }
    }

    /// 🎨 The counters, as a borderless two-column table.
    ///
    /// ```text
    /// reindex src → dest
    ///   <docs/s>            <processed> / <total>
    ///   <created> created   <updated> updated
    ///   <deleted> deleted   <noops> noops
    ///   <conflicts>         <batches> batches
    ///   <retries>           <throttle>
    ///   <elapsed>
    /// ```
    fn render(&self, docs_per_sec: f64) -> String {
        let status = &self.last;
        let right = |text: String| Cell::new(text).set_alignment(CellAlignment::Right);

        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.add_row(vec![
            right(format!("{} Docs/s", format_number(docs_per_sec as u64))),
            right(format!(
                "{} / {} Docs",
                format_number(status.successfully_processed()),
                format_number(status.total)
            )),
        ]);
        table.add_row(vec![
            right(format!("{} created", format_number(status.created))),
            right(format!("{} updated", format_number(status.updated))),
        ]);
        table.add_row(vec![
            right(format!("{} deleted", format_number(status.deleted))),
            right(format!("{} noops", format_number(status.noops))),
        ]);
        table.add_row(vec![
            right(format!("{} conflicts", format_number(status.version_conflicts))),
            right(format!("{} batches", format_number(status.batches))),
        ]);
        table.add_row(vec![
            right(format!(
                "{} bulk / {} search retries",
                status.bulk_retries, status.search_retries
            )),
            right(format!(
                "{} (slept {})",
                format_rps(status.requests_per_second),
                format_duration(status.throttled)
            )),
        ]);
        table.add_row(vec![right(format!(
            "{} elapsed",
            format_duration(self.start_time.elapsed())
        ))]);

        format!("{}\n{}", self.job_name, table)
    }
}
