// ai
//! 🎬 *[two configs walk into a struct. one sizes scroll pages. one sizes patience.]*
//!
//! 📦 **Common Backend Configs** — the shared DNA of source and sink configuration.
//!
//! 🧠 Knowledge graph:
//! - `CommonSourceConfig`: embedded in every source backend config. How big a
//!   page do we pull, and how long does the server keep the cursor warm?
//! - `CommonSinkConfig`: embedded in every sink backend config. How long may a
//!   bulk call take, and how many shard copies must be awake before it writes?
//! - `duration_str`: the serde helper that turns "5m" into a `Duration` without
//!   anyone having to count milliseconds on their fingers. 🦆

use std::time::Duration;

use serde::Deserialize;

// ============================================================
// 📦 CommonSourceConfig — shared source-side knobs
// ============================================================

/// 📦 Shared configuration embedded by every source backend config.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CommonSourceConfig {
    /// 📦 hits per scroll page
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// ⏳ how long the server keeps the scroll context alive between pages
    #[serde(default = "default_scroll_keep_alive", with = "duration_str")]
    pub scroll_keep_alive: Duration,
}

// 📦 1000 hits per page — the same number the search engine picks when nobody asks.
fn default_batch_size() -> usize {
    1000
}

fn default_scroll_keep_alive() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Default for CommonSourceConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            scroll_keep_alive: default_scroll_keep_alive(),
        }
    }
}

// ============================================================
// 🚰 CommonSinkConfig — shared sink-side knobs
// ============================================================

/// 🚰 Shared configuration embedded by every sink backend config.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CommonSinkConfig {
    /// ⏱️ per bulk request timeout, forwarded to the destination
    #[serde(default = "default_request_timeout", with = "duration_str")]
    pub request_timeout: Duration,
    /// 🧮 "1", "all", or a number of shard copies that must be active before writing
    #[serde(default = "default_wait_for_active_shards")]
    pub wait_for_active_shards: String,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_wait_for_active_shards() -> String {
    "1".to_string()
}

impl Default for CommonSinkConfig {
    fn default() -> Self {
        CommonSinkConfig {
            request_timeout: default_request_timeout(),
            wait_for_active_shards: default_wait_for_active_shards(),
        }
    }
}

// ============================================================
// ⏱️ duration_str — "5m" in, Duration out
// ============================================================

/// ⏱️ Serde glue for human durations: `"250ms"`, `"30s"`, `"5m"`, `"1h"`, `"2d"`.
/// A bare integer is read as milliseconds.
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
            Raw::Text(text) => parse(&text).map_err(serde::de::Error::custom),
        }
    }

    /// 🔧 Parse one human duration. Units are required for strings.
    pub fn parse(text: &str) -> anyhow::Result<Duration> {
        let text = text.trim();
        let split_at = text
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| anyhow::anyhow!("💀 duration '{text}' is missing a unit (ms, s, m, h, d)"))?;
        let (number, unit) = text.split_at(split_at);
        let value: u64 = number
            .parse()
            .map_err(|_| anyhow::anyhow!("💀 duration '{text}' does not start with a number"))?;
        let seconds_per_unit = match unit {
            "ms" => return Ok(Duration::from_millis(value)),
            "s" => 1,
            "m" => 60,
            "h" => 60 * 60,
            "d" => 60 * 60 * 24,
            other => anyhow::bail!("💀 duration '{text}' has an unknown unit '{other}'"),
        };
        let seconds = value
            .checked_mul(seconds_per_unit)
            .ok_or_else(|| anyhow::anyhow!("💀 duration '{text}' is out of range. Nobody is waiting that long."))?;
        Ok(Duration::from_secs(seconds))
    }

    /// 📡 Render a duration the way the search engine likes it in URLs: `"300000ms"`.
    pub fn to_es_time(duration: Duration) -> String {
        format!("{}ms", duration.as_millis())
    }
}
