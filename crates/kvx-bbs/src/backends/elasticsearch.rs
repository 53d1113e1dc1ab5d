//! # 📡 THE ELASTICSEARCH BACKEND
//!
//! *Previously, on Kravex...*
//!
//! 🎬 COLD OPEN — INT. SERVER ROOM — 3:47 AM
//!
//! The monitoring dashboard glows amber in the dark. One engineer, alone,
//! stares at an update-by-query that has been "almost done" for two hours.
//! The cluster offers a 429. Our hero's coffee has gone cold.
//!
//! "I'll just scroll through it," they whispered. "It'll be fast," they said.
//!
//! 🚀 This module is the HTTP face of the engine: a scroll cursor
//! (`_search?scroll=` / `_search/scroll`), a bulk writer (`_bulk`), and a
//! refresher (`_refresh`). Everything else, the counting and the retrying and
//! the deciding, happens upstream in the coordinator.
//!
//! 🧠 Knowledge graph:
//! - configs: [`ElasticsearchSourceConfig`], [`ElasticsearchSinkConfig`] (url + auth + common knobs)
//! - [`build_client`]: one reqwest client per backend, sane timeouts
//! - [`authorize`]: API key beats basic auth; anonymous is a lifestyle choice
//! - [`check_status`]: 429 becomes [`Rejected`] so the retry layer can do its thing
//!
//! 🦆 (mandatory duck, no context provided, none shall be requested)

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::trace;

use crate::backends::{CommonSinkConfig, CommonSourceConfig};
use crate::error::Rejected;

mod bulk_sink;
mod scroll_source;

pub use bulk_sink::ElasticsearchBulkSink;
pub use scroll_source::ElasticsearchScrollSource;

// 🔧 auth is tri-modal: username+password, api_key, or "I hope anonymous works" (it won't).
#[derive(Debug, Deserialize, Clone)]
pub struct ElasticsearchSourceConfig {
    /// 📡 The URL of your cluster. Include scheme + port. Yes, all of it.
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    /// 🔒 If this is in plaintext in your config file, I've already filed a complaint.
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 API key auth — preferred over basic auth. Hierarchy. This field respects hierarchy.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub common_config: CommonSourceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ElasticsearchSinkConfig {
    /// 📡 Where to send the writes.
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    /// 🔒 "password123" is not a password. It is a confession.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub common_config: CommonSinkConfig,
}

/// 🔒 The three things every request needs to be let into the club.
#[derive(Debug, Clone, Default)]
pub(crate) struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
}

/// 🔧 Build the HTTP client. 10s to connect, `request_timeout` (plus a little
/// grace, so the server-side timeout fires first) for the whole exchange.
pub(crate) fn build_client(request_timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(request_timeout.saturating_add(Duration::from_secs(30)))
        .build()
        .context("💀 The HTTP client refused to be born. Probably a missing TLS cert or a cursed system OpenSSL. Either way: tragic.")
}

/// 🔒 Auth priority: API key wins over basic auth. This is not a democracy.
pub(crate) fn authorize(
    request: reqwest::RequestBuilder,
    credentials: &Credentials,
) -> reqwest::RequestBuilder {
    if let Some(ref api_key) = credentials.api_key {
        request.header("Authorization", format!("ApiKey {}", api_key))
    } else if let Some(ref username) = credentials.username {
        request.basic_auth(username, credentials.password.as_ref())
    } else {
        request
    }
}

/// 🚦 Turn a non-2xx response into an error. 429 is special: it's a [`Rejected`],
/// which means "back off and try again", not "give up".
pub(crate) async fn check_status(
    response: reqwest::Response,
    what: &str,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        trace!("✅ {what} came back {status}");
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(anyhow::Error::new(Rejected::new(body))
            .context(format!("🚦 {what} was rejected with 429. The cluster needs a minute.")));
    }
    anyhow::bail!("💀 {what} failed with status {status}. The response body read: '{body}'")
}

/// 📡 `https://host/` + `path` without the double slash. One slash of difference.
/// Infinite suffering of difference.
pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// 💬 Failures come back as `{"type": "...", "reason": "..."}`, or sometimes just a string.
pub(crate) fn render_cause(cause: &serde_json::Value) -> String {
    match cause {
        serde_json::Value::String(reason) => reason.clone(),
        serde_json::Value::Object(object) => {
            let kind = object.get("type").and_then(|v| v.as_str()).unwrap_or("unknown");
            match object.get("reason").and_then(|v| v.as_str()) {
                Some(reason) => format!("{kind}: {reason}"),
                None => kind.to_string(),
            }
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn the_one_where_slashes_do_not_multiply() {
        assert_eq!(endpoint("http://es:9200/", "/_bulk"), "http://es:9200/_bulk");
        assert_eq!(endpoint("http://es:9200", "_bulk"), "http://es:9200/_bulk");
    }

    #[test]
    fn the_one_where_an_eternal_timeout_still_builds_a_client() -> anyhow::Result<()> {
        build_client(Duration::from_secs(u64::MAX))?;
        build_client(Duration::MAX)?;
        Ok(())
    }

    #[test]
    fn the_one_where_causes_are_rendered_for_humans() {
        assert_eq!(
            render_cause(&json!({"type": "mapper_parsing_exception", "reason": "bad field"})),
            "mapper_parsing_exception: bad field"
        );
        assert_eq!(render_cause(&json!("plain")), "plain");
        assert_eq!(render_cause(&json!({"type": "mystery"})), "mystery");
    }
}
