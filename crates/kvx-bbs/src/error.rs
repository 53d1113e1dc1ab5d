// ai
//! 💀 Errors — the ways a run can end badly, each with a name tag.
//!
//! Collaborators (search, bulk, refresh) speak `anyhow`. The coordinator
//! translates whatever they say into one [`BulkByScrollError`] at the moment
//! a run dies. There is exactly one of those per failed run. Never zero,
//! never two. 🦆
//!
//! 🧠 Knowledge graph:
//! - [`Rejected`] is the marker a collaborator wraps its error in when the
//!   failure is worth retrying (HTTP 429, full thread pool queues).
//! - [`is_rejected`] walks the anyhow chain looking for that marker.

use thiserror::Error;

/// 🚦 "Not now, maybe later." A retryable overload signal from a collaborator.
///
/// Wrap a transport error in this (or return it directly) and the retry layer
/// will back off and try again instead of killing the run.
#[derive(Debug, Error)]
#[error("🚦 rejected execution: {reason}")]
pub struct Rejected {
    pub reason: String,
}

impl Rejected {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// 🔍 Does any link of this error chain say "try again later"?
pub fn is_rejected(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.downcast_ref::<Rejected>().is_some())
}

/// 💀 Everything that ends a run with an error instead of a result.
///
/// Per-item write failures and version conflicts are NOT in here: those are
/// recorded in the result and the run still completes.
#[derive(Debug, Error)]
pub enum BulkByScrollError {
    /// 🔍 The cursor could not be opened or advanced (after search retries, if any).
    #[error("💀 search failed: {0:#}")]
    SearchFailed(anyhow::Error),

    /// 📬 The bulk sink gave up: retries exhausted, or the failure was never retryable.
    #[error("💀 bulk request failed: {0:#}")]
    BulkFailed(anyhow::Error),

    /// 🧪 A script did something a script is not allowed to do.
    #[error("💀 script error: {0}")]
    Script(String),

    /// 🙅 A hit failed the flavor's precondition check. One bad apple spoils the run.
    #[error("💀 document rejected: {0}")]
    DocumentRejected(String),

    /// 🔄 The final refresh failed. Any partial failures collected before it are dropped.
    #[error("💀 refresh failed: {0:#}")]
    RefreshFailed(anyhow::Error),

    /// 🔧 The request could not be assembled in the first place.
    #[error("💀 invalid request: {0}")]
    InvalidRequest(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn the_one_where_rejections_survive_being_wrapped_in_context() {
        let err = anyhow::Error::new(Rejected::new("queue full"))
            .context("while sending bulk")
            .context("while doing my best");
        assert!(is_rejected(&err));
    }

    #[test]
    fn the_one_where_a_plain_error_is_not_a_rejection() {
        let err: anyhow::Result<()> = Err(anyhow::anyhow!("mapping exploded"));
        let err = err.context("while sending bulk").unwrap_err();
        assert!(!is_rejected(&err));
    }

    #[test]
    fn the_one_where_fatal_errors_print_their_cause() {
        let err = BulkByScrollError::BulkFailed(anyhow::anyhow!("connection reset"));
        assert!(err.to_string().contains("connection reset"));
    }
}
