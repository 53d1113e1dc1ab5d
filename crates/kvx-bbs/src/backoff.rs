// ai
//! ⏳ Backoff — a bounded list of "not yet"s.
//!
//! A [`BackoffPolicy`] hands out an iterator of wait durations. When the
//! iterator runs dry, the retrier stops being patient and surfaces the last
//! error. That is the whole contract. 🦆
//!
//! The exponential curve is `initial + 10ms * (floor(e^(0.8 * n)) - 1)` for
//! the n-th retry, starting at n = 0. It starts gentle and gets grumpy fast:
//! with a 500ms start, the 11th wait is a little over 50 seconds.

use std::time::Duration;

/// ⏳ How long to wait between attempts, and how many attempts to allow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffPolicy {
    /// 🚫 zero retries; the first retryable failure is final
    NoBackoff,
    /// 🧱 the same delay, `max_retries` times
    Constant { delay: Duration, max_retries: u32 },
    /// 📈 the exponential curve described in the module docs
    Exponential { initial: Duration, max_retries: u32 },
}

impl BackoffPolicy {
    pub fn constant(delay: Duration, max_retries: u32) -> Self {
        BackoffPolicy::Constant { delay, max_retries }
    }

    pub fn exponential(initial: Duration, max_retries: u32) -> Self {
        BackoffPolicy::Exponential {
            initial,
            max_retries,
        }
    }

    /// 🔢 How many retries this policy allows in total.
    pub fn max_retries(&self) -> u32 {
        match self {
            BackoffPolicy::NoBackoff => 0,
            BackoffPolicy::Constant { max_retries, .. } => *max_retries,
            BackoffPolicy::Exponential { max_retries, .. } => *max_retries,
        }
    }

    /// 🔄 A fresh, independent sequence of delays. Each retry loop gets its own.
    pub fn iter(&self) -> Backoff {
        Backoff {
            policy: *self,
            consumed: 0,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::exponential(Duration::from_millis(500), 11)
    }
}

/// 🔄 The iterator behind [`BackoffPolicy::iter`]. Exhausts after `max_retries` items.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    consumed: u32,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.consumed >= self.policy.max_retries() {
            return None;
        }
        let n = self.consumed;
        self.consumed += 1;
        match self.policy {
            BackoffPolicy::NoBackoff => None,
            BackoffPolicy::Constant { delay, .. } => Some(delay),
            BackoffPolicy::Exponential { initial, .. } => {
                // -- 📈 floor(e^(0.8n)) saturates long before u64 does at sane retry counts
                let growth = (0.8_f64 * f64::from(n)).exp().floor() as u64;
                let extra_ms = 10u64.saturating_mul(growth.saturating_sub(1));
                Some(initial + Duration::from_millis(extra_ms))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.policy.max_retries().saturating_sub(self.consumed) as usize;
        (left, Some(left))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_no_backoff_means_no_second_chances() {
        assert_eq!(BackoffPolicy::NoBackoff.iter().next(), None);
    }

    #[test]
    fn the_one_where_constant_backoff_is_boringly_consistent() {
        let delays: Vec<_> = BackoffPolicy::constant(Duration::from_millis(7), 3)
            .iter()
            .collect();
        assert_eq!(delays, vec![Duration::from_millis(7); 3]);
    }

    #[test]
    fn the_one_where_exponential_backoff_follows_the_curve() {
        let delays: Vec<_> = BackoffPolicy::exponential(Duration::from_millis(500), 4)
            .iter()
            .collect();
        // -- e^0 = 1 → +0, e^0.8 ≈ 2.22 → +10, e^1.6 ≈ 4.95 → +30, e^2.4 ≈ 11.02 → +100
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(510),
                Duration::from_millis(530),
                Duration::from_millis(600),
            ]
        );
    }

    #[test]
    fn the_one_where_every_iterator_starts_from_scratch() {
        let policy = BackoffPolicy::constant(Duration::from_millis(1), 2);
        let mut first = policy.iter();
        first.next();
        first.next();
        assert_eq!(first.next(), None);
        assert_eq!(policy.iter().count(), 2);
    }

    #[test]
    fn the_one_where_size_hint_counts_down() {
        let mut backoff = BackoffPolicy::constant(Duration::from_millis(1), 3).iter();
        assert_eq!(backoff.size_hint(), (3, Some(3)));
        backoff.next();
        assert_eq!(backoff.size_hint(), (2, Some(2)));
    }
}
