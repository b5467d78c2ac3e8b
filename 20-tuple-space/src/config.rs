//! Coordinator tuning.

use std::time::Duration;

use rand::Rng;

/// How TAKE behaves when the voters cannot agree on a tuple.
#[derive(Debug, Clone)]
pub struct TakeRetryPolicy {
    /// Pause between locking rounds.
    pub backoff: Duration,
    /// Upper bound of the random delay added to every pause.
    pub jitter: Duration,
    /// `None` retries until the voters agree.
    pub max_rounds: Option<u32>,
}

impl TakeRetryPolicy {
    /// Pause before the next round: `backoff` plus a random share of `jitter`.
    pub fn next_pause(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.backoff;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        self.backoff + Duration::from_millis(extra)
    }

    /// Whether another round may start after `rounds` rounds have failed.
    pub fn allows_another(&self, rounds: u32) -> bool {
        self.max_rounds.map_or(true, |max| rounds < max)
    }
}

impl Default for TakeRetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(5),
            jitter: Duration::from_millis(250),
            max_rounds: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    pub take_retry: TakeRetryPolicy,
    /// Bound on every wait for replica replies. `None` waits forever.
    pub wait_timeout: Option<Duration>,
}
