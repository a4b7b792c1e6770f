//! Controller configuration: defaults with `REPLICON_*` environment overrides.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Concurrent workers pulling keys from the queue.
    pub workers: usize,
    /// Grace period passed to every delete.
    pub delete_grace_secs: u32,
    /// Periodic re-trigger of converged keys; `None` waits for the next change.
    pub resync: Option<Duration>,
    /// A pass still running after this long is cancelled.
    pub pass_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Base seed for unit-name generators; each worker adds its index.
    pub name_seed: Option<u64>,
    pub queue_cap: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            delete_grace_secs: 30,
            resync: None,
            pass_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(60),
            name_seed: None,
            queue_cap: 4096,
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary key lookup; unparsable values keep the default.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: std::str::FromStr, G: Fn(&str) -> Option<String>>(get: &G, key: &str) -> Option<T> {
            get(key).and_then(|s| s.trim().parse().ok())
        }
        let d = Self::default();
        Self {
            workers: parse::<usize, _>(&get, "REPLICON_WORKERS").filter(|n| *n > 0).unwrap_or(d.workers),
            delete_grace_secs: parse(&get, "REPLICON_DELETE_GRACE_SECS").unwrap_or(d.delete_grace_secs),
            resync: match parse::<u64, _>(&get, "REPLICON_RESYNC_SECS") {
                Some(0) => None,
                Some(s) => Some(Duration::from_secs(s)),
                None => d.resync,
            },
            pass_timeout: parse(&get, "REPLICON_PASS_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.pass_timeout),
            backoff_base: parse(&get, "REPLICON_BACKOFF_BASE_MS").map(Duration::from_millis).unwrap_or(d.backoff_base),
            backoff_max: parse(&get, "REPLICON_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.backoff_max),
            name_seed: parse(&get, "REPLICON_NAME_SEED").or(d.name_seed),
            queue_cap: parse::<usize, _>(&get, "REPLICON_QUEUE_CAP").filter(|n| *n > 0).unwrap_or(d.queue_cap),
        }
    }

    /// `base * 2^(attempts-1)`, capped at `backoff_max`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(20);
        self.backoff_base.checked_mul(1u32 << shift).unwrap_or(self.backoff_max).min(self.backoff_max)
    }
}
