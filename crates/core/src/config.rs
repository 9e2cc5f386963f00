//! Runtime settings read from `REKON_*` environment variables.

use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Wall-clock budget for one dry-run fixed-point loop.
    pub plan_timeout: Duration,
    /// Optional cap on reconcile rounds; 0 means unbounded.
    pub plan_max_rounds: usize,
    pub default_locale: String,
    pub notify_queue_cap: usize,
    /// Drained notifications per second.
    pub notify_qps: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            plan_timeout: Duration::from_secs(1000),
            plan_max_rounds: 0,
            default_locale: "en".to_string(),
            notify_queue_cap: 1024,
            notify_qps: 10,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            plan_timeout: env_parse::<u64>("REKON_PLAN_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.plan_timeout),
            plan_max_rounds: env_parse("REKON_PLAN_MAX_ROUNDS").unwrap_or(d.plan_max_rounds),
            default_locale: std::env::var("REKON_DEFAULT_LOCALE").ok().filter(|s| !s.is_empty()).unwrap_or(d.default_locale),
            notify_queue_cap: env_parse::<usize>("REKON_NOTIFY_QUEUE_CAP").unwrap_or(d.notify_queue_cap).max(1),
            notify_qps: env_parse::<u32>("REKON_NOTIFY_QPS").unwrap_or(d.notify_qps).max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_budget() {
        let s = Settings::default();
        assert_eq!(s.plan_timeout, Duration::from_secs(1000));
        assert_eq!(s.plan_max_rounds, 0);
        assert_eq!(s.default_locale, "en");
    }
}
