//! Engine-wide tuning knobs.
//!
//! Direct `std::env::var` lookups with a `RAT_` prefix, no generic
//! config-file crate, `Default` giving sensible production values.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent_runs: usize,
    pub default_step_timeout: Duration,
    pub default_run_timeout: Duration,
    pub default_max_retries: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_cap: Duration,
    pub retry_jitter: Duration,
    pub tenant_rate_limit_rps: f64,
    pub tenant_rate_limit_burst: u32,
    pub node_type_rate_limit_rps: f64,
    pub node_type_rate_limit_burst: u32,
    pub coordinator_lease: Duration,
    pub lease_renew_interval: Duration,
    pub inbox_capacity: usize,
    pub work_queue_prefetch: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 256,
            default_step_timeout: Duration::from_secs(30),
            default_run_timeout: Duration::from_secs(3600),
            default_max_retries: 3,
            retry_backoff_base: Duration::from_millis(100),
            retry_backoff_cap: Duration::from_secs(30),
            retry_jitter: Duration::from_millis(50),
            tenant_rate_limit_rps: 50.0,
            tenant_rate_limit_burst: 100,
            node_type_rate_limit_rps: 20.0,
            node_type_rate_limit_burst: 40,
            coordinator_lease: Duration::from_secs(30),
            lease_renew_interval: Duration::from_secs(10),
            inbox_capacity: 256,
            work_queue_prefetch: 16,
        }
    }
}

impl EngineConfig {
    /// Overlay environment variables (`RAT_*`) onto the defaults. Malformed
    /// values are ignored in favor of the default, logged at `warn`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.max_concurrent_runs = env_usize("RAT_MAX_CONCURRENT_RUNS", cfg.max_concurrent_runs);
        cfg.default_step_timeout = env_duration_ms("RAT_STEP_TIMEOUT_MS", cfg.default_step_timeout);
        cfg.default_run_timeout = env_duration_ms("RAT_RUN_TIMEOUT_MS", cfg.default_run_timeout);
        cfg.default_max_retries = env_u32("RAT_MAX_RETRIES", cfg.default_max_retries);
        cfg.retry_backoff_base = env_duration_ms("RAT_RETRY_BACKOFF_BASE_MS", cfg.retry_backoff_base);
        cfg.retry_backoff_cap = env_duration_ms("RAT_RETRY_BACKOFF_CAP_MS", cfg.retry_backoff_cap);
        cfg.retry_jitter = env_duration_ms("RAT_RETRY_JITTER_MS", cfg.retry_jitter);
        cfg.tenant_rate_limit_rps = env_f64("RAT_TENANT_RATE_LIMIT_RPS", cfg.tenant_rate_limit_rps);
        cfg.tenant_rate_limit_burst = env_u32("RAT_TENANT_RATE_LIMIT_BURST", cfg.tenant_rate_limit_burst);
        cfg.node_type_rate_limit_rps = env_f64("RAT_NODE_TYPE_RATE_LIMIT_RPS", cfg.node_type_rate_limit_rps);
        cfg.node_type_rate_limit_burst = env_u32("RAT_NODE_TYPE_RATE_LIMIT_BURST", cfg.node_type_rate_limit_burst);
        cfg.coordinator_lease = env_duration_secs("RAT_COORDINATOR_LEASE_SECS", cfg.coordinator_lease);
        cfg.lease_renew_interval = env_duration_secs("RAT_LEASE_RENEW_SECS", cfg.lease_renew_interval);
        cfg.inbox_capacity = env_usize("RAT_INBOX_CAPACITY", cfg.inbox_capacity);
        cfg.work_queue_prefetch = env_usize("RAT_WORK_QUEUE_PREFETCH", cfg.work_queue_prefetch);
        cfg
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_duration_ms(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
