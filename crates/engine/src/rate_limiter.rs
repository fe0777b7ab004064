//! Token-bucket admission control keyed on `(tenant, node-type)` and
//! `(tenant, global)`.
//!
//! Limiter state lives in memory, one instance per coordinator process —
//! on cluster deployments limits are therefore approximate rather than
//! globally exact.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Outcome of a [`RateLimiter::try_acquire`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Acquired,
    /// Denied; retry no sooner than `now + wait_hint`.
    Denied { wait_hint: Duration },
}

struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(refill_per_sec: f64, capacity: f64, now: Instant) -> Self {
        Self { capacity, tokens: capacity, refill_per_sec, last_refill: now }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }

    fn try_take(&mut self, n: f64, now: Instant) -> Admission {
        self.refill(now);
        if self.tokens >= n {
            self.tokens -= n;
            Admission::Acquired
        } else {
            let deficit = n - self.tokens;
            let seconds = if self.refill_per_sec > 0.0 { deficit / self.refill_per_sec } else { 1.0 };
            Admission::Denied { wait_hint: Duration::from_secs_f64(seconds) }
        }
    }
}

/// Keys a bucket by the two dimensions the Scheduler cares about:
/// per-tenant-and-node-type, and per-tenant overall.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BucketKey {
    TenantNodeType(String, String),
    TenantGlobal(String),
}

pub struct RateLimiter {
    tenant_rps: f64,
    tenant_burst: f64,
    node_type_rps: f64,
    node_type_burst: f64,
    buckets: Mutex<HashMap<BucketKey, Bucket>>,
}

impl RateLimiter {
    pub fn new(tenant_rps: f64, tenant_burst: u32, node_type_rps: f64, node_type_burst: u32) -> Self {
        Self {
            tenant_rps,
            tenant_burst: tenant_burst as f64,
            node_type_rps,
            node_type_burst: node_type_burst as f64,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Admit `n` units of work for `tenant_id` dispatching to `node_type`.
    /// Denies (without consuming tokens from either bucket) if *either*
    /// dimension is exhausted; the caller gets back the larger wait hint.
    pub fn try_acquire(&self, tenant_id: &str, node_type: &str, n: u32) -> Admission {
        let now = Instant::now();
        let n = n as f64;
        let mut buckets = self.buckets.lock().unwrap();

        let tenant_key = BucketKey::TenantGlobal(tenant_id.to_string());
        let tenant_bucket =
            buckets.entry(tenant_key).or_insert_with(|| Bucket::new(self.tenant_rps, self.tenant_burst, now));
        // Peek without mutating: refill, check, but don't commit the debit
        // until we know the node-type bucket also admits.
        tenant_bucket.refill(now);
        if tenant_bucket.tokens < n {
            let deficit = n - tenant_bucket.tokens;
            let seconds = if self.tenant_rps > 0.0 { deficit / self.tenant_rps } else { 1.0 };
            return Admission::Denied { wait_hint: Duration::from_secs_f64(seconds) };
        }

        let node_key = BucketKey::TenantNodeType(tenant_id.to_string(), node_type.to_string());
        let node_bucket = buckets
            .entry(node_key)
            .or_insert_with(|| Bucket::new(self.node_type_rps, self.node_type_burst, now));
        let node_admission = node_bucket.try_take(n, now);
        if let Admission::Denied { wait_hint } = node_admission {
            return Admission::Denied { wait_hint };
        }

        // Node-type bucket debited; now actually commit the tenant debit.
        let tenant_bucket = buckets.get_mut(&BucketKey::TenantGlobal(tenant_id.to_string())).unwrap();
        tenant_bucket.tokens -= n;

        Admission::Acquired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_within_burst_then_denies() {
        let limiter = RateLimiter::new(1.0, 2, 100.0, 100);
        assert_eq!(limiter.try_acquire("t1", "http", 1), Admission::Acquired);
        assert_eq!(limiter.try_acquire("t1", "http", 1), Admission::Acquired);
        assert!(matches!(limiter.try_acquire("t1", "http", 1), Admission::Denied { .. }));
    }

    #[test]
    fn tenants_have_independent_buckets() {
        let limiter = RateLimiter::new(1.0, 1, 100.0, 100);
        assert_eq!(limiter.try_acquire("t1", "http", 1), Admission::Acquired);
        assert_eq!(limiter.try_acquire("t2", "http", 1), Admission::Acquired);
    }

    #[test]
    fn node_type_bucket_denies_independently_of_tenant_bucket() {
        let limiter = RateLimiter::new(100.0, 100, 1.0, 1);
        assert_eq!(limiter.try_acquire("t1", "http", 1), Admission::Acquired);
        assert!(matches!(limiter.try_acquire("t1", "http", 1), Admission::Denied { .. }));
        // A different node-type for the same tenant still has its own bucket.
        assert_eq!(limiter.try_acquire("t1", "transform", 1), Admission::Acquired);
    }
}
