//! Generic token-bucket rate limiting, composed into the three named limits
//! the gateway and ingress enforce.
//!
//! Grounded in the in-memory limiter the teacher keeps as a Redis fallback
//! (a `DashMap` of per-key state protected by its own entry lock), but
//! reshaped from a fixed-window counter into a true token bucket: refill is
//! continuous rather than reset-on-window-boundary.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a bucket may sit idle before a sweep reclaims it.
pub const IDLE_EVICTION_THRESHOLD: Duration = Duration::from_secs(3600);
/// How often the eviction sweep runs.
pub const EVICTION_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// A single key's mutable bucket state.
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_activity: Instant,
}

/// A keyed token bucket. `allow` never blocks: a denied call fails
/// immediately rather than waiting for tokens to refill.
pub struct TokenBucket {
    max_tokens: f64,
    refill_per_second: f64,
    buckets: DashMap<String, Bucket>,
}

impl TokenBucket {
    pub fn new(max_tokens: f64, refill_per_second: f64) -> Self {
        Self {
            max_tokens,
            refill_per_second,
            buckets: DashMap::new(),
        }
    }

    /// Try to take `cost` tokens for `key`. Refills before checking; on
    /// denial, no tokens are consumed (no partial consumption).
    pub fn allow(&self, key: &str, cost: f64) -> bool {
        let now = Instant::now();
        let mut entry = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.max_tokens,
            last_refill: now,
            last_activity: now,
        });

        let elapsed = now.duration_since(entry.last_refill).as_secs_f64();
        entry.tokens = (entry.tokens + elapsed * self.refill_per_second).min(self.max_tokens);
        entry.last_refill = now;
        entry.last_activity = now;

        if entry.tokens >= cost {
            entry.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Evict buckets idle for longer than `max_idle` (default: one hour).
    pub fn evict_idle(&self, max_idle: Duration) {
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_activity) < max_idle);
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Shape (max tokens, refill/sec) for one of the three named limits.
#[derive(Debug, Clone, Copy)]
pub struct LimitShape {
    pub max_tokens: f64,
    pub refill_per_second: f64,
}

impl LimitShape {
    pub const fn new(max_tokens: f64, refill_per_second: f64) -> Self {
        Self {
            max_tokens,
            refill_per_second,
        }
    }
}

pub mod defaults {
    use super::LimitShape;

    pub const CONNECTIONS_PER_IP: LimitShape = LimitShape::new(10.0, 1.0);
    pub const TUNNELS_PER_CLIENT: LimitShape = LimitShape::new(5.0, 0.1);
    pub const REQUESTS_PER_TUNNEL: LimitShape = LimitShape::new(100.0, 50.0);
}

/// The three named limits composed together. When disabled, every check
/// passes - a single flag the whole system respects, rather than each
/// caller remembering to special-case it.
pub struct RateLimiter {
    enabled: bool,
    connections_per_ip: TokenBucket,
    tunnels_per_client: TokenBucket,
    requests_per_tunnel: TokenBucket,
}

impl RateLimiter {
    pub fn new(enabled: bool) -> Self {
        Self::with_shapes(
            enabled,
            defaults::CONNECTIONS_PER_IP,
            defaults::TUNNELS_PER_CLIENT,
            defaults::REQUESTS_PER_TUNNEL,
        )
    }

    pub fn with_shapes(
        enabled: bool,
        connections_per_ip: LimitShape,
        tunnels_per_client: LimitShape,
        requests_per_tunnel: LimitShape,
    ) -> Self {
        Self {
            enabled,
            connections_per_ip: TokenBucket::new(
                connections_per_ip.max_tokens,
                connections_per_ip.refill_per_second,
            ),
            tunnels_per_client: TokenBucket::new(
                tunnels_per_client.max_tokens,
                tunnels_per_client.refill_per_second,
            ),
            requests_per_tunnel: TokenBucket::new(
                requests_per_tunnel.max_tokens,
                requests_per_tunnel.refill_per_second,
            ),
        }
    }

    pub fn allow_connection(&self, ip: &str) -> bool {
        !self.enabled || self.connections_per_ip.allow(ip, 1.0)
    }

    pub fn allow_tunnel_open(&self, client_id: &str) -> bool {
        !self.enabled || self.tunnels_per_client.allow(client_id, 1.0)
    }

    pub fn allow_request(&self, tunnel_id: &str) -> bool {
        !self.enabled || self.requests_per_tunnel.allow(tunnel_id, 1.0)
    }

    /// Sweep all three buckets for idle entries. Intended to run from one
    /// periodic background task per process, not per key.
    pub fn evict_idle(&self, max_idle: Duration) {
        self.connections_per_ip.evict_idle(max_idle);
        self.tunnels_per_client.evict_idle(max_idle);
        self.requests_per_tunnel.evict_idle(max_idle);
    }

    /// Runs forever, evicting hour-idle keys from all three buckets on a
    /// fixed interval. Spawn exactly one of these per process, mirroring
    /// the gateway's own liveness sweep.
    pub async fn run_eviction_sweep(self: Arc<Self>) {
        let mut interval = tokio::time::interval(EVICTION_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            self.evict_idle(IDLE_EVICTION_THRESHOLD);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn single_token_bucket_denies_then_allows_after_refill() {
        let bucket = TokenBucket::new(1.0, 1.0);
        assert!(bucket.allow("k", 1.0));
        assert!(!bucket.allow("k", 1.0));
        sleep(Duration::from_millis(1100));
        assert!(bucket.allow("k", 1.0));
    }

    #[test]
    fn tokens_never_exceed_max_after_long_idle() {
        let bucket = TokenBucket::new(5.0, 100.0);
        assert!(bucket.allow("k", 5.0));
        sleep(Duration::from_millis(200));
        // Refilled for 200ms at 100/s = 20 tokens worth, but capped at max.
        assert!(bucket.allow("k", 5.0));
        assert!(!bucket.allow("k", 1.0));
    }

    #[test]
    fn disabled_composite_always_allows() {
        let limiter = RateLimiter::with_shapes(
            false,
            LimitShape::new(0.0, 0.0),
            LimitShape::new(0.0, 0.0),
            LimitShape::new(0.0, 0.0),
        );
        assert!(limiter.allow_connection("1.2.3.4"));
        assert!(limiter.allow_tunnel_open("client"));
        assert!(limiter.allow_request("tunnel"));
    }

    #[test]
    fn requests_per_tunnel_zero_shape_denies_everything() {
        let limiter = RateLimiter::with_shapes(
            true,
            defaults::CONNECTIONS_PER_IP,
            defaults::TUNNELS_PER_CLIENT,
            LimitShape::new(0.0, 0.0),
        );
        assert!(!limiter.allow_request("tunnel-1"));
    }

    #[test]
    fn eviction_drops_idle_keys() {
        let bucket = TokenBucket::new(1.0, 1.0);
        bucket.allow("stale", 1.0);
        assert_eq!(bucket.len(), 1);
        bucket.evict_idle(Duration::from_millis(0));
        assert_eq!(bucket.len(), 0);
    }

    #[test]
    fn no_partial_consumption_on_denial() {
        let bucket = TokenBucket::new(2.0, 0.0);
        assert!(!bucket.allow("k", 3.0));
        // Still has its full 2 tokens since the failed call consumed nothing.
        assert!(bucket.allow("k", 2.0));
    }
}
