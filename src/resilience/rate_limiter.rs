//! Token bucket rate limiting.
//!
//! Buckets refill lazily on each [`TokenBucket::allow`] call, so an idle
//! bucket costs nothing. [`RateLimiter`] keeps one bucket per identity and
//! creates it on first sight. Identities are caller-declared, so the table
//! is bounded: buckets that have refilled to capacity are swept (a full
//! bucket is the same as a fresh one), and once `max_tracked` identities are
//! live a first-seen identity is refused without allocating.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Classic token bucket: `capacity` tokens, refilled at `refill_rate` per second.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket admitting `requests` calls per `window`.
    pub fn new(requests: u32, window: Duration) -> Self {
        let capacity = f64::from(requests);
        let window_secs = window.as_secs_f64();
        let refill_rate = if window_secs > 0.0 {
            capacity / window_secs
        } else {
            capacity
        };
        Self::with_rate(capacity, refill_rate)
    }

    /// A full bucket with an explicit refill rate in tokens per second.
    pub fn with_rate(capacity: f64, refill_rate: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// Refill for the time elapsed since the last call, then spend one token
    /// if available.
    pub fn allow(&mut self) -> bool {
        self.refill(Instant::now());
        if self.tokens < 1.0 {
            return false;
        }
        self.tokens -= 1.0;
        true
    }

    /// Tokens currently in the bucket, without refilling.
    pub fn available(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Whether the bucket would be full if refilled at `now`.
    pub fn is_full_at(&self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens + elapsed * self.refill_rate >= self.capacity
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        // Rejected calls also advance the clock, otherwise the same interval
        // would be credited twice.
        self.last_refill = now;
    }
}

/// Default ceiling on concurrently tracked identities.
pub const DEFAULT_MAX_TRACKED: usize = 10_000;

/// Keyed collection of [`TokenBucket`]s sharing one quota.
pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
    requests: u32,
    window: Duration,
    max_tracked: usize,
}

impl RateLimiter {
    pub fn new(requests: u32, window: Duration) -> Self {
        Self::with_max_tracked(requests, window, DEFAULT_MAX_TRACKED)
    }

    pub fn with_max_tracked(requests: u32, window: Duration, max_tracked: usize) -> Self {
        Self {
            buckets: DashMap::new(),
            requests,
            window,
            max_tracked,
        }
    }

    /// Spend one token from `identity`'s bucket, creating it full on first
    /// use. A new identity is refused while the table is at capacity.
    pub fn allow(&self, identity: &str) -> bool {
        if let Some(mut bucket) = self.buckets.get_mut(identity) {
            return bucket.allow();
        }
        if self.buckets.len() >= self.max_tracked {
            warn!(identity, tracked = self.buckets.len(), "Rate limit table full, refusing new identity");
            return false;
        }
        let mut bucket = self.buckets.entry(identity.to_string()).or_insert_with(|| {
            debug!(identity, requests = self.requests, "Creating rate limit bucket");
            TokenBucket::new(self.requests, self.window)
        });
        bucket.allow()
    }

    /// Drop every bucket that has refilled to capacity; returns how many.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_full_at(now));
        before.saturating_sub(self.buckets.len())
    }

    /// Number of identities currently tracked.
    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }

    /// Time for an empty bucket to refill; the natural sweep period.
    pub fn window(&self) -> Duration {
        self.window
    }
}
