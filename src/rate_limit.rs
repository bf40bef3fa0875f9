//! Rate Limiting
//!
//! Per-client token bucket rate limiter with optional block windows.
//!
//! Each client is keyed by its MQTT Client Identifier (falling back to
//! the peer IP when the client never sent one). Buckets refill lazily
//! on access; a client that runs dry while a block duration is
//! configured is denied outright until the block window elapses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Buckets idle for longer than this are dropped by [`RateLimiter::cleanup_expired`].
const BUCKET_IDLE_TTL: Duration = Duration::from_secs(3600);

/// Rate limit settings applied to a single client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitPolicy {
    /// Tokens added per second.
    pub refill_rate_per_sec: f64,
    /// Maximum tokens the bucket can hold.
    pub burst_capacity: u32,
    /// How long a client stays blocked after running dry.
    /// Zero disables blocking; excess traffic is only dropped.
    pub block_duration: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        RateLimitPolicy {
            refill_rate_per_sec: 10.0,
            burst_capacity: 20,
            block_duration: Duration::from_secs(60),
        }
    }
}

/// Token bucket state for a single client.
#[derive(Debug, Default)]
struct TokenBucket {
    /// Current number of tokens.
    tokens: f64,
    /// Last refill time. `None` until the bucket is first touched.
    last_refill: Option<Instant>,
    /// End of the current block window. `None` when not blocked.
    blocked_until: Option<Instant>,
}

impl TokenBucket {
    /// Refills tokens for the time elapsed since the last refill.
    ///
    /// A fresh bucket starts full at the policy's burst capacity.
    fn refill(&mut self, policy: &RateLimitPolicy, now: Instant) {
        match self.last_refill {
            None => {
                self.tokens = f64::from(policy.burst_capacity);
                self.last_refill = Some(now);
            }
            Some(last) => {
                let elapsed = now.duration_since(last).as_secs_f64();
                self.tokens = (self.tokens + elapsed * policy.refill_rate_per_sec)
                    .min(f64::from(policy.burst_capacity));
                self.last_refill = Some(now);
            }
        }
    }

    /// Refills, observes the block window, and tries to consume one token.
    ///
    /// Refill happens first so a bucket whose block window just elapsed
    /// is seen unblocked in the same call.
    fn try_consume(&mut self, policy: &RateLimitPolicy, now: Instant) -> bool {
        self.refill(policy, now);

        if let Some(until) = self.blocked_until {
            if now < until {
                return false;
            }
            self.blocked_until = None;
        }

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            if policy.block_duration > Duration::ZERO {
                self.blocked_until = Some(now + policy.block_duration);
            }
            false
        }
    }

    fn is_blocked(&self, now: Instant) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }
}

/// Tables shared under one lock: buckets plus per-client policy overrides.
#[derive(Default)]
struct LimiterState {
    buckets: HashMap<String, TokenBucket>,
    policies: HashMap<String, RateLimitPolicy>,
}

/// Snapshot of limiter state for metrics and logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimiterStats {
    /// Buckets currently tracked.
    pub total_buckets: usize,
    /// Buckets inside an active block window.
    pub blocked_buckets: usize,
    /// Decisions that allowed a message, since startup.
    pub allowed_count: u64,
    /// Decisions that denied a message, since startup.
    pub blocked_count: u64,
}

/// Rate limiter shared by all connection workers.
pub struct RateLimiter {
    default_policy: RateLimitPolicy,
    state: Mutex<LimiterState>,
    allowed: AtomicU64,
    blocked: AtomicU64,
}

impl RateLimiter {
    /// Creates a rate limiter applying `default_policy` to every client
    /// without an override.
    pub fn new(default_policy: RateLimitPolicy) -> Self {
        RateLimiter {
            default_policy,
            state: Mutex::new(LimiterState::default()),
            allowed: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
        }
    }

    /// Decides whether one message from this client may pass.
    ///
    /// The bucket key is `client_id`, or `ip` when the client never sent
    /// an identifier. Policy overrides are looked up by `client_id` only.
    /// Exactly one of the allowed/blocked counters is bumped per call.
    pub fn allow(&self, ip: &str, client_id: &str) -> bool {
        let key = if client_id.is_empty() { ip } else { client_id };
        let now = Instant::now();

        let allowed = {
            let mut state = self.state.lock().unwrap();
            let policy = if client_id.is_empty() {
                self.default_policy
            } else {
                state
                    .policies
                    .get(client_id)
                    .copied()
                    .unwrap_or(self.default_policy)
            };
            let bucket = state.buckets.entry(key.to_string()).or_default();
            bucket.try_consume(&policy, now)
        };

        if allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.blocked.fetch_add(1, Ordering::Relaxed);
        }

        allowed
    }

    /// Installs or replaces the policy override for one client.
    ///
    /// The client's bucket, including its current token count, is left
    /// untouched; the new limits take effect from the next refill.
    pub fn set_client_policy(&self, client_id: &str, policy: RateLimitPolicy) {
        let mut state = self.state.lock().unwrap();
        state.policies.insert(client_id.to_string(), policy);
    }

    /// Drops buckets idle for more than an hour.
    ///
    /// Returns the number of buckets removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let before = state.buckets.len();

        state.buckets.retain(|_, bucket| match bucket.last_refill {
            Some(last) => now.duration_since(last) <= BUCKET_IDLE_TTL,
            None => true,
        });

        before - state.buckets.len()
    }

    /// Returns current bucket counts and cumulative decision counters.
    ///
    /// A bucket whose block window has already expired does not count
    /// as blocked, even if no call has observed the expiry yet.
    pub fn stats(&self) -> RateLimiterStats {
        let state = self.state.lock().unwrap();
        let now = Instant::now();
        RateLimiterStats {
            total_buckets: state.buckets.len(),
            blocked_buckets: state
                .buckets
                .values()
                .filter(|bucket| bucket.is_blocked(now))
                .count(),
            allowed_count: self.allowed.load(Ordering::Relaxed),
            blocked_count: self.blocked.load(Ordering::Relaxed),
        }
    }
}
