//! Token-bucket rate limiting
//!
//! Thread-safe throttling primitive behind the pipeline's rate-limiting
//! decorator. Buckets refill continuously at a configured rate; callers
//! either get refused with a retry-after hint or queue on the injected
//! clock until enough tokens accumulate.
//!
//! With scoping enabled each distinct key gets its own bucket; a `None`
//! key always routes to the shared global bucket.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{MessagingError, MessagingResult};
use crate::timebase::Timebase;

/// Policy when a bucket lacks the requested tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleBehavior {
    /// Refuse immediately with a retry-after hint
    Reject,
    /// Wait on the clock for the deficit to refill, bounded by `max_queue_wait`
    Queue,
}

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Bucket maximum, in tokens
    pub capacity: u32,
    /// Tokens added per second, continuously
    pub refill_rate: f64,
    /// Missing-token policy
    pub behavior: ThrottleBehavior,
    /// Upper bound on a queued wait (Queue behavior only)
    pub max_queue_wait: Duration,
    /// Give each distinct key its own bucket
    pub enable_scoping: bool,
    /// Cap on distinct per-key buckets
    pub max_scoped_keys: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            refill_rate: 10.0,
            behavior: ThrottleBehavior::Reject,
            max_queue_wait: Duration::from_secs(30),
            enable_scoping: false,
            max_scoped_keys: 1024,
        }
    }
}

impl RateLimiterConfig {
    /// Validate configuration
    pub fn validate(&self) -> MessagingResult<()> {
        if self.capacity == 0 {
            return Err(MessagingError::invalid_input(
                "capacity",
                "must be at least 1",
            ));
        }
        if !(self.refill_rate > 0.0) || !self.refill_rate.is_finite() {
            return Err(MessagingError::invalid_input(
                "refill_rate",
                "must be a positive finite number of tokens per second",
            ));
        }
        if self.enable_scoping && self.max_scoped_keys == 0 {
            return Err(MessagingError::invalid_input(
                "max_scoped_keys",
                "must be at least 1 when scoping is enabled",
            ));
        }
        Ok(())
    }
}

/// Outcome of one acquire call
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    /// Whether the permits were granted
    pub allowed: bool,
    /// Whole tokens left in the bucket after the call
    pub remaining_permits: u32,
    /// How long until enough tokens refill (zero when allowed)
    pub retry_after: Duration,
    /// Refusal reason, when not allowed
    pub reason: Option<String>,
}

/// Monotonic per-bucket statistics snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterStats {
    /// Whole tokens currently available
    pub available_permits: u32,
    /// Bucket maximum
    pub capacity: u32,
    /// Tokens per second
    pub refill_rate: f64,
    /// Successful acquisitions since construction
    pub total_acquired: u64,
    /// Refusals since construction
    pub total_throttled: u64,
}

impl RateLimiterStats {
    /// Fraction of calls refused: throttled / (acquired + throttled)
    pub fn throttle_rate(&self) -> f64 {
        let total = self.total_acquired + self.total_throttled;
        if total == 0 {
            0.0
        } else {
            self.total_throttled as f64 / total as f64
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

struct Bucket {
    state: Mutex<BucketState>,
    total_acquired: AtomicU64,
    total_throttled: AtomicU64,
}

impl Bucket {
    fn new(capacity: u32, now: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: now,
            }),
            total_acquired: AtomicU64::new(0),
            total_throttled: AtomicU64::new(0),
        }
    }
}

enum Attempt {
    Granted { remaining: u32 },
    Deficit { wait: Duration, remaining: u32 },
}

/// Token-bucket rate limiter.
///
/// Shared across threads; all bucket mutation happens under a per-bucket
/// mutex so concurrent acquisitions on a capacity-`C` bucket grant exactly
/// `C` permits between refills.
pub struct TokenBucketRateLimiter {
    config: RateLimiterConfig,
    clock: Arc<dyn Timebase>,
    global: Arc<Bucket>,
    scoped: DashMap<String, Arc<Bucket>>,
    disposed: AtomicBool,
}

impl TokenBucketRateLimiter {
    /// Create a limiter; fails fast on invalid configuration.
    pub fn new(config: RateLimiterConfig, clock: Arc<dyn Timebase>) -> MessagingResult<Self> {
        config.validate()?;
        let now = clock.now_utc();
        Ok(Self {
            global: Arc::new(Bucket::new(config.capacity, now)),
            scoped: DashMap::new(),
            disposed: AtomicBool::new(false),
            config,
            clock,
        })
    }

    /// Acquire `permits` tokens, scoped by `key` when scoping is enabled.
    ///
    /// Queue behavior sleeps on the injected clock and honors `cancel`;
    /// a cancelled wait consumes no tokens.
    pub async fn acquire(
        &self,
        permits: u32,
        key: Option<&str>,
        cancel: &CancellationToken,
    ) -> MessagingResult<RateLimitDecision> {
        self.ensure_live()?;
        if permits == 0 {
            return Err(MessagingError::invalid_input(
                "permits",
                "must be at least 1",
            ));
        }
        if permits > self.config.capacity {
            return Err(MessagingError::invalid_input(
                "permits",
                format!(
                    "requested {} permits but bucket capacity is {}",
                    permits, self.config.capacity
                ),
            ));
        }

        let bucket = match self.bucket_for(key) {
            Some(bucket) => bucket,
            None => {
                // Scoped-key cap reached for a brand-new key.
                return Ok(RateLimitDecision {
                    allowed: false,
                    remaining_permits: 0,
                    retry_after: Duration::ZERO,
                    reason: Some("maximum number of scoped keys reached".to_string()),
                });
            }
        };

        loop {
            let attempt = self.try_take(&bucket, permits);
            match attempt {
                Attempt::Granted { remaining } => {
                    bucket.total_acquired.fetch_add(1, Ordering::Relaxed);
                    return Ok(RateLimitDecision {
                        allowed: true,
                        remaining_permits: remaining,
                        retry_after: Duration::ZERO,
                        reason: None,
                    });
                }
                Attempt::Deficit { wait, remaining } => {
                    let refuse = |reason: &str| {
                        bucket.total_throttled.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            key = key.unwrap_or("<global>"),
                            retry_after_ms = wait.as_millis() as u64,
                            "rate limit refused acquisition"
                        );
                        Ok(RateLimitDecision {
                            allowed: false,
                            remaining_permits: remaining,
                            retry_after: wait,
                            reason: Some(reason.to_string()),
                        })
                    };
                    match self.config.behavior {
                        ThrottleBehavior::Reject => return refuse("Rate limit exceeded"),
                        ThrottleBehavior::Queue if wait > self.config.max_queue_wait => {
                            return refuse("max queue wait exceeded");
                        }
                        ThrottleBehavior::Queue => {
                            tokio::select! {
                                _ = self.clock.sleep(wait) => {}
                                _ = cancel.cancelled() => return Err(MessagingError::Cancelled),
                            }
                            self.ensure_live()?;
                        }
                    }
                }
            }
        }
    }

    /// Statistics for the bucket behind `key` (global bucket for `None`).
    ///
    /// Reading stats never creates a scoped bucket; unknown keys report
    /// empty counters.
    pub fn stats(&self, key: Option<&str>) -> RateLimiterStats {
        let bucket = match self.peek_bucket(key) {
            Some(bucket) => bucket,
            None => return self.empty_stats(),
        };
        let available = {
            let mut state = bucket.state.lock();
            self.refill(&mut state);
            state.tokens.floor() as u32
        };
        RateLimiterStats {
            available_permits: available,
            capacity: self.config.capacity,
            refill_rate: self.config.refill_rate,
            total_acquired: bucket.total_acquired.load(Ordering::Relaxed),
            total_throttled: bucket.total_throttled.load(Ordering::Relaxed),
        }
    }

    /// Number of distinct scoped buckets currently tracked.
    pub fn scoped_key_count(&self) -> usize {
        self.scoped.len()
    }

    /// Whether per-key scoping is enabled.
    pub fn scoping_enabled(&self) -> bool {
        self.config.enable_scoping
    }

    /// Mark the limiter disposed; subsequent acquisitions fail.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    fn ensure_live(&self) -> MessagingResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(MessagingError::Disposed {
                component: "TokenBucketRateLimiter",
            })
        } else {
            Ok(())
        }
    }

    fn peek_bucket(&self, key: Option<&str>) -> Option<Arc<Bucket>> {
        match key {
            Some(key) if self.config.enable_scoping => {
                self.scoped.get(key).map(|bucket| bucket.value().clone())
            }
            _ => Some(self.global.clone()),
        }
    }

    fn bucket_for(&self, key: Option<&str>) -> Option<Arc<Bucket>> {
        match key {
            Some(key) if self.config.enable_scoping => {
                if let Some(existing) = self.scoped.get(key) {
                    return Some(existing.value().clone());
                }
                if self.scoped.len() >= self.config.max_scoped_keys {
                    return None;
                }
                let bucket = self
                    .scoped
                    .entry(key.to_string())
                    .or_insert_with(|| {
                        Arc::new(Bucket::new(self.config.capacity, self.clock.now_utc()))
                    })
                    .value()
                    .clone();
                Some(bucket)
            }
            _ => Some(self.global.clone()),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now_utc();
        let elapsed = (now - state.last_refill)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.config.refill_rate)
            .min(f64::from(self.config.capacity));
        state.last_refill = now;
    }

    fn try_take(&self, bucket: &Bucket, permits: u32) -> Attempt {
        let mut state = bucket.state.lock();
        self.refill(&mut state);
        let need = f64::from(permits);
        if state.tokens >= need {
            state.tokens -= need;
            Attempt::Granted {
                remaining: state.tokens.floor() as u32,
            }
        } else {
            let deficit = need - state.tokens;
            Attempt::Deficit {
                wait: Duration::from_secs_f64(deficit / self.config.refill_rate),
                remaining: state.tokens.floor() as u32,
            }
        }
    }

    fn empty_stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            available_permits: 0,
            capacity: self.config.capacity,
            refill_rate: self.config.refill_rate,
            total_acquired: 0,
            total_throttled: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timebase::SimClock;

    fn limiter(config: RateLimiterConfig) -> (TokenBucketRateLimiter, SimClock) {
        let clock = SimClock::starting_now();
        let limiter =
            TokenBucketRateLimiter::new(config, Arc::new(clock.clone())).expect("valid config");
        (limiter, clock)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let clock: Arc<dyn Timebase> = Arc::new(SimClock::starting_now());
        let zero_capacity = RateLimiterConfig {
            capacity: 0,
            ..RateLimiterConfig::default()
        };
        assert!(TokenBucketRateLimiter::new(zero_capacity, clock.clone()).is_err());

        let zero_rate = RateLimiterConfig {
            refill_rate: 0.0,
            ..RateLimiterConfig::default()
        };
        assert!(TokenBucketRateLimiter::new(zero_rate, clock).is_err());
    }

    #[tokio::test]
    async fn test_reject_behavior_exhausts_then_refuses() {
        let (limiter, _clock) = limiter(RateLimiterConfig {
            capacity: 2,
            refill_rate: 1.0,
            ..RateLimiterConfig::default()
        });
        let cancel = CancellationToken::new();

        let first = limiter.acquire(1, None, &cancel).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining_permits, 1);

        let second = limiter.acquire(1, None, &cancel).await.unwrap();
        assert!(second.allowed);
        assert_eq!(second.remaining_permits, 0);

        let third = limiter.acquire(1, None, &cancel).await.unwrap();
        assert!(!third.allowed);
        assert!(third.retry_after > Duration::ZERO);
        assert_eq!(third.reason.as_deref(), Some("Rate limit exceeded"));

        let stats = limiter.stats(None);
        assert_eq!(stats.total_acquired, 2);
        assert_eq!(stats.total_throttled, 1);
    }

    #[tokio::test]
    async fn test_refill_is_capped_at_capacity() {
        let (limiter, clock) = limiter(RateLimiterConfig {
            capacity: 2,
            refill_rate: 10.0,
            ..RateLimiterConfig::default()
        });
        let cancel = CancellationToken::new();

        // Drain the bucket.
        assert!(limiter.acquire(2, None, &cancel).await.unwrap().allowed);

        // One second refills ten tokens, but capacity caps at two.
        clock.advance(Duration::from_secs(1));
        assert!(limiter.acquire(1, None, &cancel).await.unwrap().allowed);
        assert!(limiter.acquire(1, None, &cancel).await.unwrap().allowed);
        assert!(!limiter.acquire(1, None, &cancel).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_queue_behavior_waits_for_refill() {
        let (limiter, clock) = limiter(RateLimiterConfig {
            capacity: 1,
            refill_rate: 1.0,
            behavior: ThrottleBehavior::Queue,
            max_queue_wait: Duration::from_secs(10),
            ..RateLimiterConfig::default()
        });
        let cancel = CancellationToken::new();

        assert!(limiter.acquire(1, None, &cancel).await.unwrap().allowed);

        let limiter = Arc::new(limiter);
        let queued = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(1, None, &cancel).await })
        };
        tokio::task::yield_now().await;
        assert!(!queued.is_finished());

        clock.advance(Duration::from_secs(1));
        let decision = queued.await.unwrap().unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_queue_wait_beyond_bound_is_refused() {
        let (limiter, _clock) = limiter(RateLimiterConfig {
            capacity: 5,
            refill_rate: 0.1,
            behavior: ThrottleBehavior::Queue,
            max_queue_wait: Duration::from_secs(1),
            ..RateLimiterConfig::default()
        });
        let cancel = CancellationToken::new();

        assert!(limiter.acquire(5, None, &cancel).await.unwrap().allowed);
        let decision = limiter.acquire(1, None, &cancel).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("max queue wait exceeded"));
        assert!(decision.retry_after >= Duration::from_secs(9));
    }

    #[tokio::test]
    async fn test_cancelled_queue_wait_consumes_no_tokens() {
        let (limiter, clock) = limiter(RateLimiterConfig {
            capacity: 1,
            refill_rate: 1.0,
            behavior: ThrottleBehavior::Queue,
            max_queue_wait: Duration::from_secs(10),
            ..RateLimiterConfig::default()
        });
        let cancel = CancellationToken::new();
        assert!(limiter.acquire(1, None, &cancel).await.unwrap().allowed);

        let limiter = Arc::new(limiter);
        let queued = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(1, None, &cancel).await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        let outcome = queued.await.unwrap();
        assert!(matches!(outcome, Err(MessagingError::Cancelled)));

        // The deficit token refills untouched by the cancelled caller.
        clock.advance(Duration::from_secs(1));
        let fresh_cancel = CancellationToken::new();
        assert!(limiter.acquire(1, None, &fresh_cancel).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_scoped_keys_get_independent_buckets() {
        let (limiter, _clock) = limiter(RateLimiterConfig {
            capacity: 1,
            refill_rate: 1.0,
            enable_scoping: true,
            ..RateLimiterConfig::default()
        });
        let cancel = CancellationToken::new();

        assert!(limiter.acquire(1, Some("orders"), &cancel).await.unwrap().allowed);
        assert!(!limiter.acquire(1, Some("orders"), &cancel).await.unwrap().allowed);
        assert!(limiter.acquire(1, Some("payments"), &cancel).await.unwrap().allowed);
        assert_eq!(limiter.scoped_key_count(), 2);
    }

    #[tokio::test]
    async fn test_scoped_key_cap_refuses_new_keys() {
        let (limiter, _clock) = limiter(RateLimiterConfig {
            capacity: 1,
            refill_rate: 1.0,
            enable_scoping: true,
            max_scoped_keys: 1,
            ..RateLimiterConfig::default()
        });
        let cancel = CancellationToken::new();

        assert!(limiter.acquire(1, Some("orders"), &cancel).await.unwrap().allowed);
        let refused = limiter.acquire(1, Some("payments"), &cancel).await.unwrap();
        assert!(!refused.allowed);
        assert_eq!(
            refused.reason.as_deref(),
            Some("maximum number of scoped keys reached")
        );
    }

    #[tokio::test]
    async fn test_disposed_limiter_refuses_acquire() {
        let (limiter, _clock) = limiter(RateLimiterConfig::default());
        limiter.shutdown();
        limiter.shutdown(); // double-dispose is a no-op
        let cancel = CancellationToken::new();
        let outcome = limiter.acquire(1, None, &cancel).await;
        assert!(matches!(outcome, Err(MessagingError::Disposed { .. })));
    }

    #[tokio::test]
    async fn test_grants_over_time_bounded_by_capacity_plus_refill() {
        let capacity = 10u32;
        let refill_rate = 3.0;
        let (limiter, clock) = limiter(RateLimiterConfig {
            capacity,
            refill_rate,
            ..RateLimiterConfig::default()
        });
        let cancel = CancellationToken::new();

        let mut granted = 0u64;
        let mut elapsed_secs = 0u64;
        for _ in 0..40 {
            for _ in 0..8 {
                if limiter.acquire(1, None, &cancel).await.unwrap().allowed {
                    granted += 1;
                }
            }
            clock.advance(Duration::from_secs(1));
            elapsed_secs += 1;
        }

        // Over any interval T, grants never exceed C + R*T (+1 for
        // boundary rounding).
        let bound = u64::from(capacity) + (refill_rate * elapsed_secs as f64) as u64 + 1;
        assert!(granted <= bound, "granted {granted} exceeds bound {bound}");
        // The bucket was kept saturated, so grants also track the bound
        // from below.
        assert!(granted >= u64::from(capacity) + (refill_rate * (elapsed_secs - 1) as f64) as u64);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_acquire_grants_exactly_capacity() {
        let (limiter, _clock) = limiter(RateLimiterConfig {
            capacity: 50,
            refill_rate: 0.001,
            ..RateLimiterConfig::default()
        });
        let limiter = Arc::new(limiter);
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..200 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire(1, None, &cancel).await.unwrap().allowed
            }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 50);
    }
}
