//! Single-key token bucket.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::LimiterConfig;
use crate::error::{Result, TollgateError};

/// Capacity and refill rate shared by every bucket of a limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSettings {
    capacity: f64,
    refill_rate: f64,
    min_ttl: Option<Duration>,
}

impl BucketSettings {
    /// Create validated settings. Both values must be positive and finite.
    pub fn new(capacity: f64, refill_rate: f64) -> Result<Self> {
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(TollgateError::InvalidConfiguration(format!(
                "capacity must be a positive number, got {}",
                capacity
            )));
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(TollgateError::InvalidConfiguration(format!(
                "refill_rate must be a positive number, got {}",
                refill_rate
            )));
        }
        Ok(Self {
            capacity,
            refill_rate,
            min_ttl: None,
        })
    }

    /// Build settings from limiter configuration.
    pub fn from_config(config: &LimiterConfig) -> Result<Self> {
        let settings = Self::new(config.capacity, config.refill_rate)?;
        Ok(match config.key_ttl_ms {
            Some(ms) => settings.with_min_ttl(Duration::from_millis(ms)),
            None => settings,
        })
    }

    /// Keep idle state at least this long.
    pub fn with_min_ttl(mut self, ttl: Duration) -> Self {
        self.min_ttl = Some(ttl);
        self
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn min_ttl(&self) -> Option<Duration> {
        self.min_ttl
    }

    /// How long an untouched key's state is kept: `ceil(capacity / refill_rate * 2)`
    /// seconds, extended to `min_ttl` if that is longer.
    ///
    /// After the derived TTL an idle bucket would be full again, so dropping it
    /// is indistinguishable from keeping it.
    pub fn idle_ttl(&self) -> Duration {
        let derived = Duration::from_secs((self.capacity / self.refill_rate * 2.0).ceil() as u64);
        match self.min_ttl {
            Some(min) if min > derived => min,
            _ => derived,
        }
    }

    /// Milliseconds until `deficit` tokens have been refilled.
    pub fn retry_after_ms(&self, deficit: f64) -> u64 {
        if deficit <= 0.0 {
            return 0;
        }
        (deficit / self.refill_rate * 1000.0).ceil() as u64
    }
}

/// Observable state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens currently available, `0 <= tokens <= capacity`
    pub tokens: f64,
    /// Seconds timestamp of the last refill
    pub last_refill: f64,
}

impl BucketState {
    /// A full bucket as of `now`.
    pub fn full(capacity: f64, now: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Add the tokens accrued since `last_refill`, capped at capacity.
    ///
    /// Zero or negative elapsed time (clock going backwards) is a no-op, so tokens
    /// never decrease here and `last_refill` never moves backwards.
    pub fn refill(&mut self, now: f64, capacity: f64, refill_rate: f64) {
        let elapsed = now - self.last_refill;
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
            self.last_refill = now;
        }
    }

    /// Take `amount` tokens if available.
    pub fn take(&mut self, amount: f64, refill_rate: f64) -> Admission {
        if self.tokens >= amount {
            self.tokens -= amount;
            Admission::Allowed {
                remaining: self.tokens,
            }
        } else {
            Admission::Denied {
                available: self.tokens,
                wait_secs: (amount - self.tokens) / refill_rate,
            }
        }
    }
}

/// Outcome of a local consume attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// Tokens were taken; `remaining` are left in the bucket.
    Allowed { remaining: f64 },
    /// Not enough tokens; the request would fit after `wait_secs`.
    Denied { available: f64, wait_secs: f64 },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

/// A single-key, single-process token bucket.
///
/// Refill and consume happen in one critical section, so concurrent callers on
/// the same bucket can never both spend the same token.
#[derive(Debug)]
pub struct LocalBucket {
    settings: BucketSettings,
    state: Mutex<BucketState>,
}

impl LocalBucket {
    /// Create a full bucket as of `now`.
    pub fn new(settings: BucketSettings, now: f64) -> Self {
        Self {
            settings,
            state: Mutex::new(BucketState::full(settings.capacity, now)),
        }
    }

    pub fn settings(&self) -> &BucketSettings {
        &self.settings
    }

    /// Refill up to `now`, then try to take `amount` tokens.
    pub fn consume_at(&self, now: f64, amount: f64) -> Admission {
        let mut state = self.state.lock();
        state.refill(now, self.settings.capacity, self.settings.refill_rate);
        state.take(amount, self.settings.refill_rate)
    }

    /// The state as it would look after a refill at `now`, without mutating the bucket.
    pub fn snapshot_at(&self, now: f64) -> BucketState {
        let mut state = *self.state.lock();
        state.refill(now, self.settings.capacity, self.settings.refill_rate);
        state
    }

    /// Whether the bucket has been untouched for longer than its idle TTL.
    pub fn is_idle(&self, now: f64) -> bool {
        let last = self.state.lock().last_refill;
        now - last > self.settings.idle_ttl().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn settings(capacity: f64, rate: f64) -> BucketSettings {
        BucketSettings::new(capacity, rate).unwrap()
    }

    #[test]
    fn test_settings_reject_non_positive() {
        assert!(BucketSettings::new(0.0, 1.0).is_err());
        assert!(BucketSettings::new(-5.0, 1.0).is_err());
        assert!(BucketSettings::new(5.0, 0.0).is_err());
        assert!(BucketSettings::new(5.0, f64::INFINITY).is_err());
        assert!(BucketSettings::new(5.0, 0.5).is_ok());
    }

    #[test]
    fn test_idle_ttl() {
        // ceil(3 / 1.0 * 2) = 6s
        assert_eq!(settings(3.0, 1.0).idle_ttl(), Duration::from_secs(6));
        // ceil(5 / 0.5 * 2) = 20s
        assert_eq!(settings(5.0, 0.5).idle_ttl(), Duration::from_secs(20));
        // ceil(1 / 3 * 2) = ceil(0.67) = 1s
        assert_eq!(settings(1.0, 3.0).idle_ttl(), Duration::from_secs(1));
    }

    #[test]
    fn test_min_ttl_only_extends() {
        let longer = settings(3.0, 1.0).with_min_ttl(Duration::from_secs(60));
        assert_eq!(longer.idle_ttl(), Duration::from_secs(60));

        let shorter = settings(3.0, 1.0).with_min_ttl(Duration::from_secs(1));
        assert_eq!(shorter.idle_ttl(), Duration::from_secs(6));
    }

    #[test]
    fn test_retry_after_ms() {
        let s = settings(10.0, 2.0);
        assert_eq!(s.retry_after_ms(0.0), 0);
        assert_eq!(s.retry_after_ms(1.0), 500);
        assert_eq!(s.retry_after_ms(0.5), 250);
        // rounds up
        assert_eq!(settings(10.0, 3.0).retry_after_ms(1.0), 334);
    }

    #[test]
    fn test_three_then_denied_then_refill() {
        let bucket = LocalBucket::new(settings(3.0, 1.0), 1000.0);

        assert!(bucket.consume_at(1000.0, 1.0).is_allowed());
        assert!(bucket.consume_at(1000.0, 1.0).is_allowed());
        assert_eq!(
            bucket.consume_at(1000.0, 1.0),
            Admission::Allowed { remaining: 0.0 }
        );

        assert_eq!(
            bucket.consume_at(1000.0, 1.0),
            Admission::Denied {
                available: 0.0,
                wait_secs: 1.0
            }
        );

        assert!(bucket.consume_at(1001.0, 1.0).is_allowed());
    }

    #[test]
    fn test_deficit_is_expressed_in_seconds() {
        let bucket = LocalBucket::new(settings(4.0, 2.0), 0.0);
        assert!(bucket.consume_at(0.0, 3.0).is_allowed());

        // 1 token left, 3 requested: 2 short at 2 tokens/s
        assert_eq!(
            bucket.consume_at(0.0, 3.0),
            Admission::Denied {
                available: 1.0,
                wait_secs: 1.0
            }
        );
        assert!(bucket.consume_at(1.0, 3.0).is_allowed());
    }

    #[test]
    fn test_clock_going_backwards_never_removes_tokens() {
        let bucket = LocalBucket::new(settings(5.0, 1.0), 100.0);
        bucket.consume_at(100.0, 3.0);

        let before = bucket.snapshot_at(100.0);
        bucket.consume_at(90.0, 0.0);
        let after = bucket.snapshot_at(90.0);

        assert_eq!(before.tokens, after.tokens);
        assert_eq!(after.last_refill, 100.0);
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let bucket = LocalBucket::new(settings(5.0, 1.0), 0.0);
        bucket.consume_at(0.0, 5.0);

        let state = bucket.snapshot_at(1_000.0);
        assert_eq!(state.tokens, 5.0);
        assert_eq!(state.last_refill, 1_000.0);
    }

    #[test]
    fn test_snapshot_does_not_mutate() {
        let bucket = LocalBucket::new(settings(5.0, 1.0), 0.0);
        bucket.consume_at(0.0, 5.0);

        assert_eq!(bucket.snapshot_at(2.0).tokens, 2.0);
        // Underlying state still at t=0
        assert_eq!(bucket.snapshot_at(0.0).tokens, 0.0);
    }

    #[test]
    fn test_conservation_without_consumption() {
        let bucket = LocalBucket::new(settings(10.0, 0.5), 0.0);
        bucket.consume_at(0.0, 8.0);

        let before = bucket.snapshot_at(0.0).tokens;
        for d in [0.0, 1.0, 3.0, 10.0, 100.0] {
            let expected = (before + d * 0.5).min(10.0);
            assert_eq!(bucket.snapshot_at(d).tokens, expected);
        }
    }

    #[test]
    fn test_tokens_stay_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let s = settings(20.0, 3.0);
        let bucket = LocalBucket::new(s, 0.0);
        let mut now = 0.0;

        for _ in 0..5_000 {
            // Occasionally step backwards to exercise the anomaly path
            now += rng.gen_range(-0.2..1.5);
            let amount = rng.gen_range(0..25) as f64;
            bucket.consume_at(now, amount);

            let state = bucket.snapshot_at(f64::MIN);
            assert!(state.tokens >= 0.0, "tokens went negative: {}", state.tokens);
            assert!(state.tokens <= s.capacity(), "tokens over capacity: {}", state.tokens);
        }
    }

    #[test]
    fn test_is_idle() {
        let bucket = LocalBucket::new(settings(3.0, 1.0), 0.0);
        assert!(!bucket.is_idle(6.0));
        assert!(bucket.is_idle(6.5));
    }
}
