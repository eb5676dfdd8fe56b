//! Adaptive request pacing.
//!
//! Turns the stream of observed outcomes into the delay to wait before the
//! next request. Successful streaks slowly shorten the delay; rate limits and
//! blocks lengthen it; a CAPTCHA forces a pause window that every subsequent
//! wait has to sit out first.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::outcome::OutcomeKind;

/// Consecutive successes needed before the delay is reduced.
pub const SUCCESS_STREAK_THRESHOLD: u32 = 10;

const JITTER_FRACTION: f64 = 0.2;
const RESPONSE_TIME_ALPHA: f64 = 0.1;

/// Preset pacing strategies. Chosen once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitStrategy {
    #[default]
    Conservative,
    Balanced,
    Aggressive,
}

impl RateLimitStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitStrategy::Conservative => "conservative",
            RateLimitStrategy::Balanced => "balanced",
            RateLimitStrategy::Aggressive => "aggressive",
        }
    }

    pub fn params(self) -> StrategyParams {
        match self {
            RateLimitStrategy::Conservative => StrategyParams {
                initial_delay: 10.0,
                min_delay: 5.0,
                max_delay: 60.0,
                success_reduction_factor: 0.8,
                failure_increase_factor: 2.0,
            },
            RateLimitStrategy::Balanced => StrategyParams {
                initial_delay: 7.0,
                min_delay: 3.0,
                max_delay: 45.0,
                success_reduction_factor: 0.9,
                failure_increase_factor: 1.5,
            },
            RateLimitStrategy::Aggressive => StrategyParams {
                initial_delay: 5.0,
                min_delay: 2.0,
                max_delay: 30.0,
                success_reduction_factor: 0.95,
                failure_increase_factor: 1.2,
            },
        }
    }
}

impl fmt::Display for RateLimitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown rate limit strategy '{0}' (expected conservative, balanced or aggressive)")]
pub struct UnknownStrategy(pub String);

impl FromStr for RateLimitStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "conservative" => Ok(RateLimitStrategy::Conservative),
            "balanced" => Ok(RateLimitStrategy::Balanced),
            "aggressive" => Ok(RateLimitStrategy::Aggressive),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}

/// Delay envelope of a strategy, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategyParams {
    pub initial_delay: f64,
    pub min_delay: f64,
    pub max_delay: f64,
    pub success_reduction_factor: f64,
    pub failure_increase_factor: f64,
}

impl StrategyParams {
    fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min_delay, self.max_delay)
    }
}

/// Strategy-independent pacing knobs, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub randomize_intervals: bool,
    pub min_random_delay: f64,
    pub max_random_delay: f64,
    pub captcha_pause: f64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            randomize_intervals: true,
            min_random_delay: 5.0,
            max_random_delay: 15.0,
            captcha_pause: 30.0,
        }
    }
}

/// Pure pacing state machine. No I/O.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    strategy: RateLimitStrategy,
    params: StrategyParams,
    pacing: PacingConfig,
    current_delay: f64,
    success_streak: u32,
    failure_streak: u32,
    average_response_time: Option<f64>,
    last_captcha: Option<Instant>,
}

impl RateLimitPolicy {
    pub fn new(strategy: RateLimitStrategy, pacing: PacingConfig) -> Self {
        let params = strategy.params();
        Self {
            strategy,
            params,
            pacing,
            current_delay: params.initial_delay,
            success_streak: 0,
            failure_streak: 0,
            average_response_time: None,
            last_captcha: None,
        }
    }

    pub fn strategy(&self) -> RateLimitStrategy {
        self.strategy
    }

    pub fn params(&self) -> StrategyParams {
        self.params
    }

    pub fn current_delay(&self) -> f64 {
        self.current_delay
    }

    pub fn success_streak(&self) -> u32 {
        self.success_streak
    }

    pub fn failure_streak(&self) -> u32 {
        self.failure_streak
    }

    /// Exponential moving average of observed response times. Observability only.
    pub fn average_response_time(&self) -> f64 {
        self.average_response_time.unwrap_or(0.0)
    }

    /// Time left in the CAPTCHA pause window, if one is open.
    pub fn captcha_pause_remaining(&self, now: Instant) -> Duration {
        let Some(at) = self.last_captcha else {
            return Duration::ZERO;
        };
        let pause = Duration::from_secs_f64(self.pacing.captcha_pause);
        pause.saturating_sub(now.saturating_duration_since(at))
    }

    /// Delay to wait before the next request: any open CAPTCHA pause plus the
    /// jittered current delay.
    pub fn next_delay(&self) -> Duration {
        let remaining = self.captcha_pause_remaining(Instant::now());
        remaining + Duration::from_secs_f64(self.jittered_delay())
    }

    fn jittered_delay(&self) -> f64 {
        let base = self.current_delay;
        if !self.pacing.randomize_intervals {
            return base;
        }

        let spread = base * JITTER_FRACTION;
        let low = self.pacing.min_random_delay.max(base - spread);
        let high = self.pacing.max_random_delay.min(base + spread);
        // Once the delay leaves the random window the band inverts; sample
        // between the two edges rather than collapsing onto one.
        let (low, high) = if low <= high { (low, high) } else { (high, low) };
        rand::thread_rng().gen_range(low..=high).max(0.0)
    }

    pub fn update(&mut self, outcome: OutcomeKind, response_time: Duration) {
        match outcome {
            OutcomeKind::Success => {
                self.success_streak += 1;
                self.failure_streak = 0;
                if self.success_streak >= SUCCESS_STREAK_THRESHOLD {
                    self.current_delay = self
                        .params
                        .clamp(self.current_delay * self.params.success_reduction_factor);
                    self.success_streak = 0;
                }
            }
            OutcomeKind::RateLimited | OutcomeKind::Blocked => {
                self.failure_streak += 1;
                self.success_streak = 0;
                self.current_delay = self
                    .params
                    .clamp(self.current_delay * self.params.failure_increase_factor);
            }
            OutcomeKind::CaptchaRequired => {
                self.last_captcha = Some(Instant::now());
                let forced = self.pacing.captcha_pause.max(self.current_delay * 2.0);
                self.current_delay = self.params.clamp(forced);
            }
            OutcomeKind::NetworkError | OutcomeKind::Timeout => {}
        }

        let sample = response_time.as_secs_f64();
        self.average_response_time = Some(match self.average_response_time {
            None => sample,
            Some(avg) => avg * (1.0 - RESPONSE_TIME_ALPHA) + sample * RESPONSE_TIME_ALPHA,
        });
    }
}

/// Point-in-time copy of the pacing state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitSnapshot {
    pub strategy: RateLimitStrategy,
    pub current_delay: f64,
    pub success_streak: u32,
    pub failure_streak: u32,
    pub average_response_time: f64,
    pub captcha_pause_remaining: Duration,
}

/// Shared handle to the single policy instance used by every in-flight fetch.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<RateLimitPolicy>>,
}

impl RateLimiter {
    pub fn new(strategy: RateLimitStrategy, pacing: PacingConfig) -> Self {
        Self::from_policy(RateLimitPolicy::new(strategy, pacing))
    }

    pub fn from_policy(policy: RateLimitPolicy) -> Self {
        Self {
            inner: Arc::new(Mutex::new(policy)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RateLimitPolicy> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn next_delay(&self) -> Duration {
        self.lock().next_delay()
    }

    pub fn update(&self, outcome: OutcomeKind, response_time: Duration) {
        self.lock().update(outcome, response_time);
    }

    pub fn strategy(&self) -> RateLimitStrategy {
        self.lock().strategy()
    }

    pub fn current_delay(&self) -> f64 {
        self.lock().current_delay()
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        let policy = self.lock();
        RateLimitSnapshot {
            strategy: policy.strategy,
            current_delay: policy.current_delay,
            success_streak: policy.success_streak,
            failure_streak: policy.failure_streak,
            average_response_time: policy.average_response_time(),
            captcha_pause_remaining: policy.captcha_pause_remaining(Instant::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    const ALL: [RateLimitStrategy; 3] = [
        RateLimitStrategy::Conservative,
        RateLimitStrategy::Balanced,
        RateLimitStrategy::Aggressive,
    ];

    fn policy(strategy: RateLimitStrategy) -> RateLimitPolicy {
        RateLimitPolicy::new(strategy, PacingConfig::default())
    }

    #[test]
    fn delay_stays_within_bounds_for_random_sequences() {
        let kinds = [
            OutcomeKind::Success,
            OutcomeKind::RateLimited,
            OutcomeKind::Blocked,
            OutcomeKind::CaptchaRequired,
            OutcomeKind::NetworkError,
            OutcomeKind::Timeout,
        ];
        let mut rng = rand::thread_rng();
        for strategy in ALL {
            let mut p = policy(strategy);
            let params = strategy.params();
            for _ in 0..2_000 {
                let kind = *kinds.choose(&mut rng).unwrap();
                p.update(kind, Duration::from_millis(300));
                assert!(p.current_delay() >= params.min_delay, "{strategy}: below min");
                assert!(p.current_delay() <= params.max_delay, "{strategy}: above max");
            }
        }
    }

    #[test]
    fn ten_successes_reduce_delay_until_min() {
        for strategy in ALL {
            let mut p = policy(strategy);
            let params = strategy.params();
            let mut previous = p.current_delay();
            loop {
                for _ in 0..SUCCESS_STREAK_THRESHOLD - 1 {
                    p.update(OutcomeKind::Success, Duration::ZERO);
                    assert_eq!(p.current_delay(), previous);
                }
                p.update(OutcomeKind::Success, Duration::ZERO);
                assert_eq!(p.success_streak(), 0);
                if previous <= params.min_delay {
                    assert_eq!(p.current_delay(), params.min_delay);
                    break;
                }
                assert!(p.current_delay() < previous, "{strategy}: did not decrease");
                previous = p.current_delay();
            }
        }
    }

    #[test]
    fn pushback_increases_delay_until_max() {
        for strategy in ALL {
            let mut p = policy(strategy);
            let params = strategy.params();
            for kind in [OutcomeKind::RateLimited, OutcomeKind::Blocked].iter().cycle().take(40) {
                let before = p.current_delay();
                p.update(*kind, Duration::ZERO);
                if before < params.max_delay {
                    assert!(p.current_delay() > before);
                } else {
                    assert_eq!(p.current_delay(), params.max_delay);
                }
            }
            assert_eq!(p.failure_streak(), 40);
            assert_eq!(p.success_streak(), 0);
        }
    }

    #[test]
    fn conservative_rate_limit_doubles_delay() {
        let mut p = policy(RateLimitStrategy::Conservative);
        p.update(OutcomeKind::Success, Duration::ZERO);
        assert_eq!(p.current_delay(), 10.0);
        p.update(OutcomeKind::RateLimited, Duration::ZERO);
        assert_eq!(p.current_delay(), 20.0);
        p.update(OutcomeKind::Success, Duration::ZERO);
        assert_eq!(p.current_delay(), 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn captcha_pause_dominates_next_delay() {
        for strategy in ALL {
            let mut p = policy(strategy);
            for _ in 0..25 {
                p.update(OutcomeKind::Success, Duration::ZERO);
            }
            p.update(OutcomeKind::CaptchaRequired, Duration::ZERO);
            assert!(p.current_delay() >= 30.0_f64.min(strategy.params().max_delay));
            assert!(p.next_delay() >= Duration::from_secs(30));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn captcha_window_drains_over_time() {
        let mut p = policy(RateLimitStrategy::Balanced);
        p.update(OutcomeKind::CaptchaRequired, Duration::ZERO);
        assert_eq!(p.captcha_pause_remaining(Instant::now()), Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(p.captcha_pause_remaining(Instant::now()), Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(p.captcha_pause_remaining(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn jitter_respects_window_and_toggle() {
        let p = policy(RateLimitStrategy::Conservative);
        for _ in 0..200 {
            let d = p.next_delay().as_secs_f64();
            assert!((8.0..=12.0).contains(&d), "{d}");
        }

        let fixed = RateLimitPolicy::new(
            RateLimitStrategy::Aggressive,
            PacingConfig {
                randomize_intervals: false,
                ..PacingConfig::default()
            },
        );
        assert_eq!(fixed.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn response_time_average_is_seeded_then_smoothed() {
        let mut p = policy(RateLimitStrategy::Balanced);
        p.update(OutcomeKind::Timeout, Duration::from_secs(2));
        assert_eq!(p.average_response_time(), 2.0);
        p.update(OutcomeKind::Success, Duration::from_secs(12));
        assert!((p.average_response_time() - 3.0).abs() < 1e-9);
        assert_eq!(p.current_delay(), 7.0);
    }

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!("Balanced".parse(), Ok(RateLimitStrategy::Balanced));
        assert!("reckless".parse::<RateLimitStrategy>().is_err());
    }

    #[test]
    fn shared_limiter_applies_concurrent_updates() {
        let limiter = RateLimiter::new(RateLimitStrategy::Conservative, PacingConfig::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || limiter.update(OutcomeKind::Blocked, Duration::ZERO))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.failure_streak, 8);
        assert_eq!(snapshot.current_delay, 60.0);
    }
}
