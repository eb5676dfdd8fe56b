//! Request statistics.
//!
//! Monotonic outcome counters plus a short request history. Streaks, the
//! current delay and the response-time average are read from the shared
//! [`RateLimiter`] at snapshot time so the two never drift apart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use crate::modules::rate_limit::{RateLimitStrategy, RateLimiter};
use crate::outcome::{OutcomeKind, RequestOutcome};

/// Number of requests kept in the rolling history.
pub const HISTORY_LIMIT: usize = 100;

/// Serialisable statistics, in the layout of the stats file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub rate_limited_requests: u64,
    pub captcha_requests: u64,
    pub blocked_requests: u64,
    pub current_delay: f64,
    pub average_response_time: f64,
    pub success_streak: u32,
    pub failure_streak: u32,
    pub strategy: RateLimitStrategy,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub kind: OutcomeKind,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    successful: u64,
    failed: u64,
    rate_limited: u64,
    captcha: u64,
    blocked: u64,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    history: VecDeque<HistoryEntry>,
}

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("failed to write stats file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialise stats: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Thread-safe recorder shared by every fetch.
#[derive(Debug, Clone)]
pub struct StatsRecorder {
    counters: Arc<Mutex<Counters>>,
    limiter: RateLimiter,
}

impl StatsRecorder {
    pub fn new(limiter: RateLimiter) -> Self {
        Self {
            counters: Arc::new(Mutex::new(Counters::default())),
            limiter,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, outcome: &RequestOutcome) {
        let now = Utc::now();
        let mut counters = self.lock();
        counters.total += 1;
        if outcome.kind.is_success() {
            counters.successful += 1;
            counters.last_success = Some(now);
        } else {
            counters.failed += 1;
            counters.last_failure = Some(now);
        }
        match outcome.kind {
            OutcomeKind::RateLimited => counters.rate_limited += 1,
            OutcomeKind::CaptchaRequired => counters.captcha += 1,
            OutcomeKind::Blocked => counters.blocked += 1,
            _ => {}
        }

        if counters.history.len() == HISTORY_LIMIT {
            counters.history.pop_front();
        }
        counters.history.push_back(HistoryEntry {
            at: now,
            kind: outcome.kind,
            elapsed: outcome.elapsed,
        });
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let pacing = self.limiter.snapshot();
        let counters = self.lock();
        let success_rate = if counters.total > 0 {
            counters.successful as f64 / counters.total as f64
        } else {
            0.0
        };
        StatsSnapshot {
            total_requests: counters.total,
            successful_requests: counters.successful,
            failed_requests: counters.failed,
            success_rate,
            rate_limited_requests: counters.rate_limited,
            captcha_requests: counters.captcha,
            blocked_requests: counters.blocked,
            current_delay: pacing.current_delay,
            average_response_time: pacing.average_response_time,
            success_streak: pacing.success_streak,
            failure_streak: pacing.failure_streak,
            strategy: pacing.strategy,
            last_success: counters.last_success,
            last_failure: counters.last_failure,
            timestamp: Utc::now(),
        }
    }

    /// Oldest first.
    pub fn recent_history(&self) -> Vec<HistoryEntry> {
        self.lock().history.iter().cloned().collect()
    }

    /// Overwrites `path` with the current snapshot as pretty JSON.
    pub async fn persist(&self, path: &Path) -> Result<StatsSnapshot, StatsError> {
        let snapshot = self.snapshot();
        let payload = serde_json::to_vec_pretty(&snapshot)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, payload).await?;
        log::info!("statistics saved to {}", path.display());
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::rate_limit::PacingConfig;

    fn recorder() -> (StatsRecorder, RateLimiter) {
        let limiter = RateLimiter::new(RateLimitStrategy::Conservative, PacingConfig::default());
        (StatsRecorder::new(limiter.clone()), limiter)
    }

    fn outcome(kind: OutcomeKind) -> RequestOutcome {
        RequestOutcome::new(kind, Duration::from_millis(250))
    }

    #[test]
    fn counts_each_outcome_kind() {
        let (stats, _) = recorder();
        for kind in [
            OutcomeKind::Success,
            OutcomeKind::Success,
            OutcomeKind::RateLimited,
            OutcomeKind::CaptchaRequired,
            OutcomeKind::Blocked,
            OutcomeKind::Timeout,
            OutcomeKind::NetworkError,
        ] {
            stats.record(&outcome(kind));
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_requests, 7);
        assert_eq!(snapshot.successful_requests, 2);
        assert_eq!(snapshot.failed_requests, 5);
        assert_eq!(snapshot.rate_limited_requests, 1);
        assert_eq!(snapshot.captcha_requests, 1);
        assert_eq!(snapshot.blocked_requests, 1);
        assert!((snapshot.success_rate - 2.0 / 7.0).abs() < 1e-9);
        assert!(snapshot.last_success.is_some());
        assert!(snapshot.last_failure.is_some());
    }

    #[test]
    fn streaks_and_delay_come_from_the_limiter() {
        let (stats, limiter) = recorder();
        limiter.update(OutcomeKind::Blocked, Duration::from_secs(1));
        limiter.update(OutcomeKind::Blocked, Duration::from_secs(1));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.failure_streak, 2);
        assert_eq!(snapshot.current_delay, 40.0);
        assert_eq!(snapshot.average_response_time, 1.0);
        assert_eq!(snapshot.strategy, RateLimitStrategy::Conservative);
    }

    #[test]
    fn history_keeps_the_latest_entries() {
        let (stats, _) = recorder();
        for _ in 0..HISTORY_LIMIT {
            stats.record(&outcome(OutcomeKind::Success));
        }
        stats.record(&outcome(OutcomeKind::Timeout));
        let history = stats.recent_history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history.last().map(|e| e.kind), Some(OutcomeKind::Timeout));
    }

    #[tokio::test]
    async fn persist_overwrites_with_expected_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("stats.json");
        let (stats, _) = recorder();
        stats.record(&outcome(OutcomeKind::Success));
        stats.persist(&path).await.unwrap();
        stats.record(&outcome(OutcomeKind::RateLimited));
        stats.persist(&path).await.unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let object = value.as_object().unwrap();
        for field in [
            "total_requests",
            "successful_requests",
            "failed_requests",
            "success_rate",
            "rate_limited_requests",
            "captcha_requests",
            "blocked_requests",
            "current_delay",
            "average_response_time",
            "success_streak",
            "failure_streak",
            "strategy",
            "last_success",
            "last_failure",
            "timestamp",
        ] {
            assert!(object.contains_key(field), "missing {field}");
        }
        assert_eq!(object.len(), 15);
        assert_eq!(value["total_requests"], 2);
        assert_eq!(value["strategy"], "conservative");
    }
}
