//! Token-aware rate limiting for the classification API.
//!
//! Tracks requests per minute and estimated tokens per minute over a sliding
//! 60-second window. Both windows are checked and recorded under one lock so
//! a decision is never interleaved with another task's.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);
/// Extra wait past the oldest entry's expiry so the retry lands on free quota.
const REENTRY_MARGIN: Duration = Duration::from_millis(200);
const BASE_WAIT: Duration = Duration::from_secs(1);

/// Sliding history of weighted events for one quota dimension.
#[derive(Debug, Default)]
struct QuotaWindow {
    events: VecDeque<(Instant, u64)>,
}

impl QuotaWindow {
    fn record(&mut self, weight: u64, now: Instant) {
        self.events.push_back((now, weight));
    }

    /// Drops entries older than the window, then sums what remains.
    /// Events are appended in time order, so expiry is a prefix trim.
    fn usage(&mut self, now: Instant) -> u64 {
        while let Some(&(t, _)) = self.events.front() {
            if now.duration_since(t) > WINDOW {
                self.events.pop_front();
            } else {
                break;
            }
        }
        self.events.iter().map(|&(_, w)| w).sum()
    }

    fn oldest(&self) -> Option<Instant> {
        self.events.front().map(|&(t, _)| t)
    }
}

#[derive(Debug, Default)]
struct Windows {
    requests: QuotaWindow,
    tokens: QuotaWindow,
    total_requests: u64,
    total_tokens: u64,
}

/// Usage snapshot, read-only.
#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub total_tokens: u64,
    pub current_rpm: u64,
    pub current_tpm: u64,
    pub rpm_limit: usize,
    pub tpm_limit: u64,
}

#[derive(Clone)]
pub struct RateLimiter {
    rpm_limit: usize,
    tpm_limit: u64,
    windows: Arc<Mutex<Windows>>,
}

impl RateLimiter {
    pub fn new(rpm_limit: usize, tpm_limit: u64) -> Self {
        Self {
            rpm_limit,
            tpm_limit,
            windows: Arc::new(Mutex::new(Windows::default())),
        }
    }

    pub fn from_config() -> Self {
        let limits = &crate::run_config::cfg.rate_limits;
        Self::new(limits.requests_per_min, limits.tokens_per_min)
    }

    /// Wait until a request of the given estimated token weight fits under
    /// both quotas, then record it. Never fails; only blocks.
    pub async fn acquire(&self, estimated_tokens: u64) {
        // A weight at or above the token limit could never be admitted.
        let estimated_tokens = estimated_tokens.min(self.tpm_limit.saturating_sub(1));

        loop {
            let wait = {
                let mut windows = self.windows.lock().await;
                let now = Instant::now();
                let rpm_used = windows.requests.usage(now);
                let tpm_used = windows.tokens.usage(now);

                if rpm_used < self.rpm_limit as u64
                    && tpm_used + estimated_tokens < self.tpm_limit
                {
                    windows.requests.record(1, now);
                    windows.tokens.record(estimated_tokens, now);
                    windows.total_requests += 1;
                    windows.total_tokens += estimated_tokens;
                    return;
                }

                let oldest_request = (rpm_used >= self.rpm_limit as u64)
                    .then(|| windows.requests.oldest())
                    .flatten();
                let oldest_token = (tpm_used + estimated_tokens >= self.tpm_limit)
                    .then(|| windows.tokens.oldest())
                    .flatten();
                let wait = compute_wait(now, oldest_request, oldest_token);

                tracing::info!(
                    "Rate limit: RPM {}/{}, TPM {}/{}. Waiting {:.1}s...",
                    rpm_used,
                    self.rpm_limit,
                    tpm_used,
                    self.tpm_limit,
                    wait.as_secs_f64()
                );
                wait
            };

            // Lock is released while sleeping so other tasks can be admitted
            // as quota frees up.
            sleep(wait).await;
        }
    }

    pub async fn stats(&self) -> RateLimiterStats {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        RateLimiterStats {
            current_rpm: windows.requests.usage(now),
            current_tpm: windows.tokens.usage(now),
            total_requests: windows.total_requests,
            total_tokens: windows.total_tokens,
            rpm_limit: self.rpm_limit,
            tpm_limit: self.tpm_limit,
        }
    }
}

/// Base 1s; when a dimension is saturated, extend to just past the point
/// where its oldest entry leaves the window.
fn compute_wait(
    now: Instant,
    oldest_request: Option<Instant>,
    oldest_token: Option<Instant>,
) -> Duration {
    let mut wait = BASE_WAIT;
    for oldest in [oldest_request, oldest_token].into_iter().flatten() {
        let until_expiry = (WINDOW + REENTRY_MARGIN).saturating_sub(now.duration_since(oldest));
        wait = wait.max(until_expiry);
    }
    wait
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn quota_window_prunes_expired_entries() {
        let mut window = QuotaWindow::default();
        let start = Instant::now();
        window.record(10, start);
        window.record(20, start);
        assert_eq!(window.usage(start), 30);

        let later = start + Duration::from_secs(61);
        window.record(5, later);
        assert_eq!(window.usage(later), 5);
        // Pruning is monotonic.
        assert_eq!(window.usage(later), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_records_both_dimensions() {
        let limiter = RateLimiter::new(10, 10_000);
        for _ in 0..3 {
            limiter.acquire(100).await;
        }

        let stats = limiter.stats().await;
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.total_tokens, 300);
        assert_eq!(stats.current_rpm, 3);
        assert_eq!(stats.current_tpm, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn request_quota_is_never_exceeded() {
        let limiter = RateLimiter::new(2, 1_000_000);
        for _ in 0..5 {
            limiter.acquire(10).await;
            let stats = limiter.stats().await;
            assert!(stats.current_rpm <= 2, "rpm {} over limit", stats.current_rpm);
        }
        assert_eq!(limiter.stats().await.total_requests, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn token_quota_is_never_exceeded() {
        let limiter = RateLimiter::new(100, 250);
        for _ in 0..4 {
            limiter.acquire(100).await;
            let stats = limiter.stats().await;
            assert!(stats.current_tpm < 250, "tpm {} over limit", stats.current_tpm);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_extends_until_oldest_entry_expires() {
        let oldest = Instant::now();
        let now = oldest + Duration::from_secs(5);

        let wait = compute_wait(now, Some(oldest), None);
        assert!((wait.as_secs_f64() - 55.2).abs() < 0.01, "wait {:?}", wait);

        // Both dimensions saturated: the later expiry wins.
        let newer = oldest + Duration::from_secs(3);
        let wait = compute_wait(now, Some(oldest), Some(newer));
        assert!((wait.as_secs_f64() - 58.2).abs() < 0.01, "wait {:?}", wait);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_floors_at_one_second() {
        let oldest = Instant::now();
        let now = oldest + Duration::from_secs(120);
        assert_eq!(compute_wait(now, Some(oldest), None), Duration::from_secs(1));
        assert_eq!(compute_wait(now, None, None), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_weight_is_clamped_and_admitted() {
        let limiter = RateLimiter::new(10, 100);
        limiter.acquire(500).await;

        let stats = limiter.stats().await;
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.total_tokens, 99);
    }
}
