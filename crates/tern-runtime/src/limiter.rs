// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Sliding-window rate limiter, keyed by logical API name.
//!
//! Two constraints gate a request: at most `max_requests` inside the rolling
//! window, and at least `min_interval_ms` since the previous call to the
//! same API.  Waiting polls with a delay derived from whichever constraint
//! is blocking, clamped to [100 ms, 5 s].

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use tern_config::RateLimitConfig;

const MIN_POLL: Duration = Duration::from_millis(100);
const MAX_POLL: Duration = Duration::from_millis(5_000);

#[derive(Default)]
struct ApiWindow {
    /// Timestamps of calls still inside the window, oldest first.
    timestamps: VecDeque<Instant>,
    last_call: Option<Instant>,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, ApiWindow>>,
}

/// Process-wide limiter shared by all adapter callers.  Tests should build
/// isolated instances with [`RateLimiter::new`] instead.
pub fn shared() -> &'static RateLimiter {
    static SHARED: OnceLock<RateLimiter> = OnceLock::new();
    SHARED.get_or_init(|| RateLimiter::new(RateLimitConfig::default()))
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.config.window_ms)
    }

    fn min_interval(&self) -> Duration {
        Duration::from_millis(self.config.min_interval_ms)
    }

    /// Whether a request to `api` may go out right now.
    pub fn can_request(&self, api: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        let state = windows.entry(api.to_string()).or_default();
        Self::prune(state, now, self.window());

        let window_ok = (state.timestamps.len() as u32) < self.config.max_requests;
        let interval_ok = state
            .last_call
            .map(|last| now.duration_since(last) >= self.min_interval())
            .unwrap_or(true);
        window_ok && interval_ok
    }

    /// Record that a request went out now.
    pub fn record_request(&self, api: &str) {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        let state = windows.entry(api.to_string()).or_default();
        Self::prune(state, now, self.window());
        state.timestamps.push_back(now);
        state.last_call = Some(now);
    }

    /// Sleep until a slot is free.  The poll delay is the time until the
    /// blocking constraint clears, clamped to [100 ms, 5 s].
    pub async fn wait_for_slot(&self, api: &str) {
        loop {
            let delay = {
                let now = Instant::now();
                let mut windows = self.windows.lock().unwrap();
                let state = windows.entry(api.to_string()).or_default();
                Self::prune(state, now, self.window());

                let window_wait = if (state.timestamps.len() as u32) >= self.config.max_requests {
                    state
                        .timestamps
                        .front()
                        .map(|oldest| (*oldest + self.window()).saturating_duration_since(now))
                        .unwrap_or(Duration::ZERO)
                } else {
                    Duration::ZERO
                };
                let interval_wait = state
                    .last_call
                    .map(|last| (last + self.min_interval()).saturating_duration_since(now))
                    .unwrap_or(Duration::ZERO);

                let wait = window_wait.max(interval_wait);
                if wait.is_zero() {
                    return;
                }
                wait.clamp(MIN_POLL, MAX_POLL)
            };
            debug!(api, delay_ms = delay.as_millis() as u64, "rate limited; waiting");
            tokio::time::sleep(delay).await;
        }
    }

    /// Wait for a slot, record the request, then run `f`.
    pub async fn execute<T, F, Fut>(&self, api: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        self.wait_for_slot(api).await;
        self.record_request(api);
        f().await
    }

    fn prune(state: &mut ApiWindow, now: Instant, window: Duration) {
        while let Some(oldest) = state.timestamps.front() {
            if now.duration_since(*oldest) >= window {
                state.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window_ms: u64, min_interval_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_requests: max,
            window_ms,
            min_interval_ms,
        })
    }

    #[tokio::test]
    async fn fresh_limiter_allows_requests() {
        let l = limiter(2, 1000, 0);
        assert!(l.can_request("api"));
    }

    #[tokio::test]
    async fn window_fills_and_blocks() {
        let l = limiter(2, 1000, 0);
        l.record_request("api");
        assert!(l.can_request("api"));
        l.record_request("api");
        assert!(!l.can_request("api"));
    }

    #[tokio::test]
    async fn apis_are_independent() {
        let l = limiter(1, 1000, 0);
        l.record_request("anthropic");
        assert!(!l.can_request("anthropic"));
        assert!(l.can_request("openai"));
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_open_after_expiry() {
        let l = limiter(1, 1000, 0);
        l.record_request("api");
        assert!(!l.can_request("api"));
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(l.can_request("api"));
    }

    #[tokio::test(start_paused = true)]
    async fn min_interval_blocks_back_to_back_calls() {
        let l = limiter(100, 10_000, 500);
        l.record_request("api");
        assert!(!l.can_request("api"));
        tokio::time::advance(Duration::from_millis(501)).await;
        assert!(l.can_request("api"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_slot_returns_once_window_frees() {
        let l = limiter(1, 1000, 0);
        l.record_request("api");
        // With paused time, sleep() auto-advances the clock, so this
        // resolves deterministically once the window slides.
        l.wait_for_slot("api").await;
        assert!(l.can_request("api"));
    }

    /// Window bound: with max M in window W, any rolling window observes at
    /// most M executions.
    #[tokio::test(start_paused = true)]
    async fn execute_never_exceeds_window_bound() {
        let l = limiter(3, 1_000, 0);
        let mut completions: Vec<Instant> = Vec::new();
        for _ in 0..9 {
            l.execute("api", || async {}).await;
            completions.push(Instant::now());
        }
        for (i, t) in completions.iter().enumerate() {
            let in_window = completions
                .iter()
                .filter(|other| {
                    **other <= *t && t.duration_since(**other) < Duration::from_millis(1_000)
                })
                .count();
            assert!(in_window <= 3, "window bound violated at call {i}: {in_window}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn execute_runs_the_closure() {
        let l = limiter(10, 1000, 0);
        let out = l.execute("api", || async { 41 + 1 }).await;
        assert_eq!(out, 42);
    }

    #[test]
    fn shared_instance_is_a_singleton() {
        let a = shared() as *const RateLimiter;
        let b = shared() as *const RateLimiter;
        assert_eq!(a, b);
    }
}
