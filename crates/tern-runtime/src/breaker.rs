// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-service circuit breaker: closed → open on repeated failures, open →
//! half-open after a cooldown, half-open → closed on the first success (or
//! straight back to open on failure).

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use tern_config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BreakerError {
    #[error("circuit open for service {0:?}")]
    Open(String),
}

struct ServiceState {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            opened_at: None,
        }
    }
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    services: Mutex<HashMap<String, ServiceState>>,
}

/// Process-wide breaker shared by all adapter callers.  Tests should build
/// isolated instances with [`CircuitBreaker::new`].
pub fn shared() -> &'static CircuitBreaker {
    static SHARED: OnceLock<CircuitBreaker> = OnceLock::new();
    SHARED.get_or_init(|| CircuitBreaker::new(BreakerConfig::default()))
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            services: Mutex::new(HashMap::new()),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.open_timeout_ms)
    }

    pub fn state(&self, service: &str) -> CircuitState {
        let mut services = self.services.lock().unwrap();
        let entry = services.entry(service.to_string()).or_default();
        self.refresh(entry);
        entry.state
    }

    /// Gate a request.  Rejects instantly while open; the first caller after
    /// the cooldown gets the half-open probe slot.
    pub fn check(&self, service: &str) -> Result<(), BreakerError> {
        let mut services = self.services.lock().unwrap();
        let entry = services.entry(service.to_string()).or_default();
        self.refresh(entry);
        match entry.state {
            CircuitState::Open => Err(BreakerError::Open(service.to_string())),
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
        }
    }

    pub fn record_success(&self, service: &str) {
        let mut services = self.services.lock().unwrap();
        let entry = services.entry(service.to_string()).or_default();
        if entry.state == CircuitState::HalfOpen {
            info!(service, "circuit closed after successful probe");
        }
        entry.state = CircuitState::Closed;
        entry.failures = 0;
        entry.opened_at = None;
    }

    pub fn record_failure(&self, service: &str) {
        let mut services = self.services.lock().unwrap();
        let entry = services.entry(service.to_string()).or_default();
        self.refresh(entry);
        match entry.state {
            CircuitState::HalfOpen => {
                warn!(service, "probe failed; circuit re-opened");
                entry.state = CircuitState::Open;
                entry.opened_at = Some(Instant::now());
            }
            CircuitState::Closed => {
                entry.failures += 1;
                if entry.failures >= self.config.failure_threshold {
                    warn!(
                        service,
                        failures = entry.failures,
                        "failure threshold reached; circuit opened"
                    );
                    entry.state = CircuitState::Open;
                    entry.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Run `f` under the breaker: rejected while open, outcome recorded.
    pub async fn execute<T, E, F, Fut>(&self, service: &str, f: F) -> Result<Result<T, E>, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.check(service)?;
        let outcome = f().await;
        match &outcome {
            Ok(_) => self.record_success(service),
            Err(_) => self.record_failure(service),
        }
        Ok(outcome)
    }

    /// Open → half-open once the cooldown has elapsed.
    fn refresh(&self, entry: &mut ServiceState) {
        if entry.state == CircuitState::Open {
            let elapsed = entry
                .opened_at
                .map(|at| at.elapsed())
                .unwrap_or(Duration::ZERO);
            if elapsed >= self.timeout() {
                entry.state = CircuitState::HalfOpen;
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            open_timeout_ms: timeout_ms,
        })
    }

    #[tokio::test]
    async fn starts_closed_and_allows() {
        let b = breaker(3, 1000);
        assert_eq!(b.state("svc"), CircuitState::Closed);
        assert!(b.check("svc").is_ok());
    }

    #[tokio::test]
    async fn opens_at_failure_threshold() {
        let b = breaker(3, 1000);
        b.record_failure("svc");
        b.record_failure("svc");
        assert_eq!(b.state("svc"), CircuitState::Closed);
        b.record_failure("svc");
        assert_eq!(b.state("svc"), CircuitState::Open);
        assert_eq!(b.check("svc"), Err(BreakerError::Open("svc".into())));
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let b = breaker(3, 1000);
        b.record_failure("svc");
        b.record_failure("svc");
        b.record_success("svc");
        b.record_failure("svc");
        b.record_failure("svc");
        assert_eq!(b.state("svc"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_transitions_to_half_open_after_timeout() {
        let b = breaker(1, 1000);
        b.record_failure("svc");
        assert_eq!(b.state("svc"), CircuitState::Open);
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(b.state("svc"), CircuitState::HalfOpen);
        assert!(b.check("svc").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_success_closes_and_resets() {
        let b = breaker(2, 1000);
        b.record_failure("svc");
        b.record_failure("svc");
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(b.state("svc"), CircuitState::HalfOpen);
        b.record_success("svc");
        assert_eq!(b.state("svc"), CircuitState::Closed);
        // The failure count was reset: one new failure stays closed.
        b.record_failure("svc");
        assert_eq!(b.state("svc"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let b = breaker(1, 1000);
        b.record_failure("svc");
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(b.state("svc"), CircuitState::HalfOpen);
        b.record_failure("svc");
        assert_eq!(b.state("svc"), CircuitState::Open);
        // And the cooldown starts over.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(b.state("svc"), CircuitState::Open);
    }

    #[tokio::test]
    async fn services_are_independent() {
        let b = breaker(1, 1000);
        b.record_failure("bad");
        assert_eq!(b.state("bad"), CircuitState::Open);
        assert_eq!(b.state("good"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn execute_records_outcomes_and_rejects_when_open() {
        let b = breaker(1, 60_000);
        let ok: Result<Result<u32, &str>, _> = b.execute("svc", || async { Ok(7) }).await;
        assert_eq!(ok.unwrap().unwrap(), 7);

        let failed: Result<Result<u32, &str>, _> =
            b.execute("svc", || async { Err("boom") }).await;
        assert!(failed.unwrap().is_err());
        assert_eq!(b.state("svc"), CircuitState::Open);

        let rejected: Result<Result<u32, &str>, _> = b.execute("svc", || async { Ok(1) }).await;
        assert_eq!(rejected.unwrap_err(), BreakerError::Open("svc".into()));
    }

    #[test]
    fn shared_instance_is_a_singleton() {
        let a = shared() as *const CircuitBreaker;
        let b = shared() as *const CircuitBreaker;
        assert_eq!(a, b);
    }
}
