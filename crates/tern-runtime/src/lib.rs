// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod breaker;
pub mod limiter;
pub mod poller;

pub use breaker::{BreakerError, CircuitBreaker, CircuitState};
pub use limiter::RateLimiter;
pub use poller::{IdleFn, Poller, PromptSink, WorkItem, WorkStore};
