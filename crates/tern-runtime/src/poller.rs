// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Idle-gated inbound message pump.
//!
//! Each tick — gated on the agent being idle — fetches a batch of queued
//! work from a pluggable store, claims every item not recently seen, and
//! forwards it to the agent's queue through the injected sink.  Store
//! errors back off exponentially; after `failure_threshold` consecutive
//! failures the poller reports itself degraded, and the first success after
//! that logs recovery.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tern_config::PollerConfig;

/// One unit of inbound work, forwarded as a synthetic user prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub id: String,
    pub text: String,
}

/// Pluggable queue backend (SQL table, HTTP inbox, ...).
#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Fetch up to `limit` pending items without consuming them.
    async fn fetch_batch(&self, limit: usize) -> anyhow::Result<Vec<WorkItem>>;
    /// Claim one item so other consumers skip it.
    async fn claim(&self, id: &str) -> anyhow::Result<()>;
}

/// Forwards a claimed item into the agent's queue.
pub type PromptSink = Arc<dyn Fn(WorkItem) + Send + Sync>;

/// Idle gate: ticks are skipped while this returns `false`
/// (i.e. while the agent is streaming).
pub type IdleFn = Arc<dyn Fn() -> bool + Send + Sync>;

pub struct Poller {
    config: PollerConfig,
    store: Arc<dyn WorkStore>,
    sink: PromptSink,
    idle: IdleFn,
    /// Recently claimed ids, to deduplicate across overlapping fetches.
    seen: LruCache<String, ()>,
    consecutive_failures: u32,
    degraded: bool,
    current_interval: Duration,
}

impl Poller {
    pub fn new(config: PollerConfig, store: Arc<dyn WorkStore>, sink: PromptSink, idle: IdleFn) -> Self {
        let capacity = NonZeroUsize::new(config.dedup_capacity.max(1)).unwrap();
        let current_interval = Duration::from_millis(config.interval_ms);
        Self {
            config,
            store,
            sink,
            idle,
            seen: LruCache::new(capacity),
            consecutive_failures: 0,
            degraded: false,
            current_interval,
        }
    }

    /// The delay before the next tick (backed off after store errors).
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// One poll cycle.  Returns the number of items forwarded; zero when
    /// the gate was closed or nothing was pending.
    pub async fn tick(&mut self) -> anyhow::Result<usize> {
        if !(self.idle)() {
            debug!("agent busy; skipping poll tick");
            return Ok(0);
        }

        let batch = match self.store.fetch_batch(self.config.batch_limit).await {
            Ok(batch) => batch,
            Err(e) => {
                self.consecutive_failures += 1;
                let backed_off = self.current_interval.as_millis() as f64 * self.config.backoff_factor;
                self.current_interval = Duration::from_millis(
                    (backed_off as u64).min(self.config.backoff_cap_ms),
                );
                if self.consecutive_failures >= self.config.failure_threshold && !self.degraded {
                    self.degraded = true;
                    warn!(
                        failures = self.consecutive_failures,
                        "work store unreachable; poller degraded"
                    );
                }
                return Err(e);
            }
        };

        if self.degraded {
            info!("work store reachable again; poller recovered");
        }
        self.degraded = false;
        self.consecutive_failures = 0;
        self.current_interval = Duration::from_millis(self.config.interval_ms);

        let mut forwarded = 0;
        for item in batch {
            if self.seen.contains(&item.id) {
                continue;
            }
            if let Err(e) = self.store.claim(&item.id).await {
                warn!(id = %item.id, error = %e, "failed to claim work item; skipping");
                continue;
            }
            self.seen.put(item.id.clone(), ());
            (self.sink)(item);
            forwarded += 1;
        }
        Ok(forwarded)
    }

    /// Run until cancelled.  Tick errors are absorbed (the backoff already
    /// stretched the next delay).
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let delay = self.current_interval;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Err(e) = self.tick().await {
                debug!(error = %e, "poll tick failed");
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Scripted store: a queue of fetch outcomes plus a claim log.
    struct ScriptedStore {
        batches: Mutex<Vec<anyhow::Result<Vec<WorkItem>>>>,
        claimed: Mutex<Vec<String>>,
        fail_claims: bool,
    }

    impl ScriptedStore {
        fn new(batches: Vec<anyhow::Result<Vec<WorkItem>>>) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(batches),
                claimed: Mutex::new(Vec::new()),
                fail_claims: false,
            })
        }
    }

    #[async_trait]
    impl WorkStore for ScriptedStore {
        async fn fetch_batch(&self, _limit: usize) -> anyhow::Result<Vec<WorkItem>> {
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                return Ok(vec![]);
            }
            batches.remove(0)
        }
        async fn claim(&self, id: &str) -> anyhow::Result<()> {
            if self.fail_claims {
                anyhow::bail!("claim conflict");
            }
            self.claimed.lock().unwrap().push(id.to_string());
            Ok(())
        }
    }

    fn item(id: &str) -> WorkItem {
        WorkItem {
            id: id.into(),
            text: format!("work {id}"),
        }
    }

    fn collecting_sink() -> (PromptSink, Arc<Mutex<Vec<WorkItem>>>) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let inner = collected.clone();
        let sink: PromptSink = Arc::new(move |work| inner.lock().unwrap().push(work));
        (sink, collected)
    }

    fn always_idle() -> IdleFn {
        Arc::new(|| true)
    }

    fn config() -> PollerConfig {
        PollerConfig {
            interval_ms: 100,
            batch_limit: 10,
            backoff_factor: 2.0,
            backoff_cap_ms: 1_000,
            failure_threshold: 2,
            dedup_capacity: 8,
            ..PollerConfig::default()
        }
    }

    #[tokio::test]
    async fn forwards_claimed_items() {
        let store = ScriptedStore::new(vec![Ok(vec![item("a"), item("b")])]);
        let (sink, collected) = collecting_sink();
        let mut poller = Poller::new(config(), store.clone(), sink, always_idle());

        assert_eq!(poller.tick().await.unwrap(), 2);
        assert_eq!(collected.lock().unwrap().len(), 2);
        assert_eq!(*store.claimed.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn busy_gate_skips_tick_entirely() {
        let store = ScriptedStore::new(vec![Ok(vec![item("a")])]);
        let (sink, collected) = collecting_sink();
        let idle: IdleFn = Arc::new(|| false);
        let mut poller = Poller::new(config(), store, sink, idle);

        assert_eq!(poller.tick().await.unwrap(), 0);
        assert!(collected.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_ids_are_forwarded_once() {
        let store = ScriptedStore::new(vec![
            Ok(vec![item("a")]),
            // The store returns the same item again before it is drained.
            Ok(vec![item("a"), item("b")]),
        ]);
        let (sink, collected) = collecting_sink();
        let mut poller = Poller::new(config(), store, sink, always_idle());

        poller.tick().await.unwrap();
        poller.tick().await.unwrap();
        let ids: Vec<String> = collected.lock().unwrap().iter().map(|w| w.id.clone()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn failed_claim_skips_item_without_failing_tick() {
        let store = Arc::new(ScriptedStore {
            batches: Mutex::new(vec![Ok(vec![item("a")])]),
            claimed: Mutex::new(Vec::new()),
            fail_claims: true,
        });
        let (sink, collected) = collecting_sink();
        let mut poller = Poller::new(config(), store, sink, always_idle());

        assert_eq!(poller.tick().await.unwrap(), 0);
        assert!(collected.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_errors_back_off_exponentially_to_cap() {
        let store = ScriptedStore::new(vec![
            Err(anyhow::anyhow!("down")),
            Err(anyhow::anyhow!("down")),
            Err(anyhow::anyhow!("down")),
            Err(anyhow::anyhow!("down")),
        ]);
        let (sink, _) = collecting_sink();
        let mut poller = Poller::new(config(), store, sink, always_idle());
        assert_eq!(poller.current_interval(), Duration::from_millis(100));

        assert!(poller.tick().await.is_err());
        assert_eq!(poller.current_interval(), Duration::from_millis(200));
        assert!(poller.tick().await.is_err());
        assert_eq!(poller.current_interval(), Duration::from_millis(400));
        assert!(poller.tick().await.is_err());
        assert_eq!(poller.current_interval(), Duration::from_millis(800));
        assert!(poller.tick().await.is_err());
        // Capped.
        assert_eq!(poller.current_interval(), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn degraded_after_threshold_and_recovers_on_success() {
        let store = ScriptedStore::new(vec![
            Err(anyhow::anyhow!("down")),
            Err(anyhow::anyhow!("down")),
            Ok(vec![item("a")]),
        ]);
        let (sink, _) = collecting_sink();
        let mut poller = Poller::new(config(), store, sink, always_idle());

        let _ = poller.tick().await;
        assert!(!poller.is_degraded());
        let _ = poller.tick().await;
        assert!(poller.is_degraded());

        assert_eq!(poller.tick().await.unwrap(), 1);
        assert!(!poller.is_degraded());
        // The interval snapped back to the configured base.
        assert_eq!(poller.current_interval(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_stops_on_cancel() {
        let store = ScriptedStore::new(vec![]);
        let (sink, _) = collecting_sink();
        let poller = Poller::new(config(), store, sink, always_idle());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poller.run(cancel.clone()));
        cancel.cancel();
        handle.await.unwrap();
    }
}
