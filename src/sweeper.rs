use crate::clock::Clock;
use crate::metrics::Metrics;
use crate::producer::retry_backoff_ms;
use crate::store::{IdempotencyStore, StoreError, StoreStats, SweepReport};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, info, warn};

const RETRIES_PER_TICK: u32 = 3;
const RETRY_BACKOFF_BASE_MS: u64 = 500;
const RETRY_BACKOFF_MAX_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub report: SweepReport,
    pub stats: StoreStats,
}

/// Periodically deletes expired terminal records and fails abandoned
/// pending ones so their keys can be retried.
#[derive(Clone)]
pub struct CleanupSweeper {
    store: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn Clock>,
    abandon_after_seconds: i64,
    interval: Duration,
    metrics: Metrics,
    consecutive_failures: Arc<AtomicU64>,
    alive: Arc<AtomicBool>,
}

impl CleanupSweeper {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        clock: Arc<dyn Clock>,
        abandon_after_seconds: i64,
        interval: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            clock,
            abandon_after_seconds,
            interval,
            metrics,
            consecutive_failures: Arc::new(AtomicU64::new(0)),
            alive: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn run_once(&self) -> Result<SweepSummary, StoreError> {
        let now = self.clock.now_epoch();
        let result = self
            .store
            .sweep(now, self.abandon_after_seconds)
            .and_then(|report| Ok((report, self.store.stats(now)?)));

        match result {
            Ok((report, stats)) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.metrics.set_sweeper_consecutive_failures(0);
                self.metrics.observe_sweep(&report, &stats);

                if report.deleted > 0 || report.abandoned > 0 {
                    info!(
                        deleted = report.deleted,
                        abandoned = report.abandoned,
                        expired_leases = report.expired_leases,
                        remaining = stats.total(),
                        "idempotency sweep finished"
                    );
                } else {
                    debug!(remaining = stats.total(), "idempotency sweep found nothing to do");
                }
                Ok(SweepSummary { report, stats })
            }
            Err(error) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                self.metrics.inc_sweep_failure();
                self.metrics.set_sweeper_consecutive_failures(failures);
                warn!(error = %error, consecutive_failures = failures, "idempotency sweep failed");
                Err(error)
            }
        }
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// True while the background task started by [`spawn`](Self::spawn) runs.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn spawn(&self) -> JoinHandle<()> {
        self.alive.store(true, Ordering::SeqCst);
        // Built before the spawn so an abort ahead of the first poll still
        // clears the flag.
        let alive = AliveFlag(self.alive.clone());
        let sweeper = self.clone();
        tokio::spawn(async move {
            let _alive = alive;
            sweeper.run().await;
        })
    }

    async fn run(&self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let mut attempt = 0u32;
            while self.run_once().is_err() {
                if attempt >= RETRIES_PER_TICK {
                    warn!(
                        retries = attempt,
                        "giving up on this sweep; next attempt at the following interval"
                    );
                    break;
                }
                let backoff = retry_backoff_ms(RETRY_BACKOFF_BASE_MS, RETRY_BACKOFF_MAX_MS, attempt);
                attempt = attempt.saturating_add(1);
                sleep(Duration::from_millis(backoff).min(self.interval)).await;
            }
        }
    }
}

// Clears the alive flag however the sweeper task ends.
struct AliveFlag(Arc<AtomicBool>);

impl Drop for AliveFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
