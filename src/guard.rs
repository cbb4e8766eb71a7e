use crate::clock::Clock;
use crate::producer::retry_backoff_ms;
use crate::store::{LeaseStore, StoreError};
use std::collections::HashMap;
use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::warn;
use uuid::Uuid;

pub const DEFAULT_SHARDS: usize = 64;

// Upper bound on a single wait between re-checks of a held slot.
const LOCAL_RECHECK: Duration = Duration::from_millis(25);
const LEASE_POLL_BASE_MS: u64 = 10;
const LEASE_POLL_MAX_MS: u64 = 250;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("timed out waiting for the lock on {key}")]
    TimedOut { key: String },
    #[error("lease backend failed")]
    Lease(#[from] StoreError),
}

struct Slot {
    token: u64,
    expires_at: Instant,
    released: Arc<Notify>,
}

#[derive(Default)]
struct Shard {
    slots: Mutex<HashMap<String, Slot>>,
}

impl Shard {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        // Slot maps stay consistent across a panicking holder.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct GuardInner {
    shards: Vec<Shard>,
    leases: Option<Arc<dyn LeaseStore>>,
    max_hold: Duration,
    clock: Arc<dyn Clock>,
    instance_id: String,
    next_token: AtomicU64,
}

/// Per-key mutual exclusion.
///
/// Keys hash onto a fixed set of shards, each owning the slots of the keys
/// currently held; there is no lock spanning keys. A slot expires after
/// `max_hold`, after which the next acquirer takes it over (watchdog
/// release). When a [`LeaseStore`] is configured the holder additionally
/// takes a lease record on the shared medium, bounded by the same hold time.
#[derive(Clone)]
pub struct ConcurrencyGuard {
    inner: Arc<GuardInner>,
}

impl ConcurrencyGuard {
    pub fn new(
        shard_count: usize,
        max_hold: Duration,
        leases: Option<Arc<dyn LeaseStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Shard::default())
            .collect::<Vec<_>>();

        Self {
            inner: Arc::new(GuardInner {
                shards,
                leases,
                max_hold,
                clock,
                instance_id: Uuid::new_v4().simple().to_string(),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    pub fn local(max_hold: Duration, clock: Arc<dyn Clock>) -> Self {
        Self::new(DEFAULT_SHARDS, max_hold, None, clock)
    }

    pub fn max_hold(&self) -> Duration {
        self.inner.max_hold
    }

    pub async fn acquire(&self, key: &str, wait: Duration) -> Result<KeyLock, GuardError> {
        let deadline = Instant::now() + wait;
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);

        self.acquire_local(key, token, deadline).await?;
        let mut lock = KeyLock {
            guard: self.clone(),
            key: key.to_string(),
            token,
            lease_holder: None,
            acquired_at: Instant::now(),
        };

        if let Some(leases) = &self.inner.leases {
            let holder = format!("{}-{token}", self.inner.instance_id);
            self.acquire_lease(leases.as_ref(), key, &holder, deadline)
                .await?;
            lock.lease_holder = Some(holder);
        }

        Ok(lock)
    }

    pub async fn with_lock<F, Fut, T>(
        &self,
        key: &str,
        wait: Duration,
        critical: F,
    ) -> Result<T, GuardError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _lock = self.acquire(key, wait).await?;
        Ok(critical().await)
    }

    async fn acquire_local(&self, key: &str, token: u64, deadline: Instant) -> Result<(), GuardError> {
        let shard = self.shard(key);

        loop {
            let now = Instant::now();
            let held = {
                let mut slots = shard.slots();
                if let Some(slot) = slots.get(key)
                    && slot.expires_at > now
                {
                    Some((slot.released.clone(), slot.expires_at))
                } else {
                    if let Some(stale) = slots.remove(key) {
                        warn!(key = %key, "lock hold time exceeded; releasing by watchdog");
                        stale.released.notify_waiters();
                    }
                    slots.insert(
                        key.to_string(),
                        Slot {
                            token,
                            expires_at: now + self.inner.max_hold,
                            released: Arc::new(Notify::new()),
                        },
                    );
                    None
                }
            };

            let Some((released, expires_at)) = held else {
                return Ok(());
            };
            if now >= deadline {
                return Err(GuardError::TimedOut {
                    key: key.to_string(),
                });
            }

            let wake_at = deadline.min(expires_at).min(now + LOCAL_RECHECK);
            let _ = timeout_at(wake_at, released.notified()).await;
        }
    }

    async fn acquire_lease(
        &self,
        leases: &dyn LeaseStore,
        key: &str,
        holder: &str,
        deadline: Instant,
    ) -> Result<(), GuardError> {
        let lease_ms = i64::try_from(self.inner.max_hold.as_millis()).unwrap_or(i64::MAX);

        let mut attempt = 0u32;
        loop {
            let now_ms = self.inner.clock.now_epoch_ms();
            if leases.try_acquire_lease(key, holder, now_ms, lease_ms)? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(GuardError::TimedOut {
                    key: key.to_string(),
                });
            }

            let backoff = retry_backoff_ms(LEASE_POLL_BASE_MS, LEASE_POLL_MAX_MS, attempt);
            attempt = attempt.saturating_add(1);
            sleep_until(deadline.min(Instant::now() + Duration::from_millis(backoff))).await;
        }
    }

    fn release(&self, key: &str, token: u64, lease_holder: Option<&str>) {
        if let (Some(leases), Some(holder)) = (&self.inner.leases, lease_holder)
            && let Err(error) = leases.release_lease(key, holder)
        {
            warn!(key = %key, error = %error, "failed to release key lease; it will lapse");
        }

        let mut slots = self.shard(key).slots();
        if slots.get(key).is_some_and(|slot| slot.token == token)
            && let Some(slot) = slots.remove(key)
        {
            slot.released.notify_waiters();
        }
    }

    fn shard(&self, key: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.inner.shards.len() as u64) as usize;
        &self.inner.shards[index]
    }

    #[cfg(test)]
    fn held_slots(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|shard| shard.slots().len())
            .sum()
    }
}

/// Held lock on one key; released on drop.
pub struct KeyLock {
    guard: ConcurrencyGuard,
    key: String,
    token: u64,
    lease_holder: Option<String>,
    acquired_at: Instant,
}

impl KeyLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        let held_for = self.held_for();
        if held_for > self.guard.max_hold() {
            warn!(
                key = %self.key,
                held_ms = held_for.as_millis() as u64,
                "lock released after its hold time had already expired"
            );
        }
        self.guard
            .release(&self.key, self.token, self.lease_holder.as_deref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::memory::MemoryIdempotencyStore;
    use std::sync::atomic::AtomicUsize;

    const KEY: &str = "payment_7f3a9c2e4b1d4e8f9a0b1c2d";

    fn local_guard(max_hold: Duration) -> ConcurrencyGuard {
        ConcurrencyGuard::local(max_hold, Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn same_key_critical_sections_never_overlap() {
        let guard = local_guard(Duration::from_secs(5));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let tasks = (0..8)
            .map(|_| {
                let guard = guard.clone();
                let in_flight = in_flight.clone();
                let max_seen = max_seen.clone();
                tokio::spawn(async move {
                    guard
                        .with_lock(KEY, Duration::from_secs(5), || async {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                        })
                        .await
                        .expect("lock");
                })
            })
            .collect::<Vec<_>>();

        for task in tasks {
            task.await.expect("join");
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(guard.held_slots(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let guard = local_guard(Duration::from_secs(5));
        let _held = guard
            .acquire(KEY, Duration::from_millis(10))
            .await
            .expect("first key");

        let other = guard
            .acquire("refund_0f8fad5bd9cb469fa16570867728950e", Duration::ZERO)
            .await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn waiting_is_bounded() {
        let guard = local_guard(Duration::from_secs(5));
        let _held = guard
            .acquire(KEY, Duration::from_millis(10))
            .await
            .expect("first acquire");

        let started = Instant::now();
        let contended = guard.acquire(KEY, Duration::from_millis(50)).await;
        assert!(matches!(contended, Err(GuardError::TimedOut { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn release_wakes_waiter() {
        let guard = local_guard(Duration::from_secs(5));
        let held = guard
            .acquire(KEY, Duration::from_millis(10))
            .await
            .expect("first acquire");

        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.acquire(KEY, Duration::from_secs(2)).await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert!(waiter.await.expect("join"));
    }

    #[tokio::test]
    async fn watchdog_releases_expired_holder_without_letting_it_release_the_successor() {
        let guard = local_guard(Duration::from_millis(50));
        let stuck = guard
            .acquire(KEY, Duration::from_millis(10))
            .await
            .expect("stuck holder");

        let successor = guard
            .acquire(KEY, Duration::from_secs(1))
            .await
            .expect("watchdog takeover");
        assert_eq!(successor.key(), KEY);

        drop(stuck);
        let third = guard.acquire(KEY, Duration::ZERO).await;
        assert!(matches!(third, Err(GuardError::TimedOut { .. })));
    }

    #[tokio::test]
    async fn leases_exclude_guards_sharing_a_medium() {
        let medium: Arc<dyn LeaseStore> = Arc::new(MemoryIdempotencyStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let first = ConcurrencyGuard::new(4, Duration::from_secs(5), Some(medium.clone()), clock.clone());
        let second = ConcurrencyGuard::new(4, Duration::from_secs(5), Some(medium), clock);

        let held = first
            .acquire(KEY, Duration::from_millis(10))
            .await
            .expect("first process");
        let contended = second.acquire(KEY, Duration::from_millis(80)).await;
        assert!(matches!(contended, Err(GuardError::TimedOut { .. })));

        drop(held);
        assert!(second.acquire(KEY, Duration::from_millis(500)).await.is_ok());
    }

    #[tokio::test]
    async fn lease_of_crashed_holder_lapses() {
        let medium = Arc::new(MemoryIdempotencyStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        assert!(medium
            .try_acquire_lease(KEY, "crashed-process", clock.now_epoch_ms(), 100)
            .expect("ghost lease"));

        let medium: Arc<dyn LeaseStore> = medium;
        let guard = ConcurrencyGuard::new(4, Duration::from_secs(5), Some(medium), clock);
        let started = Instant::now();
        guard
            .acquire(KEY, Duration::from_secs(2))
            .await
            .expect("lease lapses");
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
