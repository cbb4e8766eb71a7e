use crate::clock::Clock;
use crate::config::TtlPolicy;
use crate::error::IdempotencyError;
use crate::guard::{ConcurrencyGuard, GuardError, KeyLock};
use crate::metrics::Metrics;
use crate::producer::retry_backoff_ms;
use crate::store::{ClaimOutcome, ClaimRequest, IdempotencyStore, StoreError};
use anyhow::{Context, anyhow};
use futures_util::FutureExt;
use gate_core::{fingerprint, key};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::future::{Future, ready};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

const WAIT_POLL_BASE_MS: u64 = 10;
const WAIT_POLL_MAX_MS: u64 = 250;

/// One idempotent call: the key, the operation it guards and the request
/// tuple the fingerprint is taken over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    pub key: String,
    pub operation_type: String,
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
    pub owner_id: Option<String>,
    pub ttl_seconds: Option<i64>,
    pub metadata: BTreeMap<String, String>,
}

impl OperationRequest {
    pub fn new(
        key: impl Into<String>,
        operation_type: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            key: key.into(),
            operation_type: operation_type.into(),
            method: method.into(),
            path: path.into(),
            body: body.into(),
            owner_id: None,
            ttl_seconds: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// Overrides the configured TTL for this operation type. Values below
    /// one second are ignored.
    pub fn with_ttl_seconds(mut self, ttl_seconds: i64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn with_metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution<T> {
    pub value: T,
    /// True when `value` came from the stored snapshot of an earlier call.
    pub replayed: bool,
}

struct ExecutorInner {
    store: Arc<dyn IdempotencyStore>,
    guard: ConcurrencyGuard,
    ttl: TtlPolicy,
    wait_timeout: Duration,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

/// Wraps a business operation with claim, execute-or-wait and record.
#[derive(Clone)]
pub struct OperationExecutor {
    inner: Arc<ExecutorInner>,
}

impl OperationExecutor {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        guard: ConcurrencyGuard,
        ttl: TtlPolicy,
        wait_timeout: Duration,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                store,
                guard,
                ttl,
                wait_timeout,
                clock,
                metrics,
            }),
        }
    }

    /// Runs `operation` at most once per key.
    ///
    /// The operation is spawned onto the runtime, so dropping the returned
    /// future abandons only the wait; the execution still completes and is
    /// recorded.
    pub async fn run<T, F, Fut>(
        &self,
        request: OperationRequest,
        operation: F,
    ) -> Result<Execution<T>, IdempotencyError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let operation_type = request.operation_type.clone();
        let result = self.run_claimed(request, operation).await;

        let outcome = match &result {
            Ok(execution) if execution.replayed => "replayed",
            Ok(_) => "executed",
            Err(error) => error.kind(),
        };
        self.inner.metrics.inc_request(&operation_type, outcome);
        result
    }

    async fn run_claimed<T, F, Fut>(
        &self,
        request: OperationRequest,
        operation: F,
    ) -> Result<Execution<T>, IdempotencyError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let key = key::parse(&request.key)?;
        let fingerprint = fingerprint(&request.method, &request.path, &request.body);
        let ttl_seconds = match request.ttl_seconds {
            Some(ttl_seconds) if ttl_seconds > 0 => ttl_seconds,
            Some(ttl_seconds) => {
                warn!(
                    key = %key,
                    operation_type = %request.operation_type,
                    ttl_seconds,
                    "ignoring non-positive ttl override"
                );
                self.inner.ttl.ttl_for(&request.operation_type)
            }
            None => self.inner.ttl.ttl_for(&request.operation_type),
        };

        let claim = ClaimRequest {
            key: key.into_string(),
            operation_type: request.operation_type,
            owner_id: request.owner_id,
            fingerprint: fingerprint.into_string(),
            ttl_seconds,
            metadata: request.metadata,
        };
        let deadline = Instant::now() + self.inner.wait_timeout;

        match self.claim(&claim)? {
            ClaimOutcome::Claimed { attempt } => {
                let guard = self.inner.guard.clone();
                let key = claim.key.clone();
                let budget = remaining(deadline);
                let lock = async move { guard.acquire(&key, budget).await };
                self.execute(claim, attempt, lock, operation).await
            }
            ClaimOutcome::ExistingCompleted { response_snapshot } => {
                self.replay(&claim, &response_snapshot)
            }
            ClaimOutcome::FingerprintMismatch { stored_fingerprint } => {
                Err(self.mismatch(&claim, stored_fingerprint))
            }
            ClaimOutcome::ExistingPending { attempt } => {
                debug!(
                    key = %claim.key,
                    operation_type = %claim.operation_type,
                    attempt,
                    "original request in flight; waiting"
                );
                self.wait_for_original(claim, deadline, operation).await
            }
        }
    }

    async fn wait_for_original<T, F, Fut>(
        &self,
        claim: ClaimRequest,
        deadline: Instant,
        operation: F,
    ) -> Result<Execution<T>, IdempotencyError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let mut round = 0u32;
        loop {
            let budget = remaining(deadline);
            if budget.is_zero() {
                return Err(self.still_processing(&claim));
            }

            let lock = match self.inner.guard.acquire(&claim.key, budget).await {
                Ok(lock) => lock,
                Err(error) => return Err(self.guard_error(&claim, error)),
            };

            match self.claim(&claim)? {
                ClaimOutcome::Claimed { attempt } => {
                    info!(
                        key = %claim.key,
                        operation_type = %claim.operation_type,
                        attempt,
                        "previous attempt is gone; waiter takes over the key"
                    );
                    return self
                        .execute(claim, attempt, ready(Ok(lock)), operation)
                        .await;
                }
                ClaimOutcome::ExistingCompleted { response_snapshot } => {
                    drop(lock);
                    return self.replay(&claim, &response_snapshot);
                }
                ClaimOutcome::FingerprintMismatch { stored_fingerprint } => {
                    return Err(self.mismatch(&claim, stored_fingerprint));
                }
                ClaimOutcome::ExistingPending { .. } => {
                    // The claimant has not taken the lock yet, or it runs
                    // elsewhere without a shared lease.
                    drop(lock);
                    let backoff = retry_backoff_ms(WAIT_POLL_BASE_MS, WAIT_POLL_MAX_MS, round);
                    round = round.saturating_add(1);
                    sleep_until(deadline.min(Instant::now() + Duration::from_millis(backoff)))
                        .await;
                }
            }
        }
    }

    /// Spawns lock acquisition, the operation and its recording as one
    /// task. Once a claim is held, dropping the caller can no longer leave
    /// it pending.
    async fn execute<T, F, Fut, L>(
        &self,
        claim: ClaimRequest,
        attempt: u32,
        lock: L,
        operation: F,
    ) -> Result<Execution<T>, IdempotencyError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        L: Future<Output = Result<KeyLock, GuardError>> + Send + 'static,
    {
        let executor = self.clone();
        let key = claim.key.clone();

        let task = tokio::spawn(async move {
            let lock = match lock.await {
                Ok(lock) => lock,
                Err(error) => {
                    // Give the claim back so a retry is not blocked until abandonment.
                    executor.fail_quietly(&claim, attempt);
                    return Err(executor.guard_error(&claim, error));
                }
            };
            let outcome = AssertUnwindSafe(async move { operation().await })
                .catch_unwind()
                .await;
            let result = executor.record(&claim, attempt, outcome);
            // Released only once the outcome is durable.
            drop(lock);
            result
        });

        match task.await {
            Ok(result) => result,
            Err(join_error) => {
                error!(key = %key, attempt, error = %join_error, "execution task did not finish");
                Err(IdempotencyError::BusinessOperationFailed(anyhow!(
                    "execution task did not finish: {join_error}"
                )))
            }
        }
    }

    fn record<T>(
        &self,
        claim: &ClaimRequest,
        attempt: u32,
        outcome: std::thread::Result<anyhow::Result<T>>,
    ) -> Result<Execution<T>, IdempotencyError>
    where
        T: Serialize,
    {
        let value = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(error)) => {
                warn!(
                    key = %claim.key,
                    operation_type = %claim.operation_type,
                    attempt,
                    error = %error,
                    "business operation failed; key may be retried"
                );
                return Err(self.fail_execution(claim, attempt, error));
            }
            Err(_panic) => {
                error!(
                    key = %claim.key,
                    operation_type = %claim.operation_type,
                    attempt,
                    "business operation panicked; key may be retried"
                );
                return Err(self.fail_execution(
                    claim,
                    attempt,
                    anyhow!("business operation panicked"),
                ));
            }
        };

        let snapshot = match serde_json::to_string(&value).context("serialize response snapshot") {
            Ok(snapshot) => snapshot,
            Err(error) => {
                error!(
                    key = %claim.key,
                    operation_type = %claim.operation_type,
                    attempt,
                    error = %error,
                    "response could not be snapshotted"
                );
                return Err(self.fail_execution(claim, attempt, error));
            }
        };

        let now = self.inner.clock.now_epoch();
        match self.inner.store.complete(&claim.key, attempt, &snapshot, now) {
            Ok(()) => {
                self.inner
                    .metrics
                    .inc_execution(&claim.operation_type, "completed");
                info!(
                    key = %claim.key,
                    operation_type = %claim.operation_type,
                    attempt,
                    "operation completed"
                );
            }
            Err(error) => {
                // The side effect already happened; the caller still gets it.
                self.inner
                    .metrics
                    .inc_execution(&claim.operation_type, "unrecorded");
                error!(
                    key = %claim.key,
                    operation_type = %claim.operation_type,
                    attempt,
                    error = %error,
                    "completed operation could not be recorded"
                );
            }
        }

        Ok(Execution {
            value,
            replayed: false,
        })
    }

    fn fail_execution(
        &self,
        claim: &ClaimRequest,
        attempt: u32,
        error: anyhow::Error,
    ) -> IdempotencyError {
        self.inner
            .metrics
            .inc_execution(&claim.operation_type, "failed");
        self.fail_quietly(claim, attempt);
        IdempotencyError::BusinessOperationFailed(error)
    }

    fn fail_quietly(&self, claim: &ClaimRequest, attempt: u32) {
        let now = self.inner.clock.now_epoch();
        if let Err(error) = self.inner.store.fail(&claim.key, attempt, now) {
            error!(
                key = %claim.key,
                attempt,
                error = %error,
                "failed to mark attempt failed; record stays pending until abandoned"
            );
        }
    }

    fn claim(&self, claim: &ClaimRequest) -> Result<ClaimOutcome, IdempotencyError> {
        let now = self.inner.clock.now_epoch();
        self.inner.store.claim(claim, now).map_err(|error| {
            error!(
                key = %claim.key,
                operation_type = %claim.operation_type,
                error = %error,
                "idempotency store unavailable; refusing to execute"
            );
            IdempotencyError::StoreUnavailable(error)
        })
    }

    fn replay<T>(&self, claim: &ClaimRequest, snapshot: &str) -> Result<Execution<T>, IdempotencyError>
    where
        T: DeserializeOwned,
    {
        let value = serde_json::from_str(snapshot)
            .with_context(|| format!("decode stored response for {}", claim.key))
            .map_err(|error| IdempotencyError::StoreUnavailable(StoreError::Backend(error)))?;
        debug!(
            key = %claim.key,
            operation_type = %claim.operation_type,
            "replaying stored response"
        );
        Ok(Execution {
            value,
            replayed: true,
        })
    }

    fn mismatch(&self, claim: &ClaimRequest, stored_fingerprint: String) -> IdempotencyError {
        warn!(
            key = %claim.key,
            operation_type = %claim.operation_type,
            stored_fingerprint = %stored_fingerprint,
            presented_fingerprint = %claim.fingerprint,
            "idempotency key reused with a different payload"
        );
        IdempotencyError::KeyReusedWithDifferentPayload {
            stored: stored_fingerprint,
            presented: claim.fingerprint.clone(),
        }
    }

    fn still_processing(&self, claim: &ClaimRequest) -> IdempotencyError {
        debug!(key = %claim.key, "wait budget exhausted while original is in flight");
        IdempotencyError::StillProcessing {
            retry_after_seconds: self.inner.wait_timeout.as_secs().max(1),
        }
    }

    fn guard_error(&self, claim: &ClaimRequest, error: GuardError) -> IdempotencyError {
        match error {
            GuardError::TimedOut { .. } => self.still_processing(claim),
            GuardError::Lease(error) => {
                error!(key = %claim.key, error = %error, "key lease backend failed");
                IdempotencyError::StoreUnavailable(error)
            }
        }
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}
