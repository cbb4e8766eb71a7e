use anyhow::anyhow;
use futures_util::future::BoxFuture;
use idempotency_gate::clock::{Clock, ManualClock};
use idempotency_gate::config::TtlPolicy;
use idempotency_gate::guard::ConcurrencyGuard;
use idempotency_gate::memory::MemoryIdempotencyStore;
use idempotency_gate::metrics::Metrics;
use idempotency_gate::store::{IdempotencyStore, LeaseStore, RedbIdempotencyStore};
use idempotency_gate::sweeper::CleanupSweeper;
use idempotency_gate::{IdempotencyError, OperationExecutor, OperationRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

const NOW: i64 = 1_700_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Booking {
    charge_id: String,
    booking_id: u64,
}

/// Fake payment processor counting how many charges it made.
#[derive(Clone, Default)]
struct Processor {
    charges: Arc<AtomicUsize>,
}

impl Processor {
    fn charge(
        &self,
        booking_id: u64,
        latency: Duration,
    ) -> impl FnOnce() -> BoxFuture<'static, anyhow::Result<Booking>> + Send + 'static {
        let charges = self.charges.clone();
        move || {
            Box::pin(async move {
                tokio::time::sleep(latency).await;
                let n = charges.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Booking {
                    charge_id: format!("ch_{n}"),
                    booking_id,
                })
            })
        }
    }

    fn count(&self) -> usize {
        self.charges.load(Ordering::SeqCst)
    }
}

fn executor(
    store: Arc<dyn IdempotencyStore>,
    leases: Option<Arc<dyn LeaseStore>>,
    clock: Arc<dyn Clock>,
) -> OperationExecutor {
    OperationExecutor::new(
        store,
        ConcurrencyGuard::new(16, Duration::from_secs(30), leases, clock.clone()),
        TtlPolicy::new(86_400),
        Duration::from_secs(5),
        clock,
        Metrics::new().expect("metrics"),
    )
}

fn booking(key: &str, booking_id: u64) -> OperationRequest {
    OperationRequest::new(
        key,
        "payment_intent",
        "POST",
        "/bookings",
        format!(r#"{{"booking_id":{booking_id},"amount":12000}}"#),
    )
}

#[tokio::test]
async fn double_submit_charges_once_and_both_callers_see_the_same_charge() {
    let clock = Arc::new(ManualClock::at_epoch(NOW));
    let executor = executor(Arc::new(MemoryIdempotencyStore::new()), None, clock);
    let processor = Processor::default();
    let key = "booking_5d0c2a7e9b3f4c1d8e6a";

    let first = executor.run(
        booking(key, 42),
        processor.charge(42, Duration::from_millis(200)),
    );
    let second = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        executor
            .run(booking(key, 42), processor.charge(42, Duration::ZERO))
            .await
    };
    let (first, second) = tokio::join!(first, second);

    let first = first.expect("first submit");
    let second = second.expect("second submit");
    assert_eq!(processor.count(), 1);
    assert_eq!(first.value.charge_id, second.value.charge_id);
    assert!(!first.replayed);
    assert!(second.replayed);
}

#[tokio::test]
async fn reusing_a_key_for_another_booking_is_rejected_without_charging() {
    let clock = Arc::new(ManualClock::at_epoch(NOW));
    let executor = executor(Arc::new(MemoryIdempotencyStore::new()), None, clock);
    let processor = Processor::default();
    let key = "booking_8f14e45fceea167a5a36";

    executor
        .run(booking(key, 42), processor.charge(42, Duration::ZERO))
        .await
        .expect("original booking");

    let reused = executor
        .run(booking(key, 999), processor.charge(999, Duration::ZERO))
        .await;
    assert!(matches!(
        reused,
        Err(IdempotencyError::KeyReusedWithDifferentPayload { .. })
    ));
    assert_eq!(processor.count(), 1);
}

#[tokio::test]
async fn expired_key_is_reopened_by_the_sweeper() {
    let tmp = TempDir::new().expect("tempdir");
    let store = Arc::new(RedbIdempotencyStore::open(&tmp.path().join("gate.redb")).expect("store"));
    let clock = Arc::new(ManualClock::at_epoch(NOW));
    let executor = executor(store.clone(), None, clock.clone());
    let sweeper = CleanupSweeper::new(
        store.clone(),
        clock.clone(),
        900,
        Duration::from_secs(60),
        Metrics::new().expect("metrics"),
    );
    let processor = Processor::default();
    let key = "booking_c9f0f895fb98ab9159f5";

    let first = executor
        .run(
            booking(key, 42).with_ttl_seconds(1),
            processor.charge(42, Duration::ZERO),
        )
        .await
        .expect("first charge");

    clock.advance_seconds(2);
    let summary = sweeper.run_once().expect("sweep");
    assert_eq!(summary.report.deleted, 1);

    let second = executor
        .run(
            booking(key, 42).with_ttl_seconds(1),
            processor.charge(42, Duration::ZERO),
        )
        .await
        .expect("second charge");
    assert!(!second.replayed);
    assert_ne!(first.value.charge_id, second.value.charge_id);
    assert_eq!(processor.count(), 2);
}

#[tokio::test]
async fn many_concurrent_callers_execute_once() {
    let clock = Arc::new(ManualClock::at_epoch(NOW));
    let executor = executor(Arc::new(MemoryIdempotencyStore::new()), None, clock);
    let processor = Processor::default();
    let key = "booking_45c48cce2e2d7fbdea1a";

    let calls = (0..25)
        .map(|_| {
            let executor = executor.clone();
            let charge = processor.charge(42, Duration::from_millis(30));
            tokio::spawn(async move { executor.run(booking(key, 42), charge).await })
        })
        .collect::<Vec<_>>();

    let mut charge_ids = Vec::new();
    for call in calls {
        let execution = call.await.expect("join").expect("call");
        charge_ids.push(execution.value.charge_id);
    }

    assert_eq!(processor.count(), 1);
    charge_ids.dedup();
    assert_eq!(charge_ids, vec!["ch_1".to_string()]);
}

#[tokio::test]
async fn executors_sharing_a_store_and_leases_execute_once() {
    let tmp = TempDir::new().expect("tempdir");
    let store = Arc::new(RedbIdempotencyStore::open(&tmp.path().join("gate.redb")).expect("store"));
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_epoch(NOW));
    let leases: Arc<dyn LeaseStore> = store.clone();

    // Two gate instances with separate in-process lock tables.
    let instances = [
        executor(store.clone(), Some(leases.clone()), clock.clone()),
        executor(store.clone(), Some(leases), clock),
    ];
    let processor = Processor::default();
    let key = "booking_d3d9446802a44259755d";

    let calls = (0..8)
        .map(|i| {
            let executor = instances[i % 2].clone();
            let charge = processor.charge(42, Duration::from_millis(40));
            tokio::spawn(async move { executor.run(booking(key, 42), charge).await })
        })
        .collect::<Vec<_>>();

    let mut replayed = 0;
    for call in calls {
        if call.await.expect("join").expect("call").replayed {
            replayed += 1;
        }
    }
    assert_eq!(processor.count(), 1);
    assert_eq!(replayed, 7);
}

#[tokio::test]
async fn failed_charge_is_retryable_and_crashed_claim_is_recovered() {
    let clock = Arc::new(ManualClock::at_epoch(NOW));
    let store = Arc::new(MemoryIdempotencyStore::new());
    let executor = executor(store.clone(), None, clock.clone());
    let processor = Processor::default();

    let declined = executor
        .run(booking("booking_6512bd43d9caa6e02c99", 42), || async {
            Err::<Booking, _>(anyhow!("processor declined: try again"))
        })
        .await;
    assert!(matches!(
        declined,
        Err(IdempotencyError::BusinessOperationFailed(_))
    ));
    let retried = executor
        .run(
            booking("booking_6512bd43d9caa6e02c99", 42),
            processor.charge(42, Duration::ZERO),
        )
        .await
        .expect("retry");
    assert!(!retried.replayed);

    // A claim whose worker died: the caller gets StillProcessing until the
    // sweeper declares it abandoned.
    let crashed = OperationExecutor::new(
        store.clone(),
        ConcurrencyGuard::local(Duration::from_secs(30), clock.clone()),
        TtlPolicy::new(86_400),
        Duration::from_millis(50),
        clock.clone(),
        Metrics::new().expect("metrics"),
    );
    let key = "booking_c20ad4d76fe97759aa27";
    let stuck = tokio::time::timeout(
        Duration::from_millis(20),
        crashed.run(booking(key, 7), processor.charge(7, Duration::from_secs(3_600))),
    )
    .await;
    assert!(stuck.is_err());

    let waiting = crashed
        .run(booking(key, 7), processor.charge(7, Duration::ZERO))
        .await;
    assert!(matches!(
        waiting,
        Err(IdempotencyError::StillProcessing { .. })
    ));

    clock.advance_seconds(901);
    let report = store.sweep(clock.now_epoch(), 900).expect("sweep");
    assert_eq!(report.abandoned, 1);

    let recovered = executor
        .run(booking(key, 7), processor.charge(7, Duration::ZERO))
        .await
        .expect("recovered");
    assert!(!recovered.replayed);
}
