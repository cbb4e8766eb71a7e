use crate::store::{
    ClaimOutcome, ClaimRequest, IdempotencyStore, LeaseRecord, LeaseStore, StoreError, StoreStats,
    SweepAction, SweepReport, resolve_claim, sweep_action,
};
use anyhow::anyhow;
use gate_core::model::{IdempotencyRecord, TransitionError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Process-local store. The whole claim runs under one mutex, which makes
/// it the conditional insert; suited to tests and single-instance setups.
#[derive(Debug, Clone, Default)]
pub struct MemoryIdempotencyStore {
    records: Arc<Mutex<HashMap<String, IdempotencyRecord>>>,
    leases: Arc<Mutex<HashMap<String, LeaseRecord>>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<MutexGuard<'_, HashMap<String, IdempotencyRecord>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Backend(anyhow!("memory record table lock poisoned")))
    }

    fn leases(&self) -> Result<MutexGuard<'_, HashMap<String, LeaseRecord>>, StoreError> {
        self.leases
            .lock()
            .map_err(|_| StoreError::Backend(anyhow!("memory lease table lock poisoned")))
    }

    fn transition<F>(&self, key: &str, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut IdempotencyRecord) -> Result<(), TransitionError>,
    {
        let mut guard = self.records()?;
        let record = guard.get_mut(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;

        // Apply to a copy so a rejected transition leaves the row untouched.
        let mut updated = record.clone();
        apply(&mut updated).map_err(|source| StoreError::Transition {
            key: key.to_string(),
            source,
        })?;
        *record = updated;
        Ok(())
    }
}

impl IdempotencyStore for MemoryIdempotencyStore {
    fn claim(&self, request: &ClaimRequest, now_epoch: i64) -> Result<ClaimOutcome, StoreError> {
        let mut guard = self.records()?;
        let (outcome, write) = resolve_claim(guard.get(&request.key), request, now_epoch);
        if let Some(record) = write {
            guard.insert(request.key.clone(), record);
        }
        Ok(outcome)
    }

    fn complete(
        &self,
        key: &str,
        attempt: u32,
        response_snapshot: &str,
        now_epoch: i64,
    ) -> Result<(), StoreError> {
        self.transition(key, |record| {
            record.complete(attempt, response_snapshot.to_string(), now_epoch)
        })
    }

    fn fail(&self, key: &str, attempt: u32, now_epoch: i64) -> Result<(), StoreError> {
        self.transition(key, |record| record.fail(attempt, now_epoch))
    }

    fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self.records()?.get(key).cloned())
    }

    fn sweep(
        &self,
        now_epoch: i64,
        abandon_after_seconds: i64,
    ) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();

        {
            let mut guard = self.records()?;
            guard.retain(
                |_, record| match sweep_action(record, now_epoch, abandon_after_seconds) {
                    Some(SweepAction::Delete) => {
                        report.deleted += 1;
                        false
                    }
                    Some(SweepAction::Abandon) => {
                        let attempt = record.attempt;
                        if record.fail(attempt, now_epoch).is_ok() {
                            report.abandoned += 1;
                        }
                        true
                    }
                    None => true,
                },
            );
        }

        let now_ms = now_epoch.saturating_mul(1000);
        let mut leases = self.leases()?;
        let before = leases.len();
        leases.retain(|_, lease| lease.lease_until_ms > now_ms);
        report.expired_leases = before - leases.len();

        Ok(report)
    }

    fn stats(&self, now_epoch: i64) -> Result<StoreStats, StoreError> {
        let guard = self.records()?;
        let mut stats = StoreStats::default();
        for record in guard.values() {
            stats.observe(record, now_epoch);
        }
        Ok(stats)
    }
}

impl LeaseStore for MemoryIdempotencyStore {
    fn try_acquire_lease(
        &self,
        key: &str,
        holder: &str,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<bool, StoreError> {
        let mut leases = self.leases()?;
        if let Some(lease) = leases.get(key)
            && lease.blocks(holder, now_ms)
        {
            return Ok(false);
        }
        leases.insert(
            key.to_string(),
            LeaseRecord {
                holder: holder.to_string(),
                lease_until_ms: now_ms.saturating_add(lease_ms),
            },
        );
        Ok(true)
    }

    fn release_lease(&self, key: &str, holder: &str) -> Result<(), StoreError> {
        let mut leases = self.leases()?;
        if leases.get(key).is_some_and(|lease| lease.holder == holder) {
            leases.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance::*;

    #[test]
    fn claim_is_exclusive_and_replays_completed_snapshot() {
        claim_is_exclusive_and_replays(&MemoryIdempotencyStore::new());
    }

    #[test]
    fn reports_fingerprint_mismatch_even_after_failure() {
        mismatched_fingerprint_is_reported(&MemoryIdempotencyStore::new());
    }

    #[test]
    fn failed_record_can_be_reclaimed_with_same_fingerprint() {
        failed_record_is_reclaimable(&MemoryIdempotencyStore::new());
    }

    #[test]
    fn double_completion_and_missing_keys_are_errors() {
        transitions_fail_loudly(&MemoryIdempotencyStore::new());
    }

    #[test]
    fn sweep_deletes_expired_terminal_and_fails_abandoned_pending() {
        sweep_deletes_expired_and_reclaims_abandoned(&MemoryIdempotencyStore::new());
    }

    #[test]
    fn stats_group_records_by_operation_type() {
        stats_count_by_operation(&MemoryIdempotencyStore::new());
    }

    #[test]
    fn leases_are_exclusive_until_released_or_lapsed() {
        leases_exclude_other_holders(&MemoryIdempotencyStore::new());
    }
}
