use anyhow::{Context, Result};
use gate_core::model::{IdempotencyRecord, RecordStatus, TransitionError};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

const RECORDS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("idempotency_records");
const LEASES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("key_leases");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    pub key: String,
    pub operation_type: String,
    pub owner_id: Option<String>,
    pub fingerprint: String,
    pub ttl_seconds: i64,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed { attempt: u32 },
    ExistingPending { attempt: u32 },
    ExistingCompleted { response_snapshot: String },
    FingerprintMismatch { stored_fingerprint: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub deleted: usize,
    pub abandoned: usize,
    pub expired_leases: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub by_operation: BTreeMap<String, StatusCounts>,
    /// Past `expires_at` but not yet removed by a sweep.
    pub expired: usize,
}

impl StoreStats {
    pub fn total(&self) -> usize {
        self.by_operation
            .values()
            .map(|counts| counts.pending + counts.completed + counts.failed)
            .sum()
    }

    pub(crate) fn observe(&mut self, record: &IdempotencyRecord, now_epoch: i64) {
        let counts = self
            .by_operation
            .entry(record.operation_type.clone())
            .or_default();
        match record.status {
            RecordStatus::Pending => counts.pending += 1,
            RecordStatus::Completed => counts.completed += 1,
            RecordStatus::Failed => counts.failed += 1,
        }
        if record.is_expired(now_epoch) {
            self.expired += 1;
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("idempotency record {key} not found")]
    NotFound { key: String },
    #[error("idempotency record {key} rejected transition: {source}")]
    Transition {
        key: String,
        #[source]
        source: TransitionError,
    },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Durable key → record storage. `claim` must be a single atomic
/// conditional write in every implementation.
pub trait IdempotencyStore: Send + Sync {
    fn claim(&self, request: &ClaimRequest, now_epoch: i64) -> Result<ClaimOutcome, StoreError>;

    fn complete(
        &self,
        key: &str,
        attempt: u32,
        response_snapshot: &str,
        now_epoch: i64,
    ) -> Result<(), StoreError>;

    fn fail(&self, key: &str, attempt: u32, now_epoch: i64) -> Result<(), StoreError>;

    fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError>;

    fn sweep(&self, now_epoch: i64, abandon_after_seconds: i64)
    -> Result<SweepReport, StoreError>;

    fn stats(&self, now_epoch: i64) -> Result<StoreStats, StoreError>;
}

/// Time-bounded exclusive lease on a key, kept on the same medium as the
/// records so that separate processes sharing the medium exclude each other.
pub trait LeaseStore: Send + Sync {
    fn try_acquire_lease(
        &self,
        key: &str,
        holder: &str,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<bool, StoreError>;

    fn release_lease(&self, key: &str, holder: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LeaseRecord {
    pub holder: String,
    pub lease_until_ms: i64,
}

impl LeaseRecord {
    pub(crate) fn blocks(&self, holder: &str, now_ms: i64) -> bool {
        self.holder != holder && self.lease_until_ms > now_ms
    }
}

/// Decides a claim against the current row. Returns the outcome and the
/// record to write, if any. Callers run this inside their atomic section.
pub(crate) fn resolve_claim(
    existing: Option<&IdempotencyRecord>,
    request: &ClaimRequest,
    now_epoch: i64,
) -> (ClaimOutcome, Option<IdempotencyRecord>) {
    let next_attempt = match existing {
        None => 1,
        Some(record) if record.request_fingerprint != request.fingerprint => {
            return (
                ClaimOutcome::FingerprintMismatch {
                    stored_fingerprint: record.request_fingerprint.clone(),
                },
                None,
            );
        }
        Some(record) => match record.status {
            RecordStatus::Pending => {
                return (
                    ClaimOutcome::ExistingPending {
                        attempt: record.attempt,
                    },
                    None,
                );
            }
            RecordStatus::Completed => {
                return (
                    ClaimOutcome::ExistingCompleted {
                        response_snapshot: record.response_snapshot.clone().unwrap_or_default(),
                    },
                    None,
                );
            }
            RecordStatus::Failed => record.attempt.saturating_add(1),
        },
    };

    let record = IdempotencyRecord::pending(
        request.key.clone(),
        request.operation_type.clone(),
        request.owner_id.clone(),
        request.fingerprint.clone(),
        next_attempt,
        request.ttl_seconds,
        request.metadata.clone(),
        now_epoch,
    );
    (
        ClaimOutcome::Claimed {
            attempt: next_attempt,
        },
        Some(record),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SweepAction {
    Delete,
    Abandon,
}

pub(crate) fn sweep_action(
    record: &IdempotencyRecord,
    now_epoch: i64,
    abandon_after_seconds: i64,
) -> Option<SweepAction> {
    if record.status.is_terminal() {
        return record.is_expired(now_epoch).then_some(SweepAction::Delete);
    }
    record
        .is_abandoned(now_epoch, abandon_after_seconds)
        .then_some(SweepAction::Abandon)
}

#[derive(Debug, Clone)]
pub struct RedbIdempotencyStore {
    db: Arc<Database>,
}

impl RedbIdempotencyStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create db directory at {}", parent.display()))?;
        }

        let db =
            Database::create(path).with_context(|| format!("open redb at {}", path.display()))?;
        let write_tx = db
            .begin_write()
            .context("begin write transaction for table init")?;
        {
            write_tx
                .open_table(RECORDS_TABLE)
                .context("open records table")?;
            write_tx
                .open_table(LEASES_TABLE)
                .context("open leases table")?;
        }
        write_tx.commit().context("commit table init transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn transition<F>(&self, key: &str, operation: &str, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut IdempotencyRecord) -> Result<(), TransitionError>,
    {
        let write_tx = self
            .db
            .begin_write()
            .with_context(|| format!("begin write transaction for {operation}"))?;
        {
            let mut records = write_tx
                .open_table(RECORDS_TABLE)
                .context("open records table")?;
            let Some(mut record) = read_record(&records, key)? else {
                return Err(StoreError::NotFound {
                    key: key.to_string(),
                });
            };

            apply(&mut record).map_err(|source| StoreError::Transition {
                key: key.to_string(),
                source,
            })?;

            let serialized = serialize_json(&record)?;
            records
                .insert(key, serialized.as_str())
                .with_context(|| format!("write record for {operation}"))?;
        }
        write_tx
            .commit()
            .with_context(|| format!("commit {operation} transaction"))?;
        Ok(())
    }
}

impl IdempotencyStore for RedbIdempotencyStore {
    fn claim(&self, request: &ClaimRequest, now_epoch: i64) -> Result<ClaimOutcome, StoreError> {
        let write_tx = self
            .db
            .begin_write()
            .context("begin write transaction for claim")?;

        let outcome = {
            let mut records = write_tx
                .open_table(RECORDS_TABLE)
                .context("open records table")?;
            let existing = read_record(&records, &request.key)?;
            let (outcome, write) = resolve_claim(existing.as_ref(), request, now_epoch);

            let Some(record) = write else {
                return Ok(outcome);
            };

            let serialized = serialize_json(&record).context("serialize claimed record")?;
            records
                .insert(request.key.as_str(), serialized.as_str())
                .context("insert claimed record")?;
            outcome
        };

        write_tx.commit().context("commit claim transaction")?;
        Ok(outcome)
    }

    fn complete(
        &self,
        key: &str,
        attempt: u32,
        response_snapshot: &str,
        now_epoch: i64,
    ) -> Result<(), StoreError> {
        self.transition(key, "complete", |record| {
            record.complete(attempt, response_snapshot.to_string(), now_epoch)
        })
    }

    fn fail(&self, key: &str, attempt: u32, now_epoch: i64) -> Result<(), StoreError> {
        self.transition(key, "fail", |record| record.fail(attempt, now_epoch))
    }

    fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let read_tx = self
            .db
            .begin_read()
            .context("begin read transaction for get")?;
        let records = read_tx
            .open_table(RECORDS_TABLE)
            .context("open records table")?;
        Ok(read_record(&records, key)?)
    }

    fn sweep(
        &self,
        now_epoch: i64,
        abandon_after_seconds: i64,
    ) -> Result<SweepReport, StoreError> {
        let write_tx = self
            .db
            .begin_write()
            .context("begin write transaction for sweep")?;
        let mut report = SweepReport::default();

        {
            let mut records = write_tx
                .open_table(RECORDS_TABLE)
                .context("open records table")?;

            let mut expired_keys = Vec::new();
            let mut abandoned = Vec::new();
            for entry in records.iter().context("iterate records")? {
                let (key_guard, payload_guard) = entry.context("read record row")?;
                let key = key_guard.value();
                let record: IdempotencyRecord = deserialize_json(payload_guard.value())
                    .with_context(|| format!("deserialize record {key}"))?;

                match sweep_action(&record, now_epoch, abandon_after_seconds) {
                    Some(SweepAction::Delete) => expired_keys.push(key.to_string()),
                    Some(SweepAction::Abandon) => abandoned.push(record),
                    None => {}
                }
            }

            for key in &expired_keys {
                records
                    .remove(key.as_str())
                    .context("remove expired record")?;
            }
            report.deleted = expired_keys.len();

            for mut record in abandoned {
                let attempt = record.attempt;
                record
                    .fail(attempt, now_epoch)
                    .map_err(|source| StoreError::Transition {
                        key: record.key.clone(),
                        source,
                    })?;
                let serialized = serialize_json(&record)?;
                records
                    .insert(record.key.as_str(), serialized.as_str())
                    .context("mark abandoned record failed")?;
                report.abandoned += 1;
            }
        }

        {
            let mut leases = write_tx
                .open_table(LEASES_TABLE)
                .context("open leases table")?;
            let now_ms = now_epoch.saturating_mul(1000);

            let mut stale = Vec::new();
            for entry in leases.iter().context("iterate leases")? {
                let (key_guard, payload_guard) = entry.context("read lease row")?;
                let lease: LeaseRecord = deserialize_json(payload_guard.value())?;
                if lease.lease_until_ms <= now_ms {
                    stale.push(key_guard.value().to_string());
                }
            }
            for key in &stale {
                leases.remove(key.as_str()).context("remove stale lease")?;
            }
            report.expired_leases = stale.len();
        }

        write_tx.commit().context("commit sweep transaction")?;
        Ok(report)
    }

    fn stats(&self, now_epoch: i64) -> Result<StoreStats, StoreError> {
        let read_tx = self
            .db
            .begin_read()
            .context("begin read transaction for stats")?;
        let records = read_tx
            .open_table(RECORDS_TABLE)
            .context("open records table")?;

        let mut stats = StoreStats::default();
        for entry in records.iter().context("iterate records for stats")? {
            let (_key_guard, payload_guard) = entry.context("read record row")?;
            let record: IdempotencyRecord =
                deserialize_json(payload_guard.value()).context("deserialize record row")?;
            stats.observe(&record, now_epoch);
        }
        Ok(stats)
    }
}

impl LeaseStore for RedbIdempotencyStore {
    fn try_acquire_lease(
        &self,
        key: &str,
        holder: &str,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<bool, StoreError> {
        let write_tx = self
            .db
            .begin_write()
            .context("begin write transaction for lease acquire")?;
        {
            let mut leases = write_tx
                .open_table(LEASES_TABLE)
                .context("open leases table")?;
            if let Some(lease) = read_lease(&leases, key)?
                && lease.blocks(holder, now_ms)
            {
                return Ok(false);
            }

            let lease = LeaseRecord {
                holder: holder.to_string(),
                lease_until_ms: now_ms.saturating_add(lease_ms),
            };
            let serialized = serialize_json(&lease)?;
            leases
                .insert(key, serialized.as_str())
                .context("insert lease")?;
        }
        write_tx.commit().context("commit lease acquire")?;
        Ok(true)
    }

    fn release_lease(&self, key: &str, holder: &str) -> Result<(), StoreError> {
        let write_tx = self
            .db
            .begin_write()
            .context("begin write transaction for lease release")?;
        {
            let mut leases = write_tx
                .open_table(LEASES_TABLE)
                .context("open leases table")?;
            match read_lease(&leases, key)? {
                Some(lease) if lease.holder == holder => {
                    leases.remove(key).context("remove lease")?;
                }
                _ => return Ok(()),
            }
        }
        write_tx.commit().context("commit lease release")?;
        Ok(())
    }
}

fn read_record(
    table: &impl ReadableTable<&'static str, &'static str>,
    key: &str,
) -> Result<Option<IdempotencyRecord>> {
    let raw = table
        .get(key)
        .context("read idempotency record")?
        .map(|entry| entry.value().to_string());
    raw.map(|raw| deserialize_json(&raw).with_context(|| format!("deserialize record {key}")))
        .transpose()
}

fn read_lease(
    table: &impl ReadableTable<&'static str, &'static str>,
    key: &str,
) -> Result<Option<LeaseRecord>> {
    let raw = table
        .get(key)
        .context("read lease")?
        .map(|entry| entry.value().to_string());
    raw.map(|raw| deserialize_json(&raw).context("deserialize lease"))
        .transpose()
}

fn serialize_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("serialize JSON")
}

fn deserialize_json<T: for<'de> serde::Deserialize<'de>>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).context("deserialize JSON")
}
