use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Completed,
    Failed,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Completed => "completed",
            RecordStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RecordStatus::Pending)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(RecordStatus::Pending),
            "completed" => Ok(RecordStatus::Completed),
            "failed" => Ok(RecordStatus::Failed),
            _ => Err("unsupported record status"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("record is already {from}; cannot move to {to}")]
    AlreadyTerminal {
        from: RecordStatus,
        to: RecordStatus,
    },
    #[error("attempt {presented} no longer owns the record (current attempt {current})")]
    StaleAttempt { presented: u32, current: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub operation_type: String,
    pub owner_id: Option<String>,
    pub request_fingerprint: String,
    pub status: RecordStatus,
    pub response_snapshot: Option<String>,
    pub attempt: u32,
    pub created_at_epoch: i64,
    pub updated_at_epoch: i64,
    pub expires_at_epoch: i64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl IdempotencyRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn pending(
        key: String,
        operation_type: String,
        owner_id: Option<String>,
        request_fingerprint: String,
        attempt: u32,
        ttl_seconds: i64,
        metadata: BTreeMap<String, String>,
        now_epoch: i64,
    ) -> Self {
        Self {
            key,
            operation_type,
            owner_id,
            request_fingerprint,
            status: RecordStatus::Pending,
            response_snapshot: None,
            attempt,
            created_at_epoch: now_epoch,
            updated_at_epoch: now_epoch,
            expires_at_epoch: now_epoch.saturating_add(ttl_seconds),
            metadata,
        }
    }

    pub fn is_expired(&self, now_epoch: i64) -> bool {
        self.expires_at_epoch < now_epoch
    }

    pub fn is_abandoned(&self, now_epoch: i64, abandon_after_seconds: i64) -> bool {
        self.status == RecordStatus::Pending
            && self.created_at_epoch.saturating_add(abandon_after_seconds) < now_epoch
    }

    pub fn complete(
        &mut self,
        attempt: u32,
        response_snapshot: String,
        now_epoch: i64,
    ) -> Result<(), TransitionError> {
        self.ensure_pending(attempt, RecordStatus::Completed)?;
        self.status = RecordStatus::Completed;
        self.response_snapshot = Some(response_snapshot);
        self.updated_at_epoch = now_epoch;
        Ok(())
    }

    pub fn fail(&mut self, attempt: u32, now_epoch: i64) -> Result<(), TransitionError> {
        self.ensure_pending(attempt, RecordStatus::Failed)?;
        self.status = RecordStatus::Failed;
        self.response_snapshot = None;
        self.updated_at_epoch = now_epoch;
        Ok(())
    }

    fn ensure_pending(&self, attempt: u32, to: RecordStatus) -> Result<(), TransitionError> {
        if self.attempt != attempt {
            return Err(TransitionError::StaleAttempt {
                presented: attempt,
                current: self.attempt,
            });
        }
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal {
                from: self.status,
                to,
            });
        }
        Ok(())
    }
}
