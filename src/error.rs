use crate::store::StoreError;
use gate_core::key::InvalidKeyFormat;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("invalid idempotency key: {0}")]
    InvalidKeyFormat(#[from] InvalidKeyFormat),
    #[error("missing required idempotency key header {header}")]
    MissingIdempotencyKey { header: String },
    #[error("idempotency key was reused with a different request payload")]
    KeyReusedWithDifferentPayload {
        stored: String,
        presented: String,
    },
    #[error("a request with this idempotency key is still processing")]
    StillProcessing { retry_after_seconds: u64 },
    #[error("business operation failed")]
    BusinessOperationFailed(#[source] anyhow::Error),
    #[error("idempotency store unavailable")]
    StoreUnavailable(#[source] StoreError),
}

impl IdempotencyError {
    /// Whether retrying the same request with the same key can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IdempotencyError::StillProcessing { .. }
                | IdempotencyError::BusinessOperationFailed(_)
                | IdempotencyError::StoreUnavailable(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IdempotencyError::InvalidKeyFormat(_) => "invalid_key_format",
            IdempotencyError::MissingIdempotencyKey { .. } => "missing_idempotency_key",
            IdempotencyError::KeyReusedWithDifferentPayload { .. } => {
                "key_reused_with_different_payload"
            }
            IdempotencyError::StillProcessing { .. } => "still_processing",
            IdempotencyError::BusinessOperationFailed(_) => "business_operation_failed",
            IdempotencyError::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

impl From<StoreError> for IdempotencyError {
    fn from(error: StoreError) -> Self {
        IdempotencyError::StoreUnavailable(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(IdempotencyError::StillProcessing {
            retry_after_seconds: 1
        }
        .is_retryable());
        assert!(IdempotencyError::BusinessOperationFailed(anyhow!("gateway timeout")).is_retryable());
        assert!(IdempotencyError::StoreUnavailable(StoreError::Backend(anyhow!("disk"))).is_retryable());

        assert!(!IdempotencyError::InvalidKeyFormat(InvalidKeyFormat::Empty).is_retryable());
        assert!(!IdempotencyError::MissingIdempotencyKey {
            header: "Idempotency-Key".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn messages_do_not_leak_fingerprints() {
        let error = IdempotencyError::KeyReusedWithDifferentPayload {
            stored: "aa".repeat(32),
            presented: gate_core::fingerprint("POST", "/refunds", b"{}").into_string(),
        };
        let message = error.to_string();
        assert!(!message.contains("aaaa"));
        assert_eq!(error.kind(), "key_reused_with_different_payload");
    }
}
