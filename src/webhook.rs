use crate::error::IdempotencyError;
use crate::executor::{Execution, OperationExecutor, OperationRequest};
use gate_core::key;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use tracing::warn;

/// Idempotency for inbound provider events, keyed by `(source, event_id)`
/// instead of a client supplied header.
#[derive(Clone)]
pub struct WebhookIdempotencyAdapter {
    executor: OperationExecutor,
}

impl WebhookIdempotencyAdapter {
    pub fn new(executor: OperationExecutor) -> Self {
        Self { executor }
    }

    pub fn operation_type(source: &str) -> String {
        format!("webhook:{source}")
    }

    /// Runs `handler` once per delivered event. Redeliveries with the same
    /// payload replay the first result.
    pub async fn deliver<T, F, Fut>(
        &self,
        source: &str,
        event_id: &str,
        payload: &[u8],
        handler: F,
    ) -> Result<Execution<T>, IdempotencyError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let key = key::webhook_key(source, event_id).inspect_err(|error| {
            warn!(source = %source, error = %error, "webhook event id rejected");
        })?;

        let request = OperationRequest::new(
            key.into_string(),
            Self::operation_type(source),
            "POST",
            format!("/webhooks/{source}"),
            payload,
        )
        .with_metadata("event_id", event_id)
        .with_metadata("source", source);

        let result = self.executor.run(request, handler).await;
        if let Err(IdempotencyError::KeyReusedWithDifferentPayload { .. }) = &result {
            warn!(
                source = %source,
                event_id = %event_id,
                "provider redelivered an event id with a different payload"
            );
        }
        result
    }
}
