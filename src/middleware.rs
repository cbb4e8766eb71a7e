use crate::error::IdempotencyError;
use crate::executor::{Execution, OperationRequest};
use axum::Json;
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use gate_core::key::{self, IdempotencyKey, InvalidKeyFormat};
use serde::Serialize;
use serde_json::json;

pub const REPLAYED_HEADER: &str = "idempotent-replayed";

/// The idempotency-relevant parts of an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotentRequest {
    pub key: IdempotencyKey,
    pub method: Method,
    pub path: String,
    pub body: Vec<u8>,
}

impl IdempotentRequest {
    /// Enforces the header contract: the key header must be present and
    /// hold a well-formed key.
    pub fn from_parts(
        headers: &HeaderMap,
        method: &Method,
        path: &str,
        body: &[u8],
        header_name: &HeaderName,
    ) -> Result<Self, IdempotencyError> {
        let raw = headers
            .get(header_name)
            .ok_or_else(|| IdempotencyError::MissingIdempotencyKey {
                header: header_name.to_string(),
            })?;
        let raw = raw.to_str().map_err(|_| InvalidKeyFormat::Malformed)?;

        Ok(Self {
            key: key::parse(raw.trim())?,
            method: method.clone(),
            path: path.to_string(),
            body: body.to_vec(),
        })
    }

    pub fn into_operation(self, operation_type: impl Into<String>) -> OperationRequest {
        OperationRequest::new(
            self.key.into_string(),
            operation_type,
            self.method.as_str(),
            self.path,
            self.body,
        )
    }
}

/// Maps an idempotency failure onto its HTTP response. Bodies are fixed
/// strings; payloads and fingerprints never reach the client.
pub fn error_response(error: &IdempotencyError) -> Response {
    let (status, message) = match error {
        IdempotencyError::InvalidKeyFormat(_) => {
            (StatusCode::BAD_REQUEST, "invalid idempotency key")
        }
        IdempotencyError::MissingIdempotencyKey { .. } => {
            (StatusCode::BAD_REQUEST, "missing idempotency key header")
        }
        IdempotencyError::KeyReusedWithDifferentPayload { .. } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "idempotency key was reused with a different payload",
        ),
        IdempotencyError::StillProcessing { .. } => (
            StatusCode::CONFLICT,
            "a request with this idempotency key is still processing",
        ),
        IdempotencyError::BusinessOperationFailed(_) => (
            StatusCode::BAD_GATEWAY,
            "operation failed; it may be retried with the same idempotency key",
        ),
        IdempotencyError::StoreUnavailable(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "idempotency store unavailable",
        ),
    };

    let mut response = (
        status,
        Json(json!({
            "error": message,
            "code": error.kind(),
            "retryable": error.is_retryable(),
        })),
    )
        .into_response();

    if let IdempotencyError::StillProcessing {
        retry_after_seconds,
    } = error
    {
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(*retry_after_seconds));
    }
    response
}

/// Renders a finished execution. Original and replay share status and
/// body; only the replay header differs.
pub fn execution_response<T: Serialize>(status: StatusCode, execution: Execution<T>) -> Response {
    let mut response = (status, Json(execution.value)).into_response();
    if execution.replayed {
        response.headers_mut().insert(
            HeaderName::from_static(REPLAYED_HEADER),
            HeaderValue::from_static("true"),
        );
    }
    response
}
