use crate::sources::ValidationError;
use axum::http::HeaderMap;
use gate_core::signatures::verify_stripe_signature;
use serde_json::Value;

const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

pub fn validate(
    secret: &str,
    tolerance_seconds: i64,
    headers: &HeaderMap,
    body: &[u8],
    now_epoch: i64,
) -> Result<(), ValidationError> {
    let signature = header_string(headers, STRIPE_SIGNATURE_HEADER)
        .ok_or(ValidationError::Unauthorized("missing stripe signature"))?;

    if verify_stripe_signature(secret, body, &signature, now_epoch, tolerance_seconds) {
        Ok(())
    } else {
        Err(ValidationError::Unauthorized(
            "invalid stripe signature or timestamp",
        ))
    }
}

/// Returns `(event_id, event_type)` from a Stripe event object.
pub fn event_identity(payload: &Value) -> Result<(String, String), ValidationError> {
    let event_id = string_field(payload, "id").ok_or(ValidationError::BadRequest("missing event id"))?;
    let event_type =
        string_field(payload, "type").ok_or(ValidationError::BadRequest("missing event type"))?;
    Ok((event_id, event_type))
}

fn string_field(payload: &Value, name: &str) -> Option<String> {
    payload
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}
