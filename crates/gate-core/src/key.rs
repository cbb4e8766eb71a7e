use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;
use uuid::Uuid;

pub const KEY_SEPARATOR: char = '_';
pub const MAX_PREFIX_LEN: usize = 32;
pub const MIN_SUFFIX_LEN: usize = 16;
pub const MAX_SUFFIX_LEN: usize = 128;
pub const MAX_KEY_LEN: usize = MAX_PREFIX_LEN + 1 + MAX_SUFFIX_LEN;
pub const MAX_EVENT_ID_LEN: usize = 255;

const MIN_DISTINCT_SUFFIX_CHARS: usize = 6;
const MAX_WEBHOOK_SOURCE_LEN: usize = 24;
const WEBHOOK_DIGEST_HEX_LEN: usize = 32;

static KEY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9-]{1,32})_([A-Za-z0-9-]{16,128})$")
        .expect("idempotency key pattern must compile")
});

static SOURCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9-]{1,24}$").expect("webhook source pattern must compile")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidKeyFormat {
    #[error("idempotency key is empty")]
    Empty,
    #[error("idempotency key exceeds {MAX_KEY_LEN} characters")]
    TooLong,
    #[error("idempotency key must look like <prefix>_<random suffix>")]
    Malformed,
    #[error("idempotency key suffix is not random enough")]
    LowEntropy,
    #[error("webhook source must be 1-24 lowercase alphanumeric or hyphen characters")]
    InvalidSource,
    #[error("webhook event id must be 1-{MAX_EVENT_ID_LEN} bytes")]
    InvalidEventId,
}

/// A key that passed [`parse`]. Only constructible through validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Operation family the client encoded before the separator.
    pub fn prefix(&self) -> &str {
        self.0
            .split_once(KEY_SEPARATOR)
            .map(|(prefix, _)| prefix)
            .unwrap_or_default()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = InvalidKeyFormat;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse(&value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}

pub fn validate(key: &str) -> bool {
    parse(key).is_ok()
}

pub fn parse(key: &str) -> Result<IdempotencyKey, InvalidKeyFormat> {
    if key.is_empty() {
        return Err(InvalidKeyFormat::Empty);
    }
    if key.len() > MAX_KEY_LEN {
        return Err(InvalidKeyFormat::TooLong);
    }

    let captures = KEY_PATTERN
        .captures(key)
        .ok_or(InvalidKeyFormat::Malformed)?;
    let suffix = captures.get(2).map(|m| m.as_str()).unwrap_or_default();

    let distinct = suffix
        .chars()
        .filter(|character| *character != '-')
        .map(|character| character.to_ascii_lowercase())
        .collect::<HashSet<_>>();
    if distinct.len() < MIN_DISTINCT_SUFFIX_CHARS {
        return Err(InvalidKeyFormat::LowEntropy);
    }

    Ok(IdempotencyKey(key.to_string()))
}

/// Fresh key with a UUID v4 suffix, for clients and tooling.
pub fn generate(prefix: &str) -> Result<IdempotencyKey, InvalidKeyFormat> {
    parse(&format!(
        "{prefix}{KEY_SEPARATOR}{}",
        Uuid::new_v4().simple()
    ))
}

/// Derives the storage key for an externally supplied webhook event id.
///
/// Event ids are arbitrary provider strings, so they are hashed into the
/// suffix instead of being embedded verbatim.
pub fn webhook_key(source: &str, event_id: &str) -> Result<IdempotencyKey, InvalidKeyFormat> {
    if !SOURCE_PATTERN.is_match(source) || source.len() > MAX_WEBHOOK_SOURCE_LEN {
        return Err(InvalidKeyFormat::InvalidSource);
    }
    if event_id.is_empty() || event_id.len() > MAX_EVENT_ID_LEN {
        return Err(InvalidKeyFormat::InvalidEventId);
    }

    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(event_id.as_bytes());
    let digest = hex::encode(hasher.finalize());

    parse(&format!(
        "webhook-{source}{KEY_SEPARATOR}{}",
        &digest[..WEBHOOK_DIGEST_HEX_LEN]
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_prefix_and_uuid_suffix() {
        assert!(validate("payment_7f3a9c2e4b1d4e8f9a0b1c2d3e4f5a6b"));
        assert!(validate("refund_0f8fad5b-d9cb-469f-a165-70867728950e"));
        assert!(validate("pos-order_Q2x9LmP4zR7tK1vN"));
    }

    #[test]
    fn rejects_empty_and_overlong_keys() {
        assert_eq!(parse(""), Err(InvalidKeyFormat::Empty));

        let overlong = format!("payment_{}", "a1b2c3d4e5".repeat(20));
        assert_eq!(parse(&overlong), Err(InvalidKeyFormat::TooLong));
    }

    #[test]
    fn rejects_unsafe_characters_and_missing_separator() {
        assert_eq!(
            parse("payment_7f3a9c2e 4b1d4e8f9a0b"),
            Err(InvalidKeyFormat::Malformed)
        );
        assert_eq!(
            parse("payment:7f3a9c2e4b1d4e8f9a0b"),
            Err(InvalidKeyFormat::Malformed)
        );
        assert_eq!(
            parse("../payment_7f3a9c2e4b1d4e8f9a0b"),
            Err(InvalidKeyFormat::Malformed)
        );
        assert_eq!(
            parse("payment_7f3a9c2e\"4b1d4e8f9a0b"),
            Err(InvalidKeyFormat::Malformed)
        );
        assert_eq!(
            parse("7f3a9c2e4b1d4e8f9a0b1c2d"),
            Err(InvalidKeyFormat::Malformed)
        );
    }

    #[test]
    fn rejects_short_or_repetitive_suffix() {
        assert_eq!(parse("payment_abc123"), Err(InvalidKeyFormat::Malformed));
        assert_eq!(
            parse("payment_aaaaaaaaaaaaaaaaaaaa"),
            Err(InvalidKeyFormat::LowEntropy)
        );
        assert_eq!(
            parse("payment_1212121212121212"),
            Err(InvalidKeyFormat::LowEntropy)
        );
    }

    #[test]
    fn generated_keys_validate_and_keep_prefix() {
        let key = generate("payout").expect("generated key");
        assert_eq!(key.prefix(), "payout");
        assert!(validate(key.as_str()));
        assert_ne!(key, generate("payout").expect("second key"));
    }

    #[test]
    fn webhook_key_is_stable_per_source_and_event() {
        let first = webhook_key("stripe", "evt_1NqYxB2eZvKYlo2C").expect("webhook key");
        let again = webhook_key("stripe", "evt_1NqYxB2eZvKYlo2C").expect("webhook key");
        let other_source = webhook_key("square", "evt_1NqYxB2eZvKYlo2C").expect("webhook key");

        assert_eq!(first, again);
        assert_ne!(first, other_source);
        assert_eq!(first.prefix(), "webhook-stripe");
    }

    #[test]
    fn webhook_key_rejects_bad_source_or_event_id() {
        assert_eq!(
            webhook_key("Stripe!", "evt_1"),
            Err(InvalidKeyFormat::InvalidSource)
        );
        assert_eq!(
            webhook_key("stripe", ""),
            Err(InvalidKeyFormat::InvalidEventId)
        );
        assert_eq!(
            webhook_key("stripe", &"e".repeat(MAX_EVENT_ID_LEN + 1)),
            Err(InvalidKeyFormat::InvalidEventId)
        );
    }

    #[test]
    fn deserialization_runs_validation() {
        let parsed: Result<IdempotencyKey, _> = serde_json::from_str("\"bad key\"");
        assert!(parsed.is_err());
    }
}
