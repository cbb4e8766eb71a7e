use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

pub const FINGERPRINT_HEX_LEN: usize = 64;

/// Lowercase hex SHA-256 of a normalized request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn fingerprint(method: &str, path: &str, body: &[u8]) -> Fingerprint {
    let method = method.trim().to_ascii_uppercase();
    let path = canonical_path(path);
    let body = canonical_body(body);

    let mut hasher = Sha256::new();
    for field in [method.as_bytes(), path.as_bytes(), body.as_slice()] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field);
    }
    Fingerprint(hex::encode(hasher.finalize()))
}

pub fn canonical_path(path: &str) -> String {
    let without_query = path
        .split_once(['?', '#'])
        .map(|(head, _)| head)
        .unwrap_or(path)
        .trim();

    let trimmed = without_query.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// JSON bodies are re-serialized with sorted keys and no whitespace.
/// Numbers keep their literal text. Anything that is not JSON is hashed
/// as-is.
pub fn canonical_body(body: &[u8]) -> Vec<u8> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Vec::new();
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(value) => canonical_json(&value).into_bytes(),
        Err(_) => body.to_vec(),
    }
}

pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|(left, _), (right, _)| left.cmp(right));

            out.push('{');
            for (index, (key, value)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_and_whitespace_do_not_change_fingerprint() {
        let compact = br#"{"booking_id":123,"amount":50.0}"#;
        let spaced = b"{\n  \"amount\": 50.0,\n  \"booking_id\": 123\n}";

        assert_eq!(
            fingerprint("POST", "/payments/intents", compact),
            fingerprint("post", "/payments/intents/", spaced)
        );
    }

    #[test]
    fn different_payload_changes_fingerprint() {
        let original = br#"{"booking_id":123,"amount":50.0}"#;
        let tampered = br#"{"booking_id":999,"amount":50.0}"#;

        assert_ne!(
            fingerprint("POST", "/payments/intents", original),
            fingerprint("POST", "/payments/intents", tampered)
        );
    }

    #[test]
    fn numbers_keep_their_literal_precision() {
        let path = "/payouts";
        assert_ne!(
            fingerprint("POST", path, br#"{"amount":18446744073709551616}"#),
            fingerprint("POST", path, br#"{"amount":18446744073709551617}"#)
        );
        assert_ne!(
            fingerprint("POST", path, br#"{"amount":0.1}"#),
            fingerprint("POST", path, br#"{"amount":0.10000000000000000001}"#)
        );
        assert_eq!(
            canonical_body(br#"{ "amount": 12345678901234567890123 }"#),
            br#"{"amount":12345678901234567890123}"#.to_vec()
        );
    }

    #[test]
    fn method_and_path_are_part_of_the_fingerprint() {
        let body = br#"{"amount":10}"#;
        let base = fingerprint("POST", "/refunds", body);

        assert_ne!(base, fingerprint("PUT", "/refunds", body));
        assert_ne!(base, fingerprint("POST", "/payouts", body));
        assert_eq!(base, fingerprint("POST", "/refunds?trace=1", body));
    }

    #[test]
    fn field_boundaries_are_length_delimited() {
        assert_ne!(
            fingerprint("POST", "/ab", b"c"),
            fingerprint("POST", "/a", b"bc")
        );
    }

    #[test]
    fn nested_objects_are_sorted_recursively() {
        let left = json!({"outer": {"b": 1, "a": [ {"y": 2, "x": 1} ]}});
        let right = json!({"outer": {"a": [ {"x": 1, "y": 2} ], "b": 1}});
        assert_eq!(canonical_json(&left), canonical_json(&right));
        assert_eq!(
            canonical_json(&left),
            r#"{"outer":{"a":[{"x":1,"y":2}],"b":1}}"#
        );
    }

    #[test]
    fn non_json_and_empty_bodies_are_hashed_verbatim() {
        assert_eq!(canonical_body(b"  \n"), Vec::<u8>::new());
        assert_eq!(canonical_body(b"amount=50"), b"amount=50".to_vec());
        assert_eq!(
            fingerprint("POST", "/", b"").as_str().len(),
            FINGERPRINT_HEX_LEN
        );
    }

    #[test]
    fn canonical_path_normalizes_slashes() {
        assert_eq!(canonical_path(""), "/");
        assert_eq!(canonical_path("/"), "/");
        assert_eq!(canonical_path("payouts/"), "/payouts");
        assert_eq!(canonical_path("/payouts/42?expand=true"), "/payouts/42");
    }
}
