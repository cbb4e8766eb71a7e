use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeSignatureHeader {
    pub timestamp: i64,
    pub v1_signatures: Vec<String>,
}

pub fn parse_stripe_signature_header(raw: &str) -> Option<StripeSignatureHeader> {
    let mut timestamp = None;
    let mut v1_signatures = Vec::new();

    for part in raw.split(',') {
        let Some((name, value)) = part.trim().split_once('=') else {
            continue;
        };
        match name.trim() {
            "t" => timestamp = value.trim().parse::<i64>().ok(),
            "v1" => v1_signatures.push(value.trim().to_ascii_lowercase()),
            _ => {}
        }
    }

    let timestamp = timestamp?;
    if v1_signatures.is_empty() {
        return None;
    }

    Some(StripeSignatureHeader {
        timestamp,
        v1_signatures,
    })
}

/// Checks a `Stripe-Signature` header: HMAC-SHA256 over `"{t}.{payload}"`
/// and a timestamp inside the tolerance window.
pub fn verify_stripe_signature(
    secret: &str,
    payload: &[u8],
    signature_header: &str,
    now_epoch: i64,
    tolerance_seconds: i64,
) -> bool {
    let Some(header) = parse_stripe_signature_header(signature_header) else {
        return false;
    };

    if now_epoch.abs_diff(header.timestamp) > tolerance_seconds.unsigned_abs() {
        return false;
    }

    let expected = compute_stripe_signature_hex(secret, header.timestamp, payload);
    header
        .v1_signatures
        .iter()
        .any(|provided| constant_time_hex_equals(provided, &expected))
}

pub fn compute_stripe_signature_hex(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut signed = timestamp.to_string().into_bytes();
    signed.push(b'.');
    signed.extend_from_slice(payload);
    compute_hmac_sha256_hex(secret, &signed)
}

pub fn compute_hmac_sha256_hex(secret: &str, payload: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts variable-length keys");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

pub fn constant_time_hex_equals(left: &str, right: &str) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.as_bytes().ct_eq(right.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    #[test]
    fn verifies_signature_inside_tolerance() {
        let payload = br#"{"id":"evt_1","type":"payment_intent.succeeded"}"#;
        let digest = compute_stripe_signature_hex(SECRET, 1_700_000_000, payload);
        let header = format!("t=1700000000,v1={digest}");

        assert!(verify_stripe_signature(
            SECRET,
            payload,
            &header,
            1_700_000_100,
            300
        ));
        assert!(!verify_stripe_signature(
            "wrong", payload, &header, 1_700_000_100, 300
        ));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let payload = br#"{"id":"evt_1"}"#;
        let digest = compute_stripe_signature_hex(SECRET, 1_700_000_000, payload);
        let header = format!("t=1700000000,v1={digest}");

        assert!(!verify_stripe_signature(
            SECRET,
            payload,
            &header,
            1_700_000_301,
            300
        ));
    }

    #[test]
    fn accepts_any_matching_v1_entry() {
        let payload = br#"{"id":"evt_2"}"#;
        let digest = compute_stripe_signature_hex(SECRET, 1_700_000_000, payload);
        let header = format!("t=1700000000, v1=deadbeef, v0=ignored, v1={digest}");

        assert!(verify_stripe_signature(
            SECRET,
            payload,
            &header,
            1_700_000_000,
            300
        ));
    }

    #[test]
    fn extreme_timestamps_are_rejected_without_overflow() {
        let payload = br#"{"id":"evt_3"}"#;
        for header in [
            "t=-9223372036854775808,v1=00",
            "t=9223372036854775807,v1=00",
        ] {
            assert!(!verify_stripe_signature(
                SECRET,
                payload,
                header,
                1_700_000_000,
                300
            ));
        }
        assert!(!verify_stripe_signature(
            SECRET,
            payload,
            "t=0,v1=00",
            i64::MAX,
            300
        ));
    }

    #[test]
    fn malformed_headers_do_not_parse() {
        assert_eq!(parse_stripe_signature_header(""), None);
        assert_eq!(parse_stripe_signature_header("v1=abc"), None);
        assert_eq!(parse_stripe_signature_header("t=notanumber,v1=abc"), None);
        assert_eq!(parse_stripe_signature_header("t=1700000000"), None);
    }
}
