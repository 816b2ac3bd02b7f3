//! Webhook signature verification.
//!
//! Header format is `t=<unix seconds>,v1=<hex hmac>`; the MAC is
//! HMAC-SHA256 over `"{t}.{raw body}"` with the shared webhook secret.

use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("malformed signature header")]
    MalformedHeader,
    #[error("signature timestamp outside tolerance")]
    TimestampOutOfTolerance,
    #[error("signature mismatch")]
    Mismatch,
}

struct SignatureParts {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

fn parse_header(header: &str) -> Result<SignatureParts, SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or(SignatureError::MalformedHeader)?;
        match key.trim() {
            "t" => timestamp = value.trim().parse().ok(),
            "v1" => {
                if let Ok(bytes) = hex::decode(value.trim()) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::MalformedHeader)?;
    if signatures.is_empty() {
        return Err(SignatureError::MalformedHeader);
    }
    Ok(SignatureParts {
        timestamp,
        signatures,
    })
}

#[derive(Clone)]
pub struct SignatureVerifier {
    secret: SecretString,
    tolerance: Duration,
}

impl SignatureVerifier {
    pub fn new(secret: SecretString, tolerance: Duration) -> Self {
        Self { secret, tolerance }
    }

    fn mac(&self, timestamp: i64, payload: &[u8]) -> Vec<u8> {
        // HMAC accepts keys of any length, so this never fails.
        let mut mac = match HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return Vec::new(),
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }

    pub fn verify(&self, payload: &[u8], header: &str) -> Result<(), SignatureError> {
        self.verify_at(payload, header, Utc::now().timestamp())
    }

    fn verify_at(&self, payload: &[u8], header: &str, now: i64) -> Result<(), SignatureError> {
        let parts = parse_header(header)?;
        let skew = now.abs_diff(parts.timestamp);
        if skew > self.tolerance.as_secs() {
            return Err(SignatureError::TimestampOutOfTolerance);
        }

        let expected = self.mac(parts.timestamp, payload);
        let matched = parts
            .signatures
            .iter()
            .any(|provided| !expected.is_empty() && bool::from(expected.ct_eq(provided)));
        if matched {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }

    /// Builds a valid header for `payload`. Used by tests and local tooling.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> String {
        format!("t={},v1={}", timestamp, hex::encode(self.mac(timestamp, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(
            SecretString::new("whsec_test_secret".to_string()),
            Duration::from_secs(300),
        )
    }

    const BODY: &[u8] = br#"{"id":"evt_1","type":"invoice.paid"}"#;

    #[test]
    fn test_valid_signature_passes() {
        let v = verifier();
        let now = 1_760_000_000;
        let header = v.sign(BODY, now);
        assert_eq!(v.verify_at(BODY, &header, now + 10), Ok(()));
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let v = verifier();
        let now = 1_760_000_000;
        let header = v.sign(BODY, now);
        let tampered = br#"{"id":"evt_1","type":"invoice.payment_failed"}"#;
        assert_eq!(
            v.verify_at(tampered, &header, now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let now = 1_760_000_000;
        let other = SignatureVerifier::new(
            SecretString::new("whsec_other".to_string()),
            Duration::from_secs(300),
        );
        let header = other.sign(BODY, now);
        assert_eq!(
            verifier().verify_at(BODY, &header, now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_stale_timestamp_is_rejected() {
        let v = verifier();
        let then = 1_760_000_000;
        let header = v.sign(BODY, then);
        assert_eq!(
            v.verify_at(BODY, &header, then + 301),
            Err(SignatureError::TimestampOutOfTolerance)
        );
    }

    #[test]
    fn test_future_timestamp_beyond_tolerance_is_rejected() {
        let v = verifier();
        let now = 1_760_000_000;
        let header = v.sign(BODY, now + 600);
        assert_eq!(
            v.verify_at(BODY, &header, now),
            Err(SignatureError::TimestampOutOfTolerance)
        );
    }

    #[test]
    fn test_malformed_headers_are_rejected() {
        let v = verifier();
        for header in ["", "garbage", "t=abc,v1=00", "t=1760000000", "v1=deadbeef"] {
            assert_eq!(
                v.verify_at(BODY, header, 1_760_000_000),
                Err(SignatureError::MalformedHeader),
                "header {header:?}"
            );
        }
    }

    #[test]
    fn test_any_matching_v1_entry_is_accepted() {
        let v = verifier();
        let now = 1_760_000_000;
        let valid = v.sign(BODY, now);
        let sig = valid.split("v1=").nth(1).unwrap();
        let header = format!("t={now},v1={},v1={sig}", "00".repeat(32));
        assert_eq!(v.verify_at(BODY, &header, now), Ok(()));
    }
}
