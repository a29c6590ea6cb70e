//! HMAC-SHA256 signatures on payment gateway callbacks.
//!
//! The signature is computed over `{timestamp}.{nonce}.{body}` with the configured shared secret and
//! sent base64-encoded, prefixed `v1,`, in the [`SIGNATURE_HEADER`] header. The timestamp (unix
//! seconds) and nonce travel in [`TIMESTAMP_HEADER`] and [`NONCE_HEADER`].

use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-payment-signature";
pub const TIMESTAMP_HEADER: &str = "x-payment-timestamp";
pub const NONCE_HEADER: &str = "x-payment-nonce";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing {0} header")]
    Missing(&'static str),
    #[error("malformed {0} header")]
    Malformed(&'static str),
    #[error("callback timestamp is outside the accepted window")]
    Stale,
    #[error("signature does not match")]
    Mismatch,
}

/// Sign a callback body. Returns the header value, `v1,{base64-hmac-sha256}`.
pub fn sign_callback(secret: &str, timestamp: i64, nonce: &str, body: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(format!("{timestamp}.{nonce}.{body}").as_bytes());
    let signature = mac.finalize().into_bytes();
    Some(format!("v1,{}", BASE64_STANDARD.encode(signature)))
}

/// Checks callback signatures against a shared secret and a timestamp tolerance.
#[derive(Clone)]
pub struct CallbackVerifier {
    secret: String,
    tolerance: Duration,
}

impl std::fmt::Debug for CallbackVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackVerifier")
            .field("tolerance", &self.tolerance)
            .finish_non_exhaustive()
    }
}

impl CallbackVerifier {
    pub fn new(secret: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
        }
    }

    pub fn verify(
        &self,
        timestamp: Option<&str>,
        nonce: Option<&str>,
        signature: Option<&str>,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let timestamp = timestamp.ok_or(SignatureError::Missing(TIMESTAMP_HEADER))?;
        let nonce = nonce.ok_or(SignatureError::Missing(NONCE_HEADER))?;
        let signature = signature.ok_or(SignatureError::Missing(SIGNATURE_HEADER))?;

        let timestamp: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| SignatureError::Malformed(TIMESTAMP_HEADER))?;
        let age = now.timestamp().abs_diff(timestamp);
        if age > self.tolerance.as_secs() {
            return Err(SignatureError::Stale);
        }

        let Some(sig_value) = signature.strip_prefix("v1,") else {
            return Err(SignatureError::Malformed(SIGNATURE_HEADER));
        };
        let expected = sign_callback(&self.secret, timestamp, nonce, body).ok_or(SignatureError::Mismatch)?;
        let Some(expected_value) = expected.strip_prefix("v1,") else {
            return Err(SignatureError::Mismatch);
        };

        if constant_time_eq(sig_value.as_bytes(), expected_value.as_bytes()) {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = r#"{"order_id":"RC1","transaction_id":"tx-1","amount":"30"}"#;

    fn verifier() -> CallbackVerifier {
        CallbackVerifier::new("test-secret", Duration::from_secs(300))
    }

    #[test]
    fn test_sign_and_verify() {
        let now = Utc::now();
        let ts = now.timestamp();
        let signature = sign_callback("test-secret", ts, "n-1", BODY).unwrap();
        assert!(signature.starts_with("v1,"));

        let ts = ts.to_string();
        assert_eq!(verifier().verify(Some(&ts), Some("n-1"), Some(&signature), BODY, now), Ok(()));
        assert_eq!(
            verifier().verify(Some(&ts), Some("n-1"), Some(&signature), "tampered", now),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verifier().verify(Some(&ts), Some("n-2"), Some(&signature), BODY, now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_wrong_secret_fails() {
        let now = Utc::now();
        let signature = sign_callback("other-secret", now.timestamp(), "n-1", BODY).unwrap();
        let ts = now.timestamp().to_string();
        assert_eq!(
            verifier().verify(Some(&ts), Some("n-1"), Some(&signature), BODY, now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_stale_timestamp_is_rejected() {
        let now = Utc::now();
        let old = now.timestamp() - 301;
        let signature = sign_callback("test-secret", old, "n-1", BODY).unwrap();
        assert_eq!(
            verifier().verify(Some(&old.to_string()), Some("n-1"), Some(&signature), BODY, now),
            Err(SignatureError::Stale)
        );
    }

    #[test]
    fn test_missing_and_malformed_headers() {
        let now = Utc::now();
        let ts = now.timestamp().to_string();
        assert_eq!(
            verifier().verify(None, Some("n"), Some("v1,x"), BODY, now),
            Err(SignatureError::Missing(TIMESTAMP_HEADER))
        );
        assert_eq!(
            verifier().verify(Some(&ts), Some("n"), None, BODY, now),
            Err(SignatureError::Missing(SIGNATURE_HEADER))
        );
        assert_eq!(
            verifier().verify(Some("yesterday"), Some("n"), Some("v1,x"), BODY, now),
            Err(SignatureError::Malformed(TIMESTAMP_HEADER))
        );
        assert_eq!(
            verifier().verify(Some(&ts), Some("n"), Some("v2,abc"), BODY, now),
            Err(SignatureError::Malformed(SIGNATURE_HEADER))
        );
    }
}
