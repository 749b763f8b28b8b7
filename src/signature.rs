//! Slack request signing.
//!
//! Slack signs every webhook with `v0=hex(HMAC-SHA256(secret, "v0:{ts}:{body}"))`
//! and sends the timestamp alongside. Requests outside a five minute window
//! are refused so a captured request cannot be replayed later.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::SignatureError;

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "X-Slack-Request-Timestamp";
pub const SIGNATURE_HEADER: &str = "X-Slack-Signature";

const VERSION: &str = "v0";
const MAX_CLOCK_SKEW_SECS: i64 = 300;

pub struct SignatureVerifier {
    secret: Vec<u8>,
    max_skew_secs: i64,
}

impl SignatureVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            max_skew_secs: MAX_CLOCK_SKEW_SECS,
        }
    }

    /// Check a request against the current wall clock.
    pub fn verify(
        &self,
        body: &[u8],
        timestamp: Option<&str>,
        signature: Option<&str>,
    ) -> Result<(), SignatureError> {
        self.verify_at(chrono::Utc::now().timestamp(), body, timestamp, signature)
    }

    pub fn verify_at(
        &self,
        now: i64,
        body: &[u8],
        timestamp: Option<&str>,
        signature: Option<&str>,
    ) -> Result<(), SignatureError> {
        let timestamp = timestamp.ok_or(SignatureError::MissingTimestamp)?;
        let signature = signature.ok_or(SignatureError::MissingSignature)?;

        let ts: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| SignatureError::InvalidTimestamp)?;
        // Hostile timestamps can sit at the ends of the i64 range
        let age = now.saturating_sub(ts);
        if age.unsigned_abs() > self.max_skew_secs.unsigned_abs() {
            return Err(SignatureError::Stale { age });
        }

        let provided = signature
            .strip_prefix(VERSION)
            .and_then(|s| s.strip_prefix('='))
            .ok_or(SignatureError::Malformed)?;
        let provided = hex::decode(provided).map_err(|_| SignatureError::Malformed)?;

        // verify_slice compares in constant time
        // The MAC covers the header exactly as sent
        self.mac(timestamp, body)
            .verify_slice(&provided)
            .map_err(|_| SignatureError::Mismatch)
    }

    /// Produce the header value Slack would send for this body.
    #[cfg(test)]
    pub fn sign(&self, timestamp: &str, body: &[u8]) -> String {
        let digest = self.mac(timestamp, body).finalize().into_bytes();
        format!("{}={}", VERSION, hex::encode(digest))
    }

    fn mac(&self, timestamp: &str, body: &[u8]) -> HmacSha256 {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .expect("HMAC accepts any key length");
        mac.update(VERSION.as_bytes());
        mac.update(b":");
        mac.update(timestamp.as_bytes());
        mac.update(b":");
        mac.update(body);
        mac
    }
}
