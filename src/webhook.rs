//! Inbound chat-webhook signature verification (spec §6: "All inbound
//! events are signed; signature verification is mandatory before any state
//! transition"). Grounded on the teacher's `security/webhook.rs`
//! (`HmacSha256` type alias, a timestamp-tolerance window, a versioned
//! signature header).

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-SSO-Elevator-Signature";
pub const SIGNATURE_VERSION: &str = "v1";
const DEFAULT_TIMESTAMP_TOLERANCE_SECONDS: i64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("missing or malformed signature header")]
    MalformedHeader,
    #[error("signature timestamp outside tolerance window")]
    StaleTimestamp,
    #[error("signature does not match payload")]
    BadSignature,
}

/// Compute the `{SIGNATURE_VERSION}={timestamp}.{hex hmac}` header value for
/// a request body. Shared by inbound verification's test fixtures and by
/// `notify::ReqwestChatClient`, which signs its own outbound webhook calls
/// with the same scheme so the chat front-end can verify them symmetrically.
pub fn sign_body(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts keys of any length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    format!("{SIGNATURE_VERSION}={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify `{SIGNATURE_VERSION}={timestamp}.{hex hmac}` against the raw
/// request body using a shared secret. Uses constant-time comparison via
/// `hmac`'s `verify_slice` so timing attacks can't leak the expected MAC.
pub fn verify_signature(secret: &str, signature_header: &str, timestamp: i64, body: &[u8], now: i64) -> Result<(), WebhookError> {
    if (now - timestamp).abs() > DEFAULT_TIMESTAMP_TOLERANCE_SECONDS {
        return Err(WebhookError::StaleTimestamp);
    }

    let expected_prefix = format!("{SIGNATURE_VERSION}=");
    let hex_sig = signature_header
        .strip_prefix(&expected_prefix)
        .ok_or(WebhookError::MalformedHeader)?;
    let signature_bytes = hex::decode(hex_sig).map_err(|_| WebhookError::MalformedHeader)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::MalformedHeader)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);

    mac.verify_slice(&signature_bytes).map_err(|_| WebhookError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, timestamp: i64, body: &[u8]) -> String {
        sign_body(secret, timestamp, body)
    }

    #[test]
    fn accepts_valid_signature_within_tolerance() {
        let secret = "shh";
        let body = br#"{"request_id":"r1"}"#;
        let ts = 1_700_000_000;
        let header = sign(secret, ts, body);
        assert!(verify_signature(secret, &header, ts, body, ts + 10).is_ok());
    }

    #[test]
    fn rejects_stale_timestamp() {
        let secret = "shh";
        let body = b"{}";
        let ts = 1_700_000_000;
        let header = sign(secret, ts, body);
        assert!(matches!(
            verify_signature(secret, &header, ts, body, ts + 10_000),
            Err(WebhookError::StaleTimestamp)
        ));
    }

    #[test]
    fn rejects_tampered_body() {
        let secret = "shh";
        let ts = 1_700_000_000;
        let header = sign(secret, ts, b"{\"a\":1}");
        assert!(matches!(
            verify_signature(secret, &header, ts, b"{\"a\":2}", ts),
            Err(WebhookError::BadSignature)
        ));
    }
}
