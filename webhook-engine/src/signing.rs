//! HMAC-SHA256 request signing
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac(secret, "<t>.<body>")>`.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signature header name
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

const SIGNATURE_VERSION: &str = "v1";

fn mac(secret: &str, timestamp: i64, body: &[u8]) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    mac
}

/// Build the signature header value
pub fn sign(secret: &str, body: &[u8], timestamp: DateTime<Utc>) -> String {
    let ts = timestamp.timestamp();
    let signature = hex::encode(mac(secret, ts, body).finalize().into_bytes());
    format!("t={},{}={}", ts, SIGNATURE_VERSION, signature)
}

/// Verify a header value. Rejects timestamps further than `tolerance_secs` from `now`.
pub fn verify(secret: &str, body: &[u8], header: &str, now: DateTime<Utc>, tolerance_secs: i64) -> bool {
    let mut timestamp = None;
    let mut signature = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some((SIGNATURE_VERSION, value)) => signature = hex::decode(value).ok(),
            _ => {}
        }
    }

    let (Some(ts), Some(signature)) = (timestamp, signature) else {
        return false;
    };
    if (now.timestamp() - ts).abs() > tolerance_secs {
        return false;
    }

    mac(secret, ts, body).verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_format() {
        let ts = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let header = sign("test_secret", br#"{"event":"test"}"#, ts);
        assert!(header.starts_with("t=1700000000,v1="));
        assert_eq!(header.len(), "t=1700000000,v1=".len() + 64);
    }

    #[test]
    fn test_verify_roundtrip_and_tamper() {
        let now = Utc::now();
        let body = br#"{"event":"document.sent"}"#;
        let header = sign("whsec", body, now);

        assert!(verify("whsec", body, &header, now, 300));
        assert!(!verify("other", body, &header, now, 300));
        assert!(!verify("whsec", b"{}", &header, now, 300));
        assert!(!verify("whsec", body, &header, now + chrono::Duration::minutes(10), 300));
        assert!(!verify("whsec", body, "v1=abc", now, 300));
    }
}
