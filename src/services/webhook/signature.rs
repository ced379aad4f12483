//! `t=<unix>,v1=<hex>` HMAC-SHA256 signatures over `"{t}.{payload}"`.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature header is missing or malformed")]
    MalformedHeader,
    #[error("signature timestamp is outside the tolerance window")]
    OutsideTolerance,
    #[error("signature does not match payload")]
    Mismatch,
}

struct SignatureHeader<'a> {
    timestamp: i64,
    timestamp_raw: &'a str,
    signatures: Vec<&'a str>,
}

fn parse_header(header: &str) -> Result<SignatureHeader<'_>, SignatureError> {
    let mut timestamp_raw = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp_raw = Some(value),
            Some(("v1", value)) if !value.is_empty() => signatures.push(value),
            _ => {}
        }
    }

    let timestamp_raw = timestamp_raw.ok_or(SignatureError::MalformedHeader)?;
    let timestamp = timestamp_raw.parse::<i64>().map_err(|_| SignatureError::MalformedHeader)?;
    if signatures.is_empty() {
        return Err(SignatureError::MalformedHeader);
    }
    Ok(SignatureHeader { timestamp, timestamp_raw, signatures })
}

fn mac_for(secret: &str, timestamp: &str, payload: &[u8]) -> Result<HmacSha256, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::MalformedHeader)?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

/// Verify `header` against `payload`. Any of several `v1` entries may match,
/// which allows the sender to rotate secrets.
pub fn verify(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: DateTime<Utc>,
    tolerance_secs: i64,
) -> Result<(), SignatureError> {
    let parsed = parse_header(header)?;

    if (now.timestamp() - parsed.timestamp).abs() > tolerance_secs {
        return Err(SignatureError::OutsideTolerance);
    }

    for candidate in parsed.signatures {
        let Ok(expected) = hex::decode(candidate) else { continue };
        // verify_slice compares in constant time
        if mac_for(secret, parsed.timestamp_raw, payload)?.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }
    Err(SignatureError::Mismatch)
}

/// Build a header for `payload`. Used by senders and tests.
pub fn sign(payload: &[u8], secret: &str, timestamp: i64) -> Result<String, SignatureError> {
    let timestamp = timestamp.to_string();
    let digest = mac_for(secret, &timestamp, payload)?.finalize().into_bytes();
    Ok(format!("t={},v1={}", timestamp, hex::encode(digest)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const SECRET: &str = "whsec_test";
    const PAYLOAD: &[u8] = br#"{"eventId":"evt_1","status":"CONFIRMED"}"#;

    #[test]
    fn accepts_valid_signature() {
        let now = Utc::now();
        let header = sign(PAYLOAD, SECRET, now.timestamp()).unwrap();
        assert_eq!(verify(PAYLOAD, &header, SECRET, now, 300), Ok(()));
    }

    #[test]
    fn rejects_modified_payload_and_wrong_secret() {
        let now = Utc::now();
        let header = sign(PAYLOAD, SECRET, now.timestamp()).unwrap();
        assert_eq!(verify(b"{}", &header, SECRET, now, 300), Err(SignatureError::Mismatch));
        assert_eq!(verify(PAYLOAD, &header, "other", now, 300), Err(SignatureError::Mismatch));
    }

    #[test]
    fn rejects_old_timestamps() {
        let now = Utc::now();
        let header = sign(PAYLOAD, SECRET, (now - Duration::minutes(10)).timestamp()).unwrap();
        assert_eq!(verify(PAYLOAD, &header, SECRET, now, 300), Err(SignatureError::OutsideTolerance));
    }

    #[test]
    fn rejects_malformed_headers() {
        let now = Utc::now();
        let only_timestamp = format!("t={}", now.timestamp());
        for header in ["", "garbage", "t=abc,v1=00", "v1=deadbeef", only_timestamp.as_str()] {
            assert_eq!(verify(PAYLOAD, header, SECRET, now, 300), Err(SignatureError::MalformedHeader), "{header}");
        }
    }

    #[test]
    fn any_v1_entry_may_match() {
        let now = Utc::now();
        let valid = sign(PAYLOAD, SECRET, now.timestamp()).unwrap();
        let digest = valid.split_once(",v1=").unwrap().1;
        let header = format!("t={},v1=not-hex,v1={}", now.timestamp(), digest);
        assert_eq!(verify(PAYLOAD, &header, SECRET, now, 300), Ok(()));
    }
}
