use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::Engine as _;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Version prefix for scannable-code tokens. Bump when the payload shape changes
/// so old codes are rejected instead of misparsed.
const CODE_PREFIX: &str = "SC1.";

const UNIT_ID_RANDOM_LEN: usize = 6;

#[derive(Debug, Error)]
pub enum ScanCodeError {
    #[error("malformed scannable code")]
    MalformedToken,
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload decode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decoded contents of a scannable code. One code is minted per fulfillment
/// unit; the token itself is opaque to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCode {
    pub unit_id: String,
    pub entity_id: Uuid,
    pub buyer_contact: String,
    pub seq_index: i32,
    pub quantity: i32,
}

impl ScanCode {
    pub fn encode(&self) -> String {
        // Payload is a stable JSON object; serialization of these field types
        // cannot fail.
        let payload = serde_json::to_vec(self).expect("scan code payload serializes");
        format!("{}{}", CODE_PREFIX, BASE64_URL.encode(payload))
    }

    pub fn decode(token: &str) -> Result<Self, ScanCodeError> {
        let encoded = token
            .strip_prefix(CODE_PREFIX)
            .ok_or(ScanCodeError::MalformedToken)?;
        let payload = BASE64_URL.decode(encoded)?;
        Ok(serde_json::from_slice(&payload)?)
    }
}

/// Mints an externally presentable unit id, e.g. `TCK-LX2F9A-7KQ3ZD`.
/// Timestamp component keeps ids roughly sortable; random suffix breaks ties.
pub fn mint_unit_id(prefix: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(UNIT_ID_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("{}-{}-{}", prefix, to_base36(millis), suffix).to_uppercase()
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".into();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_code_roundtrip() {
        let code = ScanCode {
            unit_id: "TCK-ABC-123".into(),
            entity_id: Uuid::new_v4(),
            buyer_contact: "buyer@example.com".into(),
            seq_index: 2,
            quantity: 3,
        };
        let token = code.encode();
        assert!(token.starts_with("SC1."));
        let decoded = ScanCode::decode(&token).expect("decode");
        assert_eq!(decoded, code);
    }

    #[test]
    fn scan_code_rejects_wrong_prefix() {
        let err = ScanCode::decode("SC9.abcdef").unwrap_err();
        assert!(matches!(err, ScanCodeError::MalformedToken));
    }

    #[test]
    fn scan_code_rejects_tampered_payload() {
        let code = ScanCode {
            unit_id: "TCK-1".into(),
            entity_id: Uuid::new_v4(),
            buyer_contact: "a@b.c".into(),
            seq_index: 0,
            quantity: 1,
        };
        let mut token = code.encode();
        token.truncate(token.len() - 4);
        assert!(ScanCode::decode(&token).is_err());
    }

    #[test]
    fn unit_ids_carry_prefix_and_differ() {
        let a = mint_unit_id("TCK");
        let b = mint_unit_id("TCK");
        assert!(a.starts_with("TCK-"));
        assert_ne!(a, b);
    }

    #[test]
    fn base36_encodes_known_values() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }
}
