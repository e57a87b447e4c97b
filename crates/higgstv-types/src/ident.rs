//! Identifier canonicalization.
//!
//! Source data carries identifiers as raw 16-byte binaries, base64 strings
//! and hex strings with or without hyphens. Everything that decodes to 16
//! bytes is stored as 32 uppercase hex characters; anything else is an opaque
//! identifier and is kept as-is.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use serde_json::Value;
use uuid::Uuid;

/// Mint a fresh identifier in canonical form.
pub fn new_id() -> String {
    canonical(Uuid::new_v4().as_bytes())
}

pub fn canonical(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Canonicalize an identifier as it appears in a stored document.
pub fn normalize_id(value: &Value) -> String {
    match value {
        Value::String(s) => normalize_id_str(s),
        Value::Object(map) => {
            if let Some(bytes) = map.get("$binary").and_then(binary_payload) {
                return canonical(&bytes);
            }
            if let Some(Value::String(u)) = map.get("$uuid") {
                return normalize_id_str(u);
            }
            if let Some(Value::String(oid)) = map.get("$oid") {
                return oid.clone();
            }
            value.to_string()
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn normalize_id_str(raw: &str) -> String {
    let s = raw.trim();

    if let Ok(uuid) = Uuid::parse_str(s) {
        return canonical(uuid.as_bytes());
    }

    // 16 bytes of base64 are 24 chars padded or 22 unpadded
    if s.len() == 22 || s.len() == 24 {
        if let Some(bytes) = decode_base64(s).filter(|b| b.len() == 16) {
            return canonical(&bytes);
        }
    }

    s.to_string()
}

/// True when the value already is 32 uppercase hex characters.
pub fn is_canonical(id: &str) -> bool {
    id.len() == 32 && id.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}

fn decode_base64(s: &str) -> Option<Vec<u8>> {
    [&STANDARD, &URL_SAFE, &STANDARD_NO_PAD, &URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(s).ok())
}

// Extended JSON v2 is {"$binary": {"base64": "..", "subType": ".."}},
// v1 is {"$binary": "..", "$type": ".."}.
fn binary_payload(binary: &Value) -> Option<Vec<u8>> {
    let encoded = match binary {
        Value::String(s) => s.as_str(),
        Value::Object(inner) => inner.get("base64")?.as_str()?,
        _ => return None,
    };
    decode_base64(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BYTES: [u8; 16] = [
        0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x0f, 0xed, 0xcb, 0xa9, 0x87, 0x65, 0x43, 0x21,
    ];
    const CANONICAL: &str = "123456789ABCDEF00FEDCBA987654321";

    #[test]
    fn test_all_encodings_agree() {
        let b64 = STANDARD.encode(BYTES);
        let b64_url = URL_SAFE_NO_PAD.encode(BYTES);
        let binary = json!({"$binary": {"base64": b64, "subType": "04"}});
        let legacy = json!({"$binary": b64, "$type": "04"});

        assert_eq!(normalize_id(&binary), CANONICAL);
        assert_eq!(normalize_id(&legacy), CANONICAL);
        assert_eq!(normalize_id_str(&b64), CANONICAL);
        assert_eq!(normalize_id_str(&b64_url), CANONICAL);
        assert_eq!(normalize_id_str("12345678-9abc-def0-0fed-cba987654321"), CANONICAL);
        assert_eq!(normalize_id_str("123456789abcdef00fedcba987654321"), CANONICAL);
        assert_eq!(normalize_id(&json!({"$uuid": "12345678-9abc-def0-0fed-cba987654321"})), CANONICAL);
    }

    #[test]
    fn test_idempotent() {
        assert_eq!(normalize_id_str(CANONICAL), CANONICAL);
        let minted = new_id();
        assert!(is_canonical(&minted));
        assert_eq!(normalize_id_str(&minted), minted);
    }

    #[test]
    fn test_opaque_ids_pass_through() {
        assert_eq!(normalize_id_str("  legacy-user-7 "), "legacy-user-7");
        assert_eq!(normalize_id(&json!({"$oid": "65a1f0c2e4b0a1b2c3d4e5f6"})), "65a1f0c2e4b0a1b2c3d4e5f6");
        assert_eq!(normalize_id(&json!(42)), "42");
        assert_eq!(normalize_id(&Value::Null), "");
    }

    #[test]
    fn test_is_canonical() {
        assert!(is_canonical(CANONICAL));
        assert!(!is_canonical("123456789abcdef00fedcba987654321"));
        assert!(!is_canonical("short"));
    }
}
