//! Frame Codec (C1) — 4-byte big-endian length prefix + UTF-8 JSON envelope
//! encode/decode (`spec.md` §4.1/§6).

use serde_json::Value;

use crate::error::Error;
use crate::protocol::constants::MAX_MESSAGE_SIZE;
use crate::protocol::envelope::SyncEnvelope;
use crate::Result;

/// Encode `envelope` as `| u32 big-endian length | JSON |`.
pub fn encode(envelope: &SyncEnvelope) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(envelope).map_err(|e| Error::BadJson(e.to_string()))?;
    if json.len() > MAX_MESSAGE_SIZE {
        return Err(Error::SizeLimitExceeded);
    }
    let mut frame = Vec::with_capacity(4 + json.len());
    frame.extend_from_slice(&(json.len() as u32).to_be_bytes());
    frame.extend_from_slice(&json);
    Ok(frame)
}

/// Decode a complete `| u32 big-endian length | JSON |` frame. Accepts both
/// `snake_case` and `camelCase` keys on the wire.
pub fn decode(buf: &[u8]) -> Result<SyncEnvelope> {
    if buf.len() < 4 {
        return Err(Error::FrameTruncated);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > buf.len().saturating_sub(4) {
        return Err(Error::BadFrameLength);
    }
    let body = &buf[4..4 + len];
    decode_body(body)
}

/// Encode a bare JSON envelope body (no length prefix) — used when the
/// transport already delimits messages itself (a WebSocket binary frame).
pub fn encode_body(envelope: &SyncEnvelope) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(envelope).map_err(|e| Error::BadJson(e.to_string()))?;
    if json.len() > MAX_MESSAGE_SIZE {
        return Err(Error::SizeLimitExceeded);
    }
    Ok(json)
}

/// Decode a bare JSON envelope body (no length prefix) — used when the
/// length framing has already been peeled off by a transport (e.g. a
/// WebSocket text/binary message).
pub fn decode_body(body: &[u8]) -> Result<SyncEnvelope> {
    let value: Value = serde_json::from_slice(body).map_err(|e| Error::BadJson(e.to_string()))?;
    let normalized = normalize_keys(value);
    serde_json::from_value(normalized).map_err(|e| Error::BadJson(e.to_string()))
}

/// Recursively rewrite camelCase object keys to snake_case so permissive
/// peers can send either convention (`spec.md` §4.1).
fn normalize_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(camel_to_snake(&k), normalize_keys(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_keys).collect()),
        other => other,
    }
}

fn camel_to_snake(key: &str) -> String {
    if !key.chars().any(|c| c.is_ascii_uppercase()) {
        return key.to_string();
    }
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Parse a bare-length prefix off a streamed buffer without requiring the
/// full frame to be present yet. Returns `None` when more bytes are needed.
pub fn peek_frame_len(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(Error::BadFrameLength);
    }
    Ok(Some(len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::{DeviceId, EncryptionInfo, EnvelopePayload};

    fn sample_envelope() -> SyncEnvelope {
        SyncEnvelope::new_clipboard(EnvelopePayload {
            content_type: "text".into(),
            ciphertext: b"hello".to_vec(),
            device_id: DeviceId::new("device-a"),
            device_platform: None,
            device_name: None,
            target: None,
            encryption: EncryptionInfo::plaintext(),
        })
    }

    #[test]
    fn encode_decode_roundtrip() {
        let envelope = sample_envelope();
        let frame = encode(&envelope).unwrap();
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.id, envelope.id);
        assert_eq!(decoded.payload.content_type, "text");
    }

    #[test]
    fn truncated_frame_rejected() {
        let err = decode(&[0, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::FrameTruncated));
    }

    #[test]
    fn bad_length_rejected() {
        let mut frame = vec![0xff, 0xff, 0xff, 0xff];
        frame.extend_from_slice(b"short");
        let err = decode(&frame).unwrap_err();
        assert!(matches!(err, Error::BadFrameLength));
    }

    #[test]
    fn camel_case_keys_accepted() {
        let body = serde_json::json!({
            "id": "11111111-1111-1111-1111-111111111111",
            "timestamp": "2024-01-01T00:00:00Z",
            "version": "1.0",
            "type": "clipboard",
            "payload": {
                "contentType": "text",
                "ciphertext": "aGVsbG8",
                "deviceId": "device-a",
                "devicePlatform": null,
                "deviceName": null,
                "target": null,
                "encryption": {"algorithm": "AES-256-GCM", "nonce": "", "tag": ""}
            }
        });
        let decoded = decode_body(&serde_json::to_vec(&body).unwrap()).unwrap();
        assert_eq!(decoded.payload.content_type, "text");
    }
}
