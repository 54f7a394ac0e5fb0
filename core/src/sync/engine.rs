//! Sync Engine (C6) — builds/parses envelopes, encrypts/decrypts,
//! compresses payloads (`spec.md` §4.6).

use std::io::{Read, Write};
use std::sync::Arc;

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::crypto;
use crate::error::{Error, Result};
use crate::keystore::KeyStore;
use crate::protocol::envelope::{
    ClipboardContent, ClipboardEntry, ClipboardPayload, DeviceId, DevicePlatform, EncryptionInfo,
    EnvelopePayload, ImageFormat, SyncEnvelope,
};

/// Encode a `ClipboardContent` into the wire `ClipboardPayload` shape
/// (`spec.md` §3): raw bytes plus content-type-specific metadata.
pub fn build_payload(content: &ClipboardContent, device_id: &DeviceId, device_name: &str) -> ClipboardPayload {
    let mut metadata = std::collections::HashMap::new();
    metadata.insert("device_id".to_string(), device_id.to_string());
    metadata.insert("device_name".to_string(), device_name.to_string());

    let (content_type, data) = match content {
        ClipboardContent::Text { text } => ("text", text.clone().into_bytes()),
        ClipboardContent::Link { url } => ("link", url.clone().into_bytes()),
        ClipboardContent::Image {
            pixel_width,
            pixel_height,
            format,
            bytes,
            ..
        } => {
            metadata.insert("width".to_string(), pixel_width.to_string());
            metadata.insert("height".to_string(), pixel_height.to_string());
            metadata.insert("format".to_string(), format_name(*format).to_string());
            ("image", bytes.clone())
        }
        ClipboardContent::File {
            name,
            uti_or_mime,
            inline_bytes,
            ..
        } => {
            metadata.insert("file_name".to_string(), name.clone());
            metadata.insert("uti".to_string(), uti_or_mime.clone());
            ("file", inline_bytes.clone().unwrap_or_default())
        }
    };

    ClipboardPayload {
        content_type: content_type.to_string(),
        data,
        metadata,
        compressed: false,
    }
}

fn format_name(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "png",
        ImageFormat::Jpeg => "jpeg",
        ImageFormat::Heic => "heic",
        ImageFormat::Heif => "heif",
        ImageFormat::Gif => "gif",
        ImageFormat::Webp => "webp",
        ImageFormat::Bmp => "bmp",
        ImageFormat::Tiff => "tiff",
    }
}

fn parse_format(name: &str) -> ImageFormat {
    match name {
        "jpeg" => ImageFormat::Jpeg,
        "heic" => ImageFormat::Heic,
        "heif" => ImageFormat::Heif,
        "gif" => ImageFormat::Gif,
        "webp" => ImageFormat::Webp,
        "bmp" => ImageFormat::Bmp,
        "tiff" => ImageFormat::Tiff,
        _ => ImageFormat::Png,
    }
}

/// Reverse of [`build_payload`]: reconstruct a `ClipboardContent` from a
/// decoded wire payload, used by the orchestrator (C14) on receipt.
pub fn parse_payload(payload: &ClipboardPayload) -> Result<ClipboardContent> {
    match payload.content_type.as_str() {
        "text" => Ok(ClipboardContent::Text {
            text: String::from_utf8(payload.data.clone()).map_err(|e| Error::InvalidMessage(e.to_string()))?,
        }),
        "link" => Ok(ClipboardContent::Link {
            url: String::from_utf8(payload.data.clone()).map_err(|e| Error::InvalidMessage(e.to_string()))?,
        }),
        "image" => {
            let pixel_width = payload.metadata.get("width").and_then(|v| v.parse().ok()).unwrap_or(0);
            let pixel_height = payload.metadata.get("height").and_then(|v| v.parse().ok()).unwrap_or(0);
            let format = parse_format(payload.metadata.get("format").map(|s| s.as_str()).unwrap_or("png"));
            Ok(ClipboardContent::Image {
                pixel_width,
                pixel_height,
                byte_size: payload.data.len() as u64,
                format,
                alt_text: None,
                bytes: payload.data.clone(),
                thumbnail: None,
                local_path: None,
            })
        }
        "file" => Ok(ClipboardContent::File {
            name: payload.metadata.get("file_name").cloned().unwrap_or_default(),
            byte_size: payload.data.len() as u64,
            uti_or_mime: payload.metadata.get("uti").cloned().unwrap_or_default(),
            source_url: None,
            inline_bytes: Some(payload.data.clone()),
            local_path: None,
        }),
        other => Err(Error::InvalidMessage(format!("unknown content_type: {other}"))),
    }
}

fn deflate(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .map_err(|e| Error::Crypto(format!("deflate failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| Error::Crypto(format!("deflate failed: {e}")))
}

fn inflate(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Crypto(format!("inflate failed: {e}")))?;
    Ok(out)
}

/// Whether plaintext (unencrypted) mode is allowed for this engine instance
/// (`spec.md` §4.6 "explicitly gated by a configuration flag").
#[derive(Clone, Copy, Debug)]
pub struct PlaintextPolicy {
    pub allow: bool,
}

impl Default for PlaintextPolicy {
    fn default() -> Self {
        Self { allow: false }
    }
}

pub struct SyncEngine {
    keystore: Arc<KeyStore>,
    local_device_id: DeviceId,
    local_platform: DevicePlatform,
    local_device_name: String,
    plaintext: PlaintextPolicy,
}

impl SyncEngine {
    pub fn new(
        keystore: Arc<KeyStore>,
        local_device_id: DeviceId,
        local_platform: DevicePlatform,
        local_device_name: String,
        plaintext: PlaintextPolicy,
    ) -> Self {
        Self {
            keystore,
            local_device_id,
            local_platform,
            local_device_name,
            plaintext,
        }
    }

    /// Build the encrypted envelope to hand to a transport's `send`
    /// (`spec.md` §4.6 steps 1-6).
    pub async fn transmit(&self, entry: &ClipboardEntry, target: DeviceId) -> Result<SyncEnvelope> {
        let mut payload = build_payload(&entry.content, &entry.device_id, &self.local_device_name);
        let payload_json =
            serde_json::to_vec(&payload).map_err(|e| Error::SerializationFailure(e.to_string()))?;
        let compressed_json = deflate(&payload_json)?;
        payload.compressed = true;

        let aad = entry.device_id.as_str().as_bytes();
        let encryption = if self.plaintext.allow && !self.keystore.has(target.as_str()).await {
            tracing::warn!(target = %target, "sending in plaintext mode: no key on file");
            EncryptionInfo::plaintext()
        } else {
            let key = self.keystore.require(target.as_str()).await?;
            let sealed = crypto::encrypt(&compressed_json, &key, aad)?;
            return Ok(SyncEnvelope::new_clipboard(EnvelopePayload {
                content_type: payload.content_type,
                ciphertext: sealed.ciphertext,
                device_id: entry.device_id.clone(),
                device_platform: entry.origin_platform.or(Some(self.local_platform)),
                device_name: Some(self.local_device_name.clone()),
                target: Some(target),
                encryption: EncryptionInfo::new(sealed.nonce, sealed.tag),
            }));
        };

        Ok(SyncEnvelope::new_clipboard(EnvelopePayload {
            content_type: payload.content_type,
            ciphertext: compressed_json,
            device_id: entry.device_id.clone(),
            device_platform: entry.origin_platform.or(Some(self.local_platform)),
            device_name: Some(self.local_device_name.clone()),
            target: Some(target),
            encryption,
        }))
    }

    /// Decode a received frame into its inner `ClipboardPayload`
    /// (`spec.md` §4.6 `decode`).
    pub async fn decode(&self, envelope: &SyncEnvelope) -> Result<ClipboardPayload> {
        let compressed_json = if envelope.payload.encryption.is_plaintext() {
            if !self.plaintext.allow {
                tracing::warn!("received plaintext envelope but plaintext mode is disabled");
            }
            envelope.payload.ciphertext.clone()
        } else {
            let key = self.keystore.require(envelope.payload.device_id.as_str()).await?;
            let nonce: [u8; 12] = envelope
                .payload
                .encryption
                .nonce
                .clone()
                .try_into()
                .map_err(|_| Error::BadNonceLength)?;
            let tag: [u8; 16] = envelope
                .payload
                .encryption
                .tag
                .clone()
                .try_into()
                .map_err(|_| Error::Crypto("tag must be 16 bytes".into()))?;
            let aad = envelope.payload.device_id.as_str().as_bytes();
            crypto::decrypt(&envelope.payload.ciphertext, &key, &nonce, &tag, aad)?
        };

        let json = inflate(&compressed_json)?;
        serde_json::from_slice(&json).map_err(|e| Error::SerializationFailure(e.to_string()))
    }

    pub fn local_device_id(&self) -> &DeviceId {
        &self.local_device_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::SymmetricKey;
    use chrono::Utc;
    use uuid::Uuid;

    async fn engine_with_key(local: &str, peer: &str) -> SyncEngine {
        let keystore = Arc::new(KeyStore::in_memory());
        keystore
            .store(peer, SymmetricKey::from_bytes([4u8; 32]))
            .await
            .unwrap();
        SyncEngine::new(
            keystore,
            DeviceId::new(local),
            DevicePlatform::Linux,
            "test-host".to_string(),
            PlaintextPolicy::default(),
        )
    }

    fn text_entry(device: &str, text: &str) -> ClipboardEntry {
        ClipboardEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            device_id: DeviceId::new(device),
            origin_platform: None,
            origin_device_name: None,
            content: ClipboardContent::Text { text: text.to_string() },
            is_pinned: false,
            is_encrypted: true,
            transport_origin: None,
        }
    }

    #[tokio::test]
    async fn transmit_then_decode_roundtrips() {
        let engine = engine_with_key("local-dev", "peer-dev").await;
        let entry = text_entry("local-dev", "hello there");
        let envelope = engine.transmit(&entry, DeviceId::new("peer-dev")).await.unwrap();

        // simulate the peer decoding: it needs the same key under the
        // sender's id, mirroring how a real peer's keystore is populated.
        let peer_keystore = Arc::new(KeyStore::in_memory());
        peer_keystore
            .store("local-dev", SymmetricKey::from_bytes([4u8; 32]))
            .await
            .unwrap();
        let peer_engine = SyncEngine::new(
            peer_keystore,
            DeviceId::new("peer-dev"),
            DevicePlatform::Macos,
            "peer-host".to_string(),
            PlaintextPolicy::default(),
        );

        let payload = peer_engine.decode(&envelope).await.unwrap();
        assert_eq!(payload.content_type, "text");
        assert_eq!(payload.data, b"hello there");
    }

    #[tokio::test]
    async fn missing_key_surfaces_error() {
        let engine = SyncEngine::new(
            Arc::new(KeyStore::in_memory()),
            DeviceId::new("local-dev"),
            DevicePlatform::Linux,
            "test-host".to_string(),
            PlaintextPolicy::default(),
        );
        let entry = text_entry("local-dev", "hello");
        let err = engine.transmit(&entry, DeviceId::new("no-key-peer")).await.unwrap_err();
        assert!(matches!(err, Error::MissingKey(_)));
    }

    #[tokio::test]
    async fn plaintext_mode_used_when_allowed_and_no_key() {
        let engine = SyncEngine::new(
            Arc::new(KeyStore::in_memory()),
            DeviceId::new("local-dev"),
            DevicePlatform::Linux,
            "test-host".to_string(),
            PlaintextPolicy { allow: true },
        );
        let entry = text_entry("local-dev", "plain");
        let envelope = engine.transmit(&entry, DeviceId::new("peer-dev")).await.unwrap();
        assert!(envelope.payload.encryption.is_plaintext());

        let payload = engine.decode(&envelope).await.unwrap();
        assert_eq!(payload.data, b"plain");
    }

    #[test]
    fn parse_payload_reverses_build_payload_for_text() {
        let content = ClipboardContent::Text { text: "round trip me".to_string() };
        let payload = build_payload(&content, &DeviceId::new("dev"), "name");
        let parsed = parse_payload(&payload).unwrap();
        assert!(content.matches(&parsed));
    }

    #[test]
    fn parse_payload_reverses_build_payload_for_image() {
        let content = ClipboardContent::Image {
            pixel_width: 64,
            pixel_height: 32,
            byte_size: 3,
            format: ImageFormat::Jpeg,
            alt_text: None,
            bytes: vec![9, 9, 9],
            thumbnail: None,
            local_path: None,
        };
        let payload = build_payload(&content, &DeviceId::new("dev"), "name");
        let parsed = parse_payload(&payload).unwrap();
        match parsed {
            ClipboardContent::Image { pixel_width, pixel_height, format, bytes, .. } => {
                assert_eq!(pixel_width, 64);
                assert_eq!(pixel_height, 32);
                assert_eq!(format, ImageFormat::Jpeg);
                assert_eq!(bytes, vec![9, 9, 9]);
            }
            other => panic!("expected image, got {other:?}"),
        }
    }

    #[test]
    fn build_payload_preserves_image_metadata() {
        let content = ClipboardContent::Image {
            pixel_width: 100,
            pixel_height: 50,
            byte_size: 42,
            format: ImageFormat::Png,
            alt_text: None,
            bytes: vec![1, 2, 3],
            thumbnail: None,
            local_path: None,
        };
        let payload = build_payload(&content, &DeviceId::new("dev"), "name");
        assert_eq!(payload.metadata.get("width").unwrap(), "100");
        assert_eq!(payload.metadata.get("format").unwrap(), "png");
    }
}
