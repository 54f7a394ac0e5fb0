//! The normative wire schema from `spec.md` §3/§6: `SyncEnvelope`,
//! `EnvelopePayload`, and the inner `ClipboardPayload` carried inside the
//! ciphertext.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::constants::PROTOCOL_VERSION;
use crate::crypto::{NONCE_LEN, TAG_LEN};

/// A lower-cased UUID string uniquely identifying a host instance.
/// Comparisons are case-insensitive by construction: the value is always
/// stored folded to lowercase.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, Hash, PartialEq)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().to_lowercase())
    }

    pub fn random() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for DeviceId {
    fn from(id: Uuid) -> Self {
        Self::new(id.to_string())
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePlatform {
    Macos,
    Android,
    Ios,
    Windows,
    Linux,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Heic,
    Heif,
    Gif,
    Webp,
    Bmp,
    Tiff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportOrigin {
    Lan,
    Cloud,
}

/// Tagged clipboard content variants, `spec.md` §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "content_type", rename_all = "lowercase")]
pub enum ClipboardContent {
    Text { text: String },
    Link { url: String },
    Image {
        pixel_width: u32,
        pixel_height: u32,
        byte_size: u64,
        format: ImageFormat,
        alt_text: Option<String>,
        bytes: Vec<u8>,
        thumbnail: Option<Vec<u8>>,
        local_path: Option<String>,
    },
    File {
        name: String,
        byte_size: u64,
        uti_or_mime: String,
        source_url: Option<String>,
        inline_bytes: Option<Vec<u8>>,
        local_path: Option<String>,
    },
}

impl ClipboardContent {
    pub fn content_type(&self) -> &'static str {
        match self {
            ClipboardContent::Text { .. } => "text",
            ClipboardContent::Link { .. } => "link",
            ClipboardContent::Image { .. } => "image",
            ClipboardContent::File { .. } => "file",
        }
    }

    /// Semantic-equality test used by the History Store's dedup rule
    /// (`spec.md` §3: "same text bytes, same URL string, same image sha256 ...
    /// or same file name + byte size").
    pub fn matches(&self, other: &ClipboardContent) -> bool {
        use ClipboardContent::*;
        match (self, other) {
            (Text { text: a }, Text { text: b }) => a == b,
            (Link { url: a }, Link { url: b }) => a == b,
            (
                Image { bytes: a, .. },
                Image { bytes: b, .. },
            ) => a == b || sha256_hex(a) == sha256_hex(b),
            (
                File { name: n1, byte_size: s1, .. },
                File { name: n2, byte_size: s2, .. },
            ) => n1 == n2 && s1 == s2,
            _ => false,
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A single clipboard history row, `spec.md` §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipboardEntry {
    pub id: Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub device_id: DeviceId,
    pub origin_platform: Option<DevicePlatform>,
    pub origin_device_name: Option<String>,
    pub content: ClipboardContent,
    pub is_pinned: bool,
    pub is_encrypted: bool,
    pub transport_origin: Option<TransportOrigin>,
}

impl ClipboardEntry {
    pub fn matches(&self, other: &ClipboardEntry) -> bool {
        self.content.matches(&other.content)
    }

    /// `true` for entries produced locally (never forwarded again,
    /// `spec.md` §4.14 "Local vs. remote enforcement").
    pub fn is_local(&self) -> bool {
        self.transport_origin.is_none()
    }
}

/// The wire payload carried inside the ciphertext (`spec.md` §3/§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipboardPayload {
    pub content_type: String,
    /// Raw content bytes, base64-encoded on the wire.
    #[serde(rename = "data_base64", with = "crate::crypto::serde_utils::base64_bytes")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub compressed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    Clipboard,
    Control,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionInfo {
    pub algorithm: String,
    #[serde(with = "crate::crypto::serde_utils::base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "crate::crypto::serde_utils::base64_bytes")]
    pub tag: Vec<u8>,
}

impl EncryptionInfo {
    pub fn new(nonce: [u8; NONCE_LEN], tag: [u8; TAG_LEN]) -> Self {
        Self {
            algorithm: "AES-256-GCM".to_string(),
            nonce: nonce.to_vec(),
            tag: tag.to_vec(),
        }
    }

    /// Plaintext mode is signaled by empty nonce/tag (`spec.md` §4.6/§6).
    pub fn plaintext() -> Self {
        Self {
            algorithm: "AES-256-GCM".to_string(),
            nonce: Vec::new(),
            tag: Vec::new(),
        }
    }

    pub fn is_plaintext(&self) -> bool {
        self.nonce.is_empty() || self.tag.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopePayload {
    pub content_type: String,
    #[serde(with = "crate::crypto::serde_utils::base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// Both the current field and the legacy one decode; only `device_id`
    /// is ever encoded (`spec.md` §9 open question).
    #[serde(alias = "origin_device_id")]
    pub device_id: DeviceId,
    pub device_platform: Option<DevicePlatform>,
    pub device_name: Option<String>,
    #[serde(default)]
    pub target: Option<DeviceId>,
    pub encryption: EncryptionInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub id: Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub payload: EnvelopePayload,
}

impl SyncEnvelope {
    pub fn new_clipboard(payload: EnvelopePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            version: PROTOCOL_VERSION.to_string(),
            kind: EnvelopeType::Clipboard,
            payload,
        }
    }

    /// `spec.md` §3 invariant: `payload.device_id != payload.target`.
    pub fn is_well_formed(&self) -> bool {
        match &self.payload.target {
            Some(target) => target != &self.payload.device_id,
            None => true,
        }
    }

    /// Target filtering used by both the LAN server (C9) and the
    /// orchestrator (C14): drop unless the target is unset or matches
    /// `local_id` (case-insensitively, by construction of `DeviceId`).
    pub fn targets(&self, local_id: &DeviceId) -> bool {
        match &self.payload.target {
            Some(target) => target == local_id,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_case_insensitive() {
        let a = DeviceId::new("ABCD-1234");
        let b = DeviceId::new("abcd-1234");
        assert_eq!(a, b);
    }

    #[test]
    fn legacy_origin_device_id_decodes() {
        let json = serde_json::json!({
            "content_type": "text",
            "ciphertext": "aGVsbG8=",
            "origin_device_id": "ABCD",
            "device_platform": null,
            "device_name": null,
            "target": null,
            "encryption": {"algorithm": "AES-256-GCM", "nonce": "", "tag": ""}
        });
        let payload: EnvelopePayload = serde_json::from_value(json).unwrap();
        assert_eq!(payload.device_id, DeviceId::new("abcd"));
    }

    #[test]
    fn plaintext_encryption_info_detected() {
        assert!(EncryptionInfo::plaintext().is_plaintext());
        assert!(!EncryptionInfo::new([0u8; 12], [0u8; 16]).is_plaintext());
    }

    #[test]
    fn envelope_target_filtering() {
        let local = DeviceId::new("local-device");
        let mut payload = EnvelopePayload {
            content_type: "text".into(),
            ciphertext: vec![],
            device_id: DeviceId::new("remote"),
            device_platform: None,
            device_name: None,
            target: Some(DeviceId::new("LOCAL-DEVICE")),
            encryption: EncryptionInfo::plaintext(),
        };
        let envelope = SyncEnvelope::new_clipboard(payload.clone());
        assert!(envelope.targets(&local));

        payload.target = Some(DeviceId::new("someone-else"));
        let envelope = SyncEnvelope::new_clipboard(payload);
        assert!(!envelope.targets(&local));
    }

    #[test]
    fn text_content_matches_by_value() {
        let a = ClipboardContent::Text { text: "hello".into() };
        let b = ClipboardContent::Text { text: "hello".into() };
        let c = ClipboardContent::Text { text: "world".into() };
        assert!(a.matches(&b));
        assert!(!a.matches(&c));
    }
}
