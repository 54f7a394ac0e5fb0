//! Pairing wire message shapes (`spec.md` §4.12) and QR code payload.
//!
//! The state machine that drives these messages lives in
//! [`crate::pairing`]; this module only owns the on-wire shapes and their
//! encoding.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine as _};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{EphemeralSecret, PublicKey};
use crate::protocol::envelope::DevicePlatform;
use crate::{Error, Result};

/// QR/deep-link payload a host displays to start pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingQrData {
    pub session_id: Uuid,
    pub pubkey: [u8; 32],
    pub host: String,
    pub port: u16,
    pub name: String,
    /// Unix epoch seconds after which the QR is rejected (`spec.md` §4.12).
    pub expires_at: i64,
    /// Base64 Ed25519 signature over the canonical JSON with this field set
    /// to the empty string (`spec.md` §4.12). Empty until `sign` is called.
    #[serde(default)]
    pub signature: String,
}

impl PairingQrData {
    pub fn new(
        session_id: Uuid,
        pubkey: [u8; 32],
        host: impl Into<String>,
        port: u16,
        name: impl Into<String>,
        expires_at: i64,
    ) -> Self {
        Self {
            session_id,
            pubkey,
            host: host.into(),
            port,
            name: name.into(),
            expires_at,
            signature: String::new(),
        }
    }

    /// Sign the canonical (`signature=""`) form and store the result.
    pub fn sign(&mut self, signing_key: &crate::crypto::SigningKey) -> Result<()> {
        let canonical = self.canonical_bytes()?;
        let sig = signing_key.sign(&canonical);
        self.signature = BASE64URL.encode(sig);
        Ok(())
    }

    /// Verify `signature` against `verifying_key` over the canonical form.
    pub fn verify(&self, verifying_key: &crate::crypto::VerifyingKey) -> Result<()> {
        let canonical = self.canonical_bytes()?;
        let sig_bytes = BASE64URL
            .decode(&self.signature)
            .map_err(|_| Error::InvalidSignature)?;
        verifying_key
            .verify(&canonical, &sig_bytes)
            .map_err(|_| Error::InvalidSignature)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }

    pub fn to_url(&self) -> String {
        let pubkey_b64 = BASE64URL.encode(self.pubkey);
        format!(
            "omniclip://pair?s={}&k={}&h={}&p={}&n={}&e={}&g={}",
            self.session_id,
            pubkey_b64,
            urlencoding::encode(&self.host),
            self.port,
            urlencoding::encode(&self.name),
            self.expires_at,
            urlencoding::encode(&self.signature),
        )
    }

    pub fn from_url(url: &str) -> Result<Self> {
        let query = url
            .strip_prefix("omniclip://pair?")
            .ok_or_else(|| Error::InvalidMessage("invalid scheme".to_string()))?;

        let mut session_id = None;
        let mut pubkey = None;
        let mut host = None;
        let mut port = None;
        let mut name = None;
        let mut expires_at = None;
        let mut signature = String::new();

        for part in query.split('&') {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::InvalidMessage("invalid param".to_string()))?;

            match key {
                "s" => {
                    session_id = Some(
                        Uuid::parse_str(value)
                            .map_err(|_| Error::InvalidMessage("invalid session id".to_string()))?,
                    )
                }
                "k" => {
                    let bytes = BASE64URL
                        .decode(value)
                        .map_err(|_| Error::InvalidMessage("invalid pubkey".to_string()))?;
                    let arr: [u8; 32] = bytes
                        .try_into()
                        .map_err(|_| Error::InvalidMessage("invalid pubkey length".to_string()))?;
                    pubkey = Some(arr);
                }
                "h" => {
                    host = Some(
                        urlencoding::decode(value)
                            .map_err(|_| Error::InvalidMessage("invalid host".to_string()))?
                            .to_string(),
                    )
                }
                "p" => {
                    port = Some(
                        value
                            .parse()
                            .map_err(|_| Error::InvalidMessage("invalid port".to_string()))?,
                    )
                }
                "n" => {
                    name = Some(
                        urlencoding::decode(value)
                            .map_err(|_| Error::InvalidMessage("invalid name".to_string()))?
                            .to_string(),
                    )
                }
                "e" => {
                    expires_at = Some(
                        value
                            .parse()
                            .map_err(|_| Error::InvalidMessage("invalid expiry".to_string()))?,
                    )
                }
                "g" => {
                    signature = urlencoding::decode(value)
                        .map_err(|_| Error::InvalidMessage("invalid signature".to_string()))?
                        .to_string()
                }
                _ => {}
            }
        }

        Ok(Self {
            session_id: session_id
                .ok_or_else(|| Error::InvalidMessage("missing session_id".to_string()))?,
            pubkey: pubkey.ok_or_else(|| Error::InvalidMessage("missing pubkey".to_string()))?,
            host: host.ok_or_else(|| Error::InvalidMessage("missing host".to_string()))?,
            port: port.ok_or_else(|| Error::InvalidMessage("missing port".to_string()))?,
            name: name.ok_or_else(|| Error::InvalidMessage("missing name".to_string()))?,
            expires_at: expires_at
                .ok_or_else(|| Error::InvalidMessage("missing expiry".to_string()))?,
            signature,
        })
    }

    /// Canonical JSON used by the Ed25519 signature, with `signature`
    /// omitted (`spec.md` §4.12: "verify the QR signature ... over the
    /// canonical JSON with signature=\"\"").
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut canonical = self.clone();
        canonical.signature.clear();
        serde_json::to_vec(&canonical).map_err(|e| Error::SerializationFailure(e.to_string()))
    }

    pub fn to_qr_svg(&self) -> Result<String> {
        use qrcode::{render::svg, QrCode};

        let url = self.to_url();
        let code = QrCode::new(url.as_bytes())
            .map_err(|e| Error::Crypto(format!("QR generation failed: {e}")))?;

        Ok(code.render::<svg::Color>().min_dimensions(200, 200).build())
    }
}

/// The initiator's pairing challenge (`spec.md` §4.12).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingChallenge {
    pub challenge_id: Uuid,
    pub initiator_device_id: Uuid,
    pub initiator_device_name: String,
    pub initiator_platform: Option<DevicePlatform>,
    #[serde(with = "crate::crypto::serde_utils::base64_array_32")]
    pub initiator_pub_key: [u8; 32],
    #[serde(with = "crate::crypto::serde_utils::base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "crate::crypto::serde_utils::base64_array_12")]
    pub nonce: [u8; 12],
    #[serde(with = "crate::crypto::serde_utils::base64_array_16")]
    pub tag: [u8; 16],
    pub timestamp: i64,
}

/// Plaintext carried inside [`PairingChallenge::ciphertext`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengePayload {
    /// Random nonce proving possession of the derived key; echoed back
    /// (hashed) in the ack.
    pub challenge: String,
}

/// The host's pairing acknowledgement (`spec.md` §4.12).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingAck {
    pub challenge_id: Uuid,
    pub mac_device_id: Uuid,
    pub mac_device_name: String,
    #[serde(with = "crate::crypto::serde_utils::base64_array_12")]
    pub nonce: [u8; 12],
    #[serde(with = "crate::crypto::serde_utils::base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "crate::crypto::serde_utils::base64_array_16")]
    pub tag: [u8; 16],
}

/// Plaintext carried inside [`PairingAck::ciphertext`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    #[serde(with = "crate::crypto::serde_utils::base64_array_32")]
    pub response_hash: [u8; 32],
    pub issued_at: i64,
}

/// An ephemeral X25519 keypair plus the session id it belongs to, held by
/// whichever side generated it until the handshake completes.
pub struct PairingKeyMaterial {
    pub session_id: Uuid,
    pub ephemeral_secret: EphemeralSecret,
    pub ephemeral_public: PublicKey,
}

impl PairingKeyMaterial {
    pub fn new(session_id: Uuid) -> Self {
        let ephemeral_secret = EphemeralSecret::generate();
        let ephemeral_public = ephemeral_secret.public_key();
        Self {
            session_id,
            ephemeral_secret,
            ephemeral_public,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qr_url_roundtrip() {
        let qr = PairingQrData::new(
            Uuid::new_v4(),
            [9u8; 32],
            "192.168.1.50",
            7010,
            "My Mac",
            1_900_000_000,
        );
        let url = qr.to_url();
        let parsed = PairingQrData::from_url(&url).unwrap();
        assert_eq!(parsed.session_id, qr.session_id);
        assert_eq!(parsed.pubkey, qr.pubkey);
        assert_eq!(parsed.host, qr.host);
        assert_eq!(parsed.port, qr.port);
        assert_eq!(parsed.name, qr.name);
        assert_eq!(parsed.expires_at, qr.expires_at);
    }

    #[test]
    fn qr_expiry_check() {
        let qr = PairingQrData::new(Uuid::new_v4(), [0u8; 32], "h", 1, "n", 1000);
        assert!(!qr.is_expired(999));
        assert!(qr.is_expired(1001));
    }

    #[test]
    fn qr_signature_verifies_and_rejects_tampering() {
        let signing_key = crate::crypto::SigningKey::generate();
        let mut qr = PairingQrData::new(Uuid::new_v4(), [1u8; 32], "host", 7010, "Phone", 2_000_000_000);
        qr.sign(&signing_key).unwrap();
        assert!(qr.verify(&signing_key.verifying_key()).is_ok());

        let mut tampered = qr.clone();
        tampered.port = 9999;
        assert!(tampered.verify(&signing_key.verifying_key()).is_err());
    }

    #[test]
    fn qr_url_roundtrip_preserves_signature() {
        let signing_key = crate::crypto::SigningKey::generate();
        let mut qr = PairingQrData::new(Uuid::new_v4(), [2u8; 32], "host", 7010, "Phone", 2_000_000_000);
        qr.sign(&signing_key).unwrap();

        let url = qr.to_url();
        let parsed = PairingQrData::from_url(&url).unwrap();
        assert_eq!(parsed.signature, qr.signature);
        assert!(parsed.verify(&signing_key.verifying_key()).is_ok());
    }
}
