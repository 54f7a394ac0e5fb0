//! Pairing Session (C12) — the state machine that drives the challenge/ack
//! handshake described by `crate::protocol::pairing`'s wire shapes
//! (`spec.md` §4.12).
//!
//! Host side: `PairingSession::host` displays a signed QR, then
//! `handle_challenge` answers the initiator's ECDH challenge. Initiator
//! side: `PairingSession::from_qr` verifies the QR and builds the challenge;
//! `verify_ack` confirms the host's reply before trusting the derived key.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::crypto::{self, PublicKey, SigningKey, VerifyingKey};
use crate::error::{Error, Result};
use crate::keystore::{KeyStore, SymmetricKey};
use crate::protocol::constants::{CHALLENGE_WINDOW_SECS, QR_VALIDITY_SECS, REPLAY_WINDOW_SIZE, SESSION_KEY_INFO};
use crate::protocol::envelope::{DeviceId, DevicePlatform};
use crate::protocol::pairing::{
    AckPayload, ChallengePayload, PairingAck, PairingChallenge, PairingKeyMaterial, PairingQrData,
};

pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingStatus {
    Displaying,
    AwaitingChallenge,
    AwaitingAck,
    Completed { peer_device_id: DeviceId },
    Failed { reason: String },
}

/// Drives one pairing attempt. A fresh instance is created per QR display
/// (host) or per scan (initiator); it is never reused across attempts.
pub struct PairingSession {
    status: Mutex<PairingStatus>,
    /// Host side only: holds the ephemeral keypair until `handle_challenge`
    /// consumes it for the one ECDH this session ever does. `diffie_hellman`
    /// takes `EphemeralSecret` by value, so it has to be taken out of the
    /// mutex rather than borrowed.
    key_material: Mutex<Option<PairingKeyMaterial>>,
    /// Set once ECDH has run, on whichever side ran it.
    derived_key: Mutex<Option<SymmetricKey>>,
    seen_challenges: Mutex<VecDeque<Uuid>>,
    local_device_id: DeviceId,
    local_device_name: String,
    #[allow(dead_code)]
    local_platform: DevicePlatform,
    /// Initiator side only: the plaintext challenge nonce sent out, kept so
    /// `verify_ack` can check `response_hash == SHA256(challenge)`.
    sent_challenge: Option<String>,
}

impl PairingSession {
    /// Host side: generate an ephemeral keypair and a signed, time-limited
    /// QR payload advertising `host`/`port` (`spec.md` §4.12).
    pub fn host(
        local_device_id: DeviceId,
        local_device_name: String,
        local_platform: DevicePlatform,
        signing_key: &SigningKey,
        host: impl Into<String>,
        port: u16,
    ) -> (Self, PairingQrData) {
        let session_id = Uuid::new_v4();
        let key_material = PairingKeyMaterial::new(session_id);
        let mut qr = PairingQrData::new(
            session_id,
            key_material.ephemeral_public.to_bytes(),
            host,
            port,
            local_device_name.clone(),
            now_epoch() + QR_VALIDITY_SECS,
        );
        qr.sign(signing_key)
            .expect("signing a freshly built QR payload cannot fail");

        let session = Self {
            status: Mutex::new(PairingStatus::AwaitingChallenge),
            key_material: Mutex::new(Some(key_material)),
            derived_key: Mutex::new(None),
            seen_challenges: Mutex::new(VecDeque::with_capacity(REPLAY_WINDOW_SIZE)),
            local_device_id,
            local_device_name,
            local_platform,
            sent_challenge: None,
        };
        (session, qr)
    }

    /// Initiator side: verify the scanned QR, run ECDH against the host's
    /// ephemeral public key, and build the outbound challenge.
    pub fn from_qr(
        qr: &PairingQrData,
        host_verifying_key: &VerifyingKey,
        local_device_id: DeviceId,
        local_device_name: String,
        local_platform: DevicePlatform,
    ) -> Result<(Self, PairingChallenge)> {
        qr.verify(host_verifying_key)?;
        if qr.is_expired(now_epoch()) {
            return Err(Error::PayloadExpired);
        }

        let key_material = PairingKeyMaterial::new(qr.session_id);
        let our_ephemeral_public = key_material.ephemeral_public.to_bytes();
        let shared = key_material
            .ephemeral_secret
            .diffie_hellman(&PublicKey::from_bytes(qr.pubkey));
        let derived = crypto::derive_session_key(shared.as_bytes(), SESSION_KEY_INFO)?;

        let mut nonce_bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let challenge_nonce = BASE64.encode(nonce_bytes);

        let payload = ChallengePayload {
            challenge: challenge_nonce.clone(),
        };
        let plaintext =
            serde_json::to_vec(&payload).map_err(|e| Error::SerializationFailure(e.to_string()))?;
        let aad = local_device_id.as_str().as_bytes();
        let sealed = crypto::encrypt(&plaintext, &derived, aad)?;

        let initiator_device_id = Uuid::parse_str(local_device_id.as_str())
            .map_err(|e| Error::InvalidMessage(format!("local device id is not a uuid: {e}")))?;

        let challenge = PairingChallenge {
            challenge_id: Uuid::new_v4(),
            initiator_device_id,
            initiator_device_name: local_device_name.clone(),
            initiator_platform: Some(local_platform),
            initiator_pub_key: our_ephemeral_public,
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce,
            tag: sealed.tag,
            timestamp: now_epoch(),
        };

        let session = Self {
            status: Mutex::new(PairingStatus::AwaitingAck),
            key_material: Mutex::new(None),
            derived_key: Mutex::new(Some(derived)),
            seen_challenges: Mutex::new(VecDeque::with_capacity(REPLAY_WINDOW_SIZE)),
            local_device_id,
            local_device_name,
            local_platform,
            sent_challenge: Some(challenge_nonce),
        };

        Ok((session, challenge))
    }

    pub fn status(&self) -> PairingStatus {
        self.status.lock().unwrap().clone()
    }

    fn set_status(&self, status: PairingStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// Reject a challenge whose `challenge_id` has already been handled, and
    /// remember this one. Bounded to `REPLAY_WINDOW_SIZE` entries.
    fn record_challenge_id(&self, id: Uuid) -> Result<()> {
        let mut seen = self.seen_challenges.lock().unwrap();
        if seen.contains(&id) {
            return Err(Error::DuplicateChallenge);
        }
        if seen.len() >= REPLAY_WINDOW_SIZE {
            seen.pop_front();
        }
        seen.push_back(id);
        Ok(())
    }

    /// Host side: answer the initiator's challenge. Runs the one ECDH this
    /// session ever performs, decrypts the challenge nonce, and returns a
    /// signed-by-key ack. On success, persists the derived key into
    /// `keystore` under the initiator's device id and completes the
    /// session.
    pub async fn handle_challenge(
        &self,
        challenge: &PairingChallenge,
        keystore: &KeyStore,
    ) -> Result<PairingAck> {
        self.record_challenge_id(challenge.challenge_id)?;

        let now = now_epoch();
        if (now - challenge.timestamp).abs() > CHALLENGE_WINDOW_SECS {
            self.set_status(PairingStatus::Failed {
                reason: "challenge window too old".to_string(),
            });
            return Err(Error::ChallengeWindowTooOld);
        }

        let key_material = self
            .key_material
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::InvalidChallengePayload(
                "session has already answered a challenge".to_string(),
            ))?;

        let shared = key_material
            .ephemeral_secret
            .diffie_hellman(&PublicKey::from_bytes(challenge.initiator_pub_key));
        let derived = crypto::derive_session_key(shared.as_bytes(), SESSION_KEY_INFO)?;
        *self.derived_key.lock().unwrap() = Some(derived.clone());

        let initiator_device_id = DeviceId::from(challenge.initiator_device_id);
        let aad = initiator_device_id.as_str().as_bytes();
        let plaintext = crypto::decrypt(&challenge.ciphertext, &derived, &challenge.nonce, &challenge.tag, aad)
            .map_err(|e| {
                self.set_status(PairingStatus::Failed {
                    reason: "challenge decryption failed".to_string(),
                });
                e
            })?;
        let challenge_payload: ChallengePayload = serde_json::from_slice(&plaintext)
            .map_err(|e| Error::InvalidChallengePayload(e.to_string()))?;

        let response_hash = sha256(challenge_payload.challenge.as_bytes());
        let ack_payload = AckPayload {
            response_hash,
            issued_at: now_epoch(),
        };
        let ack_plaintext =
            serde_json::to_vec(&ack_payload).map_err(|e| Error::SerializationFailure(e.to_string()))?;
        let ack_aad = self.local_device_id.as_str().as_bytes();
        let sealed = crypto::encrypt(&ack_plaintext, &derived, ack_aad)?;

        let mac_device_id = Uuid::parse_str(self.local_device_id.as_str())
            .map_err(|e| Error::InvalidMessage(format!("local device id is not a uuid: {e}")))?;

        keystore.store(initiator_device_id.as_str(), derived).await?;
        self.set_status(PairingStatus::Completed {
            peer_device_id: initiator_device_id,
        });

        Ok(PairingAck {
            challenge_id: challenge.challenge_id,
            mac_device_id,
            mac_device_name: self.local_device_name.clone(),
            nonce: sealed.nonce,
            ciphertext: sealed.ciphertext,
            tag: sealed.tag,
        })
    }

    /// Initiator side: confirm the host's ack proves possession of the same
    /// derived key, then persist it under the host's device id.
    pub async fn verify_ack(&self, ack: &PairingAck, keystore: &KeyStore) -> Result<()> {
        let derived = self
            .derived_key
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::InvalidChallengePayload("no pending challenge".to_string()))?;

        let host_device_id = DeviceId::from(ack.mac_device_id);
        let aad = host_device_id.as_str().as_bytes();
        let plaintext = crypto::decrypt(&ack.ciphertext, &derived, &ack.nonce, &ack.tag, aad)
            .map_err(|e| {
                self.set_status(PairingStatus::Failed {
                    reason: "ack decryption failed".to_string(),
                });
                e
            })?;
        let ack_payload: AckPayload =
            serde_json::from_slice(&plaintext).map_err(|e| Error::InvalidChallengePayload(e.to_string()))?;

        let expected = self
            .sent_challenge
            .as_ref()
            .map(|c| sha256(c.as_bytes()))
            .ok_or_else(|| Error::InvalidChallengePayload("session never sent a challenge".to_string()))?;

        if ack_payload.response_hash != expected {
            self.set_status(PairingStatus::Failed {
                reason: "ack response hash mismatch".to_string(),
            });
            return Err(Error::InvalidSignature);
        }

        keystore.store(host_device_id.as_str(), derived).await?;
        self.set_status(PairingStatus::Completed {
            peer_device_id: host_device_id,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::DevicePlatform;

    fn ids() -> (DeviceId, DeviceId) {
        (DeviceId::random(), DeviceId::random())
    }

    #[tokio::test]
    async fn full_handshake_round_trip() {
        let (host_id, initiator_id) = ids();
        let signing_key = SigningKey::generate();

        let (host_session, qr) = PairingSession::host(
            host_id.clone(),
            "Host Mac".to_string(),
            DevicePlatform::Macos,
            &signing_key,
            "192.168.1.10",
            7010,
        );
        assert_eq!(host_session.status(), PairingStatus::AwaitingChallenge);

        let (initiator_session, challenge) = PairingSession::from_qr(
            &qr,
            &signing_key.verifying_key(),
            initiator_id.clone(),
            "My Phone".to_string(),
            DevicePlatform::Ios,
        )
        .unwrap();
        assert_eq!(initiator_session.status(), PairingStatus::AwaitingAck);

        let host_store = KeyStore::in_memory();
        let ack = host_session.handle_challenge(&challenge, &host_store).await.unwrap();
        assert!(matches!(
            host_session.status(),
            PairingStatus::Completed { .. }
        ));

        let initiator_store = KeyStore::in_memory();
        initiator_session.verify_ack(&ack, &initiator_store).await.unwrap();
        assert!(matches!(
            initiator_session.status(),
            PairingStatus::Completed { .. }
        ));

        let host_key = host_store.require(initiator_id.as_str()).await.unwrap();
        let initiator_key = initiator_store.require(host_id.as_str()).await.unwrap();
        assert_eq!(host_key.as_bytes(), initiator_key.as_bytes());
    }

    #[tokio::test]
    async fn replayed_challenge_id_is_rejected() {
        let (host_id, initiator_id) = ids();
        let signing_key = SigningKey::generate();
        let (host_session, qr) = PairingSession::host(
            host_id,
            "Host".to_string(),
            DevicePlatform::Macos,
            &signing_key,
            "10.0.0.1",
            7010,
        );
        let (_initiator_session, challenge) = PairingSession::from_qr(
            &qr,
            &signing_key.verifying_key(),
            initiator_id,
            "Phone".to_string(),
            DevicePlatform::Android,
        )
        .unwrap();

        let store = KeyStore::in_memory();
        host_session.handle_challenge(&challenge, &store).await.unwrap();
        let err = host_session.handle_challenge(&challenge, &store).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateChallenge));
    }

    #[tokio::test]
    async fn expired_qr_is_rejected() {
        let (_host_id, initiator_id) = ids();
        let signing_key = SigningKey::generate();
        let mut qr = PairingQrData::new(Uuid::new_v4(), [3u8; 32], "h", 7010, "n", now_epoch() - 10);
        qr.sign(&signing_key).unwrap();

        let err = PairingSession::from_qr(
            &qr,
            &signing_key.verifying_key(),
            initiator_id,
            "Phone".to_string(),
            DevicePlatform::Ios,
        )
        .unwrap_err();
        assert!(matches!(err, Error::PayloadExpired));
    }

    #[tokio::test]
    async fn tampered_ack_is_rejected() {
        let (host_id, initiator_id) = ids();
        let signing_key = SigningKey::generate();
        let (host_session, qr) = PairingSession::host(
            host_id,
            "Host".to_string(),
            DevicePlatform::Macos,
            &signing_key,
            "10.0.0.1",
            7010,
        );
        let (initiator_session, challenge) = PairingSession::from_qr(
            &qr,
            &signing_key.verifying_key(),
            initiator_id,
            "Phone".to_string(),
            DevicePlatform::Android,
        )
        .unwrap();

        let store = KeyStore::in_memory();
        let mut ack = host_session.handle_challenge(&challenge, &store).await.unwrap();
        ack.ciphertext[0] ^= 0xFF;

        let initiator_store = KeyStore::in_memory();
        let err = initiator_session.verify_ack(&ack, &initiator_store).await.unwrap_err();
        assert!(matches!(err, Error::AuthFailure));
    }
}
