//! AES-256-GCM sealing against an explicit key and AAD, plus HKDF-SHA256 key
//! derivation for the pairing handshake.
//!
//! Unlike a session-bound cipher, every call here takes its key explicitly so
//! the Sync Engine (C6) can look a key up per target device from the Key Store
//! (C3) rather than holding one cipher per connection.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::keystore::SymmetricKey;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Result of an `encrypt` call: ciphertext (including the GCM tag, which the
/// wire format later splits back out) plus the nonce used.
#[derive(Debug, Clone)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
}

/// Encrypt `plaintext` under `key` with a fresh random nonce, authenticating
/// `aad` alongside the ciphertext (the spec uses the sender's device id as
/// AAD). Draws its own nonce every call, which is what makes Dual Transport's
/// per-path re-sealing (`spec.md` §4.8/§9) safe.
pub fn encrypt(plaintext: &[u8], key: &SymmetricKey, aad: &[u8]) -> Result<Sealed> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| Error::BadKeyLength)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut combined = cipher
        .encrypt(
            nonce,
            aes_gcm::aead::Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| Error::Crypto(format!("encryption failed: {e}")))?;

    // `aes_gcm` appends the 16-byte tag to the ciphertext; split it back out
    // so the wire format can carry ciphertext and tag as separate fields.
    if combined.len() < TAG_LEN {
        return Err(Error::Crypto("ciphertext shorter than tag".into()));
    }
    let tag_bytes = combined.split_off(combined.len() - TAG_LEN);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&tag_bytes);

    Ok(Sealed {
        ciphertext: combined,
        nonce: nonce_bytes,
        tag,
    })
}

/// Decrypt `ciphertext`/`tag` under `key`, verifying `aad` and `nonce`.
/// Fails with `Error::AuthFailure` on any tag mismatch.
pub fn decrypt(
    ciphertext: &[u8],
    key: &SymmetricKey,
    nonce: &[u8; NONCE_LEN],
    tag: &[u8; TAG_LEN],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| Error::BadKeyLength)?;
    let nonce = Nonce::from_slice(nonce);

    let mut combined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    cipher
        .decrypt(
            nonce,
            aes_gcm::aead::Payload {
                msg: &combined,
                aad,
            },
        )
        .map_err(|_| Error::AuthFailure)
}

/// Derive a 32-byte symmetric key from a raw X25519 shared secret via
/// HKDF-SHA256, as used to finish the pairing handshake (`spec.md` §4.2/§4.12).
pub fn derive_session_key(shared_secret: &[u8], info: &[u8]) -> Result<SymmetricKey> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut output = [0u8; 32];
    hk.expand(info, &mut output)
        .map_err(|_| Error::Crypto("hkdf expand failed".into()))?;
    Ok(SymmetricKey::from_bytes(output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = SymmetricKey::from_bytes([7u8; 32]);
        let aad = b"device-a";
        let plaintext = b"hello from device a";

        let sealed = encrypt(plaintext, &key, aad).unwrap();
        let decrypted = decrypt(&sealed.ciphertext, &key, &sealed.nonce, &sealed.tag, aad).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn wrong_aad_fails_auth() {
        let key = SymmetricKey::from_bytes([9u8; 32]);
        let sealed = encrypt(b"payload", &key, b"device-a").unwrap();
        let err = decrypt(&sealed.ciphertext, &key, &sealed.nonce, &sealed.tag, b"device-b");
        assert!(matches!(err, Err(Error::AuthFailure)));
    }

    #[test]
    fn distinct_nonces_per_call() {
        let key = SymmetricKey::from_bytes([3u8; 32]);
        let a = encrypt(b"same message", &key, b"aad").unwrap();
        let b = encrypt(b"same message", &key, b"aad").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn hkdf_derivation_is_deterministic() {
        let shared = [42u8; 32];
        let a = derive_session_key(&shared, b"info").unwrap();
        let b = derive_session_key(&shared, b"info").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }
}
