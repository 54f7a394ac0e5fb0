//! Cryptographic primitives for Omniclip
//!
//! - Ed25519 for device identity and signing
//! - X25519 for ECDH key exchange
//! - AES-256-GCM for symmetric encryption, keyed from the Key Store (C3)
//! - HKDF-SHA256 to derive session keys during pairing

mod keys;
mod aead;
pub mod serde_utils;

pub use keys::{EphemeralSecret, PublicKey, SigningKey, VerifyingKey};
pub use aead::{decrypt, derive_session_key, encrypt, Sealed, NONCE_LEN, TAG_LEN};
