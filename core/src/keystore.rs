//! Key Store (C3) — per-peer symmetric key persistence.
//!
//! Maps a case-folded device id to a 32-byte AES-256-GCM key. The real OS
//! keychain is an external collaborator (`spec.md` §1); this module is the
//! in-process cache plus a JSON-file-backed default store, mirroring the
//! "key-value settings store" `spec.md` §6 calls for.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// A raw 32-byte AES-256-GCM key.
#[derive(Clone, Serialize, Deserialize)]
pub struct SymmetricKey(#[serde(with = "crate::crypto::serde_utils::base64_array_32")] [u8; 32]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey").finish_non_exhaustive()
    }
}

fn fold(device_id: &str) -> String {
    device_id.to_lowercase()
}

/// Per-peer symmetric key persistence and retrieval by device id.
pub struct KeyStore {
    path: Option<PathBuf>,
    keys: Arc<RwLock<HashMap<String, SymmetricKey>>>,
}

impl KeyStore {
    /// A purely in-memory store (useful for tests or ephemeral sessions).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            keys: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// A store backed by a JSON file under `data_dir`. Loads any existing
    /// keys eagerly; writes are atomic (temp file + rename).
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("keys.json");
        let keys = if path.exists() {
            let bytes = tokio::fs::read(&path).await?;
            serde_json::from_slice(&bytes).map_err(|e| Error::SerializationFailure(e.to_string()))?
        } else {
            HashMap::new()
        };

        Ok(Self {
            path: Some(path),
            keys: Arc::new(RwLock::new(keys)),
        })
    }

    async fn persist(&self, keys: &HashMap<String, SymmetricKey>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(keys)
            .map_err(|e| Error::SerializationFailure(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Store (or replace) the key for `device_id`.
    pub async fn store(&self, device_id: &str, key: SymmetricKey) -> Result<()> {
        let mut guard = self.keys.write().await;
        guard.insert(fold(device_id), key);
        self.persist(&guard).await
    }

    /// Load the key for `device_id`, if any.
    pub async fn load(&self, device_id: &str) -> Option<SymmetricKey> {
        self.keys.read().await.get(&fold(device_id)).cloned()
    }

    /// `load`, surfaced as `Error::MissingKey` when absent — used by the Sync
    /// Engine on both encrypt and decrypt paths.
    pub async fn require(&self, device_id: &str) -> Result<SymmetricKey> {
        self.load(device_id)
            .await
            .ok_or_else(|| Error::MissingKey(device_id.to_string()))
    }

    pub async fn has(&self, device_id: &str) -> bool {
        self.keys.read().await.contains_key(&fold(device_id))
    }

    pub async fn delete(&self, device_id: &str) -> Result<()> {
        let mut guard = self.keys.write().await;
        guard.remove(&fold(device_id));
        self.persist(&guard).await
    }

    pub async fn list(&self) -> Vec<String> {
        self.keys.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_load_case_insensitive() {
        let store = KeyStore::in_memory();
        store
            .store("AAAA-BBBB", SymmetricKey::from_bytes([1u8; 32]))
            .await
            .unwrap();

        assert!(store.has("aaaa-bbbb").await);
        let key = store.load("aaaa-bbbb").await.unwrap();
        assert_eq!(key.as_bytes(), &[1u8; 32]);
    }

    #[tokio::test]
    async fn missing_key_surfaces_error() {
        let store = KeyStore::in_memory();
        let err = store.require("nope").await.unwrap_err();
        assert!(matches!(err, Error::MissingKey(_)));
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = KeyStore::open(dir.path()).await.unwrap();
            store
                .store("dev-1", SymmetricKey::from_bytes([5u8; 32]))
                .await
                .unwrap();
        }
        let reopened = KeyStore::open(dir.path()).await.unwrap();
        assert!(reopened.has("dev-1").await);
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let store = KeyStore::in_memory();
        store
            .store("dev-1", SymmetricKey::from_bytes([2u8; 32]))
            .await
            .unwrap();
        store.delete("dev-1").await.unwrap();
        assert!(!store.has("dev-1").await);
    }
}
