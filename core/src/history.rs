//! History Store (C4) — ordered, deduplicated, pin-aware clipboard history.
//!
//! Serialized behind a single lock (`spec.md` §4.4/§5: "serialized behind a
//! single task/lock; callers may await without holding other locks"),
//! mirroring how [`crate::clipboard::ClipboardManager`] guards its own state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::envelope::ClipboardEntry;

const DEFAULT_MAX_ENTRIES: usize = 500;

/// A `ClipboardEntry` with its large inline blobs stripped, used solely for
/// persistence (`spec.md` §4.4: "omitting large inline blobs from the
/// persisted form").
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedEntry(ClipboardEntry);

fn strip_blobs(entry: &ClipboardEntry) -> ClipboardEntry {
    use crate::protocol::envelope::ClipboardContent::*;
    let mut stripped = entry.clone();
    stripped.content = match stripped.content {
        Image {
            pixel_width,
            pixel_height,
            byte_size,
            format,
            alt_text,
            thumbnail,
            local_path,
            ..
        } => Image {
            pixel_width,
            pixel_height,
            byte_size,
            format,
            alt_text,
            bytes: Vec::new(),
            thumbnail,
            local_path,
        },
        File {
            name,
            byte_size,
            uti_or_mime,
            source_url,
            local_path,
            ..
        } => File {
            name,
            byte_size,
            uti_or_mime,
            source_url,
            inline_bytes: None,
            local_path,
        },
        other => other,
    };
    stripped
}

/// Ordered, deduplicated, pin-aware clipboard history.
pub struct HistoryStore {
    path: Option<PathBuf>,
    entries: Arc<RwLock<Vec<ClipboardEntry>>>,
    max_entries: Arc<RwLock<usize>>,
}

impl HistoryStore {
    pub fn in_memory(max_entries: usize) -> Self {
        Self {
            path: None,
            entries: Arc::new(RwLock::new(Vec::new())),
            max_entries: Arc::new(RwLock::new(max_entries)),
        }
    }

    pub async fn open(data_dir: &Path, max_entries: usize) -> Result<Self> {
        let path = data_dir.join("history.json");
        let entries = if path.exists() {
            let bytes = tokio::fs::read(&path).await?;
            let persisted: Vec<PersistedEntry> =
                serde_json::from_slice(&bytes).map_err(|e| Error::SerializationFailure(e.to_string()))?;
            persisted.into_iter().map(|p| p.0).collect()
        } else {
            Vec::new()
        };

        Ok(Self {
            path: Some(path),
            entries: Arc::new(RwLock::new(entries)),
            max_entries: Arc::new(RwLock::new(max_entries.max(1))),
        })
    }

    async fn persist(&self, entries: &[ClipboardEntry]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let persisted: Vec<PersistedEntry> =
            entries.iter().map(|e| PersistedEntry(strip_blobs(e))).collect();
        let bytes = serde_json::to_vec_pretty(&persisted)
            .map_err(|e| Error::SerializationFailure(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    fn sort(entries: &mut [ClipboardEntry]) {
        entries.sort_by(|a, b| {
            b.is_pinned
                .cmp(&a.is_pinned)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
    }

    /// Trim rule (`spec.md` §4.4): keep all pinned entries plus the most
    /// recent unpinned entries up to `max_entries - pinned_count`.
    fn trim(entries: &mut Vec<ClipboardEntry>, max_entries: usize) {
        let pinned_count = entries.iter().filter(|e| e.is_pinned).count();
        let unpinned_budget = max_entries.saturating_sub(pinned_count);

        let mut kept = Vec::with_capacity(entries.len());
        let mut unpinned_seen = 0usize;
        for entry in entries.drain(..) {
            if entry.is_pinned {
                kept.push(entry);
            } else if unpinned_seen < unpinned_budget {
                unpinned_seen += 1;
                kept.push(entry);
            }
        }
        *entries = kept;
    }

    /// Insert `entry`, applying move-to-top dedup semantics, re-sort, and
    /// trim (`spec.md` §4.4).
    pub async fn insert(&self, entry: ClipboardEntry) -> Result<()> {
        let mut guard = self.entries.write().await;
        let max_entries = *self.max_entries.read().await;

        if let Some(existing) = guard.iter_mut().find(|e| e.matches(&entry)) {
            existing.timestamp = Utc::now();
            existing.device_id = entry.device_id.clone();
            existing.transport_origin = entry.transport_origin;
        } else {
            guard.push(entry);
        }

        Self::sort(&mut guard);
        Self::trim(&mut guard, max_entries);

        self.persist(&guard).await
    }

    pub async fn all(&self) -> Vec<ClipboardEntry> {
        self.entries.read().await.clone()
    }

    pub async fn get_by_id(&self, id: Uuid) -> Option<ClipboardEntry> {
        self.entries.read().await.iter().find(|e| e.id == id).cloned()
    }

    pub async fn remove(&self, id: Uuid) -> Result<bool> {
        let mut guard = self.entries.write().await;
        let before = guard.len();
        guard.retain(|e| e.id != id);
        let removed = guard.len() != before;
        if removed {
            self.persist(&guard).await?;
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<()> {
        let mut guard = self.entries.write().await;
        guard.clear();
        self.persist(&guard).await
    }

    pub async fn update_pin(&self, id: Uuid, pinned: bool) -> Result<bool> {
        let mut guard = self.entries.write().await;
        let Some(entry) = guard.iter_mut().find(|e| e.id == id) else {
            return Ok(false);
        };
        entry.is_pinned = pinned;
        let max_entries = *self.max_entries.read().await;
        Self::sort(&mut guard);
        Self::trim(&mut guard, max_entries);
        self.persist(&guard).await?;
        Ok(true)
    }

    pub async fn update_limit(&self, new_max: usize) -> Result<()> {
        let new_max = new_max.max(1);
        *self.max_entries.write().await = new_max;
        let mut guard = self.entries.write().await;
        Self::trim(&mut guard, new_max);
        self.persist(&guard).await
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::in_memory(DEFAULT_MAX_ENTRIES)
    }
}

/// Per-device registry of paired peers (`spec.md` §3 `PairedDevice`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedDevice {
    pub id: crate::protocol::envelope::DeviceId,
    pub name: String,
    pub platform: Option<crate::protocol::envelope::DevicePlatform>,
    pub last_seen: chrono::DateTime<Utc>,
    pub is_online: bool,
    pub service_name: Option<String>,
    pub lan_host: Option<String>,
    pub lan_port: Option<u16>,
    pub fingerprint: Option<String>,
}

/// Persisted registry of paired devices, keyed by case-folded `DeviceId`.
pub struct PairedDeviceRegistry {
    path: Option<PathBuf>,
    devices: Arc<RwLock<HashMap<String, PairedDevice>>>,
}

impl PairedDeviceRegistry {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            devices: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("paired_devices.json");
        let devices = if path.exists() {
            let bytes = tokio::fs::read(&path).await?;
            serde_json::from_slice(&bytes).map_err(|e| Error::SerializationFailure(e.to_string()))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path: Some(path),
            devices: Arc::new(RwLock::new(devices)),
        })
    }

    async fn persist(&self, devices: &HashMap<String, PairedDevice>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(devices)
            .map_err(|e| Error::SerializationFailure(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn upsert(&self, device: PairedDevice) -> Result<()> {
        let mut guard = self.devices.write().await;
        let key = device.id.as_str().to_string();
        guard
            .entry(key)
            .and_modify(|existing| {
                if device.last_seen > existing.last_seen {
                    existing.last_seen = device.last_seen;
                }
                existing.name = device.name.clone();
                existing.platform = device.platform;
                existing.is_online = device.is_online;
                existing.service_name = device.service_name.clone();
                existing.lan_host = device.lan_host.clone();
                existing.lan_port = device.lan_port;
                existing.fingerprint = device.fingerprint.clone();
            })
            .or_insert(device);
        self.persist(&guard).await
    }

    pub async fn get(&self, id: &crate::protocol::envelope::DeviceId) -> Option<PairedDevice> {
        self.devices.read().await.get(id.as_str()).cloned()
    }

    pub async fn all(&self) -> Vec<PairedDevice> {
        self.devices.read().await.values().cloned().collect()
    }

    pub async fn set_online(&self, id: &crate::protocol::envelope::DeviceId, online: bool) -> Result<()> {
        let mut guard = self.devices.write().await;
        if let Some(device) = guard.get_mut(id.as_str()) {
            device.is_online = online;
        }
        self.persist(&guard).await
    }

    pub async fn remove(&self, id: &crate::protocol::envelope::DeviceId) -> Result<bool> {
        let mut guard = self.devices.write().await;
        let removed = guard.remove(id.as_str()).is_some();
        if removed {
            self.persist(&guard).await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::{ClipboardContent, DeviceId};

    fn text_entry(text: &str, device: &str) -> ClipboardEntry {
        ClipboardEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            device_id: DeviceId::new(device),
            origin_platform: None,
            origin_device_name: None,
            content: ClipboardContent::Text { text: text.to_string() },
            is_pinned: false,
            is_encrypted: false,
            transport_origin: None,
        }
    }

    #[tokio::test]
    async fn insert_appends_and_sorts() {
        let store = HistoryStore::in_memory(10);
        store.insert(text_entry("a", "dev")).await.unwrap();
        store.insert(text_entry("b", "dev")).await.unwrap();
        let all = store.all().await;
        assert_eq!(all.len(), 2);
        if let ClipboardContent::Text { text: t } = &all[0].content {
            assert_eq!(t, "b");
        } else {
            panic!("expected text");
        }
    }

    #[tokio::test]
    async fn duplicate_moves_to_top_without_growing() {
        let store = HistoryStore::in_memory(10);
        store.insert(text_entry("x", "dev")).await.unwrap();
        store.insert(text_entry("y", "dev")).await.unwrap();
        store.insert(text_entry("x", "dev")).await.unwrap();

        let all = store.all().await;
        assert_eq!(all.len(), 2);
        if let ClipboardContent::Text { text: t } = &all[0].content {
            assert_eq!(t, "x");
        } else {
            panic!("expected text");
        }
    }

    #[tokio::test]
    async fn pinned_entries_survive_trim() {
        let store = HistoryStore::in_memory(2);
        let mut pinned = text_entry("keep-me", "dev");
        pinned.is_pinned = true;
        store.insert(pinned.clone()).await.unwrap();
        store.insert(text_entry("b", "dev")).await.unwrap();
        store.insert(text_entry("c", "dev")).await.unwrap();

        let all = store.all().await;
        assert!(all.iter().any(|e| e.id == pinned.id));
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = HistoryStore::open(dir.path(), 10).await.unwrap();
            store.insert(text_entry("persisted", "dev")).await.unwrap();
        }
        let reopened = HistoryStore::open(dir.path(), 10).await.unwrap();
        let all = reopened.all().await;
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn paired_device_upsert_keeps_latest_last_seen() {
        let registry = PairedDeviceRegistry::in_memory();
        let id = DeviceId::new("peer-1");
        registry
            .upsert(PairedDevice {
                id: id.clone(),
                name: "Phone".into(),
                platform: None,
                last_seen: Utc::now(),
                is_online: true,
                service_name: None,
                lan_host: None,
                lan_port: None,
                fingerprint: None,
            })
            .await
            .unwrap();
        registry.set_online(&id, false).await.unwrap();
        let device = registry.get(&id).await.unwrap();
        assert!(!device.is_online);
    }
}
