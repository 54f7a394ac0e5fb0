//! Sync Orchestrator (C14) — the capture → history → per-peer-queue →
//! transport bridge (`spec.md` §4.14).
//!
//! Grounded on [`crate::transport::ws::WsTransport`]'s actor-plus-bounded-
//! queue shape (one queue per destination instead of one queue per
//! connection) and on [`crate::server::LanServer`]'s event-forwarding style
//! for the incoming-frame path.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::clipboard::ClipboardManager;
use crate::error::Result;
use crate::history::{HistoryStore, PairedDeviceRegistry};
use crate::keystore::KeyStore;
use crate::ports::{BlobStore, NotificationSink};
use crate::protocol::constants::ORCHESTRATOR_MESSAGE_EXPIRY_SECS;
use crate::protocol::envelope::{ClipboardContent, ClipboardEntry, DeviceId, SyncEnvelope, TransportOrigin};
use crate::sync::engine::{parse_payload, SyncEngine};
use crate::transport::dual::{DualTransport, TransportPath};

struct QueuedMessage {
    entry: ClipboardEntry,
    target: DeviceId,
    queued_at: Instant,
}

/// Bridges local clipboard capture to outbound per-peer queues, and inbound
/// frames to the history store and pasteboard.
pub struct SyncOrchestrator {
    engine: Arc<SyncEngine>,
    history: Arc<HistoryStore>,
    registry: Arc<PairedDeviceRegistry>,
    keystore: Arc<KeyStore>,
    clipboard: Mutex<ClipboardManager>,
    queues: RwLock<HashMap<DeviceId, VecDeque<QueuedMessage>>>,
    local_device_id: DeviceId,
    blob_store: Option<Arc<dyn BlobStore>>,
    notifications: Option<Arc<dyn NotificationSink>>,
}

impl SyncOrchestrator {
    pub fn new(
        engine: Arc<SyncEngine>,
        history: Arc<HistoryStore>,
        registry: Arc<PairedDeviceRegistry>,
        keystore: Arc<KeyStore>,
        clipboard: ClipboardManager,
        local_device_id: DeviceId,
    ) -> Self {
        Self::with_ports(engine, history, registry, keystore, clipboard, local_device_id, None, None)
    }

    /// Like [`Self::new`], additionally injecting the external collaborators
    /// that externalize large blobs to disk and surface arrival
    /// notifications (`spec.md` §9: "inject a `BlobStore`... and a
    /// `NotificationSink` through constructors").
    #[allow(clippy::too_many_arguments)]
    pub fn with_ports(
        engine: Arc<SyncEngine>,
        history: Arc<HistoryStore>,
        registry: Arc<PairedDeviceRegistry>,
        keystore: Arc<KeyStore>,
        clipboard: ClipboardManager,
        local_device_id: DeviceId,
        blob_store: Option<Arc<dyn BlobStore>>,
        notifications: Option<Arc<dyn NotificationSink>>,
    ) -> Self {
        Self {
            engine,
            history,
            registry,
            keystore,
            clipboard: Mutex::new(clipboard),
            queues: RwLock::new(HashMap::new()),
            local_device_id,
            blob_store,
            notifications,
        }
    }

    /// Writes inline image/file bytes out to the injected `BlobStore` and
    /// records the resulting path as `local_path`, leaving the in-memory
    /// bytes untouched for immediate use (history persistence strips them
    /// separately). No-op when no `BlobStore` was injected, or the content
    /// already carries a `local_path`.
    fn externalize_blob(&self, content: ClipboardContent) -> ClipboardContent {
        let Some(store) = &self.blob_store else {
            return content;
        };
        match content {
            ClipboardContent::Image {
                pixel_width,
                pixel_height,
                byte_size,
                format,
                alt_text,
                bytes,
                thumbnail,
                local_path: None,
            } if !bytes.is_empty() => {
                let name = format!("{}.img", Uuid::new_v4());
                let local_path = match store.store(&bytes, &name) {
                    Ok(path) => Some(path.display().to_string()),
                    Err(e) => {
                        tracing::warn!("failed to externalize image blob: {e}");
                        None
                    }
                };
                ClipboardContent::Image { pixel_width, pixel_height, byte_size, format, alt_text, bytes, thumbnail, local_path }
            }
            ClipboardContent::File {
                name,
                byte_size,
                uti_or_mime,
                source_url,
                inline_bytes: Some(bytes),
                local_path: None,
            } => {
                let local_path = match store.store(&bytes, &name) {
                    Ok(path) => Some(path.display().to_string()),
                    Err(e) => {
                        tracing::warn!("failed to externalize file blob: {e}");
                        None
                    }
                };
                ClipboardContent::File { name, byte_size, uti_or_mime, source_url, inline_bytes: Some(bytes), local_path }
            }
            other => other,
        }
    }

    /// A locally captured clipboard change: insert into history, then fan
    /// out to every paired device we hold a key for (`spec.md` §4.14).
    pub async fn capture_local(&self, content: ClipboardContent, platform: crate::protocol::envelope::DevicePlatform, device_name: String) -> Result<()> {
        let content = self.externalize_blob(content);
        let entry = ClipboardEntry {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            device_id: self.local_device_id.clone(),
            origin_platform: Some(platform),
            origin_device_name: Some(device_name),
            content,
            is_pinned: false,
            is_encrypted: true,
            transport_origin: None,
        };

        debug_assert!(entry.is_local());
        self.history.insert(entry.clone()).await?;

        let peers = self.registry.all().await;
        let mut queues = self.queues.write().await;
        for peer in peers {
            if !self.keystore.has(peer.id.as_str()).await {
                continue;
            }
            queues.entry(peer.id.clone()).or_default().push_back(QueuedMessage {
                entry: entry.clone(),
                target: peer.id,
                queued_at: Instant::now(),
            });
        }
        Ok(())
    }

    /// Drain every per-peer queue once, dropping anything older than
    /// `ORCHESTRATOR_MESSAGE_EXPIRY_SECS` and re-queuing send failures for
    /// the next wake (`spec.md` §4.14: "wakes on `Connected*`... processes
    /// each message exactly once per pass").
    pub async fn process_queues(&self, transport: &DualTransport) {
        let expiry = Duration::from_secs(ORCHESTRATOR_MESSAGE_EXPIRY_SECS);
        let pending: Vec<(DeviceId, VecDeque<QueuedMessage>)> = {
            let mut queues = self.queues.write().await;
            queues.drain().collect()
        };

        for (peer, mut messages) in pending {
            let mut retry = VecDeque::new();
            while let Some(message) = messages.pop_front() {
                if message.queued_at.elapsed() > expiry {
                    tracing::debug!(peer = %peer, "dropping expired queued message");
                    continue;
                }
                match transport.send(&message.entry, message.target.clone()).await {
                    Ok(TransportPath::Lan) | Ok(TransportPath::Cloud) => {}
                    Err(e) => {
                        tracing::debug!(peer = %peer, error = %e, "send failed, retrying next wake");
                        retry.push_back(message);
                    }
                }
            }
            if !retry.is_empty() {
                self.queues.write().await.entry(peer).or_default().extend(retry);
            }
        }
    }

    /// Handle a decrypted frame received over either transport
    /// (`spec.md` §4.14 incoming path): verify target, decrypt, insert into
    /// history with `transport_origin` set, forward to the pasteboard while
    /// suppressing the echo, and refresh the sender's `last_seen`.
    pub async fn handle_incoming(&self, envelope: &SyncEnvelope, origin: TransportOrigin) -> Result<()> {
        if !envelope.targets(&self.local_device_id) {
            tracing::debug!("dropping envelope not addressed to us");
            return Ok(());
        }

        let payload = self.engine.decode(envelope).await?;
        let content = self.externalize_blob(parse_payload(&payload)?);

        let entry = ClipboardEntry {
            id: envelope.id,
            timestamp: envelope.timestamp,
            device_id: envelope.payload.device_id.clone(),
            origin_platform: envelope.payload.device_platform,
            origin_device_name: envelope.payload.device_name.clone(),
            content: content.clone(),
            is_pinned: false,
            is_encrypted: !envelope.payload.encryption.is_plaintext(),
            transport_origin: Some(origin),
        };

        debug_assert!(!entry.is_local());
        self.history.insert(entry).await?;

        self.clipboard.lock().await.write(&content)?;
        self.clipboard.lock().await.suppress_echo(content);

        if let Some(sink) = &self.notifications {
            let from = envelope
                .payload
                .device_name
                .clone()
                .unwrap_or_else(|| envelope.payload.device_id.as_str().to_string());
            sink.notify("Clipboard synced", &format!("New item from {from}"));
        }

        if let Some(mut device) = self.registry.get(&envelope.payload.device_id).await {
            device.last_seen = chrono::Utc::now();
            self.registry.upsert(device).await?;
        }

        Ok(())
    }
}

/// Wakes the queue processor on relevant transport events
/// (`spec.md` §4.14: "a `Connected*` event wakes the queue processor").
pub async fn run_wake_loop(
    orchestrator: Arc<SyncOrchestrator>,
    transport: Arc<DualTransport>,
    mut wake_rx: mpsc::Receiver<()>,
) {
    while wake_rx.recv().await.is_some() {
        orchestrator.process_queues(&transport).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::{ClipboardManager, PasteboardSource};
    use crate::history::PairedDevice;
    use crate::keystore::{KeyStore, SymmetricKey};
    use crate::protocol::envelope::{DevicePlatform, EncryptionInfo, EnvelopePayload};
    use crate::sync::engine::PlaintextPolicy;

    struct NullSource;
    impl PasteboardSource for NullSource {
        fn read(&mut self) -> Result<Option<ClipboardContent>> {
            Ok(None)
        }
        fn write(&mut self, _content: &ClipboardContent) -> Result<()> {
            Ok(())
        }
    }

    fn manager() -> ClipboardManager {
        ClipboardManager::new(Box::new(NullSource))
    }

    async fn orchestrator_with_peer(local: &str, peer: &str) -> (Arc<SyncOrchestrator>, Arc<KeyStore>) {
        let keystore = Arc::new(KeyStore::in_memory());
        keystore.store(peer, SymmetricKey::from_bytes([1u8; 32])).await.unwrap();

        let engine = Arc::new(SyncEngine::new(
            keystore.clone(),
            DeviceId::new(local),
            DevicePlatform::Linux,
            "local-host".to_string(),
            PlaintextPolicy::default(),
        ));
        let history = Arc::new(HistoryStore::in_memory(50));
        let registry = Arc::new(PairedDeviceRegistry::in_memory());
        registry
            .upsert(PairedDevice {
                id: DeviceId::new(peer),
                name: "Phone".to_string(),
                platform: None,
                last_seen: chrono::Utc::now(),
                is_online: true,
                service_name: None,
                lan_host: None,
                lan_port: None,
                fingerprint: None,
            })
            .await
            .unwrap();

        let orchestrator = Arc::new(SyncOrchestrator::new(
            engine,
            history,
            registry,
            keystore.clone(),
            manager(),
            DeviceId::new(local),
        ));
        (orchestrator, keystore)
    }

    #[tokio::test]
    async fn capture_local_enqueues_for_keyed_peers_only() {
        let (orchestrator, _keystore) = orchestrator_with_peer("local-dev", "peer-dev").await;
        orchestrator
            .capture_local(ClipboardContent::Text { text: "hi".into() }, DevicePlatform::Linux, "local-host".into())
            .await
            .unwrap();

        let queues = orchestrator.queues.read().await;
        assert_eq!(queues.get(&DeviceId::new("peer-dev")).map(|q| q.len()), Some(1));
    }

    #[tokio::test]
    async fn capture_local_inserts_into_history() {
        let (orchestrator, _keystore) = orchestrator_with_peer("local-dev", "peer-dev").await;
        orchestrator
            .capture_local(ClipboardContent::Text { text: "hi".into() }, DevicePlatform::Linux, "local-host".into())
            .await
            .unwrap();

        let all = orchestrator.history.all().await;
        assert_eq!(all.len(), 1);
        assert!(all[0].is_local());
    }

    #[tokio::test]
    async fn incoming_envelope_not_addressed_to_us_is_dropped() {
        let (orchestrator, _keystore) = orchestrator_with_peer("local-dev", "peer-dev").await;
        let envelope = SyncEnvelope::new_clipboard(EnvelopePayload {
            content_type: "text".into(),
            ciphertext: vec![],
            device_id: DeviceId::new("peer-dev"),
            device_platform: None,
            device_name: None,
            target: Some(DeviceId::new("someone-else")),
            encryption: EncryptionInfo::plaintext(),
        });
        orchestrator.handle_incoming(&envelope, TransportOrigin::Lan).await.unwrap();
        assert!(orchestrator.history.all().await.is_empty());
    }

    #[tokio::test]
    async fn incoming_envelope_is_recorded_as_remote_and_refreshes_last_seen() {
        let (orchestrator, keystore) = orchestrator_with_peer("local-dev", "peer-dev").await;
        keystore.store("peer-dev", SymmetricKey::from_bytes([1u8; 32])).await.unwrap();

        // `transmit` encrypts under the key stored at the *target*'s id, and
        // `decode` looks it up under the *sender*'s id, mirroring how pairing
        // stores the shared secret keyed by the other party on each side.
        let sender_keystore = Arc::new(KeyStore::in_memory());
        sender_keystore.store("local-dev", SymmetricKey::from_bytes([1u8; 32])).await.unwrap();
        let sender_engine = SyncEngine::new(
            sender_keystore,
            DeviceId::new("peer-dev"),
            DevicePlatform::Macos,
            "peer-host".to_string(),
            PlaintextPolicy::default(),
        );
        let entry = ClipboardEntry {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            device_id: DeviceId::new("peer-dev"),
            origin_platform: Some(DevicePlatform::Macos),
            origin_device_name: Some("peer-host".to_string()),
            content: ClipboardContent::Text { text: "from peer".into() },
            is_pinned: false,
            is_encrypted: true,
            transport_origin: None,
        };
        let envelope = sender_engine.transmit(&entry, DeviceId::new("local-dev")).await.unwrap();

        orchestrator.handle_incoming(&envelope, TransportOrigin::Lan).await.unwrap();

        let all = orchestrator.history.all().await;
        assert_eq!(all.len(), 1);
        assert!(!all[0].is_local());
        assert_eq!(all[0].transport_origin, Some(TransportOrigin::Lan));
    }

    struct RecordingBlobStore {
        written: std::sync::Mutex<Vec<String>>,
    }

    impl crate::ports::BlobStore for RecordingBlobStore {
        fn store(&self, bytes: &[u8], suggested_name: &str) -> Result<std::path::PathBuf> {
            self.written.lock().unwrap().push(suggested_name.to_string());
            Ok(std::path::PathBuf::from(format!("/tmp/{suggested_name}-{}", bytes.len())))
        }
        fn load(&self, _path: &std::path::Path) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn remove(&self, _path: &std::path::Path) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn capture_local_externalizes_file_blob_when_store_injected() {
        let keystore = Arc::new(KeyStore::in_memory());
        let engine = Arc::new(SyncEngine::new(
            keystore.clone(),
            DeviceId::new("local-dev"),
            DevicePlatform::Linux,
            "local-host".to_string(),
            PlaintextPolicy::default(),
        ));
        let history = Arc::new(HistoryStore::in_memory(50));
        let registry = Arc::new(PairedDeviceRegistry::in_memory());
        let blob_store = Arc::new(RecordingBlobStore { written: std::sync::Mutex::new(Vec::new()) });

        let orchestrator = Arc::new(SyncOrchestrator::with_ports(
            engine,
            history.clone(),
            registry,
            keystore,
            manager(),
            DeviceId::new("local-dev"),
            Some(blob_store.clone() as Arc<dyn crate::ports::BlobStore>),
            None,
        ));

        orchestrator
            .capture_local(
                ClipboardContent::File {
                    name: "report.pdf".into(),
                    byte_size: 3,
                    uti_or_mime: "application/pdf".into(),
                    source_url: None,
                    inline_bytes: Some(vec![1, 2, 3]),
                    local_path: None,
                },
                DevicePlatform::Linux,
                "local-host".into(),
            )
            .await
            .unwrap();

        assert_eq!(blob_store.written.lock().unwrap().as_slice(), ["report.pdf"]);
        let all = history.all().await;
        match &all[0].content {
            ClipboardContent::File { local_path: Some(path), .. } => assert!(path.contains("report.pdf")),
            other => panic!("expected externalized file content, got {other:?}"),
        }
    }
}
