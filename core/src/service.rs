//! High-level Omniclip service (C1-C14) that wires every component into a
//! single running instance: mDNS discovery, the LAN server, the outbound
//! dual transport, the sync engine, history/keystore/registry persistence,
//! the clipboard monitor, and the orchestrator that bridges them all.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use url::Url;

use crate::clipboard::{self, ArboardSource, ClipboardManager};
use crate::crypto::VerifyingKey;
use crate::discovery::{DiscoveredPeer, DiscoveryEvent, DiscoveryService};
use crate::error::{Error, Result};
use crate::history::{HistoryStore, PairedDevice, PairedDeviceRegistry};
use crate::keystore::KeyStore;
use crate::manager::TransportManager;
use crate::orchestrator::{run_wake_loop, SyncOrchestrator};
use crate::pairing::{PairingSession, PairingStatus};
use crate::ports::{BlobStore, NotificationSink, TempFileManager};
use crate::prober::{ConnectionProber, ProbeEvent};
use crate::protocol::constants::CLIPBOARD_POLL_INTERVAL_MS;
use crate::protocol::envelope::{DeviceId, DevicePlatform, TransportOrigin};
use crate::protocol::pairing::{PairingAck, PairingChallenge, PairingQrData};
use crate::server::{LanServer, ServerEvent, ServerHandle};
use crate::sync::engine::{PlaintextPolicy, SyncEngine};
use crate::transport::dual::{DualTransport, TransportPath};
use crate::transport::{ConnectionState, TransportEvent, WsTransportConfig};
use crate::{Config, DeviceIdentity};

const HISTORY_MAX_ENTRIES: usize = 500;

fn local_platform() -> DevicePlatform {
    if cfg!(target_os = "macos") {
        DevicePlatform::Macos
    } else if cfg!(target_os = "windows") {
        DevicePlatform::Windows
    } else if cfg!(target_os = "linux") {
        DevicePlatform::Linux
    } else {
        DevicePlatform::Unknown
    }
}

/// Events emitted by the running service for a UI/CLI layer to observe.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    DeviceDiscovered(DiscoveredPeer),
    DeviceLost(String),
    ClipboardReceived { from_device: DeviceId },
    Error(String),
}

/// Coordinates every component of the running service.
pub struct OmniclipService {
    config: Config,
    identity: DeviceIdentity,
    keystore: Arc<KeyStore>,
    history: Arc<HistoryStore>,
    registry: Arc<PairedDeviceRegistry>,
    discovery: Arc<DiscoveryService>,
    manager: Arc<TransportManager>,
    orchestrator: Arc<SyncOrchestrator>,
    prober: Arc<ConnectionProber>,
    dual: Arc<DualTransport>,
    lan_server: RwLock<Option<ServerHandle>>,
    /// Shared with the LAN server's event forwarder so an inbound pairing
    /// challenge arriving over the wire can be routed to whichever session
    /// is currently active (`spec.md` §4.9).
    active_pairing: Arc<RwLock<Option<Arc<PairingSession>>>>,
    wake_tx: RwLock<Option<mpsc::Sender<()>>>,
    temp_files: Option<Arc<dyn TempFileManager>>,
    notifications: Option<Arc<dyn NotificationSink>>,
}

impl OmniclipService {
    /// Construct the service, opening (or creating) all persistent stores
    /// under `config.data_dir`. No blob storage, temp-file, or notification
    /// collaborator is attached; use [`Self::with_ports`] to inject them.
    pub async fn new(device_name: String, config: Config) -> Result<Self> {
        Self::with_ports(device_name, config, None, None, None).await
    }

    /// Like [`Self::new`], additionally injecting the external collaborators
    /// the core never implements itself (`spec.md` §1/§9: platform blob
    /// storage, notification surfaces, and temp-file handling are
    /// "deliberately out of scope" and reach the core only through these
    /// constructor-injected traits).
    pub async fn with_ports(
        device_name: String,
        config: Config,
        blob_store: Option<Arc<dyn BlobStore>>,
        notifications: Option<Arc<dyn NotificationSink>>,
        temp_files: Option<Arc<dyn TempFileManager>>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let identity = DeviceIdentity::new(device_name.clone());
        let local_device_id = DeviceId::from(identity.id);

        let keystore = Arc::new(KeyStore::open(&config.data_dir).await?);
        let history = Arc::new(HistoryStore::open(&config.data_dir, HISTORY_MAX_ENTRIES).await?);
        let registry = Arc::new(PairedDeviceRegistry::open(&config.data_dir).await?);
        let discovery = Arc::new(DiscoveryService::new(local_device_id.clone())?);
        let manager = Arc::new(TransportManager::new(discovery.clone()));
        let prober = Arc::new(ConnectionProber::new(registry.clone()));

        let engine = Arc::new(SyncEngine::new(
            keystore.clone(),
            local_device_id.clone(),
            local_platform(),
            device_name,
            PlaintextPolicy { allow: config.allow_plaintext },
        ));

        let (dual_events_tx, dual_events_rx) = mpsc::channel(64);
        let dual = Arc::new(DualTransport::new(engine.clone(), dual_events_tx));

        let clipboard_source: Box<dyn crate::clipboard::PasteboardSource> =
            Box::new(ArboardSource::new(notifications.clone())?);
        let clipboard_manager = ClipboardManager::new(clipboard_source);

        let orchestrator = Arc::new(SyncOrchestrator::with_ports(
            engine,
            history.clone(),
            registry.clone(),
            keystore.clone(),
            clipboard_manager,
            local_device_id,
            blob_store,
            notifications.clone(),
        ));

        spawn_dual_event_forwarder(dual_events_rx, orchestrator.clone(), prober.clone());

        Ok(Self {
            config,
            identity,
            keystore,
            history,
            registry,
            discovery,
            manager,
            orchestrator,
            prober,
            dual,
            lan_server: RwLock::new(None),
            active_pairing: Arc::new(RwLock::new(None)),
            wake_tx: RwLock::new(None),
            temp_files,
            notifications,
        })
    }

    /// The injected scratch-space collaborator, if any (`spec.md` §9).
    pub fn temp_files(&self) -> Option<&Arc<dyn TempFileManager>> {
        self.temp_files.as_ref()
    }

    pub fn device_id(&self) -> DeviceId {
        DeviceId::from(self.identity.id)
    }

    pub fn device_name(&self) -> &str {
        &self.identity.name
    }

    pub fn fingerprint(&self) -> String {
        self.identity.fingerprint()
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn registry(&self) -> &Arc<PairedDeviceRegistry> {
        &self.registry
    }

    /// Start the LAN server, mDNS advertisement/browsing, clipboard
    /// monitor, and the orchestrator's queue processor. Returns a channel
    /// of high-level events for a UI layer.
    pub async fn start(&self) -> Result<mpsc::Receiver<ServiceEvent>> {
        let (tx, rx) = mpsc::channel(64);

        let lan_server = LanServer::bind(self.config.port, self.device_id()).await?;
        let port = lan_server.port();
        let (server_handle, server_events) = lan_server.serve();
        *self.lan_server.write().await = Some(server_handle);

        let fullname = format!(
            "{}-{}.{}",
            self.identity.name,
            &self.device_id().as_str()[..8.min(self.device_id().as_str().len())],
            crate::protocol::constants::SERVICE_TYPE
        );
        self.manager
            .start_advertising(&self.identity.name, &self.fingerprint(), port, fullname)?;
        let discovery_events = self.discovery.browse()?;

        if let Some(relay) = self.config.cloud_relay_url.clone() {
            self.connect_cloud(relay).await;
        }

        let (wake_tx, wake_rx) = mpsc::channel(16);
        *self.wake_tx.write().await = Some(wake_tx.clone());

        spawn_server_event_forwarder(
            server_events,
            self.orchestrator.clone(),
            self.prober.clone(),
            tx.clone(),
            self.active_pairing.clone(),
            self.keystore.clone(),
        );
        spawn_discovery_event_forwarder(
            discovery_events,
            self.registry.clone(),
            self.dual.clone(),
            self.device_id(),
            self.prober.clone(),
            wake_tx.clone(),
            tx.clone(),
        );
        tokio::spawn(run_wake_loop(self.orchestrator.clone(), self.dual.clone(), wake_rx));
        self.spawn_clipboard_monitor(wake_tx);

        tracing::info!(port, "omniclip service started");
        Ok(rx)
    }

    async fn connect_cloud(&self, relay: Url) {
        self.dual
            .connect_cloud(WsTransportConfig {
                url: relay,
                device_id: self.device_id(),
                device_platform: local_platform(),
                pinned_fingerprint: None,
                is_cloud: true,
            })
            .await;
    }

    fn spawn_clipboard_monitor(&self, wake_tx: mpsc::Sender<()>) {
        let orchestrator = self.orchestrator.clone();
        let device_name = self.identity.name.clone();
        let source = ArboardSource::new(self.notifications.clone());
        let Ok(source) = source else {
            tracing::warn!("clipboard pasteboard unavailable, monitor not started");
            return;
        };
        let manager = ClipboardManager::new(Box::new(source));
        let (mut clip_rx, _handle) =
            clipboard::start_monitor(manager, Duration::from_millis(CLIPBOARD_POLL_INTERVAL_MS));

        tokio::spawn(async move {
            while let Some(change) = clip_rx.recv().await {
                if let Err(e) = orchestrator
                    .capture_local(change.content, local_platform(), device_name.clone())
                    .await
                {
                    tracing::warn!("failed to capture local clipboard change: {e}");
                    continue;
                }
                let _ = wake_tx.send(()).await;
            }
        });
    }

    /// Begin hosting a pairing session: generates an ephemeral keypair and a
    /// signed QR payload advertising this device's LAN address.
    pub async fn begin_pairing_as_host(&self, host_address: impl Into<String>) -> Result<(String, PairingQrData)> {
        let (session, qr) = PairingSession::host(
            self.device_id(),
            self.identity.name.clone(),
            local_platform(),
            &self.identity.signing_key,
            host_address,
            self.config.port,
        );
        *self.active_pairing.write().await = Some(Arc::new(session));
        let svg = qr.to_qr_svg()?;
        Ok((svg, qr))
    }

    /// Answer a challenge received from an initiator scanning our QR.
    pub async fn answer_pairing_challenge(&self, challenge: &PairingChallenge) -> Result<PairingAck> {
        let pairing = self.active_pairing.read().await;
        let session = pairing
            .as_ref()
            .ok_or_else(|| Error::InvalidChallengePayload("no active pairing session".to_string()))?;
        session.handle_challenge(challenge, &self.keystore).await
    }

    /// Initiator side: verify a scanned QR and build the outbound challenge.
    pub async fn begin_pairing_as_initiator(
        &self,
        qr: &PairingQrData,
        host_verifying_key: &VerifyingKey,
    ) -> Result<PairingChallenge> {
        let (session, challenge) = PairingSession::from_qr(
            qr,
            host_verifying_key,
            self.device_id(),
            self.identity.name.clone(),
            local_platform(),
        )?;
        *self.active_pairing.write().await = Some(Arc::new(session));
        Ok(challenge)
    }

    /// Confirm the host's ack and persist the paired device.
    pub async fn verify_pairing_ack(&self, ack: &PairingAck, host_name: String) -> Result<DeviceId> {
        let pairing = self.active_pairing.read().await;
        let session = pairing
            .as_ref()
            .ok_or_else(|| Error::InvalidChallengePayload("no active pairing session".to_string()))?;
        session.verify_ack(ack, &self.keystore).await?;
        let peer_id = match session.status() {
            PairingStatus::Completed { peer_device_id } => peer_device_id,
            _ => return Err(Error::InvalidChallengePayload("pairing did not complete".to_string())),
        };
        self.registry
            .upsert(PairedDevice {
                id: peer_id.clone(),
                name: host_name,
                platform: None,
                last_seen: chrono::Utc::now(),
                is_online: true,
                service_name: None,
                lan_host: None,
                lan_port: None,
                fingerprint: None,
            })
            .await?;
        Ok(peer_id)
    }

    pub async fn paired_devices(&self) -> Vec<PairedDevice> {
        self.registry.all().await
    }

    pub async fn unpair_device(&self, device_id: &DeviceId) -> Result<()> {
        self.registry.remove(device_id).await?;
        self.keystore.delete(device_id.as_str()).await
    }

    pub fn transport_state(&self) -> crate::manager::ManagerState {
        self.manager.state()
    }
}

fn spawn_dual_event_forwarder(
    mut events_rx: mpsc::Receiver<(TransportPath, TransportEvent)>,
    orchestrator: Arc<SyncOrchestrator>,
    prober: Arc<ConnectionProber>,
) {
    tokio::spawn(async move {
        while let Some((path, event)) = events_rx.recv().await {
            match event {
                TransportEvent::EnvelopeReceived(envelope) => {
                    let origin = match path {
                        TransportPath::Lan => TransportOrigin::Lan,
                        TransportPath::Cloud => TransportOrigin::Cloud,
                    };
                    if let Err(e) = orchestrator.handle_incoming(&envelope, origin).await {
                        tracing::warn!("failed to handle incoming envelope: {e}");
                    }
                }
                TransportEvent::Connected if path == TransportPath::Cloud => {
                    let _ = prober
                        .handle_event(ProbeEvent::CloudStateChanged(ConnectionState::Connected))
                        .await;
                }
                TransportEvent::Disconnected if path == TransportPath::Cloud => {
                    let _ = prober
                        .handle_event(ProbeEvent::CloudStateChanged(ConnectionState::Disconnected))
                        .await;
                }
                _ => {}
            }
        }
    });
}

fn spawn_server_event_forwarder(
    mut events_rx: mpsc::Receiver<ServerEvent>,
    orchestrator: Arc<SyncOrchestrator>,
    prober: Arc<ConnectionProber>,
    service_tx: mpsc::Sender<ServiceEvent>,
    active_pairing: Arc<RwLock<Option<Arc<PairingSession>>>>,
    keystore: Arc<KeyStore>,
) {
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                ServerEvent::Connected { device_id: Some(device_id), .. } => {
                    let _ = prober.handle_event(ProbeEvent::InboundConnected(device_id)).await;
                }
                ServerEvent::Connected { device_id: None, .. } => {}
                ServerEvent::Disconnected { device_id: Some(device_id) } => {
                    let _ = prober.handle_event(ProbeEvent::InboundDisconnected(device_id)).await;
                }
                ServerEvent::Disconnected { device_id: None } => {}
                ServerEvent::EnvelopeReceived(envelope) => {
                    let from = envelope.payload.device_id.clone();
                    if let Err(e) = orchestrator.handle_incoming(&envelope, TransportOrigin::Lan).await {
                        tracing::warn!("failed to handle inbound LAN envelope: {e}");
                        let _ = service_tx.send(ServiceEvent::Error(e.to_string())).await;
                    } else {
                        let _ = service_tx.send(ServiceEvent::ClipboardReceived { from_device: from }).await;
                    }
                }
                ServerEvent::PairingChallenge { challenge, reply } => {
                    let session = active_pairing.read().await.clone();
                    let outcome = match session {
                        Some(session) => session.handle_challenge(&challenge, &keystore).await,
                        None => Err(Error::InvalidChallengePayload("no active pairing session".to_string())),
                    };
                    if let Err(e) = &outcome {
                        tracing::warn!("inbound pairing challenge rejected: {e}");
                    }
                    let _ = reply.send(outcome);
                }
                ServerEvent::PairingAck(ack) => {
                    let session = active_pairing.read().await.clone();
                    match session {
                        Some(session) => {
                            if let Err(e) = session.verify_ack(&ack, &keystore).await {
                                tracing::warn!("inbound pairing ack rejected: {e}");
                            }
                        }
                        None => tracing::debug!("dropping pairing ack: no active pairing session"),
                    }
                }
            }
        }
    });
}

fn spawn_discovery_event_forwarder(
    mut events_rx: mpsc::Receiver<DiscoveryEvent>,
    registry: Arc<PairedDeviceRegistry>,
    dual: Arc<DualTransport>,
    local_device_id: DeviceId,
    prober: Arc<ConnectionProber>,
    wake_tx: mpsc::Sender<()>,
    service_tx: mpsc::Sender<ServiceEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                DiscoveryEvent::PeerFound(peer) => {
                    if let Some(device_id) = peer.device_id.clone() {
                        if registry.get(&device_id).await.is_some() {
                            let _ = prober.handle_event(ProbeEvent::PeerDiscovered(device_id)).await;
                            if let Ok(url) = Url::parse(&format!("ws://{}:{}", peer.host, peer.port)) {
                                dual.connect_lan(WsTransportConfig {
                                    url,
                                    device_id: local_device_id.clone(),
                                    device_platform: local_platform(),
                                    pinned_fingerprint: None,
                                    is_cloud: false,
                                })
                                .await;
                                let _ = wake_tx.send(()).await;
                            }
                        }
                    }
                    let _ = service_tx.send(ServiceEvent::DeviceDiscovered(peer)).await;
                }
                DiscoveryEvent::PeerLost(name) => {
                    let _ = service_tx.send(ServiceEvent::DeviceLost(name)).await;
                }
            }
        }
    });
}
