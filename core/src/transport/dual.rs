//! Dual Transport (C8) — fans a clipboard entry out over LAN and cloud,
//! re-encrypting separately for each path (`spec.md` §4.8/§9: GCM nonce reuse
//! safety means the same ciphertext must never be replayed across sockets).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};

use crate::error::Result;
use crate::protocol::constants::DUAL_LAN_TIMEOUT_SECS;
use crate::protocol::envelope::{ClipboardEntry, DeviceId};
use crate::sync::engine::SyncEngine;
use crate::transport::ws::{ConnectionState, TransportEvent, WsTransport, WsTransportConfig};

/// Which socket carried a message, surfaced back to callers that track
/// `last_successful_transport` (C11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPath {
    Lan,
    Cloud,
}

/// Owns up to one LAN and one cloud `WsTransport`, racing LAN first with a
/// short timeout before falling back to cloud (`spec.md` §4.8).
pub struct DualTransport {
    engine: Arc<SyncEngine>,
    lan: RwLock<Option<WsTransport>>,
    cloud: RwLock<Option<WsTransport>>,
    events_tx: mpsc::Sender<(TransportPath, TransportEvent)>,
}

impl DualTransport {
    pub fn new(engine: Arc<SyncEngine>, events_tx: mpsc::Sender<(TransportPath, TransportEvent)>) -> Self {
        Self {
            engine,
            lan: RwLock::new(None),
            cloud: RwLock::new(None),
            events_tx,
        }
    }

    pub async fn connect_lan(&self, config: WsTransportConfig) {
        let (tx, mut rx) = mpsc::channel(64);
        let transport = WsTransport::spawn(config, tx);
        *self.lan.write().await = Some(transport);

        let forward = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if forward.send((TransportPath::Lan, event)).await.is_err() {
                    break;
                }
            }
        });
    }

    pub async fn connect_cloud(&self, config: WsTransportConfig) {
        let (tx, mut rx) = mpsc::channel(64);
        let transport = WsTransport::spawn(config, tx);
        *self.cloud.write().await = Some(transport);

        let forward = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if forward.send((TransportPath::Cloud, event)).await.is_err() {
                    break;
                }
            }
        });
    }

    pub async fn disconnect_lan(&self) {
        if let Some(transport) = self.lan.write().await.take() {
            transport.disconnect().await;
        }
    }

    pub async fn disconnect_cloud(&self) {
        if let Some(transport) = self.cloud.write().await.take() {
            transport.disconnect().await;
        }
    }

    pub async fn lan_state(&self) -> ConnectionState {
        match self.lan.read().await.as_ref() {
            Some(t) => t.state(),
            None => ConnectionState::Idle,
        }
    }

    pub async fn cloud_state(&self) -> ConnectionState {
        match self.cloud.read().await.as_ref() {
            Some(t) => t.state(),
            None => ConnectionState::Idle,
        }
    }

    /// Send `entry` to `target` over both transports concurrently
    /// (`spec.md` §4.8): each path re-encrypts the same plaintext with its
    /// own `SyncEngine::transmit` call, drawing a fresh nonce, and the two
    /// sends are dispatched together rather than LAN-then-cloud-fallback.
    /// Either leg succeeding is a silent success; both failing propagates
    /// the cloud's error.
    pub async fn send(&self, entry: &ClipboardEntry, target: DeviceId) -> Result<TransportPath> {
        let lan_fut = async {
            let lan = self.lan.read().await;
            let lan = lan.as_ref().filter(|t| t.state() == ConnectionState::Connected)?;
            let envelope = match self.engine.transmit(entry, target.clone()).await {
                Ok(envelope) => envelope,
                Err(e) => return Some(Err(e)),
            };
            let sent = tokio::time::timeout(
                Duration::from_secs(DUAL_LAN_TIMEOUT_SECS),
                lan.send(envelope),
            )
            .await;
            match sent {
                Ok(Ok(())) => Some(Ok(())),
                Ok(Err(e)) => Some(Err(e)),
                Err(_) => {
                    tracing::debug!("LAN send did not complete within {DUAL_LAN_TIMEOUT_SECS}s");
                    Some(Err(crate::error::Error::Timeout))
                }
            }
        };

        let cloud_fut = async {
            let cloud = self.cloud.read().await;
            let cloud = cloud.as_ref().ok_or(crate::error::Error::SocketNotConnected)?;
            let envelope = self.engine.transmit(entry, target.clone()).await?;
            cloud.send(envelope).await
        };

        let (lan_result, cloud_result) = tokio::join!(lan_fut, cloud_fut);

        match (lan_result, cloud_result) {
            (Some(Ok(())), _) => Ok(TransportPath::Lan),
            (_, Ok(())) => Ok(TransportPath::Cloud),
            (_, Err(e)) => Err(e),
        }
    }
}
