//! Connection Prober (C13) — event-driven (not periodic) online/offline
//! recomputation (`spec.md` §4.13).
//!
//! Grounded on [`crate::history::PairedDeviceRegistry`]'s async, lock-guarded
//! shape: the prober holds its own small sets of "currently true" facts and
//! recomputes a peer's online bit by OR-ing them together whenever one
//! changes, then writes straight through to the registry.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::error::Result;
use crate::history::PairedDeviceRegistry;
use crate::protocol::envelope::DeviceId;
use crate::transport::ConnectionState;

/// An observation that should trigger recomputation of one peer's online
/// status (`spec.md` §4.13: discovery added/removed, inbound server
/// connections, and the cloud socket's state).
#[derive(Debug, Clone)]
pub enum ProbeEvent {
    PeerDiscovered(DeviceId),
    PeerLost(DeviceId),
    InboundConnected(DeviceId),
    InboundDisconnected(DeviceId),
    /// The shared cloud socket changed state; every peer whose last
    /// successful transport was cloud must be recomputed.
    CloudStateChanged(ConnectionState),
}

pub struct ConnectionProber {
    registry: std::sync::Arc<PairedDeviceRegistry>,
    discovered: Mutex<HashSet<DeviceId>>,
    inbound: Mutex<HashSet<DeviceId>>,
    cloud_connected: Mutex<bool>,
    /// Peers whose `last_successful_transport` (C11) was `cloud`; maintained
    /// by the caller via `note_last_successful_cloud`.
    cloud_eligible: Mutex<HashSet<DeviceId>>,
}

impl ConnectionProber {
    pub fn new(registry: std::sync::Arc<PairedDeviceRegistry>) -> Self {
        Self {
            registry,
            discovered: Mutex::new(HashSet::new()),
            inbound: Mutex::new(HashSet::new()),
            cloud_connected: Mutex::new(false),
            cloud_eligible: Mutex::new(HashSet::new()),
        }
    }

    /// Record that `peer`'s last successful transport (C11) was cloud, so a
    /// later `CloudStateChanged` event recomputes it correctly.
    pub fn note_last_successful_cloud(&self, peer: DeviceId) {
        self.cloud_eligible.lock().unwrap().insert(peer);
    }

    fn is_online(&self, peer: &DeviceId) -> bool {
        let discovered = self.discovered.lock().unwrap().contains(peer);
        let inbound = self.inbound.lock().unwrap().contains(peer);
        let cloud_online = *self.cloud_connected.lock().unwrap() && self.cloud_eligible.lock().unwrap().contains(peer);
        discovered || inbound || cloud_online
    }

    pub async fn handle_event(&self, event: ProbeEvent) -> Result<()> {
        match event {
            ProbeEvent::PeerDiscovered(peer) => {
                self.discovered.lock().unwrap().insert(peer.clone());
                self.registry.set_online(&peer, self.is_online(&peer)).await?;
            }
            ProbeEvent::PeerLost(peer) => {
                self.discovered.lock().unwrap().remove(&peer);
                self.registry.set_online(&peer, self.is_online(&peer)).await?;
            }
            ProbeEvent::InboundConnected(peer) => {
                self.inbound.lock().unwrap().insert(peer.clone());
                self.registry.set_online(&peer, self.is_online(&peer)).await?;
            }
            ProbeEvent::InboundDisconnected(peer) => {
                self.inbound.lock().unwrap().remove(&peer);
                self.registry.set_online(&peer, self.is_online(&peer)).await?;
            }
            ProbeEvent::CloudStateChanged(state) => {
                *self.cloud_connected.lock().unwrap() = state == ConnectionState::Connected;
                let affected: Vec<DeviceId> = self.cloud_eligible.lock().unwrap().iter().cloned().collect();
                for peer in affected {
                    self.registry.set_online(&peer, self.is_online(&peer)).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::PairedDevice;
    use chrono::Utc;
    use std::sync::Arc;

    async fn registry_with(peer: &DeviceId) -> Arc<PairedDeviceRegistry> {
        let registry = Arc::new(PairedDeviceRegistry::in_memory());
        registry
            .upsert(PairedDevice {
                id: peer.clone(),
                name: "Phone".to_string(),
                platform: None,
                last_seen: Utc::now(),
                is_online: false,
                service_name: None,
                lan_host: None,
                lan_port: None,
                fingerprint: None,
            })
            .await
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn discovery_marks_peer_online_then_offline() {
        let peer = DeviceId::new("peer-1");
        let registry = registry_with(&peer).await;
        let prober = ConnectionProber::new(registry.clone());

        prober.handle_event(ProbeEvent::PeerDiscovered(peer.clone())).await.unwrap();
        assert!(registry.get(&peer).await.unwrap().is_online);

        prober.handle_event(ProbeEvent::PeerLost(peer.clone())).await.unwrap();
        assert!(!registry.get(&peer).await.unwrap().is_online);
    }

    #[tokio::test]
    async fn inbound_connection_marks_online_independent_of_discovery() {
        let peer = DeviceId::new("peer-2");
        let registry = registry_with(&peer).await;
        let prober = ConnectionProber::new(registry.clone());

        prober.handle_event(ProbeEvent::InboundConnected(peer.clone())).await.unwrap();
        assert!(registry.get(&peer).await.unwrap().is_online);
    }

    #[tokio::test]
    async fn cloud_state_change_only_affects_cloud_eligible_peers() {
        let peer = DeviceId::new("peer-3");
        let other = DeviceId::new("peer-4");
        let registry = registry_with(&peer).await;
        registry
            .upsert(PairedDevice {
                id: other.clone(),
                name: "Laptop".to_string(),
                platform: None,
                last_seen: Utc::now(),
                is_online: false,
                service_name: None,
                lan_host: None,
                lan_port: None,
                fingerprint: None,
            })
            .await
            .unwrap();

        let prober = ConnectionProber::new(registry.clone());
        prober.note_last_successful_cloud(peer.clone());

        prober
            .handle_event(ProbeEvent::CloudStateChanged(ConnectionState::Connected))
            .await
            .unwrap();
        assert!(registry.get(&peer).await.unwrap().is_online);
        assert!(!registry.get(&other).await.unwrap().is_online);
    }
}
