//! Bonjour/mDNS (C10) — advertise local service, browse peers, TTL-prune
//! stale peers (`spec.md` §4.10).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use mdns_sd::{ServiceDaemon, ServiceEvent as MdnsEvent, ServiceInfo};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Duration;

use crate::protocol::constants::{
    PRUNE_INTERVAL_SECS, PROTOCOL_VERSION, SERVICE_TYPE, STALE_PEER_INTERVAL_SECS,
};
use crate::protocol::envelope::DeviceId;
use crate::{Error, Result};

/// `spec.md` §3 `DiscoveredPeer`.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub device_id: Option<DeviceId>,
    pub fingerprint: Option<String>,
    pub version: Option<String>,
    pub protocols: Option<String>,
    pub last_seen: i64,
}

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    PeerFound(DiscoveredPeer),
    PeerLost(String),
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Bonjour/mDNS advertisement + browse + staleness pruning.
pub struct DiscoveryService {
    daemon: ServiceDaemon,
    local_device_id: DeviceId,
    peers: Arc<RwLock<HashMap<String, DiscoveredPeer>>>,
}

impl DiscoveryService {
    pub fn new(local_device_id: DeviceId) -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| Error::Discovery(e.to_string()))?;
        Ok(Self {
            daemon,
            local_device_id,
            peers: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Advertise this host on the LAN (`spec.md` §6: TXT keys `device_id`,
    /// `fingerprint_sha256`, `version`, `protocols`).
    pub fn register(&self, device_name: &str, fingerprint_sha256: &str, port: u16) -> Result<()> {
        let instance_name = format!("{}-{}", device_name, &self.local_device_id.as_str()[..8.min(self.local_device_id.as_str().len())]);

        let mut properties = HashMap::new();
        properties.insert("device_id".to_string(), self.local_device_id.to_string());
        properties.insert("fingerprint_sha256".to_string(), fingerprint_sha256.to_string());
        properties.insert("version".to_string(), PROTOCOL_VERSION.to_string());
        properties.insert("protocols".to_string(), "ws".to_string());

        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "omniclip".to_string());

        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &instance_name,
            &format!("{host}.local."),
            (),
            port,
            properties,
        )
        .map_err(|e| Error::Discovery(e.to_string()))?;

        self.daemon.register(service).map_err(|e| Error::Discovery(e.to_string()))?;
        tracing::info!(instance = %instance_name, "registered mDNS service");
        Ok(())
    }

    /// Stop advertising, e.g. when the app loses focus (`spec.md` §4.11
    /// "advertisement lifecycle (start/stop with app focus)").
    pub fn unregister(&self, fullname: &str) -> Result<()> {
        self.daemon
            .unregister(fullname)
            .map(|_| ())
            .map_err(|e| Error::Discovery(e.to_string()))
    }

    /// Browse for peers and run a staleness-pruning loop alongside it.
    pub fn browse(&self) -> Result<mpsc::Receiver<DiscoveryEvent>> {
        let (tx, rx) = mpsc::channel(32);
        let peers = self.peers.clone();
        let local_device_id = self.local_device_id.clone();

        let receiver = self
            .daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| Error::Discovery(e.to_string()))?;

        let browse_peers = peers.clone();
        let browse_tx = tx.clone();
        tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    MdnsEvent::ServiceResolved(info) => {
                        let props = info.get_properties();
                        let device_id = props.get("device_id").map(|v| DeviceId::new(v.val_str()));

                        if device_id.as_ref() == Some(&local_device_id) {
                            continue;
                        }

                        let peer = DiscoveredPeer {
                            service_name: info.get_fullname().to_string(),
                            host: info
                                .get_addresses()
                                .iter()
                                .next()
                                .map(|ip| ip.to_string())
                                .unwrap_or_else(|| info.get_hostname().to_string()),
                            port: info.get_port(),
                            device_id,
                            fingerprint: props.get("fingerprint_sha256").map(|v| v.val_str().to_string()),
                            version: props.get("version").map(|v| v.val_str().to_string()),
                            protocols: props.get("protocols").map(|v| v.val_str().to_string()),
                            last_seen: now_epoch(),
                        };

                        browse_peers
                            .write()
                            .await
                            .insert(peer.service_name.clone(), peer.clone());

                        if browse_tx.send(DiscoveryEvent::PeerFound(peer)).await.is_err() {
                            break;
                        }
                    }
                    MdnsEvent::ServiceRemoved(_, fullname) => {
                        let removed = browse_peers.write().await.remove(&fullname).is_some();
                        if removed && browse_tx.send(DiscoveryEvent::PeerLost(fullname)).await.is_err() {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        });

        let prune_peers = peers;
        let prune_tx = tx;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(PRUNE_INTERVAL_SECS));
            loop {
                interval.tick().await;
                let cutoff = now_epoch() - STALE_PEER_INTERVAL_SECS as i64;
                let stale: Vec<String> = {
                    let guard = prune_peers.read().await;
                    guard
                        .values()
                        .filter(|p| p.last_seen < cutoff)
                        .map(|p| p.service_name.clone())
                        .collect()
                };
                if stale.is_empty() {
                    continue;
                }
                let mut guard = prune_peers.write().await;
                for name in stale {
                    guard.remove(&name);
                    if prune_tx.send(DiscoveryEvent::PeerLost(name)).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    pub async fn peers(&self) -> Vec<DiscoveredPeer> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn peer_by_service_name(&self, service_name: &str) -> Option<DiscoveredPeer> {
        self.peers.read().await.get(service_name).cloned()
    }

    pub fn shutdown(self) -> Result<()> {
        self.daemon.shutdown().map_err(|e| Error::Discovery(e.to_string()))?;
        Ok(())
    }
}

/// Local, non-loopback IP addresses, used to populate LAN server
/// advertisement and QR pairing data.
pub fn get_local_ips() -> Vec<std::net::IpAddr> {
    let mut ips = Vec::new();
    if let Ok(interfaces) = get_if_addrs::get_if_addrs() {
        for iface in interfaces {
            if !iface.is_loopback() {
                ips.push(iface.ip());
            }
        }
    }
    ips
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_ips_lookup_does_not_panic() {
        let _ = get_local_ips();
    }
}
