//! Transport Manager (C11) — advertisement lifecycle, discovery cache, and
//! the connection-state machine `spec.md` §4.11 names:
//! `{idle, connecting_lan, connected_lan, connecting_cloud, connected_cloud,
//! disconnected, error(msg)}`.
//!
//! Grounded on [`crate::transport::dual::DualTransport`]'s LAN-first-then-
//! cloud race and [`crate::discovery::DiscoveryService`]'s advertise/browse
//! split; this module is the layer above both that tracks which path last
//! worked per peer and publishes state for the orchestrator to watch.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};

use crate::discovery::{DiscoveredPeer, DiscoveryService};
use crate::error::{Error, Result};
use crate::protocol::envelope::DeviceId;
use crate::transport::dual::TransportPath;

#[derive(Debug, Clone, PartialEq)]
pub enum ManagerState {
    Idle,
    ConnectingLan,
    ConnectedLan,
    ConnectingCloud,
    ConnectedCloud,
    Disconnected,
    Error(String),
}

/// Why `connect` fell through to the cloud dialer (`spec.md` §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    LanTimeout,
    LanFailure,
    Unknown,
}

/// `preference` argument to `preferred_transport` (`spec.md` §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPreference {
    LanFirst,
    CloudOnly,
}

/// What `preferred_transport` resolves to: `lan_first` always resolves to
/// `Dual` (race LAN then fall back); `cloud_only` skips the race entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTransport {
    Dual,
    CloudOnly,
}

pub fn preferred_transport(preference: TransportPreference) -> SyncTransport {
    match preference {
        TransportPreference::LanFirst => SyncTransport::Dual,
        TransportPreference::CloudOnly => SyncTransport::CloudOnly,
    }
}

/// Owns the discovery cache, the advertisement on/off switch, and the
/// per-peer last-successful-transport map. Connection state for a given
/// dial attempt is published on a `watch` channel so the orchestrator can
/// wake its queue processor on `Connected*` transitions.
pub struct TransportManager {
    discovery: Arc<DiscoveryService>,
    state_tx: watch::Sender<ManagerState>,
    state_rx: watch::Receiver<ManagerState>,
    last_successful: RwLock<HashMap<DeviceId, TransportPath>>,
    advertised_fullname: RwLock<Option<String>>,
}

impl TransportManager {
    pub fn new(discovery: Arc<DiscoveryService>) -> Self {
        let (state_tx, state_rx) = watch::channel(ManagerState::Idle);
        Self {
            discovery,
            state_tx,
            state_rx,
            last_successful: RwLock::new(HashMap::new()),
            advertised_fullname: RwLock::new(None),
        }
    }

    pub fn state(&self) -> ManagerState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ManagerState> {
        self.state_rx.clone()
    }

    fn set_state(&self, state: ManagerState) {
        let _ = self.state_tx.send(state);
    }

    /// Start advertising on the LAN, e.g. when the app gains focus
    /// (`spec.md` §4.11).
    pub fn start_advertising(&self, device_name: &str, fingerprint_sha256: &str, port: u16, fullname: String) -> Result<()> {
        self.discovery.register(device_name, fingerprint_sha256, port)?;
        *self.advertised_fullname.try_write().map_err(|_| Error::Cancelled)? = Some(fullname);
        Ok(())
    }

    /// Stop advertising, e.g. when the app loses focus.
    pub async fn stop_advertising(&self) -> Result<()> {
        let fullname = self.advertised_fullname.write().await.take();
        if let Some(fullname) = fullname {
            self.discovery.unregister(&fullname)?;
        }
        Ok(())
    }

    pub async fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        self.discovery.peers().await
    }

    pub async fn last_successful_transport(&self, key: &DeviceId) -> Option<TransportPath> {
        self.last_successful.read().await.get(key).copied()
    }

    async fn record_success(&self, key: DeviceId, path: TransportPath) {
        self.last_successful.write().await.insert(key, path);
    }

    /// Race `lan_dialer` against `lan_timeout`; on success the state becomes
    /// `connected_lan`. On timeout or dialer failure, record the fallback
    /// reason and invoke `cloud_dialer` (`spec.md` §4.11).
    pub async fn connect<LanFut, CloudFut>(
        &self,
        key: DeviceId,
        lan_dialer: impl FnOnce() -> LanFut,
        cloud_dialer: impl FnOnce() -> CloudFut,
        lan_timeout: Duration,
    ) -> Result<(TransportPath, Option<FallbackReason>)>
    where
        LanFut: Future<Output = Result<()>>,
        CloudFut: Future<Output = Result<()>>,
    {
        self.set_state(ManagerState::ConnectingLan);

        let fallback_reason = match tokio::time::timeout(lan_timeout, lan_dialer()).await {
            Ok(Ok(())) => {
                self.set_state(ManagerState::ConnectedLan);
                self.record_success(key, TransportPath::Lan).await;
                return Ok((TransportPath::Lan, None));
            }
            Ok(Err(_)) => FallbackReason::LanFailure,
            Err(_) => FallbackReason::LanTimeout,
        };

        self.set_state(ManagerState::ConnectingCloud);
        match cloud_dialer().await {
            Ok(()) => {
                self.set_state(ManagerState::ConnectedCloud);
                self.record_success(key, TransportPath::Cloud).await;
                Ok((TransportPath::Cloud, Some(fallback_reason)))
            }
            Err(e) => {
                self.set_state(ManagerState::Error(e.to_string()));
                Err(e)
            }
        }
    }

    pub fn mark_disconnected(&self) {
        self.set_state(ManagerState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn manager() -> TransportManager {
        let discovery = Arc::new(DiscoveryService::new(DeviceId::random()).unwrap());
        TransportManager::new(discovery)
    }

    #[tokio::test]
    async fn connect_succeeds_over_lan_without_touching_cloud() {
        let manager = manager();
        let key = DeviceId::new("peer");
        let (path, fallback) = manager
            .connect(
                key.clone(),
                || async { Ok(()) },
                || async { panic!("cloud dialer should not run") },
                Duration::from_secs(3),
            )
            .await
            .unwrap();
        assert_eq!(path, TransportPath::Lan);
        assert!(fallback.is_none());
        assert_eq!(manager.state(), ManagerState::ConnectedLan);
        assert_eq!(manager.last_successful_transport(&key).await, Some(TransportPath::Lan));
    }

    #[tokio::test]
    async fn connect_falls_back_to_cloud_on_lan_timeout() {
        let manager = manager();
        let key = DeviceId::new("peer");
        let (path, fallback) = manager
            .connect(
                key.clone(),
                || async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                },
                || async { Ok(()) },
                Duration::from_millis(5),
            )
            .await
            .unwrap();
        assert_eq!(path, TransportPath::Cloud);
        assert_eq!(fallback, Some(FallbackReason::LanTimeout));
        assert_eq!(manager.state(), ManagerState::ConnectedCloud);
    }

    #[tokio::test]
    async fn connect_falls_back_to_cloud_on_lan_failure() {
        let manager = manager();
        let key = DeviceId::new("peer");
        let (path, fallback) = manager
            .connect(
                key,
                || async { Err(Error::ConnectFailed("refused".to_string())) },
                || async { Ok(()) },
                Duration::from_secs(3),
            )
            .await
            .unwrap();
        assert_eq!(path, TransportPath::Cloud);
        assert_eq!(fallback, Some(FallbackReason::LanFailure));
    }

    #[test]
    fn preferred_transport_lan_first_is_dual() {
        assert_eq!(preferred_transport(TransportPreference::LanFirst), SyncTransport::Dual);
        assert_eq!(preferred_transport(TransportPreference::CloudOnly), SyncTransport::CloudOnly);
    }
}
