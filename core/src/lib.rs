//! Omniclip Core - Cross-platform clipboard sync library
//!
//! This library provides the core functionality for syncing clipboard
//! content across devices over LAN using mDNS discovery and encrypted
//! peer-to-peer connections.

pub mod clipboard;
pub mod crypto;
pub mod discovery;
pub mod history;
pub mod keystore;
pub mod manager;
pub mod orchestrator;
pub mod pairing;
pub mod ports;
pub mod prober;
pub mod protocol;
pub mod server;
pub mod service;
pub mod sync;
pub mod transport;

mod error;

pub use error::{Error, Result};

/// Device identity containing keys and metadata
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub id: uuid::Uuid,
    pub name: String,
    pub signing_key: crypto::SigningKey,
}

impl DeviceIdentity {
    /// Create a new device identity with generated keys
    pub fn new(name: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            name,
            signing_key: crypto::SigningKey::generate(),
        }
    }

    /// Get the public key fingerprint for display/verification
    pub fn fingerprint(&self) -> String {
        self.signing_key.public_key_fingerprint()
    }
}

/// Configuration for the Omniclip service
#[derive(Debug, Clone)]
pub struct Config {
    /// Port to listen on for incoming connections
    pub port: u16,
    /// mDNS service name
    pub service_name: String,
    /// Path to store persistent data (keys, paired devices, history)
    pub data_dir: std::path::PathBuf,
    /// Cloud relay to fall back to when LAN dialing times out or fails
    /// (`spec.md` §4.11); `None` disables cloud fallback entirely.
    pub cloud_relay_url: Option<url::Url>,
    /// Whether unencrypted envelopes may be sent/accepted when no key is on
    /// file yet (`spec.md` §4.6 "explicitly gated by a configuration flag").
    pub allow_plaintext: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: protocol::constants::DEFAULT_PORT,
            service_name: protocol::constants::SERVICE_TYPE.to_string(),
            data_dir: dirs_home().join(".omniclip"),
            cloud_relay_url: None,
            allow_plaintext: false,
        }
    }
}

fn dirs_home() -> std::path::PathBuf {
    dirs::home_dir().unwrap_or_else(|| std::path::PathBuf::from("."))
}

// Re-export key types for convenience
pub use discovery::DiscoveredPeer;
pub use keystore::SymmetricKey;
pub use protocol::ClipboardContent;
pub use service::OmniclipService;
