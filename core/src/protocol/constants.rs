//! Centralized protocol constants
//!
//! All protocol-level constants are defined here to ensure consistency
//! across the codebase and make configuration easier.

/// Default LAN WebSocket server port (`spec.md` §4.9/§6).
pub const DEFAULT_PORT: u16 = 7010;

/// mDNS service type for discovery (`spec.md` §4.10/§6).
pub const SERVICE_TYPE: &str = "_hypo._tcp.local.";

/// URL scheme prefix for pairing QR codes.
pub const PAIRING_URL_SCHEME: &str = "omniclip://pair";

/// Info string used in HKDF session-key derivation during pairing.
pub const SESSION_KEY_INFO: &[u8] = b"omniclip-session-key";

/// Maximum wire frame size, matching `max_attachment_bytes` (`spec.md` §6).
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Current wire protocol version string (`spec.md` §3/§6).
pub const PROTOCOL_VERSION: &str = "1.0";

/// Clipboard polling interval (`spec.md` §4.5).
pub const CLIPBOARD_POLL_INTERVAL_MS: u64 = 500;

/// Token-bucket capacity/refill for the clipboard monitor (`spec.md` §4.5).
pub const CLIPBOARD_THROTTLE_CAPACITY: u32 = 5;
pub const CLIPBOARD_THROTTLE_REFILL_PER_SEC: u32 = 1;

/// Size limits (`spec.md` §6).
pub const MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;
pub const MAX_RAW_SIZE_FOR_COMPRESSION: u64 = 1024 * 1024;
pub const MAX_IMAGE_DIMENSION_PX: u32 = 2048;
pub const MAX_COPY_SIZE_BYTES: u64 = 50 * 1024 * 1024;

/// Transport timing (`spec.md` §4.7/§5).
pub const LAN_DIAL_TIMEOUT_SECS: u64 = 3;
pub const SMALL_MESSAGE_TIMEOUT_SECS: u64 = 5;
pub const LARGE_MESSAGE_TIMEOUT_SECS: u64 = 10;
pub const LARGE_MESSAGE_THRESHOLD_BYTES: usize = 100 * 1024;
pub const MESSAGE_EXPIRY_SECS: u64 = 300;
pub const MAX_SEND_RETRIES: u32 = 8;
pub const MAX_BACKOFF_SECS: u64 = 128;
pub const QUEUE_CAPACITY: usize = 100;
pub const CLOUD_PING_INTERVAL_SECS: u64 = 840;
pub const LAN_IDLE_TIMEOUT_SECS: u64 = 30;
pub const CONTROL_QUERY_TIMEOUT_SECS: u64 = 5;
pub const DUAL_LAN_TIMEOUT_SECS: u64 = 3;

/// Discovery timing (`spec.md` §4.10).
pub const STALE_PEER_INTERVAL_SECS: u64 = 300;
pub const PRUNE_INTERVAL_SECS: u64 = 60;

/// Pairing timing (`spec.md` §4.12).
pub const CHALLENGE_WINDOW_SECS: i64 = 30;
pub const QR_VALIDITY_SECS: i64 = 300;
pub const REPLAY_WINDOW_SIZE: usize = 32;

/// Orchestrator queue expiry, independent of `MESSAGE_EXPIRY_SECS` (`spec.md` §9).
pub const ORCHESTRATOR_MESSAGE_EXPIRY_SECS: u64 = 60;
