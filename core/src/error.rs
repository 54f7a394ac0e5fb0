use thiserror::Error;

/// Omniclip error types, grouped by the domain taxonomy from the design spec
/// rather than by Rust module boundary.
#[derive(Error, Debug)]
pub enum Error {
    // --- Transport ---
    #[error("connection failed: {0}")]
    ConnectFailed(String),
    #[error("socket not connected")]
    SocketNotConnected,
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out")]
    Timeout,
    #[error("websocket upgrade rejected: {0}")]
    UpgradeRejected(String),
    #[error("certificate fingerprint mismatch")]
    PinMismatch,

    // --- Protocol / framing ---
    #[error("frame truncated")]
    FrameTruncated,
    #[error("bad frame length")]
    BadFrameLength,
    #[error("bad json: {0}")]
    BadJson(String),
    #[error("bad base64: {0}")]
    BadBase64(String),
    #[error("unsupported websocket opcode {0:#x}")]
    UnsupportedOpcode(u8),
    #[error("fragmented frame not supported")]
    FragmentedFrame,

    // --- Crypto ---
    #[error("authentication failed")]
    AuthFailure,
    #[error("bad key length")]
    BadKeyLength,
    #[error("bad nonce length")]
    BadNonceLength,
    #[error("cryptographic operation failed: {0}")]
    Crypto(String),

    // --- Key store ---
    #[error("missing key for device {0}")]
    MissingKey(String),

    // --- Pairing ---
    #[error("invalid signature")]
    InvalidSignature,
    #[error("pairing payload expired")]
    PayloadExpired,
    #[error("duplicate challenge")]
    DuplicateChallenge,
    #[error("challenge window too old")]
    ChallengeWindowTooOld,
    #[error("invalid challenge payload: {0}")]
    InvalidChallengePayload(String),

    // --- History ---
    #[error("serialization failure: {0}")]
    SerializationFailure(String),

    // --- Resource ---
    #[error("size limit exceeded")]
    SizeLimitExceeded,
    #[error("queue overflow")]
    QueueOverflow,

    // --- Relay control ---
    #[error("device not connected: {0}")]
    DeviceNotConnected(String),
    #[error("incorrect device id: {0}")]
    IncorrectDeviceId(String),

    // --- Generic / passthrough domains kept from the teacher ---
    #[error("network error: {0}")]
    Network(String),
    #[error("discovery error: {0}")]
    Discovery(String),
    #[error("clipboard error: {0}")]
    Clipboard(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("device not paired: {0}")]
    NotPaired(String),

    #[error("failed to serialize/deserialize: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
