//! Wire protocol: envelope schema, pairing messages, and shared constants.

pub mod constants;
pub mod envelope;
pub mod pairing;

pub use envelope::{
    ClipboardContent, ClipboardEntry, ClipboardPayload, DeviceId, DevicePlatform,
    EncryptionInfo, EnvelopePayload, EnvelopeType, ImageFormat, SyncEnvelope, TransportOrigin,
};
pub use pairing::{
    AckPayload, ChallengePayload, PairingAck, PairingChallenge, PairingKeyMaterial, PairingQrData,
};
