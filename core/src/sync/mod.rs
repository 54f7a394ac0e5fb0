//! Wire framing (C1) and the Sync Engine (C6): turning a clipboard entry into
//! an encrypted, compressed `SyncEnvelope` and back.

pub mod engine;
pub mod framing;

pub use engine::{build_payload, parse_payload, PlaintextPolicy, SyncEngine};
pub use framing::{decode, decode_body, encode, encode_body, peek_frame_len};
