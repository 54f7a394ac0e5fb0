//! Manual RFC 6455 opening handshake (`spec.md` §4.9/§6).
//!
//! The LAN server speaks raw WebSocket rather than pulling in a server-side
//! HTTP stack: incoming connections are always a single upgrade request from
//! a device that already knows our address from mDNS, so there is no routing
//! or content negotiation to do.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::protocol::envelope::{DeviceId, DevicePlatform};

const MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_HEADER_BYTES: usize = 8 * 1024;

pub struct HandshakeRequest {
    /// Populated from `X-Device-Id` when the client sends it; §4.9 allows a
    /// connection to complete without one, with the device id learned from
    /// the first pairing message instead.
    pub device_id: Option<DeviceId>,
    pub device_platform: Option<DevicePlatform>,
}

fn parse_headers(raw: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for line in raw.split("\r\n").skip(1) {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    headers
}

fn header_contains_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(MAGIC.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Read the upgrade request off `stream`, validate it, and write back the
/// `101 Switching Protocols` response (or a `400` on rejection).
pub async fn accept(stream: &mut TcpStream) -> Result<HandshakeRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(Error::UpgradeRejected("handshake headers too large".into()));
        }
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        if n == 0 {
            return Err(Error::UpgradeRejected("connection closed during handshake".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let raw = String::from_utf8_lossy(&buf);
    let headers = parse_headers(&raw);

    let upgrade_ok = headers
        .get("upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection_ok = headers
        .get("connection")
        .map(|v| header_contains_token(v, "upgrade"))
        .unwrap_or(false);
    let version_ok = headers.get("sec-websocket-version").map(String::as_str) == Some("13");
    let Some(client_key) = headers.get("sec-websocket-key") else {
        write_rejection(stream).await;
        return Err(Error::UpgradeRejected("missing Sec-WebSocket-Key".into()));
    };

    if !upgrade_ok || !connection_ok || !version_ok {
        write_rejection(stream).await;
        return Err(Error::UpgradeRejected("not a valid websocket upgrade request".into()));
    }

    // `X-Device-Id` is optional metadata (`spec.md` §4.9): a pairing
    // initiator may not know its peer's handshake conventions yet, so only
    // the core RFC 6455 upgrade headers gate acceptance.
    let device_id = headers.get("x-device-id").map(|v| DeviceId::new(v));
    let device_platform = headers
        .get("x-device-platform")
        .and_then(|v| serde_json::from_value(serde_json::Value::String(v.clone())).ok());

    let accept = accept_key(client_key);
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(|e| Error::Network(e.to_string()))?;

    Ok(HandshakeRequest {
        device_id,
        device_platform,
    })
}

async fn write_rejection(stream: &mut TcpStream) {
    let _ = stream
        .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n")
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_known_vector() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn header_token_matching_is_case_insensitive() {
        assert!(header_contains_token("keep-alive, Upgrade", "upgrade"));
        assert!(!header_contains_token("keep-alive", "upgrade"));
    }
}
