//! Manual WebSocket frame parsing for the LAN server (`spec.md` §4.9/§6).
//!
//! Client-to-server frames must be masked per RFC 6455 §5.1; this server only
//! ever talks to its own dual-transport client, so fragmented messages and
//! extensions are out of scope and rejected rather than reassembled.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(Error::UnsupportedOpcode(other)),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Read one complete, unmasked-output frame off `stream`. Errors on any
/// fragmented frame (`FIN=0` or a `0x0` continuation opcode) — this server
/// only ever emits single-frame messages and expects the same in return.
pub async fn read_frame(stream: &mut TcpStream, max_len: usize) -> Result<Frame> {
    let mut header = [0u8; 2];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| Error::Network(e.to_string()))?;

    let fin = header[0] & 0b1000_0000 != 0;
    let opcode_bits = header[0] & 0b0000_1111;
    if opcode_bits == 0x0 {
        return Err(Error::FragmentedFrame);
    }
    let opcode = Opcode::from_byte(opcode_bits)?;
    if !fin {
        return Err(Error::FragmentedFrame);
    }

    let masked = header[1] & 0b1000_0000 != 0;
    if !masked {
        return Err(Error::UpgradeRejected("client frame must be masked".into()));
    }

    let len_bits = header[1] & 0b0111_1111;
    let payload_len: u64 = match len_bits {
        126 => {
            let mut ext = [0u8; 2];
            stream
                .read_exact(&mut ext)
                .await
                .map_err(|e| Error::Network(e.to_string()))?;
            u16::from_be_bytes(ext) as u64
        }
        127 => {
            let mut ext = [0u8; 8];
            stream
                .read_exact(&mut ext)
                .await
                .map_err(|e| Error::Network(e.to_string()))?;
            u64::from_be_bytes(ext)
        }
        n => n as u64,
    };

    if payload_len as usize > max_len {
        return Err(Error::SizeLimitExceeded);
    }

    let mut mask_key = [0u8; 4];
    stream
        .read_exact(&mut mask_key)
        .await
        .map_err(|e| Error::Network(e.to_string()))?;

    let mut payload = vec![0u8; payload_len as usize];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }

    Ok(Frame { opcode, payload })
}

/// Write an unmasked server-to-client frame (RFC 6455 §5.1: servers never mask).
pub async fn write_frame(stream: &mut TcpStream, opcode: Opcode, payload: &[u8]) -> Result<()> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    out.push(0b1000_0000 | opcode.to_byte());

    let len = payload.len();
    if len < 126 {
        out.push(len as u8);
    } else if len <= u16::MAX as usize {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);

    stream
        .write_all(&out)
        .await
        .map_err(|e| Error::Network(e.to_string()))
}
