//! LAN WebSocket Server (C9) — accepts inbound connections from paired
//! devices on the local network, speaking a hand-rolled RFC 6455 subset
//! (`spec.md` §4.9/§6).
//!
//! Grounded on the accept-loop / spawn-per-connection shape of the teacher's
//! raw-TCP sync server, generalized to a WebSocket byte stream and the
//! `SyncEnvelope` wire format instead of the teacher's length-prefixed
//! `Message` enum.

pub mod frame;
pub mod handshake;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};

use crate::error::{Error, Result};
use crate::protocol::constants::MAX_MESSAGE_SIZE;
use crate::protocol::envelope::{DeviceId, DevicePlatform, SyncEnvelope};
use crate::protocol::pairing::{PairingAck, PairingChallenge};
use crate::sync::framing;
use frame::{read_frame, write_frame, Opcode};

#[derive(Debug)]
pub enum ServerEvent {
    Connected {
        /// Populated from `X-Device-Id` when present; otherwise learned
        /// from the first pairing message (`spec.md` §4.9).
        device_id: Option<DeviceId>,
        device_platform: Option<DevicePlatform>,
        addr: SocketAddr,
    },
    Disconnected {
        device_id: Option<DeviceId>,
    },
    EnvelopeReceived(SyncEnvelope),
    /// A pairing challenge arrived on this connection; the receiver answers
    /// against the active `PairingSession` and replies via `reply`.
    PairingChallenge {
        challenge: PairingChallenge,
        reply: tokio::sync::oneshot::Sender<Result<PairingAck>>,
    },
    /// A pairing ack arrived on this connection (initiator side).
    PairingAck(PairingAck),
}

/// Classification of an inbound application frame (`spec.md` §4.9): a
/// pairing challenge/ack is routed to the active `PairingSession` rather
/// than attempted as a clipboard envelope.
enum FrameKind {
    Clipboard(SyncEnvelope),
    PairingChallenge(PairingChallenge),
    PairingAck(PairingAck),
    Unknown,
}

fn classify_frame(body: &[u8]) -> FrameKind {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return FrameKind::Unknown;
    };

    if value.get("initiator_device_id").is_some() && value.get("initiator_pub_key").is_some() {
        return match serde_json::from_value(value) {
            Ok(challenge) => FrameKind::PairingChallenge(challenge),
            Err(_) => FrameKind::Unknown,
        };
    }

    if value.get("challenge_id").is_some() && value.get("mac_device_id").is_some() {
        return match serde_json::from_value(value) {
            Ok(ack) => FrameKind::PairingAck(ack),
            Err(_) => FrameKind::Unknown,
        };
    }

    match framing::decode_body(body) {
        Ok(envelope) => FrameKind::Clipboard(envelope),
        Err(_) => FrameKind::Unknown,
    }
}

/// Per-connection outbound sink, keyed by the peer's device id, so other
/// components (the orchestrator, control-query replies) can push frames to
/// an already-connected peer without going through `WsTransport`.
type Outbound = Arc<RwLock<HashMap<DeviceId, mpsc::Sender<Vec<u8>>>>>;

pub struct LanServer {
    listener: TcpListener,
    port: u16,
    local_device_id: DeviceId,
    outbound: Outbound,
}

impl LanServer {
    pub async fn bind(port: u16, local_device_id: DeviceId) -> Result<Self> {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Network(format!("failed to bind: {e}")))?;
        let actual_port = listener
            .local_addr()
            .map_err(|e| Error::Network(e.to_string()))?
            .port();

        tracing::info!(port = actual_port, "LAN server listening");

        Ok(Self {
            listener,
            port: actual_port,
            local_device_id,
            outbound: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send an envelope to a connected peer, if one is live. Used to push
    /// clipboard updates and control-query replies over an inbound
    /// connection rather than dialing back out.
    pub async fn send_to(&self, device_id: &DeviceId, envelope: &SyncEnvelope) -> Result<()> {
        let frame = framing::encode_body(envelope)?;
        let sender = self
            .outbound
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| Error::DeviceNotConnected(device_id.to_string()))?;
        sender
            .send(frame)
            .await
            .map_err(|_| Error::DeviceNotConnected(device_id.to_string()))
    }

    pub async fn connected_peers(&self) -> Vec<DeviceId> {
        self.outbound.read().await.keys().cloned().collect()
    }

    /// Run the accept loop, spawning one task per connection. Returns a
    /// handle that can be aborted and a receiver for server-wide events.
    pub fn serve(self) -> (ServerHandle, mpsc::Receiver<ServerEvent>) {
        let (events_tx, events_rx) = mpsc::channel(128);
        let outbound = self.outbound.clone();
        let local_device_id = self.local_device_id.clone();

        let task = tokio::spawn(async move {
            loop {
                match self.listener.accept().await {
                    Ok((stream, addr)) => {
                        let events_tx = events_tx.clone();
                        let outbound = outbound.clone();
                        let local_device_id = local_device_id.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_connection(stream, addr, events_tx.clone(), outbound, local_device_id).await
                            {
                                tracing::debug!(%addr, error = %e, "LAN connection ended");
                            }
                        });
                    }
                    Err(e) => tracing::error!("accept error: {e}"),
                }
            }
        });

        (ServerHandle { task }, events_rx)
    }
}

pub struct ServerHandle {
    task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn abort(self) {
        self.task.abort();
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    events_tx: mpsc::Sender<ServerEvent>,
    outbound: Outbound,
    local_device_id: DeviceId,
) -> Result<()> {
    let request = handshake::accept(&mut stream).await?;
    let device_id = request.device_id;
    tracing::info!(%addr, device_id = ?device_id, "LAN peer connected");

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(QUEUE_DEPTH);
    // Only devices whose id is known at handshake time can be addressed via
    // `send_to`; a pairing-only connection registers nothing here and is
    // instead answered directly over `stream` inside `drive`.
    if let Some(device_id) = &device_id {
        outbound.write().await.insert(device_id.clone(), out_tx);
    }

    let _ = events_tx
        .send(ServerEvent::Connected {
            device_id: device_id.clone(),
            device_platform: request.device_platform,
            addr,
        })
        .await;

    let result = drive(&mut stream, &mut out_rx, &events_tx, &local_device_id).await;

    if let Some(device_id) = &device_id {
        outbound.write().await.remove(device_id);
    }
    let _ = events_tx
        .send(ServerEvent::Disconnected {
            device_id: device_id.clone(),
        })
        .await;

    result
}

const QUEUE_DEPTH: usize = 32;

async fn drive(
    stream: &mut TcpStream,
    out_rx: &mut mpsc::Receiver<Vec<u8>>,
    events_tx: &mpsc::Sender<ServerEvent>,
    local_device_id: &DeviceId,
) -> Result<()> {
    loop {
        tokio::select! {
            frame = read_frame(stream, MAX_MESSAGE_SIZE) => {
                let frame = frame?;
                match frame.opcode {
                    Opcode::Binary | Opcode::Text => {
                        match classify_frame(&frame.payload) {
                            FrameKind::Clipboard(envelope) if envelope.targets(local_device_id) => {
                                if events_tx.send(ServerEvent::EnvelopeReceived(envelope)).await.is_err() {
                                    return Ok(());
                                }
                            }
                            FrameKind::Clipboard(_) => tracing::debug!("dropping envelope not addressed to us"),
                            FrameKind::PairingChallenge(challenge) => {
                                let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
                                if events_tx
                                    .send(ServerEvent::PairingChallenge { challenge, reply: reply_tx })
                                    .await
                                    .is_err()
                                {
                                    return Ok(());
                                }
                                match reply_rx.await {
                                    Ok(Ok(ack)) => {
                                        let json = serde_json::to_vec(&ack)
                                            .map_err(|e| Error::BadJson(e.to_string()))?;
                                        write_frame(stream, Opcode::Binary, &json).await?;
                                    }
                                    Ok(Err(e)) => tracing::warn!("pairing challenge rejected: {e}"),
                                    Err(_) => tracing::warn!("pairing challenge handler dropped the reply channel"),
                                }
                            }
                            FrameKind::PairingAck(ack) => {
                                if events_tx.send(ServerEvent::PairingAck(ack)).await.is_err() {
                                    return Ok(());
                                }
                            }
                            FrameKind::Unknown => tracing::warn!("dropping unrecognized frame"),
                        }
                    }
                    Opcode::Ping => write_frame(stream, Opcode::Pong, &frame.payload).await?,
                    Opcode::Pong => {}
                    Opcode::Close => return Ok(()),
                }
            }
            outgoing = out_rx.recv() => {
                match outgoing {
                    Some(bytes) => write_frame(stream, Opcode::Binary, &bytes).await?,
                    None => return Ok(()),
                }
            }
        }
    }
}
