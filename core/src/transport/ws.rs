//! WebSocket Transport (C7) — a single WS connection with a bounded queue,
//! retries, keepalive, and reconnect (`spec.md` §4.7/§5).
//!
//! Grounded on `Swatto86-cliprelay/cliprelay-client`'s use of
//! `tokio_tungstenite::connect_async` + `futures_util::{SinkExt, StreamExt}`;
//! the connection is driven as a single actor task so all mutable state
//! (queue, retry count, socket halves) has one writer, matching the
//! single-task-per-component discipline `spec.md` §5 calls for.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::Connector;
use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::constants::{
    CLOUD_PING_INTERVAL_SECS, LAN_DIAL_TIMEOUT_SECS, LAN_IDLE_TIMEOUT_SECS, MAX_BACKOFF_SECS,
    MAX_SEND_RETRIES, MESSAGE_EXPIRY_SECS, QUEUE_CAPACITY,
};
use crate::protocol::envelope::{DeviceId, DevicePlatform, SyncEnvelope};
use crate::sync::framing;
use crate::transport::pinning::PinnedCertVerifier;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error(String),
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    EnvelopeReceived(SyncEnvelope),
    ControlReceived(Value),
    QueueOverflow { dropped: usize },
}

#[derive(Clone)]
pub struct WsTransportConfig {
    pub url: Url,
    pub device_id: DeviceId,
    pub device_platform: DevicePlatform,
    pub pinned_fingerprint: Option<[u8; 32]>,
    pub is_cloud: bool,
}

struct QueuedEnvelope {
    envelope: SyncEnvelope,
    queued_at: Instant,
}

enum Command {
    Send(SyncEnvelope),
    ControlQuery {
        action: String,
        reply: oneshot::Sender<Result<Value>>,
    },
    Disconnect,
}

/// A single outbound WebSocket connection, owned by a dedicated actor task.
pub struct WsTransport {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl WsTransport {
    pub fn spawn(config: WsTransportConfig, events_tx: mpsc::Sender<TransportEvent>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(128);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        tokio::spawn(run_actor(config, cmd_rx, events_tx, state_tx));

        Self { cmd_tx, state_rx }
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub async fn send(&self, envelope: SyncEnvelope) -> Result<()> {
        self.cmd_tx
            .send(Command::Send(envelope))
            .await
            .map_err(|_| Error::SocketNotConnected)
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect).await;
    }

    /// `query_connected_peers` control query (`spec.md` §5: 5s timeout).
    pub async fn query_connected_peers(&self) -> Result<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ControlQuery {
                action: "query_connected_peers".to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::SocketNotConnected)?;

        match tokio::time::timeout(Duration::from_secs(crate::protocol::constants::CONTROL_QUERY_TIMEOUT_SECS), reply_rx)
            .await
        {
            // `spec.md` §4.7/§5: a timed-out peer query reports no peers
            // rather than failing the caller.
            Err(_) => Ok(Value::Array(Vec::new())),
            Ok(inner) => inner.map_err(|_| Error::Cancelled)?,
        }
    }
}

fn backoff_for(attempt: u32) -> Duration {
    let secs = 1u64.checked_shl(attempt.min(7)).unwrap_or(MAX_BACKOFF_SECS);
    Duration::from_secs(secs.min(MAX_BACKOFF_SECS))
}

async fn build_connector(config: &WsTransportConfig) -> Option<Connector> {
    let fingerprint = config.pinned_fingerprint?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = PinnedCertVerifier::new(fingerprint);
    let tls_config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("default TLS protocol versions are always valid")
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Some(Connector::Rustls(Arc::new(tls_config)))
}

async fn dial(config: &WsTransportConfig) -> Result<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::ConnectFailed(e.to_string()))?;
    request
        .headers_mut()
        .insert("X-Device-Id", config.device_id.to_string().parse().unwrap());
    request
        .headers_mut()
        .insert("X-Device-Platform", format!("{:?}", config.device_platform).to_lowercase().parse().unwrap());

    let connector = build_connector(config).await;
    let timeout_secs = if config.is_cloud { 10 } else { LAN_DIAL_TIMEOUT_SECS };

    let connect_fut = tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector);
    let (stream, _response) = tokio::time::timeout(Duration::from_secs(timeout_secs), connect_fut)
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|e| Error::ConnectFailed(e.to_string()))?;
    Ok(stream)
}

async fn run_actor(
    config: WsTransportConfig,
    mut cmd_rx: mpsc::Receiver<Command>,
    events_tx: mpsc::Sender<TransportEvent>,
    state_tx: watch::Sender<ConnectionState>,
) {
    let mut queue: VecDeque<QueuedEnvelope> = VecDeque::new();
    let mut attempt: u32 = 0;

    loop {
        let _ = state_tx.send(ConnectionState::Connecting);

        match dial(&config).await {
            Ok(stream) => {
                attempt = 0;
                let _ = state_tx.send(ConnectionState::Connected);
                let _ = events_tx.send(TransportEvent::Connected).await;

                let intentional = drive_connection(stream, &mut cmd_rx, &events_tx, &mut queue, &config).await;

                let _ = state_tx.send(ConnectionState::Disconnected);
                let _ = events_tx.send(TransportEvent::Disconnected).await;

                if intentional {
                    return;
                }
            }
            Err(e) => {
                let _ = state_tx.send(ConnectionState::Error(e.to_string()));
            }
        }

        attempt += 1;
        if attempt as usize > MAX_SEND_RETRIES as usize {
            tracing::warn!("ws transport giving up after {attempt} reconnect attempts, will keep trying at max backoff");
        }
        let wait = backoff_for(attempt);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Disconnect) | None => return,
                    Some(other) => requeue_during_backoff(other, &mut queue),
                }
            }
        }
    }
}

fn requeue_during_backoff(cmd: Command, queue: &mut VecDeque<QueuedEnvelope>) {
    match cmd {
        Command::Send(envelope) => push_with_cap(queue, envelope, None),
        Command::ControlQuery { reply, .. } => {
            let _ = reply.send(Err(Error::SocketNotConnected));
        }
        Command::Disconnect => {}
    }
}

/// Push onto the bounded send queue, dropping the oldest entries so the
/// queue never holds more than `QUEUE_CAPACITY` messages (`spec.md` §8:
/// enqueuing past capacity while disconnected leaves exactly `QUEUE_CAPACITY`
/// messages and emits one overflow event).
fn push_with_cap(
    queue: &mut VecDeque<QueuedEnvelope>,
    envelope: SyncEnvelope,
    overflow_events: Option<&mut usize>,
) {
    queue.push_back(QueuedEnvelope {
        envelope,
        queued_at: Instant::now(),
    });
    if queue.len() > QUEUE_CAPACITY {
        let to_drop = queue.len() - QUEUE_CAPACITY;
        for _ in 0..to_drop {
            queue.pop_front();
        }
        if let Some(counter) = overflow_events {
            *counter += to_drop;
        }
    }
}

/// Error codes the relay considers permanent (`spec.md` §4.7): the message
/// can never be delivered, so it is dropped rather than retried.
const PERMANENT_RELAY_ERROR_CODES: &[&str] = &["device_not_connected", "incorrect_device_id"];

fn record_in_flight(
    in_flight: &mut std::collections::HashMap<Uuid, SyncEnvelope>,
    order: &mut VecDeque<Uuid>,
    envelope: SyncEnvelope,
) {
    if in_flight.len() >= QUEUE_CAPACITY {
        if let Some(oldest) = order.pop_front() {
            in_flight.remove(&oldest);
        }
    }
    order.push_back(envelope.id);
    in_flight.insert(envelope.id, envelope);
}

#[derive(serde::Deserialize)]
struct RelayErrorBody {
    code: String,
    original_message_id: Uuid,
}

/// Match an inbound `{type:"error", ...}` control envelope against
/// `in_flight` by `original_message_id` and either drop or requeue the
/// message it concerns (`spec.md` §4.7).
fn handle_relay_error(
    envelope: &SyncEnvelope,
    in_flight: &mut std::collections::HashMap<Uuid, SyncEnvelope>,
    order: &mut VecDeque<Uuid>,
    queue: &mut VecDeque<QueuedEnvelope>,
) {
    let body: RelayErrorBody = match serde_json::from_slice(&envelope.payload.ciphertext) {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!("dropping malformed relay error payload: {e}");
            return;
        }
    };

    order.retain(|id| *id != body.original_message_id);
    let Some(failed) = in_flight.remove(&body.original_message_id) else {
        tracing::debug!(code = %body.code, "relay error for unknown or already-resolved message");
        return;
    };

    if PERMANENT_RELAY_ERROR_CODES.contains(&body.code.as_str()) {
        tracing::warn!(code = %body.code, message_id = %body.original_message_id, "relay reported a permanent error, dropping message");
    } else {
        tracing::debug!(code = %body.code, message_id = %body.original_message_id, "relay reported a transient error, requeuing message");
        push_with_cap(queue, failed, None);
    }
}

/// Drives one live connection until it closes or a `Disconnect` command
/// arrives. Returns `true` if the disconnect was requested by the caller
/// (the actor should stop reconnecting).
async fn drive_connection(
    stream: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    cmd_rx: &mut mpsc::Receiver<Command>,
    events_tx: &mpsc::Sender<TransportEvent>,
    queue: &mut VecDeque<QueuedEnvelope>,
    config: &WsTransportConfig,
) -> bool {
    let (mut sink, mut stream) = stream.split();
    let ping_interval = if config.is_cloud {
        Duration::from_secs(CLOUD_PING_INTERVAL_SECS)
    } else {
        Duration::from_secs(LAN_IDLE_TIMEOUT_SECS)
    };
    let mut keepalive = tokio::time::interval(ping_interval);
    let mut flush = tokio::time::interval(Duration::from_millis(200));
    let mut pending_controls: std::collections::HashMap<Uuid, oneshot::Sender<Result<Value>>> =
        std::collections::HashMap::new();
    // Sent-but-not-yet-acknowledged clipboard envelopes, kept so a relay
    // `{type:"error", payload:{..., original_message_id}}` can be matched
    // back to the message it concerns (`spec.md` §4.7). Bounded the same as
    // the send queue; oldest entries age out if no error ever arrives.
    let mut in_flight: std::collections::HashMap<Uuid, SyncEnvelope> = std::collections::HashMap::new();
    let mut in_flight_order: VecDeque<Uuid> = VecDeque::new();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    None => return true,
                    Some(Command::Disconnect) => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return true;
                    }
                    Some(Command::Send(envelope)) => {
                        let mut dropped = 0usize;
                        push_with_cap(queue, envelope, Some(&mut dropped));
                        if dropped > 0 {
                            let _ = events_tx.send(TransportEvent::QueueOverflow { dropped }).await;
                        }
                    }
                    Some(Command::ControlQuery { action, reply }) => {
                        let request = serde_json::json!({ "action": action });
                        let ciphertext = match serde_json::to_vec(&request) {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                let _ = reply.send(Err(Error::SerializationFailure(e.to_string())));
                                continue;
                            }
                        };
                        let mut envelope = SyncEnvelope::new_clipboard(crate::protocol::envelope::EnvelopePayload {
                            content_type: "control".to_string(),
                            ciphertext,
                            device_id: config.device_id.clone(),
                            device_platform: Some(config.device_platform),
                            device_name: None,
                            target: None,
                            encryption: crate::protocol::envelope::EncryptionInfo::plaintext(),
                        });
                        envelope.kind = crate::protocol::envelope::EnvelopeType::Control;
                        match framing::encode_body(&envelope) {
                            Ok(frame) if sink.send(WsMessage::Binary(frame)).await.is_ok() => {
                                pending_controls.insert(envelope.id, reply);
                            }
                            Ok(_) => {
                                let _ = reply.send(Err(Error::SocketNotConnected));
                            }
                            Err(e) => {
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                }
            }
            _ = flush.tick() => {
                let now = Instant::now();
                while let Some(front) = queue.front() {
                    if now.duration_since(front.queued_at) > Duration::from_secs(MESSAGE_EXPIRY_SECS) {
                        queue.pop_front();
                        continue;
                    }
                    break;
                }
                if let Some(item) = queue.pop_front() {
                    match framing::encode_body(&item.envelope) {
                        Ok(frame) => {
                            if sink.send(WsMessage::Binary(frame)).await.is_err() {
                                queue.push_front(item);
                                return false;
                            }
                            record_in_flight(&mut in_flight, &mut in_flight_order, item.envelope);
                        }
                        Err(e) => tracing::warn!("failed to encode outbound envelope: {e}"),
                    }
                }
            }
            _ = keepalive.tick() => {
                if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    return false;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        match framing::decode_body(&bytes) {
                            Ok(envelope) if envelope.kind == crate::protocol::envelope::EnvelopeType::Control => {
                                let body: Value = serde_json::from_slice(&envelope.payload.ciphertext).unwrap_or_default();
                                if let Some(reply) = pending_controls.remove(&envelope.id) {
                                    let _ = reply.send(Ok(body));
                                } else {
                                    let _ = events_tx.send(TransportEvent::ControlReceived(body)).await;
                                }
                            }
                            Ok(envelope) if envelope.kind == crate::protocol::envelope::EnvelopeType::Error => {
                                handle_relay_error(&envelope, &mut in_flight, &mut in_flight_order, queue);
                            }
                            Ok(envelope) => {
                                let _ = events_tx.send(TransportEvent::EnvelopeReceived(envelope)).await;
                            }
                            Err(e) => tracing::warn!("dropping malformed frame: {e}"),
                        }
                    }
                    Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close(_))) | None => return false,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("ws read error: {e}");
                        return false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_max() {
        assert_eq!(backoff_for(0), Duration::from_secs(1));
        assert_eq!(backoff_for(7), Duration::from_secs(MAX_BACKOFF_SECS));
        assert_eq!(backoff_for(20), Duration::from_secs(MAX_BACKOFF_SECS));
    }

    #[test]
    fn push_with_cap_drops_oldest_on_overflow() {
        let mut queue = VecDeque::new();
        let mut dropped = 0usize;
        for i in 0..QUEUE_CAPACITY + 1 {
            let envelope = SyncEnvelope::new_clipboard(crate::protocol::envelope::EnvelopePayload {
                content_type: "text".into(),
                ciphertext: i.to_le_bytes().to_vec(),
                device_id: DeviceId::new("dev"),
                device_platform: None,
                device_name: None,
                target: None,
                encryption: crate::protocol::envelope::EncryptionInfo::plaintext(),
            });
            push_with_cap(&mut queue, envelope, Some(&mut dropped));
        }
        assert_eq!(queue.len(), QUEUE_CAPACITY);
        assert_eq!(dropped, 1);
    }

    fn error_envelope(code: &str, original_message_id: Uuid) -> SyncEnvelope {
        let body = serde_json::json!({ "code": code, "original_message_id": original_message_id });
        let mut envelope = SyncEnvelope::new_clipboard(crate::protocol::envelope::EnvelopePayload {
            content_type: "error".into(),
            ciphertext: serde_json::to_vec(&body).unwrap(),
            device_id: DeviceId::new("relay"),
            device_platform: None,
            device_name: None,
            target: None,
            encryption: crate::protocol::envelope::EncryptionInfo::plaintext(),
        });
        envelope.kind = crate::protocol::envelope::EnvelopeType::Error;
        envelope
    }

    #[test]
    fn permanent_relay_error_drops_the_message() {
        let sent = SyncEnvelope::new_clipboard(crate::protocol::envelope::EnvelopePayload {
            content_type: "text".into(),
            ciphertext: b"hi".to_vec(),
            device_id: DeviceId::new("dev"),
            device_platform: None,
            device_name: None,
            target: None,
            encryption: crate::protocol::envelope::EncryptionInfo::plaintext(),
        });
        let mut in_flight = std::collections::HashMap::new();
        let mut order = VecDeque::new();
        record_in_flight(&mut in_flight, &mut order, sent.clone());

        let mut queue = VecDeque::new();
        handle_relay_error(&error_envelope("device_not_connected", sent.id), &mut in_flight, &mut order, &mut queue);

        assert!(queue.is_empty());
        assert!(!in_flight.contains_key(&sent.id));
    }

    #[test]
    fn transient_relay_error_requeues_the_message() {
        let sent = SyncEnvelope::new_clipboard(crate::protocol::envelope::EnvelopePayload {
            content_type: "text".into(),
            ciphertext: b"hi".to_vec(),
            device_id: DeviceId::new("dev"),
            device_platform: None,
            device_name: None,
            target: None,
            encryption: crate::protocol::envelope::EncryptionInfo::plaintext(),
        });
        let mut in_flight = std::collections::HashMap::new();
        let mut order = VecDeque::new();
        record_in_flight(&mut in_flight, &mut order, sent.clone());

        let mut queue = VecDeque::new();
        handle_relay_error(&error_envelope("routing_failure", sent.id), &mut in_flight, &mut order, &mut queue);

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.front().unwrap().envelope.id, sent.id);
    }
}
