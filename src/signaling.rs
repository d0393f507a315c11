//! Signaling channel client.
//!
//! The backend speaks Socket.IO v4; this client talks to it over a raw
//! WebSocket. Inbound events are normalized into [`SignalEvent`] at this
//! boundary so the negotiation machine sees one candidate shape and string
//! call ids only.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{CallError, Result};
use crate::http_retry::{next_backoff, sleep_with_jitter};
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::session::CallId;

/// A normalized inbound signaling event.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    Connected,
    Disconnected,
    IncomingCall {
        caller_id: String,
        recipient_id: String,
        call_id: CallId,
        offer: SessionDescription,
    },
    Answer {
        call_id: CallId,
        answer: SessionDescription,
    },
    RemoteCandidate {
        call_id: CallId,
        candidate: IceCandidate,
    },
    RemoteEnd {
        call_id: CallId,
    },
    Rejected {
        call_id: CallId,
    },
}

// ---------- Socket.IO framing ----------

/// One text frame of the Engine.IO/Socket.IO protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `0{...}` handshake
    Open,
    Ping,
    Close,
    /// `40...` namespace connected
    NamespaceConnected,
    /// `44...` namespace connect refused
    NamespaceError(String),
    /// `42["name", payload]`
    Event { name: String, payload: Value },
    Other,
}

pub fn decode_frame(text: &str) -> Frame {
    let mut chars = text.chars();
    match chars.next() {
        Some('0') => Frame::Open,
        Some('1') => Frame::Close,
        Some('2') => Frame::Ping,
        Some('4') => {
            let rest = chars.as_str();
            match rest.chars().next() {
                Some('0') => Frame::NamespaceConnected,
                Some('4') => Frame::NamespaceError(rest[1..].to_owned()),
                Some('2') => decode_event(&rest[1..]),
                _ => Frame::Other,
            }
        }
        _ => Frame::Other,
    }
}

fn decode_event(body: &str) -> Frame {
    // optional ack id before the array
    let body = body.trim_start_matches(|c: char| c.is_ascii_digit());
    let Ok(Value::Array(mut items)) = serde_json::from_str::<Value>(body) else {
        return Frame::Other;
    };
    if items.is_empty() {
        return Frame::Other;
    }
    let payload = if items.len() > 1 { items.swap_remove(1) } else { Value::Null };
    match items.swap_remove(0) {
        Value::String(name) => Frame::Event { name, payload },
        _ => Frame::Other,
    }
}

pub fn encode_event(name: &str, payload: &Value) -> String {
    format!("42{}", Value::Array(vec![Value::String(name.to_owned()), payload.clone()]))
}

pub const PONG: &str = "3";
pub const CONNECT_NAMESPACE: &str = "40";

/// `ws://host` → `ws://host/socket.io/?EIO=4&transport=websocket`
pub fn socket_io_url(base: &str) -> String {
    if base.contains("/socket.io/") {
        return base.to_owned();
    }
    let base = base
        .trim_end_matches('/')
        .replacen("http://", "ws://", 1)
        .replacen("https://", "wss://", 1);
    format!("{base}/socket.io/?EIO=4&transport=websocket")
}

// ---------- payload normalization ----------

#[derive(Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(serde_json::Number),
}

impl WireId {
    fn into_call_id(self) -> Option<CallId> {
        match self {
            Self::Text(s) if !s.trim().is_empty() => Some(CallId::new(s.trim())),
            Self::Text(_) => None,
            Self::Number(n) => Some(CallId::new(n.to_string())),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireCandidate {
    Full(IceCandidate),
    Bare(String),
}

impl WireCandidate {
    fn normalize(self) -> Option<IceCandidate> {
        let c = match self {
            Self::Full(c) => c,
            Self::Bare(s) => IceCandidate::new(s),
        };
        (!c.candidate.trim().is_empty()).then_some(c)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingCallWire {
    caller_id: WireId,
    recipient_id: WireId,
    call_id: WireId,
    offer: SessionDescription,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnswerWire {
    call_id: WireId,
    answer: SessionDescription,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidateWire {
    call_id: WireId,
    candidate: Option<WireCandidate>,
    ice_candidate: Option<WireCandidate>,
    ice_candidate_payload: Option<WireCandidate>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallIdWire {
    call_id: WireId,
}

fn wire_text(id: WireId) -> String {
    match id {
        WireId::Text(s) => s,
        WireId::Number(n) => n.to_string(),
    }
}

/// Maps a named inbound event onto [`SignalEvent`]. `None` for unknown
/// events and payloads missing required fields.
pub fn normalize_event(name: &str, payload: Value) -> Option<SignalEvent> {
    match name {
        "incomingCall" => {
            let w: IncomingCallWire = parse(name, payload)?;
            Some(SignalEvent::IncomingCall {
                caller_id: wire_text(w.caller_id),
                recipient_id: wire_text(w.recipient_id),
                call_id: w.call_id.into_call_id()?,
                offer: w.offer,
            })
        }
        "answer" => {
            let w: AnswerWire = parse(name, payload)?;
            Some(SignalEvent::Answer {
                call_id: w.call_id.into_call_id()?,
                answer: w.answer,
            })
        }
        "iceCandidate" => {
            let w: CandidateWire = parse(name, payload)?;
            let candidate = w
                .candidate
                .or(w.ice_candidate)
                .or(w.ice_candidate_payload)
                .and_then(WireCandidate::normalize);
            let Some(candidate) = candidate else {
                warn!("iceCandidate event without candidate payload");
                return None;
            };
            Some(SignalEvent::RemoteCandidate {
                call_id: w.call_id.into_call_id()?,
                candidate,
            })
        }
        "endCall" => {
            let w: CallIdWire = parse(name, payload)?;
            Some(SignalEvent::RemoteEnd {
                call_id: w.call_id.into_call_id()?,
            })
        }
        "callRejected" => {
            let w: CallIdWire = parse(name, payload)?;
            Some(SignalEvent::Rejected {
                call_id: w.call_id.into_call_id()?,
            })
        }
        other => {
            debug!(event = other, "ignoring unknown signaling event");
            None
        }
    }
}

fn parse<T: for<'de> Deserialize<'de>>(name: &str, payload: Value) -> Option<T> {
    match serde_json::from_value(payload) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(event = name, "malformed signaling payload: {e}");
            None
        }
    }
}

// ---------- client ----------

/// Keeps the channel connected and re-registers after every reconnect.
pub struct SignalingClient {
    shutdown: watch::Sender<bool>,
}

impl SignalingClient {
    /// Spawns the connection task. Events arrive on the returned receiver.
    pub fn start(url: &str, identity: &str) -> (Self, mpsc::Receiver<SignalEvent>) {
        let (tx, rx) = mpsc::channel(128);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let url = socket_io_url(url);
        let identity = identity.to_owned();
        tokio::spawn(connection_loop(url, identity, tx, shutdown_rx));
        (
            Self {
                shutdown: shutdown_tx,
            },
            rx,
        )
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn connection_loop(
    url: String,
    identity: String,
    events: mpsc::Sender<SignalEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Duration::from_millis(500);
    loop {
        if *shutdown.borrow() {
            break;
        }
        match run_connection(&url, &identity, &events, &mut shutdown).await {
            Ok(()) => backoff = Duration::from_millis(500),
            Err(e) => warn!("signaling connection error: {e}"),
        }
        if events.send(SignalEvent::Disconnected).await.is_err() || *shutdown.borrow() {
            break;
        }
        info!("signaling reconnect in ~{}ms", backoff.as_millis());
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = sleep_with_jitter(backoff) => {}
        }
        backoff = next_backoff(backoff).max(Duration::from_millis(500));
    }
    debug!("signaling loop stopped");
}

/// One connection lifetime. `Ok` on orderly close or shutdown.
async fn run_connection(
    url: &str,
    identity: &str,
    events: &mpsc::Sender<SignalEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    info!("dialing signaling channel {url}");
    let (ws, _resp) = connect_async(url)
        .await
        .map_err(|e| CallError::Signaling(format!("connect: {e}")))?;
    let (mut sink, mut stream) = ws.split();
    let send_err = |e: tokio_tungstenite::tungstenite::Error| CallError::Signaling(format!("send: {e}"));

    loop {
        let msg = tokio::select! {
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
            msg = stream.next() => msg,
        };
        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(CallError::Signaling(format!("read: {e}"))),
        };

        match decode_frame(&text) {
            Frame::Open => {
                sink.send(Message::Text(CONNECT_NAMESPACE.into()))
                    .await
                    .map_err(send_err)?;
            }
            Frame::NamespaceConnected => {
                // one register per connection
                let register = encode_event("register", &Value::String(identity.to_owned()));
                sink.send(Message::Text(register)).await.map_err(send_err)?;
                info!(identity, "signaling connected, registered");
                if events.send(SignalEvent::Connected).await.is_err() {
                    return Ok(());
                }
            }
            Frame::NamespaceError(reason) => {
                return Err(CallError::Signaling(format!("namespace refused: {reason}")));
            }
            Frame::Ping => {
                sink.send(Message::Text(PONG.into())).await.map_err(send_err)?;
            }
            Frame::Close => return Ok(()),
            Frame::Event { name, payload } => {
                debug!(event = %name, "signaling event");
                if let Some(ev) = normalize_event(&name, payload) {
                    if events.send(ev).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Frame::Other => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_decode() {
        assert_eq!(decode_frame(r#"0{"sid":"abc","pingInterval":25000}"#), Frame::Open);
        assert_eq!(decode_frame("2"), Frame::Ping);
        assert_eq!(decode_frame(r#"40{"sid":"xyz"}"#), Frame::NamespaceConnected);
        assert_eq!(
            decode_frame(r#"42["endCall",{"callId":"5"}]"#),
            Frame::Event {
                name: "endCall".into(),
                payload: json!({"callId": "5"})
            }
        );
        assert_eq!(
            decode_frame(r#"4213["endCall",{"callId":"5"}]"#),
            Frame::Event {
                name: "endCall".into(),
                payload: json!({"callId": "5"})
            }
        );
        assert_eq!(decode_frame("42not json"), Frame::Other);
    }

    #[test]
    fn register_event_encoding() {
        assert_eq!(
            encode_event("register", &json!("user-1")),
            r#"42["register","user-1"]"#
        );
    }

    #[test]
    fn url_gets_socket_io_path() {
        assert_eq!(
            socket_io_url("http://localhost:3000/"),
            "ws://localhost:3000/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(
            socket_io_url("wss://example.org/socket.io/?EIO=4&transport=websocket"),
            "wss://example.org/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn candidate_field_variants_normalize() {
        let payloads = [
            json!({"callId": "55", "candidate": {"candidate": "candidate:a", "sdpMid": "0", "sdpMLineIndex": 0}}),
            json!({"callId": 55, "iceCandidate": {"candidate": "candidate:a", "sdpMid": "0", "sdpMLineIndex": 0}}),
            json!({"callId": "55", "iceCandidatePayload": {"candidate": "candidate:a", "sdpMid": "0", "sdpMLineIndex": 0}}),
        ];
        for p in payloads {
            let ev = normalize_event("iceCandidate", p).unwrap();
            assert_eq!(
                ev,
                SignalEvent::RemoteCandidate {
                    call_id: "55".into(),
                    candidate: IceCandidate {
                        candidate: "candidate:a".into(),
                        sdp_mid: Some("0".into()),
                        sdp_mline_index: Some(0),
                    },
                }
            );
        }
    }

    #[test]
    fn bare_and_empty_candidates() {
        let ev = normalize_event(
            "iceCandidate",
            json!({"callId": "1", "candidate": "candidate:b"}),
        )
        .unwrap();
        assert!(matches!(ev, SignalEvent::RemoteCandidate { candidate, .. } if candidate.candidate == "candidate:b"));
        assert_eq!(
            normalize_event("iceCandidate", json!({"callId": "1", "candidate": {"candidate": ""}})),
            None
        );
        assert_eq!(normalize_event("iceCandidate", json!({"callId": "1"})), None);
    }

    #[test]
    fn incoming_call_normalizes() {
        let ev = normalize_event(
            "incomingCall",
            json!({
                "callerId": "user-1",
                "recipientId": 2,
                "callId": 55,
                "offer": {"type": "offer", "sdp": "v=0"}
            }),
        )
        .unwrap();
        assert_eq!(
            ev,
            SignalEvent::IncomingCall {
                caller_id: "user-1".into(),
                recipient_id: "2".into(),
                call_id: "55".into(),
                offer: SessionDescription::offer("v=0"),
            }
        );
    }

    #[test]
    fn unknown_and_malformed_events_are_dropped() {
        assert_eq!(normalize_event("typing", json!({})), None);
        assert_eq!(normalize_event("answer", json!({"callId": "1"})), None);
        assert_eq!(normalize_event("endCall", json!({"callId": ""})), None);
    }
}
