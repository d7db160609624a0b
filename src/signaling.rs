//! PeerJS-compatible signaling over a persistent WebSocket.
//!
//! Inbound envelopes are turned into [`SignalingEvent`]s on a bounded channel;
//! outbound envelopes go through a cloneable [`SignalingSender`] that feeds the
//! writer task.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::config::SignalingConfig;
use crate::error::{ConnectionError, ProtocolError};
use crate::peer::types::{IceCandidate, PeerAddress, SessionDescription, SessionOffer};
use crate::utils::random_id;

pub const SIGNALING_EVENT_BUFFER: usize = 64;
const OUTBOUND_BUFFER: usize = 64;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Wire envelope: `{type, src?, dst?, payload}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Envelope {
    pub fn answer(answer: &SessionDescription, dst: &str, connection_id: Option<&str>) -> Self {
        let mut payload = Map::new();
        payload.insert("sdp".into(), serde_json::to_value(answer).unwrap_or_default());
        payload.insert("type".into(), "answer".into());
        if let Some(id) = connection_id {
            payload.insert("connectionId".into(), id.into());
        }
        Self::addressed("ANSWER", dst, payload)
    }

    pub fn candidate(candidate: &IceCandidate, dst: &str, connection_id: Option<&str>) -> Self {
        let mut payload = Map::new();
        payload.insert(
            "candidate".into(),
            serde_json::to_value(candidate).unwrap_or_default(),
        );
        payload.insert("type".into(), "candidate".into());
        if let Some(id) = connection_id {
            payload.insert("connectionId".into(), id.into());
        }
        Self::addressed("CANDIDATE", dst, payload)
    }

    pub fn heartbeat() -> Self {
        Self {
            kind: "HEARTBEAT".into(),
            src: None,
            dst: None,
            payload: Value::Null,
        }
    }

    fn addressed(kind: &str, dst: &str, payload: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            src: None,
            dst: Some(dst.into()),
            payload: Value::Object(payload),
        }
    }

    pub fn encode(&self) -> Result<String, ConnectionError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug)]
pub enum SignalingEvent {
    Offer {
        offer: SessionOffer,
        src: PeerAddress,
    },
    Answer {
        description: SessionDescription,
        src: PeerAddress,
    },
    Candidate {
        candidate: IceCandidate,
        src: PeerAddress,
    },
    /// The receive loop ended; the connection is gone.
    Disconnected,
}

/// Decodes one inbound frame. `Ok(None)` means the envelope carries no session event.
pub fn parse_envelope(text: &str) -> Result<Option<SignalingEvent>, ProtocolError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    dispatch(envelope)
}

fn dispatch(envelope: Envelope) -> Result<Option<SignalingEvent>, ProtocolError> {
    let Envelope {
        kind, src, payload, ..
    } = envelope;
    let source = || src.clone().ok_or(ProtocolError::MissingField("src"));

    match kind.as_str() {
        "OPEN" => {
            log::info!("rendezvous server confirmed the connection");
            Ok(None)
        }
        "OFFER" => {
            let src = source()?;
            let offer = SessionOffer::from_payload(payload)?;
            log::info!("received offer from peer {src}");
            Ok(Some(SignalingEvent::Offer { offer, src }))
        }
        "ANSWER" => {
            let src = source()?;
            let description = match payload.get("sdp") {
                Some(Value::String(sdp)) => SessionDescription::answer(sdp.clone()),
                Some(value @ Value::Object(_)) => serde_json::from_value(value.clone())?,
                _ => return Err(ProtocolError::MissingField("payload.sdp")),
            };
            log::info!("received answer from peer {src}");
            Ok(Some(SignalingEvent::Answer { description, src }))
        }
        "CANDIDATE" => {
            let src = source()?;
            let candidate = match payload.get("candidate") {
                Some(Value::String(raw)) => IceCandidate {
                    candidate: raw.clone(),
                    ..Default::default()
                },
                Some(value @ Value::Object(_)) => serde_json::from_value(value.clone())?,
                _ => return Err(ProtocolError::MissingField("payload.candidate")),
            };
            log::debug!("received candidate from peer {src}");
            Ok(Some(SignalingEvent::Candidate { candidate, src }))
        }
        "LEAVE" => {
            log::info!("peer left: {}", src.as_deref().unwrap_or("unknown"));
            Ok(None)
        }
        "ERROR" => {
            log::error!("rendezvous server error: {payload}");
            Ok(None)
        }
        "ID-TAKEN" | "INVALID-KEY" => {
            log::error!("rendezvous server rejected us ({kind}): {payload}");
            Ok(None)
        }
        "EXPIRE" => {
            log::warn!(
                "message to {} expired undelivered",
                src.as_deref().unwrap_or("unknown")
            );
            Ok(None)
        }
        other => {
            log::debug!("unhandled envelope type {other}");
            Ok(None)
        }
    }
}

#[derive(Debug)]
pub enum Outbound {
    Envelope(Envelope),
    Close,
}

/// Cloneable handle for address-scoped sends.
#[derive(Clone)]
pub struct SignalingSender {
    outbound: mpsc::Sender<Outbound>,
}

impl SignalingSender {
    pub fn new(outbound: mpsc::Sender<Outbound>) -> Self {
        Self { outbound }
    }

    pub async fn send(&self, envelope: Envelope) -> Result<(), ConnectionError> {
        self.outbound
            .send(Outbound::Envelope(envelope))
            .await
            .map_err(|_| ConnectionError::NotConnected)
    }

    pub async fn send_answer(
        &self,
        answer: &SessionDescription,
        dst: &str,
        connection_id: Option<&str>,
    ) -> Result<(), ConnectionError> {
        self.send(Envelope::answer(answer, dst, connection_id))
            .await?;
        log::info!("sent answer to peer {dst}");
        Ok(())
    }

    pub async fn send_candidate(
        &self,
        candidate: &IceCandidate,
        dst: &str,
        connection_id: Option<&str>,
    ) -> Result<(), ConnectionError> {
        self.send(Envelope::candidate(candidate, dst, connection_id))
            .await?;
        log::debug!("sent candidate to peer {dst}");
        Ok(())
    }

    async fn close(&self) {
        let _ = self.outbound.send(Outbound::Close).await;
    }
}

pub struct SignalingClient {
    config: SignalingConfig,
    peer_id: String,
    sender: Option<SignalingSender>,
    connected: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl SignalingClient {
    pub fn new(config: SignalingConfig) -> Self {
        let peer_id = config
            .peer_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(random_id);
        Self {
            config,
            peer_id,
            sender: None,
            connected: Arc::new(AtomicBool::new(false)),
            reader: None,
            writer: None,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn sender(&self) -> Option<SignalingSender> {
        self.sender.clone()
    }

    /// `{ws|wss}://host:port{path}peerjs?key=..&id=..&token=..`
    pub fn connect_url(&self, token: &str) -> Result<Url, ConnectionError> {
        let scheme = if self.config.secure { "wss" } else { "ws" };
        let mut path = self.config.path.clone();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        if !path.ends_with('/') {
            path.push('/');
        }

        let mut url = Url::parse(&format!(
            "{scheme}://{}:{}{path}peerjs",
            self.config.host, self.config.port
        ))?;
        url.query_pairs_mut()
            .append_pair("key", &self.config.key)
            .append_pair("id", &self.peer_id)
            .append_pair("token", token);
        Ok(url)
    }

    /// Opens the connection with a fresh token and starts the I/O tasks.
    /// Handshake failures are returned, never retried here.
    pub async fn connect(&mut self) -> Result<mpsc::Receiver<SignalingEvent>, ConnectionError> {
        self.close().await;

        let token = random_id();
        let url = self.connect_url(&token)?;
        let endpoint = format!(
            "{}://{}:{}",
            url.scheme(),
            self.config.host,
            self.config.port
        );
        log::info!("connecting to rendezvous server {endpoint}");

        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|source| ConnectionError::Handshake {
                url: endpoint.clone(),
                source,
            })?;
        let (sink, stream) = socket.split();

        let (events_tx, events_rx) = mpsc::channel(SIGNALING_EVENT_BUFFER);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let connected = Arc::new(AtomicBool::new(true));

        self.writer = Some(tokio::spawn(write_loop(
            sink,
            outbound_rx,
            self.config.heartbeat_interval,
        )));
        self.reader = Some(tokio::spawn(read_loop(stream, events_tx, connected.clone())));
        self.connected = connected;
        self.sender = Some(SignalingSender::new(outbound_tx));

        log::info!("connected to {endpoint}, our peer id is {}", self.peer_id);
        Ok(events_rx)
    }

    pub async fn send_answer(
        &self,
        answer: &SessionDescription,
        dst: &str,
        connection_id: Option<&str>,
    ) -> Result<(), ConnectionError> {
        self.sender
            .as_ref()
            .ok_or(ConnectionError::NotConnected)?
            .send_answer(answer, dst, connection_id)
            .await
    }

    pub async fn send_candidate(
        &self,
        candidate: &IceCandidate,
        dst: &str,
    ) -> Result<(), ConnectionError> {
        self.sender
            .as_ref()
            .ok_or(ConnectionError::NotConnected)?
            .send_candidate(candidate, dst, None)
            .await
    }

    /// Releases the connection. Idempotent; a no-op when never connected.
    pub async fn close(&mut self) {
        if let Some(sender) = self.sender.take() {
            sender.close().await;
        }
        if let Some(mut writer) = self.writer.take() {
            if timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            log::info!("disconnected from rendezvous server");
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for task in [self.reader.take(), self.writer.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<Socket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    heartbeat: Duration,
) {
    let mut ticker = interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        let envelope = tokio::select! {
            msg = outbound.recv() => match msg {
                Some(Outbound::Envelope(envelope)) => envelope,
                Some(Outbound::Close) | None => break,
            },
            _ = ticker.tick() => Envelope::heartbeat(),
        };

        let text = match envelope.encode() {
            Ok(text) => text,
            Err(e) => {
                log::warn!("dropping {} envelope: {e}", envelope.kind);
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text)).await {
            log::warn!("signaling send failed: {e}");
            return;
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<Socket>,
    events: mpsc::Sender<SignalingEvent>,
    connected: Arc<AtomicBool>,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => deliver(&events, &text).await,
            Ok(Message::Close(frame)) => {
                log::info!("rendezvous server closed the connection: {frame:?}");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                log::error!("signaling receive loop failed: {e}");
                break;
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    let _ = events.send(SignalingEvent::Disconnected).await;
}

async fn deliver(events: &mpsc::Sender<SignalingEvent>, text: &str) {
    match parse_envelope(text) {
        Ok(Some(event)) => {
            // a dropped receiver means nobody is listening
            if events.send(event).await.is_err() {
                log::debug!("no signaling listener, dropping event");
            }
        }
        Ok(None) => {}
        Err(e) => log::warn!("discarding malformed envelope: {e}"),
    }
}
