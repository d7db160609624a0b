//! In-process stand-ins for the peer-session engine, the recorder and the
//! control link. Used by the unit and integration tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::error::{NegotiationError, RecorderError};
use crate::peer::engine::{ControlLink, EngineEvent, EngineFactory, PeerEngine};
use crate::peer::types::{
    IceCandidate, MediaTrack, SessionDescription, SessionOffer, TrackCodec, TrackKind,
};
use crate::peer::ENGINE_EVENT_BUFFER;
use crate::recording::{Recorder, RecorderFactory, RecorderOptions};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub const OFFER_SDP: &str = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:1\r\n\
m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:2\r\n";

pub const ANSWER_SDP: &str = "v=0\r\no=- 3 4 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

pub fn offer_with_media(connection_id: Option<&str>) -> SessionOffer {
    SessionOffer {
        description: SessionDescription::offer(OFFER_SDP),
        connection_id: connection_id.map(str::to_string),
        attributes: Default::default(),
    }
}

pub fn video_track(id: &str) -> MediaTrack {
    MediaTrack::new(
        id,
        TrackKind::Video,
        TrackCodec {
            mime_type: "video/VP8".into(),
            clock_rate: 90000,
            channels: 0,
            payload_type: 96,
            fmtp: String::new(),
        },
    )
}

pub fn audio_track(id: &str) -> MediaTrack {
    MediaTrack::new(
        id,
        TrackKind::Audio,
        TrackCodec {
            mime_type: "audio/opus".into(),
            clock_rate: 48000,
            channels: 2,
            payload_type: 111,
            fmtp: "minptime=10;useinbandfec=1".into(),
        },
    )
}

pub struct MockControlLink {
    label: String,
    open: Mutex<bool>,
    sent: Mutex<Vec<String>>,
}

impl MockControlLink {
    pub fn open(label: &str) -> Self {
        Self {
            label: label.to_string(),
            open: Mutex::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_open(&self, open: bool) {
        *lock(&self.open) = open;
    }

    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl ControlLink for MockControlLink {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        *lock(&self.open)
    }

    async fn send_text(&self, text: String) -> Result<(), NegotiationError> {
        if !self.is_open() {
            return Err(NegotiationError::LinkClosed);
        }
        lock(&self.sent).push(text);
        Ok(())
    }
}

#[derive(Default)]
struct EngineState {
    events: Option<mpsc::Sender<EngineEvent>>,
    remote_descriptions: Vec<SessionDescription>,
    local: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    links: Vec<Arc<MockControlLink>>,
    reject_remote: bool,
    closed: bool,
}

/// Engine that records calls and lets the test inject events.
pub struct MockEngine {
    state: Arc<Mutex<EngineState>>,
}

/// Test-side view of a [`MockEngine`].
#[derive(Clone)]
pub struct MockEngineHandle {
    state: Arc<Mutex<EngineState>>,
}

impl MockEngine {
    pub fn new() -> (MockEngine, MockEngineHandle) {
        let state = Arc::new(Mutex::new(EngineState::default()));
        (
            MockEngine {
                state: state.clone(),
            },
            MockEngineHandle { state },
        )
    }
}

impl MockEngineHandle {
    /// Delivers an event as if the engine produced it; false when nobody subscribed.
    pub async fn emit(&self, event: EngineEvent) -> bool {
        let sender = lock(&self.state).events.clone();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    pub fn remote_descriptions(&self) -> usize {
        lock(&self.state).remote_descriptions.len()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).candidates.clone()
    }

    /// The data channel the session opened locally.
    pub fn control_link(&self) -> Option<Arc<MockControlLink>> {
        lock(&self.state).links.first().cloned()
    }

    pub fn reject_remote_descriptions(&self) {
        lock(&self.state).reject_remote = true;
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

#[async_trait]
impl PeerEngine for MockEngine {
    fn subscribe(&self) -> mpsc::Receiver<EngineEvent> {
        let (tx, rx) = mpsc::channel(ENGINE_EVENT_BUFFER);
        lock(&self.state).events = Some(tx);
        rx
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let mut state = lock(&self.state);
        if state.reject_remote {
            return Err(NegotiationError::Rejected("remote description refused".into()));
        }
        if desc.sdp_type != "offer" {
            return Err(NegotiationError::UnsupportedType(desc.sdp_type));
        }
        state.remote_descriptions.push(desc);
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        if lock(&self.state).remote_descriptions.is_empty() {
            return Err(NegotiationError::Rejected("no remote description".into()));
        }
        Ok(SessionDescription::answer(ANSWER_SDP))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        lock(&self.state).local = Some(desc);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.state).local.clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let mut state = lock(&self.state);
        if state.remote_descriptions.is_empty() {
            return Err(NegotiationError::Rejected("no remote description".into()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn create_control_link(
        &self,
        label: &str,
    ) -> Result<Arc<dyn ControlLink>, NegotiationError> {
        let link = Arc::new(MockControlLink::open(label));
        lock(&self.state).links.push(link.clone());
        Ok(link)
    }

    async fn gathering_complete(&self) {}

    async fn close(&self) -> Result<(), NegotiationError> {
        let mut state = lock(&self.state);
        state.closed = true;
        state.events = None;
        Ok(())
    }
}

/// Hands out [`MockEngine`]s and keeps a handle to each.
#[derive(Default)]
pub struct MockEngineFactory {
    handles: Mutex<Vec<MockEngineHandle>>,
}

impl MockEngineFactory {
    pub fn handles(&self) -> Vec<MockEngineHandle> {
        lock(&self.handles).clone()
    }

    pub fn last(&self) -> Option<MockEngineHandle> {
        lock(&self.handles).last().cloned()
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create(&self) -> Result<Box<dyn PeerEngine>, NegotiationError> {
        let (engine, handle) = MockEngine::new();
        lock(&self.handles).push(handle);
        Ok(Box::new(engine))
    }
}

#[derive(Default)]
struct RecorderLog {
    created: usize,
    stopped: usize,
    running: HashSet<String>,
    fail_start: HashSet<String>,
    tracks: HashMap<String, Vec<String>>,
}

/// Recorder factory whose recorders only record what was asked of them.
#[derive(Default)]
pub struct MockRecorderFactory {
    log: Arc<Mutex<RecorderLog>>,
}

impl MockRecorderFactory {
    /// Recorders for `target` will refuse to start.
    pub fn fail_start(&self, target: &str) {
        lock(&self.log).fail_start.insert(target.to_string());
    }

    pub fn created(&self) -> usize {
        lock(&self.log).created
    }

    /// Number of `stop` calls across all recorders.
    pub fn stopped(&self) -> usize {
        lock(&self.log).stopped
    }

    pub fn running(&self) -> usize {
        lock(&self.log).running.len()
    }

    pub fn tracks_of(&self, target: &str) -> Vec<String> {
        lock(&self.log)
            .tracks
            .get(target)
            .cloned()
            .unwrap_or_default()
    }
}

impl RecorderFactory for MockRecorderFactory {
    fn create(
        &self,
        target: &str,
        _format: &str,
        _options: &RecorderOptions,
    ) -> Result<Box<dyn Recorder>, RecorderError> {
        lock(&self.log).created += 1;
        Ok(Box::new(MockRecorder {
            target: target.to_string(),
            log: self.log.clone(),
            tracks: Vec::new(),
        }))
    }
}

struct MockRecorder {
    target: String,
    log: Arc<Mutex<RecorderLog>>,
    tracks: Vec<String>,
}

#[async_trait]
impl Recorder for MockRecorder {
    fn target(&self) -> &str {
        &self.target
    }

    async fn add_track(&mut self, track: &MediaTrack) -> Result<(), RecorderError> {
        if !self.tracks.iter().any(|id| id == track.id()) {
            self.tracks.push(track.id().to_string());
        }
        lock(&self.log)
            .tracks
            .insert(self.target.clone(), self.tracks.clone());
        Ok(())
    }

    async fn start(&mut self) -> Result<(), RecorderError> {
        let mut log = lock(&self.log);
        if log.fail_start.contains(&self.target) {
            return Err(RecorderError::Other("connection refused".into()));
        }
        log.running.insert(self.target.clone());
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), RecorderError> {
        let mut log = lock(&self.log);
        log.stopped += 1;
        log.running.remove(&self.target);
        Ok(())
    }
}
