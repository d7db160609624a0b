use std::future::pending;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::NegotiationError;
use crate::logger::dump_candidate;
use crate::peer::engine::{ControlLink, EngineEvent, PeerEngine};
use crate::peer::ice::{normalize_candidate, CandidateTally};
use crate::peer::types::{
    ConnectionState, IceCandidate, MediaTrack, PeerAddress, SessionDescription, SessionOffer,
};
use crate::peer::COMMAND_CHANNEL_LABEL;
use crate::signaling::SignalingSender;

/// Drives one peer-session engine through offer/answer and candidate exchange,
/// and owns the session's active track set.
pub struct SessionNegotiator {
    engine: Box<dyn PeerEngine>,
    signaling: Option<SignalingSender>,
    remote: Option<PeerAddress>,
    connection_id: Option<String>,
    events: Option<mpsc::Receiver<EngineEvent>>,
    links: Vec<Arc<dyn ControlLink>>,
    tracks: Vec<MediaTrack>,
    /// Remote candidates received before the remote description was set.
    pending: Vec<IceCandidate>,
    tally: CandidateTally,
    subscribed: bool,
    negotiated: bool,
    closed: bool,
}

impl SessionNegotiator {
    pub fn new(
        engine: Box<dyn PeerEngine>,
        signaling: Option<SignalingSender>,
        remote: Option<PeerAddress>,
        connection_id: Option<String>,
    ) -> Self {
        Self {
            engine,
            signaling,
            remote,
            connection_id,
            events: None,
            links: Vec::new(),
            tracks: Vec::new(),
            pending: Vec::new(),
            tally: CandidateTally::default(),
            subscribed: false,
            negotiated: false,
            closed: false,
        }
    }

    pub fn remote(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    /// Replaces the signaling path, e.g. after the rendezvous connection was re-established.
    pub fn set_signaling(&mut self, signaling: Option<SignalingSender>) {
        self.signaling = signaling;
    }

    pub fn engine(&self) -> &dyn PeerEngine {
        self.engine.as_ref()
    }

    /// Applies an offer and returns the local answer.
    pub async fn receive_offer(
        &mut self,
        offer: &SessionOffer,
    ) -> Result<SessionDescription, NegotiationError> {
        if !self.subscribed {
            self.events = Some(self.engine.subscribe());
            self.subscribed = true;
            // every session gets a command channel, whether or not the offer asked for one
            let link = self.engine.create_control_link(COMMAND_CHANNEL_LABEL).await?;
            self.links.push(link);
        }

        if !offer.description.has_media_sections() {
            log::warn!("offer has no audio or video sections; no media will flow");
        }

        self.engine
            .set_remote_description(offer.description.clone())
            .await?;
        self.negotiated = true;
        self.apply_pending_candidates().await;

        let answer = self.engine.create_answer().await?;
        self.engine.set_local_description(answer.clone()).await?;
        log::info!(
            "answered offer from {}",
            self.remote.as_deref().unwrap_or("manual peer")
        );
        Ok(answer)
    }

    /// Best-effort: returns whether the candidate was accepted (or queued).
    pub async fn add_ice_candidate(&mut self, data: &IceCandidate) -> bool {
        let (candidate, line) = match normalize_candidate(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::debug!("rejecting remote candidate: {e}");
                return false;
            }
        };
        dump_candidate("REMOTE", &candidate);
        self.tally.record(&line);

        if !self.negotiated {
            log::debug!("remote description not set yet, queuing candidate");
            self.pending.push(candidate);
            return true;
        }

        match self.engine.add_ice_candidate(candidate).await {
            Ok(()) => true,
            Err(e) => {
                log::debug!("engine rejected remote candidate: {e}");
                false
            }
        }
    }

    async fn apply_pending_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.pending) {
            if let Err(e) = self.engine.add_ice_candidate(candidate).await {
                log::debug!("failed to apply pending candidate: {e}");
            }
        }
    }

    /// Next engine event; never resolves once the engine stops producing them.
    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        let Some(events) = self.events.as_mut() else {
            return pending().await;
        };
        match events.recv().await {
            Some(event) => Some(event),
            None => {
                self.events = None;
                None
            }
        }
    }

    /// Records a new track; returns the active track count.
    pub fn on_track(&mut self, track: MediaTrack) -> usize {
        if !self.tracks.iter().any(|t| t.id() == track.id()) {
            self.tracks.push(track);
        }
        log::info!("{} active track(s)", self.tracks.len());
        self.tracks.len()
    }

    /// Drops an ended track; returns true when this emptied the active set.
    pub fn on_track_ended(&mut self, track_id: &str) -> bool {
        let before = self.tracks.len();
        self.tracks.retain(|t| t.id() != track_id);
        before > 0 && self.tracks.is_empty()
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// Sends a locally gathered candidate to the remote peer, if one is known.
    pub async fn forward_local_candidate(&self, candidate: IceCandidate) {
        dump_candidate("LOCAL", &candidate);
        let (Some(signaling), Some(remote)) = (&self.signaling, &self.remote) else {
            log::debug!("no remote peer known yet, dropping local candidate");
            return;
        };
        if let Err(e) = signaling
            .send_candidate(&candidate, remote, self.connection_id.as_deref())
            .await
        {
            log::warn!("failed to send local candidate to {remote}: {e}");
        }
    }

    /// Returns true when the state is fatal for the session.
    pub async fn on_connection_state(&mut self, state: ConnectionState) -> bool {
        log::info!("peer connection state changed to {state:?}");
        if state == ConnectionState::Failed {
            self.close().await;
            return true;
        }
        false
    }

    pub fn add_link(&mut self, link: Arc<dyn ControlLink>) {
        log::info!("remote opened data channel '{}'", link.label());
        self.links.push(link);
    }

    /// First control link that can currently carry a message.
    pub fn open_link(&self) -> Option<Arc<dyn ControlLink>> {
        self.links.iter().find(|link| link.is_open()).cloned()
    }

    /// Releases the engine. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.tally.log_summary();
        self.tracks.clear();
        self.pending.clear();
        self.links.clear();
        if let Err(e) = self.engine.close().await {
            log::warn!("failed to close peer connection: {e}");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{Outbound, SignalingSender};
    use crate::testing::{offer_with_media, video_track, MockEngine, MockEngineHandle};

    fn negotiator(
        signaling: Option<SignalingSender>,
        connection_id: Option<&str>,
    ) -> (SessionNegotiator, MockEngineHandle) {
        let (engine, handle) = MockEngine::new();
        let negotiator = SessionNegotiator::new(
            Box::new(engine),
            signaling,
            Some("peer-a".into()),
            connection_id.map(str::to_string),
        );
        (negotiator, handle)
    }

    fn host_candidate(raw: &str) -> IceCandidate {
        IceCandidate {
            candidate: raw.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn first_offer_opens_the_command_channel_once() {
        let (mut neg, handle) = negotiator(None, None);
        let answer = neg.receive_offer(&offer_with_media(None)).await.unwrap();
        assert_eq!(answer.sdp_type, "answer");
        neg.receive_offer(&offer_with_media(None)).await.unwrap();

        let link = handle.control_link().unwrap();
        assert_eq!(link.label(), COMMAND_CHANNEL_LABEL);
        assert!(neg.open_link().is_some());
        assert_eq!(handle.remote_descriptions(), 2);
    }

    #[tokio::test]
    async fn candidates_before_the_offer_are_queued() {
        let (mut neg, handle) = negotiator(None, None);
        assert!(neg.add_ice_candidate(&host_candidate("1 1 udp 2122260223 10.0.0.2 5000 typ host")).await);
        assert!(handle.candidates().is_empty());

        neg.receive_offer(&offer_with_media(None)).await.unwrap();
        let applied = handle.candidates();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].candidate, "candidate:1 1 udp 2122260223 10.0.0.2 5000 typ host");
        assert_eq!(applied[0].sdp_mid.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn bad_candidates_are_rejected_quietly() {
        let (mut neg, handle) = negotiator(None, None);
        neg.receive_offer(&offer_with_media(None)).await.unwrap();
        assert!(!neg.add_ice_candidate(&host_candidate("")).await);
        assert!(!neg.add_ice_candidate(&host_candidate("candidate:")).await);
        assert!(!neg.add_ice_candidate(&host_candidate("garbage")).await);
        assert!(handle.candidates().is_empty());
    }

    #[tokio::test]
    async fn engine_events_reach_the_owner() {
        let (mut neg, handle) = negotiator(None, None);
        neg.receive_offer(&offer_with_media(None)).await.unwrap();
        assert!(handle.emit(EngineEvent::TrackAdded(video_track("v"))).await);

        match neg.next_event().await {
            Some(EngineEvent::TrackAdded(track)) => assert_eq!(neg.on_track(track), 1),
            _ => panic!("expected a track"),
        }
        assert_eq!(neg.on_track(video_track("v")), 1);
        assert!(!neg.on_track_ended("other"));
        assert!(neg.on_track_ended("v"));
        assert!(neg.tracks().is_empty());
    }

    #[tokio::test]
    async fn local_candidates_echo_the_connection_id() {
        let (tx, mut rx) = mpsc::channel(4);
        let (mut neg, _handle) = negotiator(Some(SignalingSender::new(tx)), Some("abc123"));
        neg.receive_offer(&offer_with_media(Some("abc123"))).await.unwrap();

        neg.forward_local_candidate(host_candidate("candidate:2 1 udp 1 10.0.0.3 6000 typ host"))
            .await;
        match rx.recv().await {
            Some(Outbound::Envelope(envelope)) => {
                assert_eq!(envelope.kind, "CANDIDATE");
                assert_eq!(envelope.dst.as_deref(), Some("peer-a"));
                assert_eq!(envelope.payload["connectionId"], "abc123");
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failure_closes_the_engine_once() {
        let (mut neg, handle) = negotiator(None, None);
        neg.receive_offer(&offer_with_media(None)).await.unwrap();
        assert!(!neg.on_connection_state(ConnectionState::Disconnected).await);
        assert!(!handle.is_closed());
        assert!(neg.on_connection_state(ConnectionState::Failed).await);
        assert!(handle.is_closed() && neg.is_closed());
        neg.close().await;
        assert!(neg.next_event().await.is_none());
    }
}
