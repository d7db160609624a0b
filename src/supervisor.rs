//! Process lifetime: wires signaling, the live session and the recording
//! orchestrator together and drives them from one loop.

use anyhow::{anyhow, bail, Context};
use std::collections::HashMap;
use std::future::pending;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use crate::commands::CommandChannel;
use crate::config::RelayConfig;
use crate::error::SessionError;
use crate::peer::engine::{EngineEvent, EngineFactory};
use crate::peer::negotiator::SessionNegotiator;
use crate::peer::types::{IceCandidate, PeerAddress, SessionDescription, SessionOffer};
use crate::recording::{RecorderFactory, RecordingOrchestrator};
use crate::session::Session;
use crate::signaling::{SignalingClient, SignalingEvent, SignalingSender};

/// Remote candidates kept per peer while its offer has not arrived yet.
pub const EARLY_CANDIDATE_LIMIT: usize = 64;

/// Distinct peers that may hold early candidates at once.
pub const EARLY_CANDIDATE_PEERS: usize = 16;

const GATHER_TIMEOUT: Duration = Duration::from_secs(5);

enum Step {
    Interrupted,
    Signaling(SignalingEvent),
    Engine(Option<EngineEvent>),
    IdleCeiling,
}

pub struct Supervisor {
    config: RelayConfig,
    engines: Arc<dyn EngineFactory>,
    orchestrator: RecordingOrchestrator,
    session: Option<Session>,
    signaling: Option<SignalingSender>,
    early_candidates: HashMap<PeerAddress, Vec<IceCandidate>>,
}

impl Supervisor {
    pub fn new(
        config: RelayConfig,
        engines: Arc<dyn EngineFactory>,
        recorders: Arc<dyn RecorderFactory>,
    ) -> Self {
        let orchestrator = RecordingOrchestrator::new(recorders, config.recorder.clone());
        Self {
            config,
            engines,
            orchestrator,
            session: None,
            signaling: None,
            early_candidates: HashMap::new(),
        }
    }

    pub fn orchestrator(&self) -> &RecordingOrchestrator {
        &self.orchestrator
    }

    pub fn orchestrator_mut(&mut self) -> &mut RecordingOrchestrator {
        &mut self.orchestrator
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn early_candidates(&self, peer: &str) -> usize {
        self.early_candidates.get(peer).map_or(0, Vec::len)
    }

    /// Routes outbound answers and candidates through `sender` from now on.
    pub fn attach_signaling(&mut self, sender: SignalingSender) {
        if let Some(session) = self.session.as_mut() {
            session.negotiator_mut().set_signaling(Some(sender.clone()));
        }
        self.signaling = Some(sender);
    }

    fn detach_signaling(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.negotiator_mut().set_signaling(None);
        }
        self.signaling = None;
    }

    pub async fn register_default_destination(&mut self) {
        let Some(url) = self.config.default_destination.clone() else {
            return;
        };
        match self.orchestrator.add_destination(&url, &[]).await {
            Ok(change) => log::info!("default destination: {}", change.url),
            Err(e) => log::warn!("ignoring default destination {url:?}: {e}"),
        }
    }

    /// Serves offers from the rendezvous server until interrupted.
    pub async fn run_relay(&mut self) -> anyhow::Result<()> {
        self.register_default_destination().await;

        let mut client = SignalingClient::new(self.config.signaling.clone());
        let mut events = client
            .connect()
            .await
            .context("failed to connect to the rendezvous server")?;
        if let Some(sender) = client.sender() {
            self.attach_signaling(sender);
        }
        log::info!("waiting for offers; peers can reach us as {}", client.peer_id());

        let result = self.relay_loop(&mut client, &mut events).await;

        self.shutdown().await;
        client.close().await;
        result
    }

    async fn relay_loop(
        &mut self,
        client: &mut SignalingClient,
        events: &mut mpsc::Receiver<SignalingEvent>,
    ) -> anyhow::Result<()> {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            let step = tokio::select! {
                _ = &mut ctrl_c => Step::Interrupted,
                event = events.recv() => {
                    Step::Signaling(event.unwrap_or(SignalingEvent::Disconnected))
                }
                event = next_engine_event(&mut self.session) => Step::Engine(event),
            };

            match step {
                Step::Interrupted => {
                    log::info!("interrupted, shutting down");
                    return Ok(());
                }
                Step::Signaling(SignalingEvent::Disconnected) => {
                    *events = self.reconnect(client).await?;
                }
                Step::Signaling(event) => self.handle_signaling_event(event).await,
                Step::Engine(Some(event)) => self.handle_engine_event(event).await,
                Step::Engine(None) => log::debug!("engine stopped producing events"),
                Step::IdleCeiling => {}
            }
        }
    }

    async fn reconnect(
        &mut self,
        client: &mut SignalingClient,
    ) -> anyhow::Result<mpsc::Receiver<SignalingEvent>> {
        log::warn!("lost the rendezvous server connection");
        self.detach_signaling();

        let attempts = self.config.reconnect_attempts;
        let mut last_error = None;
        for attempt in 1..=attempts {
            sleep(self.config.reconnect_delay).await;
            log::info!("reconnecting to the rendezvous server ({attempt}/{attempts})");
            match client.connect().await {
                Ok(events) => {
                    if let Some(sender) = client.sender() {
                        self.attach_signaling(sender);
                    }
                    return Ok(events);
                }
                Err(e) => {
                    log::warn!("reconnect attempt {attempt} failed: {e}");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(anyhow::Error::new(e).context(format!(
                "giving up on the rendezvous server after {attempts} attempt(s)"
            ))),
            None => Err(anyhow!("rendezvous server connection lost")),
        }
    }

    pub async fn handle_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Offer { offer, src } => {
                if let Err(e) = self.accept_offer(offer, Some(src.clone())).await {
                    log::error!("failed to answer offer from {src}: {e}");
                }
            }
            SignalingEvent::Answer { src, .. } => {
                log::warn!("ignoring answer from {src}; this relay only answers offers");
            }
            SignalingEvent::Candidate { candidate, src } => {
                self.route_remote_candidate(candidate, src).await;
            }
            SignalingEvent::Disconnected => log::debug!("signaling disconnected"),
        }
    }

    async fn route_remote_candidate(&mut self, candidate: IceCandidate, src: PeerAddress) {
        if let Some(session) = self.session.as_mut() {
            if session.is_active() && session.remote() == Some(src.as_str()) {
                session.negotiator_mut().add_ice_candidate(&candidate).await;
                return;
            }
        }

        if !self.early_candidates.contains_key(&src)
            && self.early_candidates.len() >= EARLY_CANDIDATE_PEERS
        {
            log::debug!("too many peers with early candidates, dropping candidate from {src}");
            return;
        }
        let queue = self.early_candidates.entry(src).or_default();
        if queue.len() >= EARLY_CANDIDATE_LIMIT {
            log::debug!("early candidate buffer full, dropping candidate");
            return;
        }
        queue.push(candidate);
    }

    /// Answers an offer, replacing or renegotiating the live session.
    pub async fn accept_offer(
        &mut self,
        offer: SessionOffer,
        remote: Option<PeerAddress>,
    ) -> Result<SessionDescription, SessionError> {
        let renegotiation = self.session.as_ref().is_some_and(|session| {
            session.matches(remote.as_deref(), offer.connection_id.as_deref())
        });

        if !renegotiation {
            self.teardown_session("replaced by a new offer").await;
            let engine = self.engines.create().await?;
            let negotiator = SessionNegotiator::new(
                engine,
                self.signaling.clone(),
                remote.clone(),
                offer.connection_id.clone(),
            );
            let session = Session::new(negotiator);
            log::info!(
                "session {} opened for {}",
                session.id(),
                remote.as_deref().unwrap_or("manual peer")
            );
            self.session = Some(session);
        }

        let Some(session) = self.session.as_mut() else {
            return Err(SessionError::Fatal("no session to negotiate".into()));
        };
        let answer = match session.accept_offer(&offer).await {
            Ok(answer) => answer,
            Err(e) => {
                self.teardown_session("negotiation failed").await;
                return Err(e);
            }
        };

        if !renegotiation {
            let early = remote
                .as_ref()
                .and_then(|peer| self.early_candidates.remove(peer))
                .unwrap_or_default();
            self.early_candidates.clear();
            if !early.is_empty() {
                log::debug!("replaying {} early candidate(s)", early.len());
            }
            for candidate in &early {
                session.negotiator_mut().add_ice_candidate(candidate).await;
            }
        }

        if let (Some(signaling), Some(dst)) = (&self.signaling, remote.as_deref()) {
            if let Err(e) = signaling
                .send_answer(&answer, dst, offer.connection_id.as_deref())
                .await
            {
                log::error!("failed to send answer to {dst}: {e}");
            }
        }
        Ok(answer)
    }

    pub async fn handle_engine_event(&mut self, event: EngineEvent) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        match event {
            EngineEvent::TrackAdded(track) => {
                log::info!("received {} track {}", track.kind(), track.id());
                session.negotiator_mut().on_track(track.clone());
                if self.orchestrator.is_recording() {
                    let tracks = session.negotiator().tracks();
                    for e in self.orchestrator.attach_track(&track, tracks).await {
                        log::warn!("{e}");
                    }
                } else if self.config.auto_start {
                    let tracks = session.negotiator().tracks().to_vec();
                    let report = self.orchestrator.start_recording(&tracks).await;
                    for e in &report.failed {
                        log::warn!("auto-start: {e}");
                    }
                }
            }
            EngineEvent::TrackEnded { track_id } => {
                log::info!("track {track_id} ended");
                if session.negotiator_mut().on_track_ended(&track_id)
                    && self.orchestrator.is_recording()
                {
                    log::info!("no tracks left, stopping recording");
                    for e in self.orchestrator.stop_recording().await {
                        log::warn!("{e}");
                    }
                }
            }
            EngineEvent::LocalCandidate(candidate) => {
                session.negotiator().forward_local_candidate(candidate).await;
            }
            EngineEvent::ConnectionStateChanged(state) => {
                if session.on_connection_state(state).await {
                    self.teardown_session("peer connection failed").await;
                }
            }
            EngineEvent::ControlLinkOpened(link) => session.negotiator_mut().add_link(link),
            EngineEvent::ControlMessage { link, text } => {
                let tracks = session.negotiator().tracks().to_vec();
                CommandChannel::new(link)
                    .handle(&text, &mut self.orchestrator, &tracks)
                    .await;
            }
        }
    }

    /// Stops recording and releases the session's engine.
    pub async fn teardown_session(&mut self, reason: &str) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        log::info!("closing session {} ({reason})", session.id());
        for e in self.orchestrator.stop_recording().await {
            log::warn!("{e}");
        }
        session.close().await;
    }

    pub async fn shutdown(&mut self) {
        self.teardown_session("shutting down").await;
        for e in self.orchestrator.stop_recording().await {
            log::warn!("{e}");
        }
    }

    /// Answers one offer pasted on stdin (or read from a file) without a
    /// rendezvous server, then serves the session until it ends.
    pub async fn run_manual(&mut self, offer_file: Option<PathBuf>) -> anyhow::Result<()> {
        self.register_default_destination().await;
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();

        let text = match offer_file {
            Some(path) => tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read offer from {}", path.display()))?,
            None => {
                println!("Paste the remote offer JSON, then an empty line:");
                read_block(&mut stdin).await?
            }
        };
        let offer = parse_manual_offer(&text)?;

        let answer = self
            .accept_offer(offer, None)
            .await
            .context("failed to answer the offer")?;
        let answer = match self.session.as_ref() {
            Some(session) => {
                if timeout(GATHER_TIMEOUT, session.engine().gathering_complete())
                    .await
                    .is_err()
                {
                    log::warn!("candidate gathering still running, answering with what we have");
                }
                session.engine().local_description().await.unwrap_or(answer)
            }
            None => answer,
        };
        println!("{}", serde_json::to_string(&answer)?);

        println!("Paste remote candidates, one JSON object per line, then an empty line:");
        while let Some(line) = stdin.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                break;
            }
            let candidate: IceCandidate = match serde_json::from_str(line) {
                Ok(candidate) => candidate,
                Err(e) => {
                    log::warn!("skipping candidate line: {e}");
                    continue;
                }
            };
            if let Some(session) = self.session.as_mut() {
                if !session.negotiator_mut().add_ice_candidate(&candidate).await {
                    log::warn!("candidate rejected: {}", candidate.candidate);
                }
            }
        }

        let result = self.manual_loop().await;
        self.shutdown().await;
        result
    }

    async fn manual_loop(&mut self) -> anyhow::Result<()> {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let ceiling = sleep(self.config.idle_timeout);
        tokio::pin!(ceiling);

        while self.session.as_ref().is_some_and(Session::is_active) {
            let step = tokio::select! {
                _ = &mut ctrl_c => Step::Interrupted,
                _ = &mut ceiling => Step::IdleCeiling,
                event = next_engine_event(&mut self.session) => Step::Engine(event),
            };

            match step {
                Step::Interrupted => {
                    log::info!("interrupted, shutting down");
                    return Ok(());
                }
                Step::IdleCeiling => {
                    log::info!("idle ceiling reached, shutting down");
                    return Ok(());
                }
                Step::Engine(Some(event)) => self.handle_engine_event(event).await,
                Step::Engine(None) | Step::Signaling(_) => {}
            }
        }
        log::info!("session ended");
        Ok(())
    }
}

async fn next_engine_event(session: &mut Option<Session>) -> Option<EngineEvent> {
    match session {
        Some(session) if session.is_active() => session.negotiator_mut().next_event().await,
        _ => pending().await,
    }
}

/// Lines up to the first blank line (or end of input), joined.
async fn read_block(lines: &mut Lines<BufReader<Stdin>>) -> anyhow::Result<String> {
    let mut block = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            break;
        }
        block.push(line);
    }
    if block.is_empty() {
        bail!("no offer on stdin");
    }
    Ok(block.join("\n"))
}

/// Accepts `{type, sdp}` as well as `{sdp: {type, sdp}}`.
pub fn parse_manual_offer(text: &str) -> anyhow::Result<SessionOffer> {
    let value: serde_json::Value = serde_json::from_str(text).context("offer is not valid JSON")?;
    let offer = SessionOffer::from_payload(value).context("offer has no session description")?;
    if offer.description.sdp_type != "offer" {
        bail!("expected an offer, got `{}`", offer.description.sdp_type);
    }
    Ok(offer)
}
