use async_trait::async_trait;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::time::interval;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::Marshal;

use crate::error::NegotiationError;
use crate::peer::data_channel::DataChannelLink;
use crate::peer::engine::{ControlLink, EngineEvent, EngineFactory, PeerEngine};
use crate::peer::types::{
    IceCandidate, MediaTrack, ServerConfig, SessionDescription, TrackCodec, TrackKind,
};
use crate::peer::{ENGINE_EVENT_BUFFER, KEYFRAME_INTERVAL};
use crate::utils::add_ice_url_scheme;

/// Builds webrtc-rs peer connections with the default codecs and interceptors.
pub struct WebRtcEngineFactory {
    ice_servers: Vec<ServerConfig>,
}

impl WebRtcEngineFactory {
    pub fn new(ice_servers: Vec<ServerConfig>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn create(&self) -> Result<Box<dyn PeerEngine>, NegotiationError> {
        Ok(Box::new(self.build().await?))
    }
}

impl WebRtcEngineFactory {
    async fn build(&self) -> Result<WebRtcEngine, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(&self.ice_servers)).await?);
        log::debug!("created peer connection");

        Ok(WebRtcEngine {
            pc,
            events: Mutex::new(None),
        })
    }
}

/// Configuration for the peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
    events: Mutex<Option<mpsc::Sender<EngineEvent>>>,
}

impl WebRtcEngine {
    fn event_sender(&self) -> Option<mpsc::Sender<EngineEvent>> {
        self.events.lock().ok().and_then(|events| events.clone())
    }
}

#[async_trait]
impl PeerEngine for WebRtcEngine {
    fn subscribe(&self) -> mpsc::Receiver<EngineEvent> {
        let (tx, rx) = mpsc::channel(ENGINE_EVENT_BUFFER);
        if let Ok(mut events) = self.events.lock() {
            *events = Some(tx.clone());
        }

        let track_tx = tx.clone();
        let pc_weak = Arc::downgrade(&self.pc);
        self.pc.on_track(Box::new(
            move |remote: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = track_tx.clone();
                let pc = pc_weak.clone();
                Box::pin(async move {
                    let Some(track) = media_track(&remote) else {
                        log::warn!("ignoring remote track {} of unknown kind", remote.id());
                        return;
                    };
                    log::info!(
                        "remote {} track {} ({})",
                        track.kind(),
                        track.id(),
                        track.codec().mime_type
                    );

                    if track.kind() == TrackKind::Video {
                        tokio::spawn(request_keyframes(pc, remote.ssrc()));
                    }
                    if tx.send(EngineEvent::TrackAdded(track.clone())).await.is_ok() {
                        tokio::spawn(pump_track(remote, track, tx));
                    }
                })
            },
        ));

        let candidate_tx = tx.clone();
        self.pc
            .on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
                let tx = candidate_tx.clone();
                Box::pin(async move {
                    let Some(c) = cand else {
                        log::debug!("local candidate gathering completed");
                        return;
                    };
                    match c.to_json() {
                        Ok(init) => {
                            let _ = tx.send(EngineEvent::LocalCandidate(init.into())).await;
                        }
                        Err(e) => log::debug!("failed to serialize local candidate: {e}"),
                    }
                })
            }));

        let state_tx = tx.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                let tx = state_tx.clone();
                Box::pin(async move {
                    let _ = tx.send(EngineEvent::ConnectionStateChanged(st.into())).await;
                })
            }));

        let channel_tx = tx;
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let tx = channel_tx.clone();
                Box::pin(async move {
                    let link = DataChannelLink::attach(dc, Some(tx.clone()));
                    let _ = tx.send(EngineEvent::ControlLinkOpened(link)).await;
                })
            }));

        rx
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await?;
        Ok(from_rtc(answer))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc.local_description().await.map(from_rtc)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn create_control_link(
        &self,
        label: &str,
    ) -> Result<Arc<dyn ControlLink>, NegotiationError> {
        let dc = self.pc.create_data_channel(label, None).await?;
        Ok(DataChannelLink::attach(dc, self.event_sender()))
    }

    async fn gathering_complete(&self) {
        let mut done = self.pc.gathering_complete_promise().await;
        let _ = done.recv().await;
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc.close().await?;
        Ok(())
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let rtc = match desc.sdp_type.as_str() {
        "offer" => RTCSessionDescription::offer(desc.sdp)?,
        "answer" => RTCSessionDescription::answer(desc.sdp)?,
        "pranswer" => RTCSessionDescription::pranswer(desc.sdp)?,
        other => return Err(NegotiationError::UnsupportedType(other.to_string())),
    };
    Ok(rtc)
}

fn from_rtc(desc: RTCSessionDescription) -> SessionDescription {
    SessionDescription {
        sdp_type: desc.sdp_type.to_string(),
        sdp: desc.sdp,
    }
}

fn media_track(remote: &TrackRemote) -> Option<MediaTrack> {
    let kind = match remote.kind() {
        RTPCodecType::Audio => TrackKind::Audio,
        RTPCodecType::Video => TrackKind::Video,
        _ => return None,
    };
    let params = remote.codec();
    let codec = TrackCodec {
        mime_type: params.capability.mime_type,
        clock_rate: params.capability.clock_rate,
        channels: params.capability.channels,
        payload_type: params.payload_type,
        fmtp: params.capability.sdp_fmtp_line,
    };
    Some(MediaTrack::new(remote.id(), kind, codec))
}

/// Copies RTP from the engine into the track fan-out until the stream ends.
async fn pump_track(remote: Arc<TrackRemote>, track: MediaTrack, tx: mpsc::Sender<EngineEvent>) {
    loop {
        match remote.read_rtp().await {
            Ok((packet, _)) => match packet.marshal() {
                Ok(raw) => {
                    track.publish(raw);
                }
                Err(e) => log::debug!("dropping unmarshallable packet on {}: {e}", track.id()),
            },
            Err(e) => {
                log::info!("{} track {} ended: {e}", track.kind(), track.id());
                break;
            }
        }
    }
    let _ = tx
        .send(EngineEvent::TrackEnded {
            track_id: track.id().to_string(),
        })
        .await;
}

/// Encoders joining mid-stream need a keyframe, so ask the sender periodically.
async fn request_keyframes(pc: Weak<RTCPeerConnection>, media_ssrc: u32) {
    let mut ticker = interval(KEYFRAME_INTERVAL);
    loop {
        ticker.tick().await;
        let Some(pc) = pc.upgrade() else { break };
        if pc
            .write_rtcp(&[Box::new(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            })])
            .await
            .is_err()
        {
            break;
        }
    }
}
