//! End-to-end relay behavior with the mock engine and recorder.

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

use rtc_relay::peer::{EngineEvent, IceCandidate};
use rtc_relay::signaling::{Envelope, Outbound};
use rtc_relay::testing::{
    offer_with_media, video_track, MockControlLink, MockEngineFactory, MockEngineHandle,
    MockRecorderFactory,
};
use rtc_relay::{RelayConfig, SessionState, SignalingEvent, SignalingSender, Supervisor};

struct Harness {
    supervisor: Supervisor,
    engines: Arc<MockEngineFactory>,
    recorders: Arc<MockRecorderFactory>,
    outbound: mpsc::Receiver<Outbound>,
}

impl Harness {
    fn new() -> Self {
        let engines = Arc::new(MockEngineFactory::default());
        let recorders = Arc::new(MockRecorderFactory::default());
        let mut supervisor =
            Supervisor::new(RelayConfig::default(), engines.clone(), recorders.clone());
        let (tx, outbound) = mpsc::channel(64);
        supervisor.attach_signaling(SignalingSender::new(tx));
        Self {
            supervisor,
            engines,
            recorders,
            outbound,
        }
    }

    async fn offer(&mut self, src: &str, connection_id: Option<&str>) -> MockEngineHandle {
        self.supervisor
            .handle_signaling_event(SignalingEvent::Offer {
                offer: offer_with_media(connection_id),
                src: src.into(),
            })
            .await;
        self.engines.last().unwrap()
    }

    fn next_envelope(&mut self) -> Envelope {
        match self.outbound.try_recv() {
            Ok(Outbound::Envelope(envelope)) => envelope,
            other => panic!("expected an envelope, got {other:?}"),
        }
    }

    /// Sends a command over the session's command channel and returns the replies it produced.
    async fn command(&mut self, link: &Arc<MockControlLink>, text: &str) -> Vec<Value> {
        let before = link.sent().len();
        self.supervisor
            .handle_engine_event(EngineEvent::ControlMessage {
                link: link.clone(),
                text: text.into(),
            })
            .await;
        link.sent()[before..]
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }
}

#[tokio::test]
async fn answer_and_candidates_echo_the_connection_id() {
    let mut h = Harness::new();
    h.offer("peer-b", Some("abc123")).await;

    let answer = h.next_envelope();
    assert_eq!(answer.kind, "ANSWER");
    assert_eq!(answer.dst.as_deref(), Some("peer-b"));
    assert_eq!(answer.payload["type"], "answer");
    assert_eq!(answer.payload["sdp"]["type"], "answer");
    assert_eq!(answer.payload["connectionId"], "abc123");

    h.supervisor
        .handle_engine_event(EngineEvent::LocalCandidate(IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.5 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }))
        .await;
    let candidate = h.next_envelope();
    assert_eq!(candidate.kind, "CANDIDATE");
    assert_eq!(candidate.payload["type"], "candidate");
    assert_eq!(candidate.payload["connectionId"], "abc123");
    assert_eq!(candidate.payload["candidate"]["sdpMLineIndex"], 0);
}

#[tokio::test]
async fn answer_without_connection_id_omits_it() {
    let mut h = Harness::new();
    h.offer("peer-b", None).await;
    let answer = h.next_envelope();
    assert!(answer.payload.get("connectionId").is_none());
}

#[tokio::test]
async fn status_before_any_media() {
    let mut h = Harness::new();
    let engine = h.offer("peer-b", None).await;
    let link = engine.control_link().unwrap();

    h.supervisor
        .handle_engine_event(EngineEvent::ControlMessage {
            link: link.clone(),
            text: r#"{"action":"status"}"#.into(),
        })
        .await;
    assert_eq!(
        link.sent(),
        vec![r#"{"status":"ok","recording":false,"urls":[],"tracks":0,"active_recorders":0}"#]
    );
}

#[tokio::test]
async fn remote_candidates_are_normalized_or_dropped() {
    let mut h = Harness::new();
    let engine = h.offer("peer-b", None).await;

    let candidate = |raw: &str| SignalingEvent::Candidate {
        candidate: IceCandidate {
            candidate: raw.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        },
        src: "peer-b".into(),
    };
    let good = candidate("candidate:1 1 UDP 2122252543 192.168.1.10 54321 typ host");
    let bare = candidate("2 1 udp 1686052607 203.0.113.7 40000 typ srflx raddr 0.0.0.0 rport 0");
    let empty = candidate("");
    for event in [good, bare, empty] {
        h.supervisor.handle_signaling_event(event).await;
    }

    let applied = engine.candidates();
    assert_eq!(applied.len(), 2);
    assert!(applied
        .iter()
        .all(|c| c.candidate.starts_with("candidate:") && c.sdp_mid.as_deref() == Some("0")));
}

#[tokio::test]
async fn start_stop_and_partial_failure() {
    let mut h = Harness::new();
    h.recorders.fail_start("rtmp://down.example.com/live/x");
    let engine = h.offer("peer-b", None).await;
    let link = engine.control_link().unwrap();
    h.supervisor
        .handle_engine_event(EngineEvent::TrackAdded(video_track("v")))
        .await;

    h.command(&link, r#"{"action":"add_url","url":"rtmp://up.example.com/live/a"}"#)
        .await;
    h.command(&link, r#"{"action":"add_url","url":"rtmp://down.example.com/live/x"}"#)
        .await;

    let replies = h.command(&link, r#"{"action":"start"}"#).await;
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0]["status"], "error");
    assert_eq!(replies[0]["url"], "rtmp://down.example.com/live/x");
    assert_eq!(
        replies[1],
        json!({"status": "ok", "urls": ["rtmp://down.example.com/live/x", "rtmp://up.example.com/live/a"]})
    );
    assert!(h.supervisor.orchestrator().is_recording());
    assert_eq!(h.recorders.running(), 1);

    let status = h.command(&link, r#"{"action":"status"}"#).await;
    assert_eq!(status[0]["active_recorders"], 1);
    assert_eq!(status[0]["tracks"], 1);

    assert_eq!(
        h.command(&link, r#"{"action":"stop"}"#).await,
        vec![json!({"status": "ok"})]
    );
    assert_eq!(h.recorders.running(), 0);

    // stopping again is a no-op that still answers
    assert_eq!(
        h.command(&link, r#"{"action":"stop"}"#).await,
        vec![json!({"status": "ok"})]
    );
}

#[tokio::test]
async fn last_track_ending_stops_recording() {
    let mut h = Harness::new();
    let engine = h.offer("peer-b", None).await;
    let link = engine.control_link().unwrap();
    h.supervisor
        .handle_engine_event(EngineEvent::TrackAdded(video_track("v")))
        .await;
    h.command(&link, r#"{"action":"add_url","url":"rtmp://a/live/1"}"#)
        .await;
    h.command(&link, r#"{"action":"start"}"#).await;
    assert!(h.supervisor.orchestrator().is_recording());

    h.supervisor
        .handle_engine_event(EngineEvent::TrackEnded {
            track_id: "v".into(),
        })
        .await;

    let status = h.command(&link, r#"{"action":"status"}"#).await;
    assert_eq!(status[0]["recording"], false);
    assert_eq!(status[0]["tracks"], 0);
    assert_eq!(h.recorders.running(), 0);
}

#[tokio::test]
async fn new_offer_replaces_the_old_session() {
    let mut h = Harness::new();
    let first = h.offer("peer-a", Some("c1")).await;
    let link = first.control_link().unwrap();
    h.supervisor
        .handle_engine_event(EngineEvent::TrackAdded(video_track("v")))
        .await;
    h.command(&link, r#"{"action":"add_url","url":"rtmp://a/live/1"}"#)
        .await;
    h.command(&link, r#"{"action":"start"}"#).await;

    // same peer, same connection id: renegotiation
    let same = h.offer("peer-a", Some("c1")).await;
    assert_eq!(h.engines.handles().len(), 1);
    assert_eq!(same.remote_descriptions(), 2);
    assert!(h.supervisor.orchestrator().is_recording());

    let second = h.offer("peer-a", Some("c2")).await;
    assert_eq!(h.engines.handles().len(), 2);
    assert!(first.is_closed());
    assert!(!second.is_closed());
    assert!(!h.supervisor.orchestrator().is_recording());
    // destinations outlive the session
    assert_eq!(h.supervisor.orchestrator().urls(), vec!["rtmp://a/live/1"]);

    let session = h.supervisor.session().unwrap();
    assert_eq!(session.state(), SessionState::Answered);
    assert_eq!(session.connection_id(), Some("c2"));
}

#[tokio::test]
async fn connected_state_advances_the_session() {
    let mut h = Harness::new();
    h.offer("peer-a", None).await;
    h.supervisor
        .handle_engine_event(EngineEvent::ConnectionStateChanged(
            rtc_relay::peer::ConnectionState::Connected,
        ))
        .await;
    assert_eq!(
        h.supervisor.session().map(|s| s.state()),
        Some(SessionState::Connected)
    );
}

#[tokio::test]
async fn start_before_media_launches_once_a_track_arrives() {
    let mut h = Harness::new();
    let engine = h.offer("peer-b", None).await;
    let link = engine.control_link().unwrap();
    h.command(&link, r#"{"action":"add_url","url":"rtmp://a/live/1"}"#)
        .await;

    let replies = h.command(&link, r#"{"action":"start"}"#).await;
    assert_eq!(replies[0]["status"], "error");
    assert_eq!(replies[0]["url"], "rtmp://a/live/1");
    assert_eq!(h.recorders.running(), 0);

    h.supervisor
        .handle_engine_event(EngineEvent::TrackAdded(video_track("v")))
        .await;

    let status = h.command(&link, r#"{"action":"status"}"#).await;
    assert_eq!(
        status[0],
        json!({"status": "ok", "recording": true, "urls": ["rtmp://a/live/1"], "tracks": 1, "active_recorders": 1})
    );
    assert_eq!(h.recorders.running(), 1);
    assert_eq!(h.recorders.tracks_of("rtmp://a/live/1"), vec!["v"]);
}
