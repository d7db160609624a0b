use std::time::Duration;

pub mod connection;
pub mod data_channel;
pub mod engine;
pub mod ice;
pub mod negotiator;
pub mod types;

pub use connection::{WebRtcEngine, WebRtcEngineFactory};
pub use engine::{ControlLink, EngineEvent, EngineFactory, PeerEngine};
pub use negotiator::SessionNegotiator;
pub use types::{
    ConnectionState, IceCandidate, MediaTrack, PeerAddress, ServerConfig, SessionDescription,
    SessionOffer, TrackCodec, TrackKind,
};

/// Label of the locally created data channel carrying commands.
pub const COMMAND_CHANNEL_LABEL: &str = "commands";

/// Capacity of the engine -> supervisor event channel.
pub const ENGINE_EVENT_BUFFER: usize = 64;

/// How often a keyframe is requested on inbound video.
pub const KEYFRAME_INTERVAL: Duration = Duration::from_secs(3);
