//! Answers PeerJS WebRTC sessions and fans the received media out to a
//! runtime-controlled set of RTMP destinations.

pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
pub mod recording;
pub mod session;
pub mod signaling;
pub mod supervisor;
pub mod utils;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{RelayConfig, SignalingConfig};
pub use session::{Session, SessionState};
pub use signaling::{SignalingClient, SignalingEvent, SignalingSender};
pub use supervisor::Supervisor;
