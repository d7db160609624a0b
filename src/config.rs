use std::time::Duration;

use crate::peer::types::ServerConfig;
use crate::recording::RecorderOptions;

/// Rendezvous (PeerJS) server settings.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub secure: bool,
    pub key: String,
    /// Our own address; a random one is generated when unset.
    pub peer_id: Option<String>,
    pub heartbeat_interval: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            host: "0.peerjs.com".into(),
            port: 443,
            path: "/".into(),
            secure: true,
            key: "peerjs".into(),
            peer_id: None,
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub signaling: SignalingConfig,
    pub ice_servers: Vec<ServerConfig>,
    pub recorder: RecorderOptions,
    /// Destination registered at startup.
    pub default_destination: Option<String>,
    /// Start recording as soon as media arrives.
    pub auto_start: bool,
    /// Upper bound on a manual-mode run.
    pub idle_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            ice_servers: default_ice_servers(),
            recorder: RecorderOptions::default(),
            default_destination: None,
            auto_start: false,
            idle_timeout: Duration::from_secs(3600),
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig::stun("stun:stun.l.google.com:19302"),
        ServerConfig::stun("stun:stun1.l.google.com:19302"),
    ]
}
