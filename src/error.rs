use thiserror::Error;

/// The signaling connection could not be used.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid signaling url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("signaling handshake with {url} failed: {source}")]
    Handshake {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("signaling connection is not open")]
    NotConnected,

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// An inbound envelope that cannot be turned into an event.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope is missing `{0}`")]
    MissingField(&'static str),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Engine(#[from] webrtc::Error),

    #[error("unsupported session description type `{0}`")]
    UnsupportedType(String),

    #[error("peer-session engine rejected the request: {0}")]
    Rejected(String),

    #[error("control link is closed")]
    LinkClosed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CandidateError {
    #[error("empty candidate")]
    Empty,

    #[error("malformed candidate `{0}`")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("recorder has no tracks")]
    NoTracks,

    #[error("failed to launch encoder: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("encoder exited early ({0})")]
    Exited(String),

    #[error("{0}")]
    Other(String),
}

/// A failure scoped to one recording destination.
#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("{url}: unsupported destination scheme (expected {expected})")]
    UnsupportedScheme { url: String, expected: String },

    #[error("{url}: no media available")]
    NoMedia { url: String },

    #[error("{url}: {source}")]
    Recorder {
        url: String,
        #[source]
        source: RecorderError,
    },
}

impl DestinationError {
    pub fn url(&self) -> &str {
        match self {
            DestinationError::UnsupportedScheme { url, .. }
            | DestinationError::NoMedia { url }
            | DestinationError::Recorder { url, .. } => url,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Invalid JSON")]
    InvalidJson,

    #[error("Missing action")]
    MissingAction,

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid arguments for {0}")]
    InvalidArguments(String),

    #[error("URL required")]
    UrlRequired,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session failed: {0}")]
    Fatal(String),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}
