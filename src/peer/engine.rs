//! The seam between session negotiation and the peer-session engine.
//!
//! Engine callbacks never touch relay state directly; they are turned into
//! [`EngineEvent`]s on a bounded channel that the owner of the session drains.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::NegotiationError;
use crate::peer::types::{ConnectionState, IceCandidate, MediaTrack, SessionDescription};

/// Events produced by a peer-session engine after [`PeerEngine::subscribe`].
pub enum EngineEvent {
    TrackAdded(MediaTrack),
    TrackEnded { track_id: String },
    LocalCandidate(IceCandidate),
    ConnectionStateChanged(ConnectionState),
    /// A data channel opened by the remote side.
    ControlLinkOpened(Arc<dyn ControlLink>),
    ControlMessage {
        link: Arc<dyn ControlLink>,
        text: String,
    },
}

/// Text link used for the command protocol.
#[async_trait]
pub trait ControlLink: Send + Sync {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<(), NegotiationError>;
}

#[async_trait]
pub trait PeerEngine: Send + Sync {
    /// Installs the engine listeners. Only the most recent receiver gets events.
    fn subscribe(&self) -> mpsc::Receiver<EngineEvent>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), NegotiationError>;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    async fn create_control_link(
        &self,
        label: &str,
    ) -> Result<Arc<dyn ControlLink>, NegotiationError>;

    /// Resolves once local candidate gathering has finished.
    async fn gathering_complete(&self);

    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Creates one engine per session.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn PeerEngine>, NegotiationError>;
}
