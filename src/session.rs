use std::fmt;

use crate::error::SessionError;
use crate::peer::engine::PeerEngine;
use crate::peer::negotiator::SessionNegotiator;
use crate::peer::types::{ConnectionState, SessionDescription, SessionOffer};
use crate::utils::random_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Offered,
    Answered,
    Connected,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed | Failed, _) => false,
            (_, Closed | Failed) => true,
            (Idle, Offered) | (Offered, Answered) | (Answered, Connected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "IDLE",
            SessionState::Offered => "OFFERED",
            SessionState::Answered => "ANSWERED",
            SessionState::Connected => "CONNECTED",
            SessionState::Closed => "CLOSED",
            SessionState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// One negotiated media exchange with a single remote peer.
pub struct Session {
    id: String,
    state: SessionState,
    negotiator: SessionNegotiator,
}

impl Session {
    pub fn new(negotiator: SessionNegotiator) -> Self {
        Self {
            id: random_id(),
            state: SessionState::Idle,
            negotiator,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn remote(&self) -> Option<&str> {
        self.negotiator.remote()
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.negotiator.connection_id()
    }

    pub fn negotiator(&self) -> &SessionNegotiator {
        &self.negotiator
    }

    pub fn negotiator_mut(&mut self) -> &mut SessionNegotiator {
        &mut self.negotiator
    }

    pub fn engine(&self) -> &dyn PeerEngine {
        self.negotiator.engine()
    }

    /// Same peer and same correlation token: an offer for this session is a renegotiation.
    pub fn matches(&self, remote: Option<&str>, connection_id: Option<&str>) -> bool {
        self.is_active() && self.remote() == remote && self.connection_id() == connection_id
    }

    /// Rejected transitions are logged and leave the state untouched.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            log::warn!(
                "session {}: ignoring transition {} -> {next}",
                self.id,
                self.state
            );
            return false;
        }
        log::debug!("session {}: {} -> {next}", self.id, self.state);
        self.state = next;
        true
    }

    /// Answers an offer. A failed negotiation fails the session.
    pub async fn accept_offer(
        &mut self,
        offer: &SessionOffer,
    ) -> Result<SessionDescription, SessionError> {
        if self.state.is_terminal() {
            return Err(SessionError::Fatal(format!(
                "session {} is already {}",
                self.id, self.state
            )));
        }
        let first = self.state == SessionState::Idle;
        if first {
            self.transition(SessionState::Offered);
        } else {
            log::info!("session {}: renegotiating", self.id);
        }

        match self.negotiator.receive_offer(offer).await {
            Ok(answer) => {
                if first {
                    self.transition(SessionState::Answered);
                }
                Ok(answer)
            }
            Err(e) => {
                self.fail(&e.to_string()).await;
                Err(e.into())
            }
        }
    }

    /// Returns true when the new state ends the session.
    pub async fn on_connection_state(&mut self, state: ConnectionState) -> bool {
        if self.negotiator.on_connection_state(state).await {
            self.transition(SessionState::Failed);
            return true;
        }
        if state == ConnectionState::Connected && self.state == SessionState::Answered {
            self.transition(SessionState::Connected);
        }
        false
    }

    pub async fn fail(&mut self, reason: &str) {
        log::error!("session {} failed: {reason}", self.id);
        self.negotiator.close().await;
        self.transition(SessionState::Failed);
    }

    /// Releases the engine. Safe to call in any state.
    pub async fn close(&mut self) {
        self.negotiator.close().await;
        if !self.state.is_terminal() {
            self.transition(SessionState::Closed);
        }
    }
}
