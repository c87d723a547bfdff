use thiserror::Error;

use crate::crypto::SessionKey;
use crate::messages::ACTION_ID_MODULUS;

/// Largest id the generator produces; a response id of 0 after it is a wraparound.
pub const LAST_ACTION_ID: u32 = ACTION_ID_MODULUS - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    /// Transport open, no challenge yet.
    Connected,
    /// Challenge received, waiting for the first `QUERY` response.
    Authenticating,
    Authenticated,
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid phase transition {from:?} -> {to:?}")]
pub struct PhaseTransitionError {
    pub from: ConnectionPhase,
    pub to: ConnectionPhase,
}

impl ConnectionPhase {
    /// Validates and applies a transition.
    pub fn transition(self, next: ConnectionPhase) -> Result<ConnectionPhase, PhaseTransitionError> {
        use ConnectionPhase::*;
        let allowed = match (self, next) {
            (Idle | Closed, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected | Authenticating | Authenticated, Authenticating) => true,
            (Authenticating, Authenticated) => true,
            (Idle, _) => false,
            (_, Closed) => true,
            _ => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(PhaseTransitionError {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self,
            ConnectionPhase::Connected
                | ConnectionPhase::Authenticating
                | ConnectionPhase::Authenticated
        )
    }
}

/// `true` when `candidate` is ahead of `current` on the action id ring.
pub fn is_ahead(candidate: u32, current: u32) -> bool {
    candidate > current || (candidate == 0 && current == LAST_ACTION_ID)
}

pub fn next_action_id(id: u32) -> u32 {
    (id + 1) % ACTION_ID_MODULUS
}

/// Half-ring comparison used for ids we generated ourselves.
fn ring_ahead(candidate: u32, reference: u32) -> bool {
    let distance = (candidate + ACTION_ID_MODULUS - reference) % ACTION_ID_MODULUS;
    distance != 0 && distance < ACTION_ID_MODULUS / 2
}

/// Mutable per-connection state. Owned exclusively by [`super::Session`].
#[derive(Debug, Clone)]
pub struct SessionState {
    pub phase: ConnectionPhase,
    pub session_key: Option<SessionKey>,
    pub last_action_id: Option<u32>,
    /// Id of the most recent action we sent; keeps back-to-back sends unique
    /// while their responses are still in flight.
    pub last_sent_action_id: Option<u32>,
    pub awaiting_auth_query_response: bool,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            session_key: None,
            last_action_id: None,
            last_sent_action_id: None,
            awaiting_auth_query_response: false,
        }
    }

    pub fn connected(&self) -> bool {
        self.phase.is_open()
    }

    pub fn authenticated(&self) -> bool {
        self.connected() && self.session_key.is_some() && !self.awaiting_auth_query_response
    }

    /// Clears everything negotiated on a previous connection.
    pub fn reset(&mut self) {
        self.session_key = None;
        self.last_action_id = None;
        self.last_sent_action_id = None;
        self.awaiting_auth_query_response = false;
    }

    pub fn set_phase(&mut self, next: ConnectionPhase) -> Result<(), PhaseTransitionError> {
        self.phase = self.phase.transition(next)?;
        Ok(())
    }

    pub fn accept_challenge(&mut self, key: SessionKey, initial_action_id: u32) {
        self.session_key = Some(key);
        self.last_action_id = Some(initial_action_id);
        self.last_sent_action_id = None;
    }

    /// Id the next outbound action will carry, or `None` before a challenge.
    pub fn peek_action_id(&self) -> Option<u32> {
        let acknowledged = self.last_action_id?;
        Some(next_action_id(
            self.last_sent_action_id.unwrap_or(acknowledged),
        ))
    }

    pub fn record_sent_action_id(&mut self, id: u32) {
        self.last_sent_action_id = Some(id);
    }

    /// Moves `last_action_id` forward if `response_id` is ahead of it.
    ///
    /// Returns whether the counter moved. Stale, duplicate and out-of-range ids
    /// leave it untouched.
    pub fn observe_response_id(&mut self, response_id: u32) -> bool {
        let Some(current) = self.last_action_id else {
            return false;
        };
        if response_id >= ACTION_ID_MODULUS || !is_ahead(response_id, current) {
            return false;
        }
        self.last_action_id = Some(response_id);
        if let Some(sent) = self.last_sent_action_id {
            if ring_ahead(response_id, sent) {
                self.last_sent_action_id = None;
            }
        }
        true
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
