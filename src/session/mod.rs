//! Session state machine for one Remootio device.
//!
//! [`Session`] performs no I/O. Every input (connect attempt, transport open,
//! inbound text, timer tick, transport close, API call) returns the
//! [`SessionAction`]s the driver must carry out in order: frames to send, events to
//! publish, or a forced transport teardown. The async driver lives in
//! [`crate::sdk::client`].
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{self, CodecError};
use crate::crypto::{self, CryptoError, KeyMaterial, SessionKey};
use crate::messages::{
    ActionCommand, ActionRequest, ActionType, EncryptedPayload, Frame, PeerErrorMessage,
    ACTION_ID_MODULUS, MAX_HOLD_DURATION_MINUTES,
};

pub mod keepalive;
pub mod state;

use keepalive::{Keepalive, KeepaliveAction};
use state::{ConnectionPhase, PhaseTransitionError, SessionState};

/// Failures reported by the session, either returned from API calls
/// (precondition misuse) or published as [`SessionEvent::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("transport is not open")]
    NotConnected,
    #[error("no challenge received on this connection; call authenticate first")]
    NotAuthenticated,
    #[error("hold duration must be between 1 and 1440 minutes, got {0}")]
    InvalidDuration(u32),
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("transport: {0}")]
    Transport(String),
    #[error("unexpected {0} frame from device")]
    UnexpectedFrame(&'static str),
    #[error("invalid challenge: {0}")]
    InvalidChallenge(String),
    #[error("device reported error: {}", .0.as_str())]
    Peer(PeerErrorMessage),
    #[error("no reply to keepalive within {0:?}")]
    KeepaliveTimeout(Duration),
    #[error("{0}")]
    InvalidTransition(String),
}

impl From<PhaseTransitionError> for SessionError {
    fn from(err: PhaseTransitionError) -> Self {
        SessionError::InvalidTransition(err.to_string())
    }
}

/// Consumer-facing lifecycle and traffic notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connecting,
    Connected,
    Authenticated,
    Disconnect,
    Error(SessionError),
    /// `payload` is the plaintext of an encrypted action, `None` for plaintext frames.
    OutgoingMessage {
        frame: Frame,
        payload: Option<ActionRequest>,
    },
    /// `payload` is `None` for plaintext frames and for frames that failed to decrypt.
    IncomingMessage {
        frame: Frame,
        payload: Option<EncryptedPayload>,
    },
}

/// Work the driver must perform, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    Send(Frame),
    Emit(SessionEvent),
    /// Drop the transport without a close handshake.
    Terminate,
}

#[derive(Debug)]
pub struct Session {
    keys: KeyMaterial,
    state: SessionState,
    keepalive: Keepalive,
}

impl Session {
    pub fn new(keys: KeyMaterial, keepalive_interval: Duration) -> Self {
        Self {
            keys,
            state: SessionState::new(),
            keepalive: Keepalive::new(keepalive_interval),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.authenticated()
    }

    pub fn last_action_id(&self) -> Option<u32> {
        self.state.last_action_id
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state.phase
    }

    pub fn next_keepalive_deadline(&self) -> Option<Instant> {
        self.keepalive.next_deadline()
    }

    /// Starts a connection attempt, discarding anything negotiated before.
    pub fn begin_connect(&mut self) -> Result<Vec<SessionAction>, SessionError> {
        self.state.set_phase(ConnectionPhase::Connecting)?;
        self.state.reset();
        self.keepalive.disarm();
        debug!("session connecting");
        Ok(vec![SessionAction::Emit(SessionEvent::Connecting)])
    }

    /// Transport reported open.
    pub fn on_open(&mut self, now: Instant) -> Vec<SessionAction> {
        if let Err(err) = self.state.set_phase(ConnectionPhase::Connected) {
            warn!(%err, "transport opened outside a connection attempt");
            return vec![SessionAction::Emit(SessionEvent::Error(err.into()))];
        }
        self.keepalive.arm(now);
        info!(
            interval = ?self.keepalive.interval(),
            "transport open"
        );
        vec![SessionAction::Emit(SessionEvent::Connected)]
    }

    /// Transport reported closed, for whatever reason.
    pub fn on_closed(&mut self) -> Vec<SessionAction> {
        self.keepalive.disarm();
        self.state.awaiting_auth_query_response = false;
        match self.state.phase {
            ConnectionPhase::Idle | ConnectionPhase::Closed => Vec::new(),
            _ => {
                self.state.phase = ConnectionPhase::Closed;
                info!("transport closed");
                vec![SessionAction::Emit(SessionEvent::Disconnect)]
            }
        }
    }

    /// Local close requested. Liveness is no longer enforced while the peer
    /// acknowledges; `on_closed` still follows once the transport is gone.
    pub fn begin_close(&mut self) {
        self.keepalive.disarm();
        debug!("close requested, keepalive stopped");
    }

    /// Sends `AUTH`; the device answers with an encrypted challenge.
    pub fn authenticate(&mut self) -> Result<Vec<SessionAction>, SessionError> {
        self.ensure_connected()?;
        Ok(plaintext(Frame::Auth))
    }

    pub fn hello(&mut self) -> Result<Vec<SessionAction>, SessionError> {
        self.ensure_connected()?;
        Ok(plaintext(Frame::Hello))
    }

    /// Encrypts and sends one action under the session key.
    pub fn send_action(
        &mut self,
        command: ActionCommand,
    ) -> Result<Vec<SessionAction>, SessionError> {
        self.ensure_connected()?;
        if let Some(minutes) = command.duration() {
            if minutes == 0 || minutes > MAX_HOLD_DURATION_MINUTES {
                return Err(SessionError::InvalidDuration(minutes));
            }
        }
        let id = self
            .state
            .peek_action_id()
            .ok_or(SessionError::NotAuthenticated)?;
        let session_key = self
            .state
            .session_key
            .as_ref()
            .ok_or(SessionError::NotAuthenticated)?;

        let request = command.request(id);
        let bytes = codec::encode_action(&request)?;
        let encrypted = crypto::encrypt(&bytes, Some(session_key), &self.keys)?;
        self.state.record_sent_action_id(id);
        debug!(action = ?request.action.kind, id, "action queued");

        let frame = Frame::Encrypted(encrypted);
        Ok(vec![
            SessionAction::Send(frame.clone()),
            SessionAction::Emit(SessionEvent::OutgoingMessage {
                frame,
                payload: Some(request),
            }),
        ])
    }

    /// Advances the keepalive timer.
    pub fn poll_keepalive(&mut self, now: Instant) -> Vec<SessionAction> {
        match self.keepalive.poll(now) {
            Some(KeepaliveAction::SendPing) => plaintext(Frame::Ping),
            Some(KeepaliveAction::ReplyTimedOut) => {
                let timeout = self.keepalive.reply_timeout();
                warn!(timeout = ?timeout, "keepalive reply timed out");
                vec![
                    SessionAction::Emit(SessionEvent::Error(SessionError::KeepaliveTimeout(
                        timeout,
                    ))),
                    SessionAction::Terminate,
                ]
            }
            None => Vec::new(),
        }
    }

    /// Processes one inbound websocket message. Never fails: every fault becomes
    /// an error event and the session carries on.
    pub fn handle_message(&mut self, text: &str) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if let Err(err) = self.process_message(text, &mut actions) {
            warn!(%err, "inbound message rejected");
            actions.push(SessionAction::Emit(SessionEvent::Error(err)));
        }
        actions
    }

    fn process_message(
        &mut self,
        text: &str,
        actions: &mut Vec<SessionAction>,
    ) -> Result<(), SessionError> {
        let frame = codec::decode_frame(text)?;
        if self.keepalive.on_traffic() {
            debug!("keepalive reply observed");
        }

        match frame {
            Frame::Encrypted(ref encrypted) => {
                let key = self.keys.derive_key(self.state.session_key.as_ref());
                let decoded = crypto::decrypt_and_verify(encrypted, &key, self.keys.auth_key())
                    .map_err(SessionError::from)
                    .and_then(|bytes| codec::decode_payload(&bytes).map_err(SessionError::from));
                match decoded {
                    Ok(payload) => {
                        actions.push(SessionAction::Emit(SessionEvent::IncomingMessage {
                            frame: frame.clone(),
                            payload: Some(payload.clone()),
                        }));
                        self.apply_payload(payload, actions)
                    }
                    Err(err) => {
                        actions.push(SessionAction::Emit(SessionEvent::IncomingMessage {
                            frame,
                            payload: None,
                        }));
                        Err(err)
                    }
                }
            }
            Frame::Error { error_message } => {
                actions.push(SessionAction::Emit(SessionEvent::IncomingMessage {
                    frame,
                    payload: None,
                }));
                Err(SessionError::Peer(error_message))
            }
            client_only if client_only.is_client_only() => {
                let frame_type = client_only.type_tag();
                actions.push(SessionAction::Emit(SessionEvent::IncomingMessage {
                    frame: client_only,
                    payload: None,
                }));
                Err(SessionError::UnexpectedFrame(frame_type))
            }
            _ => {
                debug!(frame_type = frame.type_tag(), "plaintext frame received");
                actions.push(SessionAction::Emit(SessionEvent::IncomingMessage {
                    frame,
                    payload: None,
                }));
                Ok(())
            }
        }
    }

    fn apply_payload(
        &mut self,
        payload: EncryptedPayload,
        actions: &mut Vec<SessionAction>,
    ) -> Result<(), SessionError> {
        match payload {
            EncryptedPayload::Challenge(challenge) => {
                let key = SessionKey::from_base64(&challenge.session_key)
                    .map_err(|e| SessionError::InvalidChallenge(e.to_string()))?;
                if challenge.initial_action_id >= ACTION_ID_MODULUS {
                    return Err(SessionError::InvalidChallenge(format!(
                        "initial action id {} out of range",
                        challenge.initial_action_id
                    )));
                }
                self.state.set_phase(ConnectionPhase::Authenticating)?;
                self.state
                    .accept_challenge(key, challenge.initial_action_id);
                self.state.awaiting_auth_query_response = true;
                debug!(
                    initial_action_id = challenge.initial_action_id,
                    "challenge accepted, confirming session key"
                );
                actions.extend(self.send_action(ActionCommand::Query)?);
                Ok(())
            }
            EncryptedPayload::Response(response) => {
                if self.state.observe_response_id(response.id) {
                    debug!(id = response.id, "action counter advanced");
                } else {
                    debug!(
                        id = response.id,
                        last = ?self.state.last_action_id,
                        "response id not ahead of counter"
                    );
                }
                if self.state.awaiting_auth_query_response && response.kind == ActionType::Query {
                    self.state.awaiting_auth_query_response = false;
                    self.state.set_phase(ConnectionPhase::Authenticated)?;
                    info!("session authenticated");
                    actions.push(SessionAction::Emit(SessionEvent::Authenticated));
                }
                Ok(())
            }
            EncryptedPayload::Event(event) => {
                debug!(kind = ?event.kind, cnt = event.cnt, "device event");
                Ok(())
            }
        }
    }

    fn ensure_connected(&self) -> Result<(), SessionError> {
        if self.state.connected() {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }
}

fn plaintext(frame: Frame) -> Vec<SessionAction> {
    vec![
        SessionAction::Send(frame.clone()),
        SessionAction::Emit(SessionEvent::OutgoingMessage {
            frame,
            payload: None,
        }),
    ]
}
