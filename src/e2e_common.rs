//! In-memory transport and a simulated device for end-to-end tests and demos.
//!
//! [`PipeConnector`] hands every accepted connection to the test as a
//! [`DevicePeer`]; [`DeviceSimulator`] answers on that peer the way a Remootio
//! controller does: challenge on `AUTH`, encrypted responses to actions, `PONG`
//! on `PING`, `SERVER_HELLO` on `HELLO`.
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use tokio::sync::mpsc;

use crate::codec;
use crate::config::ClientConfig;
use crate::crypto::{self, KeyMaterial, IV_LEN, KEY_LEN};
use crate::messages::{
    ActionRequest, ActionResponse, ActionType, Challenge, DeviceEvent, EncryptedPayload,
    EventType, Frame, SensorState, ServerHello, ACTION_ID_MODULUS,
};
use crate::transport::{Connector, SessionTransport, TransportError};

pub const TEST_SECRET_KEY: &str =
    "c6a8f3b5d2e1f0a9b8c7d6e5f4a3b2c1d0e9f8a7b6c5d4e3f2a1b0c9d8e7f6a5";
pub const TEST_AUTH_KEY: &str =
    "1f2e3d4c5b6a79881f2e3d4c5b6a79881f2e3d4c5b6a79881f2e3d4c5b6a7988";

pub fn test_keys() -> KeyMaterial {
    KeyMaterial::from_hex(TEST_SECRET_KEY, TEST_AUTH_KEY)
        .unwrap_or_else(|e| unreachable!("test keys are valid hex: {e}"))
}

pub fn test_config() -> ClientConfig {
    ClientConfig::new("127.0.0.1", TEST_SECRET_KEY, TEST_AUTH_KEY)
}

/// Client half of an in-memory connection.
pub struct PipeTransport {
    to_device: Option<mpsc::UnboundedSender<String>>,
    from_device: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl SessionTransport for PipeTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.to_device
            .as_ref()
            .ok_or_else(|| TransportError::Send("pipe closing".into()))?
            .send(text)
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.from_device.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // the device sees its inbound end and hangs up in turn
        self.to_device.take();
        Ok(())
    }

    fn terminate(self: Box<Self>) {}
}

/// Device half of an in-memory connection.
pub struct DevicePeer {
    pub from_client: mpsc::UnboundedReceiver<String>,
    pub to_client: mpsc::UnboundedSender<String>,
}

impl DevicePeer {
    pub fn send_frame(&self, frame: &Frame) -> bool {
        codec::encode_frame(frame)
            .ok()
            .map(|text| self.to_client.send(text).is_ok())
            .unwrap_or(false)
    }
}

/// Connector whose connections surface as [`DevicePeer`]s on a channel.
pub struct PipeConnector {
    peers: mpsc::UnboundedSender<DevicePeer>,
    refuse_remaining: AtomicUsize,
}

impl PipeConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DevicePeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                refuse_remaining: AtomicUsize::new(0),
            },
            rx,
        )
    }

    /// Makes the next `count` attempts fail like a refused TCP connect.
    pub fn refuse_next(&self, count: usize) {
        self.refuse_remaining.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for PipeConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn SessionTransport>, TransportError> {
        let refused = self
            .refuse_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect(format!("{url}: connection refused")));
        }
        let (to_device, from_client) = mpsc::unbounded_channel();
        let (to_client, from_device) = mpsc::unbounded_channel();
        self.peers
            .send(DevicePeer {
                from_client,
                to_client,
            })
            .map_err(|_| TransportError::Connect(format!("{url}: nobody listening")))?;
        Ok(Box::new(PipeTransport {
            to_device: Some(to_device),
            from_device,
        }))
    }
}

/// Device side of the protocol, sharing the client's pre-shared keys.
pub struct DeviceSimulator {
    keys: KeyMaterial,
    session_key: [u8; KEY_LEN],
    counter: u32,
    event_cnt: u64,
    pub answer_pings: bool,
    pub state: SensorState,
}

impl DeviceSimulator {
    pub fn new(keys: KeyMaterial, initial_action_id: u32) -> Self {
        let mut session_key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut session_key);
        Self {
            keys,
            session_key,
            counter: initial_action_id % ACTION_ID_MODULUS,
            event_cnt: 0,
            answer_pings: true,
            state: SensorState::Closed,
        }
    }

    pub fn session_key_base64(&self) -> String {
        STANDARD.encode(self.session_key)
    }

    pub fn last_action_id(&self) -> u32 {
        self.counter
    }

    fn seal(&self, payload: &EncryptedPayload, key: &[u8; KEY_LEN]) -> Option<Frame> {
        let bytes = serde_json::to_vec(payload).ok()?;
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        crypto::encrypt_with_iv(&bytes, key, &iv, self.keys.auth_key())
            .ok()
            .map(Frame::Encrypted)
    }

    /// Challenge encrypted under the API secret key.
    pub fn challenge_frame(&self) -> Option<Frame> {
        let payload = EncryptedPayload::Challenge(Challenge {
            session_key: self.session_key_base64(),
            initial_action_id: self.counter,
        });
        self.seal(&payload, &self.keys.derive_key(None))
    }

    pub fn response_frame(&self, kind: ActionType, id: u32) -> Option<Frame> {
        let payload = EncryptedPayload::Response(ActionResponse {
            kind,
            id,
            success: true,
            state: self.state,
            t100ms: 0,
            relay_triggered: !matches!(kind, ActionType::Query),
            error_code: String::new(),
        });
        self.seal(&payload, &self.session_key)
    }

    pub fn event_frame(&mut self, kind: EventType) -> Option<Frame> {
        self.event_cnt += 1;
        let payload = EncryptedPayload::Event(DeviceEvent {
            cnt: self.event_cnt,
            kind,
            state: self.state,
            t100ms: 0,
            data: None,
        });
        self.seal(&payload, &self.session_key)
    }

    /// Decrypts an action sent by the client under the current session key.
    pub fn open_action(&self, frame: &Frame) -> Option<ActionRequest> {
        let Frame::Encrypted(encrypted) = frame else {
            return None;
        };
        let bytes =
            crypto::decrypt_and_verify(encrypted, &self.session_key, self.keys.auth_key()).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Frames the device answers one client message with.
    pub fn reply(&mut self, text: &str) -> Vec<Frame> {
        let Ok(frame) = codec::decode_frame(text) else {
            return Vec::new();
        };
        match frame {
            Frame::Auth => self.challenge_frame().into_iter().collect(),
            Frame::Ping if self.answer_pings => vec![Frame::Pong],
            Frame::Hello => vec![Frame::ServerHello(ServerHello {
                api_version: 3,
                message: "Hello from the simulator".into(),
                serial_number: None,
                remootio_version: None,
            })],
            Frame::Encrypted(_) => {
                let Some(request) = self.open_action(&frame) else {
                    return Vec::new();
                };
                let action = request.action;
                match action.kind {
                    ActionType::Open => self.state = SensorState::Open,
                    ActionType::Close => self.state = SensorState::Closed,
                    _ => {}
                }
                if crate::session::state::is_ahead(action.id, self.counter) {
                    self.counter = action.id;
                }
                self.response_frame(action.kind, action.id)
                    .into_iter()
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    /// Answers on `peer` until the client hangs up.
    pub async fn serve(mut self, mut peer: DevicePeer) -> Self {
        while let Some(text) = peer.from_client.recv().await {
            for frame in self.reply(&text) {
                if !peer.send_frame(&frame) {
                    return self;
                }
            }
        }
        self
    }
}
