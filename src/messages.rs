//! Wire vocabulary for the Remootio websocket API.
//!
//! Plaintext control frames are tagged by a `type` field. Everything carried after
//! the handshake travels inside `ENCRYPTED` frames whose decrypted content is one of
//! the [`EncryptedPayload`] shapes, or an [`ActionRequest`] in the outbound direction.
use serde::{Deserialize, Serialize};

/// Action ids cycle in `[0, ACTION_ID_MODULUS)`.
pub const ACTION_ID_MODULUS: u32 = 0x7FFF_FFFF;

/// Upper bound (minutes) accepted by the hold-output-active actions.
pub const MAX_HOLD_DURATION_MINUTES: u32 = 1440;

/// A single websocket message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frame {
    Auth,
    Hello,
    Ping,
    Pong,
    Error {
        #[serde(rename = "errorMessage")]
        error_message: PeerErrorMessage,
    },
    ServerHello(ServerHello),
    Encrypted(EncryptedFrame),
}

impl Frame {
    /// Every `type` tag the codec recognizes.
    pub const KNOWN_TYPES: [&'static str; 7] = [
        "AUTH",
        "HELLO",
        "PING",
        "PONG",
        "ERROR",
        "SERVER_HELLO",
        "ENCRYPTED",
    ];

    pub fn type_tag(&self) -> &'static str {
        match self {
            Frame::Auth => "AUTH",
            Frame::Hello => "HELLO",
            Frame::Ping => "PING",
            Frame::Pong => "PONG",
            Frame::Error { .. } => "ERROR",
            Frame::ServerHello(_) => "SERVER_HELLO",
            Frame::Encrypted(_) => "ENCRYPTED",
        }
    }

    /// Frames only a client ever sends; receiving one is a protocol violation.
    pub fn is_client_only(&self) -> bool {
        matches!(self, Frame::Auth | Frame::Hello | Frame::Ping)
    }
}

/// Error strings the device reports in plaintext `ERROR` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerErrorMessage {
    #[serde(rename = "json error")]
    JsonError,
    #[serde(rename = "input error")]
    InputError,
    #[serde(rename = "internal error")]
    InternalError,
    #[serde(rename = "connection timeout")]
    ConnectionTimeout,
    #[serde(rename = "authentication error")]
    AuthenticationError,
    #[serde(rename = "unsupported frame")]
    UnsupportedFrame,
    #[serde(other)]
    Unknown,
}

impl PeerErrorMessage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerErrorMessage::JsonError => "json error",
            PeerErrorMessage::InputError => "input error",
            PeerErrorMessage::InternalError => "internal error",
            PeerErrorMessage::ConnectionTimeout => "connection timeout",
            PeerErrorMessage::AuthenticationError => "authentication error",
            PeerErrorMessage::UnsupportedFrame => "unsupported frame",
            PeerErrorMessage::Unknown => "unknown error",
        }
    }
}

/// Reply to a `HELLO` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHello {
    pub api_version: u32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remootio_version: Option<String>,
}

/// Body of an `ENCRYPTED` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedFrame {
    pub data: EncryptedData,
    /// Base64 HMAC-SHA256 over the serialized `data` object.
    pub mac: String,
}

/// The authenticated part of an encrypted frame.
///
/// Field order is part of the MAC input: `iv` must serialize before `payload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    pub iv: String,
    pub payload: String,
}

/// Decrypted content of an inbound `ENCRYPTED` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptedPayload {
    Challenge(Challenge),
    Response(ActionResponse),
    Event(DeviceEvent),
}

/// Issued by the device in answer to `AUTH`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    /// Base64 encoded 256-bit session key.
    pub session_key: String,
    pub initial_action_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    #[serde(rename = "type")]
    pub kind: ActionType,
    pub id: u32,
    pub success: bool,
    #[serde(default)]
    pub state: SensorState,
    #[serde(default)]
    pub t100ms: u64,
    #[serde(default)]
    pub relay_triggered: bool,
    #[serde(default)]
    pub error_code: String,
}

/// Asynchronous notification pushed by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub cnt: u64,
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(default)]
    pub state: SensorState,
    #[serde(default)]
    pub t100ms: u64,
    /// Type-dependent block, e.g. `keyNr`/`keyType`/`via` for `RelayTrigger`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SensorState {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "closed")]
    Closed,
    #[default]
    #[serde(rename = "no sensor")]
    NoSensor,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    StateChange,
    RelayTrigger,
    Connected,
    PlusConnected,
    LeftOpen,
    KeyManagement,
    Restart,
    ManualButtonPushed,
    ManualButtonEnabled,
    ManualButtonDisabled,
    DoorbellPushed,
    DoorbellEnabled,
    DoorbellDisabled,
    SensorEnabled,
    SensorFlipped,
    SensorDisabled,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Query,
    Trigger,
    TriggerSecondary,
    Open,
    Close,
    Restart,
    HoldTriggerOutputActive,
    HoldTriggerSecondaryOutputActive,
    HoldOpenOutputActive,
    HoldCloseOutputActive,
    #[serde(other)]
    Unknown,
}

/// Outbound plaintext, serialized as `{"action":{...}}` before encryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionType,
    pub id: u32,
    /// Minutes, only present on the hold-output-active actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
}

/// Commands accepted by the action API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionCommand {
    Query,
    Trigger,
    TriggerSecondary,
    Open,
    Close,
    Restart,
    HoldTriggerOutputActive { minutes: u32 },
    HoldTriggerSecondaryOutputActive { minutes: u32 },
    HoldOpenOutputActive { minutes: u32 },
    HoldCloseOutputActive { minutes: u32 },
}

impl ActionCommand {
    pub fn action_type(&self) -> ActionType {
        match self {
            ActionCommand::Query => ActionType::Query,
            ActionCommand::Trigger => ActionType::Trigger,
            ActionCommand::TriggerSecondary => ActionType::TriggerSecondary,
            ActionCommand::Open => ActionType::Open,
            ActionCommand::Close => ActionType::Close,
            ActionCommand::Restart => ActionType::Restart,
            ActionCommand::HoldTriggerOutputActive { .. } => ActionType::HoldTriggerOutputActive,
            ActionCommand::HoldTriggerSecondaryOutputActive { .. } => {
                ActionType::HoldTriggerSecondaryOutputActive
            }
            ActionCommand::HoldOpenOutputActive { .. } => ActionType::HoldOpenOutputActive,
            ActionCommand::HoldCloseOutputActive { .. } => ActionType::HoldCloseOutputActive,
        }
    }

    pub fn duration(&self) -> Option<u32> {
        match self {
            ActionCommand::HoldTriggerOutputActive { minutes }
            | ActionCommand::HoldTriggerSecondaryOutputActive { minutes }
            | ActionCommand::HoldOpenOutputActive { minutes }
            | ActionCommand::HoldCloseOutputActive { minutes } => Some(*minutes),
            _ => None,
        }
    }

    /// Builds the request for the given action id.
    pub fn request(&self, id: u32) -> ActionRequest {
        ActionRequest {
            action: Action {
                kind: self.action_type(),
                id,
                duration: self.duration(),
            },
        }
    }
}
