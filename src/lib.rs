//! Client for the Remootio websocket API.
//!
//! Implements the authenticated session protocol spoken by Remootio gate and garage
//! door controllers: plaintext control frames, the `AUTH` challenge handshake,
//! AES-256-CBC + HMAC-SHA256 encrypted frames, keepalive supervision and
//! action id sequencing. The protocol core ([`session::Session`]) is sans-IO; the
//! [`sdk::RemootioClient`] drives it over a websocket.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod e2e_common;
pub mod messages;
pub mod sdk;
pub mod session;
pub mod transport;

pub use codec::CodecError;
pub use config::{ClientConfig, CompiledClientConfig, ConfigError};
pub use crypto::{CryptoError, KeyMaterial, SessionKey};
pub use messages::{
    ActionCommand, ActionRequest, ActionResponse, ActionType, Challenge, DeviceEvent,
    EncryptedPayload, EventType, Frame, SensorState, ServerHello,
};
pub use sdk::{ClientError, RemootioClient};
pub use session::{Session, SessionAction, SessionError, SessionEvent};
pub use transport::{Connector, SessionTransport, TransportError, WebSocketConnector};
