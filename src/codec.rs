//! Stateless translation between websocket text and typed frames.
//!
//! The codec never touches key material or session state. It also owns the byte
//! encodings the crypto layer consumes: the canonical `data` serialization that is
//! MAC'd, and the plaintext bytes of outbound actions.
use serde_json::Value;
use thiserror::Error;

use crate::messages::{ActionRequest, EncryptedData, EncryptedPayload, Frame};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("frame has no type discriminator")]
    MissingType,
    #[error("unknown frame type {0:?}")]
    UnknownType(String),
    #[error("malformed {frame_type} frame: {reason}")]
    InvalidShape { frame_type: String, reason: String },
    #[error("decrypted payload is not a known document: {0}")]
    InvalidPayload(String),
    #[error("encode: {0}")]
    Encode(String),
}

/// Parses one websocket text message into a frame.
pub fn decode_frame(text: &str) -> Result<Frame, CodecError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| CodecError::InvalidJson(e.to_string()))?;
    let frame_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingType)?
        .to_string();
    if !Frame::KNOWN_TYPES.contains(&frame_type.as_str()) {
        return Err(CodecError::UnknownType(frame_type));
    }
    serde_json::from_value(value).map_err(|e| CodecError::InvalidShape {
        frame_type,
        reason: e.to_string(),
    })
}

pub fn encode_frame(frame: &Frame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Parses decrypted bytes. Called only after the MAC has been verified.
pub fn decode_payload(bytes: &[u8]) -> Result<EncryptedPayload, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::InvalidPayload(e.to_string()))
}

pub fn encode_action(request: &ActionRequest) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(request).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Exact bytes covered by the frame MAC: `{"iv":"...","payload":"..."}`.
pub fn authenticated_bytes(data: &EncryptedData) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(data).map_err(|e| CodecError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{
        ActionCommand, ActionType, EncryptedFrame, EventType, PeerErrorMessage, SensorState,
    };

    #[test]
    fn plaintext_frames_encode_bit_exact() {
        assert_eq!(encode_frame(&Frame::Auth).unwrap(), r#"{"type":"AUTH"}"#);
        assert_eq!(encode_frame(&Frame::Hello).unwrap(), r#"{"type":"HELLO"}"#);
        assert_eq!(encode_frame(&Frame::Ping).unwrap(), r#"{"type":"PING"}"#);
    }

    #[test]
    fn encrypted_frame_keeps_iv_before_payload() {
        let frame = Frame::Encrypted(EncryptedFrame {
            data: EncryptedData {
                iv: "aXY=".into(),
                payload: "cGF5".into(),
            },
            mac: "bWFj".into(),
        });
        assert_eq!(
            encode_frame(&frame).unwrap(),
            r#"{"type":"ENCRYPTED","data":{"iv":"aXY=","payload":"cGF5"},"mac":"bWFj"}"#
        );
        let data = EncryptedData {
            iv: "a".into(),
            payload: "b".into(),
        };
        assert_eq!(
            authenticated_bytes(&data).unwrap(),
            br#"{"iv":"a","payload":"b"}"#.to_vec()
        );
    }

    #[test]
    fn decodes_inbound_plaintext_frames() {
        assert_eq!(decode_frame(r#"{"type":"PONG"}"#).unwrap(), Frame::Pong);
        assert_eq!(
            decode_frame(r#"{"type":"ERROR","errorMessage":"authentication error"}"#).unwrap(),
            Frame::Error {
                error_message: PeerErrorMessage::AuthenticationError
            }
        );
        assert_eq!(
            decode_frame(r#"{"type":"ERROR","errorMessage":"something new"}"#).unwrap(),
            Frame::Error {
                error_message: PeerErrorMessage::Unknown
            }
        );
        match decode_frame(
            r#"{"type":"SERVER_HELLO","apiVersion":3,"message":"hi","serialNumber":"abc"}"#,
        )
        .unwrap()
        {
            Frame::ServerHello(hello) => {
                assert_eq!(hello.api_version, 3);
                assert_eq!(hello.serial_number.as_deref(), Some("abc"));
                assert_eq!(hello.remootio_version, None);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn rejects_garbage_and_unknown_types() {
        assert!(matches!(
            decode_frame("not json"),
            Err(CodecError::InvalidJson(_))
        ));
        assert_eq!(decode_frame(r#"{"foo":1}"#), Err(CodecError::MissingType));
        assert_eq!(
            decode_frame(r#"{"type":"BOGUS"}"#),
            Err(CodecError::UnknownType("BOGUS".into()))
        );
        assert!(matches!(
            decode_frame(r#"{"type":"ENCRYPTED","data":{"iv":"x"}}"#),
            Err(CodecError::InvalidShape { .. })
        ));
    }

    #[test]
    fn decodes_payload_shapes() {
        let challenge =
            decode_payload(br#"{"challenge":{"sessionKey":"AAAA","initialActionId":7}}"#).unwrap();
        assert!(matches!(
            challenge,
            EncryptedPayload::Challenge(ref c) if c.initial_action_id == 7
        ));

        let response = decode_payload(
            br#"{"response":{"type":"QUERY","id":12,"success":true,"state":"closed","t100ms":53,"relayTriggered":false,"errorCode":""}}"#,
        )
        .unwrap();
        match response {
            EncryptedPayload::Response(r) => {
                assert_eq!(r.kind, ActionType::Query);
                assert_eq!(r.id, 12);
                assert_eq!(r.state, SensorState::Closed);
            }
            other => panic!("unexpected payload {other:?}"),
        }

        let event = decode_payload(
            br#"{"event":{"cnt":3,"type":"RelayTrigger","state":"no sensor","t100ms":9,"data":{"keyNr":0,"keyType":"master key","via":"wifi"}}}"#,
        )
        .unwrap();
        match event {
            EncryptedPayload::Event(e) => {
                assert_eq!(e.kind, EventType::RelayTrigger);
                assert_eq!(e.state, SensorState::NoSensor);
                assert_eq!(e.data.unwrap()["via"], "wifi");
            }
            other => panic!("unexpected payload {other:?}"),
        }

        assert!(matches!(
            decode_payload(b"{\"challenge\":"),
            Err(CodecError::InvalidPayload(_))
        ));
    }

    #[test]
    fn action_plaintext_shape() {
        let bytes = encode_action(&ActionCommand::Query.request(101)).unwrap();
        assert_eq!(bytes, br#"{"action":{"type":"QUERY","id":101}}"#.to_vec());
        let bytes =
            encode_action(&ActionCommand::HoldOpenOutputActive { minutes: 5 }.request(2)).unwrap();
        assert_eq!(
            bytes,
            br#"{"action":{"type":"HOLD_OPEN_OUTPUT_ACTIVE","id":2,"duration":5}}"#.to_vec()
        );
    }
}
