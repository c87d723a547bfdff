use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::json;
use tokio::time::Instant;

use remootio::codec::CodecError;
use remootio::crypto::{self, CryptoError, KEY_LEN};
use remootio::e2e_common::{test_keys, DeviceSimulator};
use remootio::messages::{
    ActionCommand, ActionRequest, ActionType, EncryptedData, EncryptedFrame, EncryptedPayload,
    EventType, Frame, PeerErrorMessage, ACTION_ID_MODULUS,
};
use remootio::session::state::{ConnectionPhase, LAST_ACTION_ID};
use remootio::session::{Session, SessionAction, SessionError, SessionEvent};

const INTERVAL: Duration = Duration::from_secs(60);
const ZERO_SESSION_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

fn events(actions: &[SessionAction]) -> Vec<SessionEvent> {
    actions
        .iter()
        .filter_map(|action| match action {
            SessionAction::Emit(event) => Some(event.clone()),
            _ => None,
        })
        .collect()
}

fn sent(actions: &[SessionAction]) -> Vec<Frame> {
    actions
        .iter()
        .filter_map(|action| match action {
            SessionAction::Send(frame) => Some(frame.clone()),
            _ => None,
        })
        .collect()
}

fn errors(actions: &[SessionAction]) -> Vec<SessionError> {
    events(actions)
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::Error(err) => Some(err),
            _ => None,
        })
        .collect()
}

fn open_session(now: Instant) -> Session {
    let mut session = Session::new(test_keys(), INTERVAL);
    session.begin_connect().unwrap();
    session.on_open(now);
    session
}

/// Encrypts a payload document the way the device does.
fn device_frame(document: serde_json::Value, key: &[u8; KEY_LEN]) -> String {
    let keys = test_keys();
    let bytes = serde_json::to_vec(&document).unwrap();
    let frame = crypto::encrypt_with_iv(&bytes, key, &[3u8; 16], keys.auth_key()).unwrap();
    serde_json::to_string(&Frame::Encrypted(frame)).unwrap()
}

fn zero_key_challenge(initial_action_id: u32) -> String {
    device_frame(
        json!({"challenge": {"sessionKey": ZERO_SESSION_KEY, "initialActionId": initial_action_id}}),
        &test_keys().derive_key(None),
    )
}

fn query_response(id: u32) -> String {
    device_frame(
        json!({"response": {"type": "QUERY", "id": id, "success": true, "state": "closed",
            "t100ms": 12, "relayTriggered": false, "errorCode": ""}}),
        &[0u8; KEY_LEN],
    )
}

/// Valid MAC over a ciphertext that is not a whole number of AES blocks.
fn truncated_ciphertext_frame() -> String {
    let keys = test_keys();
    let data = EncryptedData {
        iv: STANDARD.encode([3u8; 16]),
        payload: STANDARD.encode([9u8; 15]),
    };
    let mac = STANDARD.encode(crypto::auth_tag(&data, keys.auth_key()).unwrap());
    serde_json::to_string(&Frame::Encrypted(EncryptedFrame { data, mac })).unwrap()
}

fn assert_untouched(session: &Session, last_action_id: Option<u32>, phase: ConnectionPhase) {
    assert_eq!(session.last_action_id(), last_action_id);
    assert_eq!(session.phase(), phase);
    assert!(session.is_connected());
    assert!(!session.is_authenticated());
}

fn decrypt_request(frame: &Frame, key: &[u8; KEY_LEN]) -> ActionRequest {
    let Frame::Encrypted(encrypted) = frame else {
        panic!("expected encrypted frame, got {frame:?}");
    };
    let bytes = crypto::decrypt_and_verify(encrypted, key, test_keys().auth_key()).unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[test]
fn connect_reports_connecting_before_transport_opens() {
    let mut session = Session::new(test_keys(), INTERVAL);
    let actions = session.begin_connect().unwrap();
    assert_eq!(events(&actions), vec![SessionEvent::Connecting]);
    assert!(!session.is_connected());
    assert!(!session.is_authenticated());
    assert_eq!(session.phase(), ConnectionPhase::Connecting);
}

#[test]
fn actions_require_open_transport_and_challenge() {
    let mut session = Session::new(test_keys(), INTERVAL);
    assert_eq!(session.authenticate(), Err(SessionError::NotConnected));
    assert_eq!(
        session.send_action(ActionCommand::Trigger),
        Err(SessionError::NotConnected)
    );

    let mut session = open_session(Instant::now());
    assert!(session.is_connected());
    assert_eq!(
        session.send_action(ActionCommand::Open),
        Err(SessionError::NotAuthenticated)
    );
    let auth = session.authenticate().unwrap();
    assert_eq!(sent(&auth), vec![Frame::Auth]);
}

#[test]
fn challenge_then_query_response_authenticates_once() {
    let mut session = open_session(Instant::now());

    let actions = session.handle_message(&zero_key_challenge(100));
    assert_eq!(session.last_action_id(), Some(100));
    assert!(session.is_connected());
    assert!(!session.is_authenticated());
    assert!(errors(&actions).is_empty());

    let frames = sent(&actions);
    assert_eq!(frames.len(), 1);
    let request = decrypt_request(&frames[0], &[0u8; KEY_LEN]);
    assert_eq!(request.action.kind, ActionType::Query);
    assert_eq!(request.action.id, 101);
    assert!(events(&actions).iter().any(|event| matches!(
        event,
        SessionEvent::OutgoingMessage { payload: Some(req), .. } if req == &request
    )));

    let actions = session.handle_message(&query_response(101));
    let authenticated = events(&actions)
        .into_iter()
        .filter(|event| *event == SessionEvent::Authenticated)
        .count();
    assert_eq!(authenticated, 1);
    assert!(session.is_authenticated());
    assert_eq!(session.last_action_id(), Some(101));

    // later query responses are ordinary traffic
    let actions = session.handle_message(&query_response(102));
    assert!(!events(&actions).contains(&SessionEvent::Authenticated));
    assert_eq!(session.last_action_id(), Some(102));
}

#[test]
fn tampered_mac_surfaces_error_and_leaves_state_alone() {
    let mut session = open_session(Instant::now());
    session.handle_message(&zero_key_challenge(100));

    let mut frame: EncryptedFrame = match serde_json::from_str(&query_response(101)).unwrap() {
        Frame::Encrypted(frame) => frame,
        other => panic!("unexpected frame {other:?}"),
    };
    frame.mac = STANDARD.encode([0u8; 32]);
    let text = serde_json::to_string(&Frame::Encrypted(frame)).unwrap();

    let actions = session.handle_message(&text);
    assert_eq!(
        errors(&actions),
        vec![SessionError::Crypto(CryptoError::MacMismatch)]
    );
    assert!(events(&actions).iter().any(|event| matches!(
        event,
        SessionEvent::IncomingMessage { payload: None, .. }
    )));
    assert!(sent(&actions).is_empty());
    assert_eq!(session.last_action_id(), Some(100));
    assert!(!session.is_authenticated());
    assert!(session.is_connected());
}

#[test]
fn garbage_and_client_frames_are_reported_not_fatal() {
    let mut session = open_session(Instant::now());

    let actions = session.handle_message("{not json");
    assert!(matches!(
        errors(&actions).as_slice(),
        [SessionError::Codec(_)]
    ));

    let actions = session.handle_message(r#"{"type":"PING"}"#);
    assert_eq!(errors(&actions), vec![SessionError::UnexpectedFrame("PING")]);
    assert_eq!(
        events(&actions).first(),
        Some(&SessionEvent::IncomingMessage {
            frame: Frame::Ping,
            payload: None
        })
    );

    let actions = session.handle_message(r#"{"type":"ERROR","errorMessage":"authentication error"}"#);
    assert_eq!(
        errors(&actions),
        vec![SessionError::Peer(PeerErrorMessage::AuthenticationError)]
    );
    assert!(session.is_connected());
}

#[test]
fn events_before_challenge_decrypt_under_secret_key() {
    let mut session = open_session(Instant::now());
    let text = device_frame(
        json!({"event": {"cnt": 4, "type": "LeftOpen", "state": "open", "t100ms": 0}}),
        &test_keys().derive_key(None),
    );
    let actions = session.handle_message(&text);
    assert!(errors(&actions).is_empty());
    assert!(events(&actions).iter().any(|event| matches!(
        event,
        SessionEvent::IncomingMessage { payload: Some(EncryptedPayload::Event(ev)), .. }
            if ev.kind == EventType::LeftOpen
    )));
}

#[test]
fn invalid_hold_duration_is_rejected_before_allocation() {
    let mut session = open_session(Instant::now());
    session.handle_message(&zero_key_challenge(7));
    session.handle_message(&query_response(8));

    for minutes in [0, 1441] {
        assert_eq!(
            session.send_action(ActionCommand::HoldOpenOutputActive { minutes }),
            Err(SessionError::InvalidDuration(minutes))
        );
    }
    let actions = session
        .send_action(ActionCommand::HoldOpenOutputActive { minutes: 1440 })
        .unwrap();
    let request = decrypt_request(&sent(&actions)[0], &[0u8; KEY_LEN]);
    assert_eq!(request.action.id, 9);
    assert_eq!(request.action.duration, Some(1440));
}

#[test]
fn keepalive_pings_then_kills_silent_connection() {
    let start = Instant::now();
    let mut session = open_session(start);
    assert!(session.poll_keepalive(start + INTERVAL / 2).is_empty());

    let actions = session.poll_keepalive(start + INTERVAL);
    assert_eq!(sent(&actions), vec![Frame::Ping]);

    // a reply resets the cycle
    session.handle_message(r#"{"type":"PONG"}"#);
    assert!(session.poll_keepalive(start + INTERVAL + INTERVAL / 2).is_empty());

    let actions = session.poll_keepalive(start + INTERVAL * 2);
    assert_eq!(sent(&actions), vec![Frame::Ping]);

    let actions = session.poll_keepalive(start + INTERVAL * 2 + INTERVAL / 2);
    assert_eq!(
        errors(&actions),
        vec![SessionError::KeepaliveTimeout(INTERVAL / 2)]
    );
    assert_eq!(actions.last(), Some(&SessionAction::Terminate));
    assert!(session.poll_keepalive(start + INTERVAL * 10).is_empty());

    let closed = session.on_closed();
    assert_eq!(events(&closed), vec![SessionEvent::Disconnect]);
    assert!(!session.is_connected());
    assert!(session.on_closed().is_empty());
}

#[test]
fn reconnect_discards_previous_session_key() {
    let mut session = open_session(Instant::now());
    session.handle_message(&zero_key_challenge(100));
    session.handle_message(&query_response(101));
    assert!(session.is_authenticated());

    session.on_closed();
    session.begin_connect().unwrap();
    assert_eq!(session.last_action_id(), None);
    session.on_open(Instant::now());
    assert!(session.is_connected());
    assert!(!session.is_authenticated());
}

#[test]
fn action_ids_stay_unique_across_wraparound() {
    let now = Instant::now();
    let mut device = DeviceSimulator::new(test_keys(), LAST_ACTION_ID - 2);
    let mut session = open_session(now);

    let mut inbound: Vec<Frame> = Vec::new();
    for frame in sent(&session.authenticate().unwrap()) {
        inbound.extend(device.reply(&serde_json::to_string(&frame).unwrap()));
    }
    let mut seen = Vec::new();
    let mut commands = vec![ActionCommand::Query; 2];
    commands.extend([ActionCommand::Trigger, ActionCommand::Close, ActionCommand::Open]);

    while let Some(frame) = inbound.pop() {
        let actions = session.handle_message(&serde_json::to_string(&frame).unwrap());
        assert!(errors(&actions).is_empty(), "{actions:?}");
        for out in sent(&actions) {
            let request = device.open_action(&out).unwrap();
            seen.push(request.action.id);
            inbound.extend(device.reply(&serde_json::to_string(&out).unwrap()));
        }
        if inbound.is_empty() {
            if let Some(command) = commands.pop() {
                for out in sent(&session.send_action(command).unwrap()) {
                    seen.push(device.open_action(&out).unwrap().action.id);
                    inbound.extend(device.reply(&serde_json::to_string(&out).unwrap()));
                }
            }
        }
    }

    assert!(session.is_authenticated());
    assert_eq!(seen, vec![LAST_ACTION_ID - 1, LAST_ACTION_ID, 0, 1, 2, 3]);
    assert!(seen.iter().all(|id| *id < ACTION_ID_MODULUS));
    assert_eq!(session.last_action_id(), Some(3));
    assert_eq!(device.last_action_id(), 3);
}

#[test]
fn back_to_back_sends_get_distinct_ids() {
    let mut session = open_session(Instant::now());
    session.handle_message(&zero_key_challenge(50));
    session.handle_message(&query_response(51));

    let ids: Vec<u32> = [ActionCommand::Trigger, ActionCommand::Trigger, ActionCommand::Restart]
        .into_iter()
        .map(|command| {
            let actions = session.send_action(command).unwrap();
            decrypt_request(&sent(&actions)[0], &[0u8; KEY_LEN]).action.id
        })
        .collect();
    assert_eq!(ids, vec![52, 53, 54]);
    assert_eq!(session.last_action_id(), Some(51));
}

#[test]
fn valid_mac_over_unknown_document_is_a_codec_error() {
    let mut session = open_session(Instant::now());
    session.handle_message(&zero_key_challenge(100));

    let text = device_frame(json!({"status": {"ok": true}}), &[0u8; KEY_LEN]);
    let actions = session.handle_message(&text);
    assert!(matches!(
        errors(&actions).as_slice(),
        [SessionError::Codec(CodecError::InvalidPayload(_))]
    ));
    assert!(events(&actions).iter().any(|event| matches!(
        event,
        SessionEvent::IncomingMessage { payload: None, .. }
    )));
    assert!(sent(&actions).is_empty());
    assert_untouched(&session, Some(100), ConnectionPhase::Authenticating);
}

#[test]
fn undecryptable_frames_are_decrypt_errors() {
    let mut session = open_session(Instant::now());
    session.handle_message(&zero_key_challenge(100));

    // still encrypted under the secret key after the session key took over
    let stale = device_frame(
        json!({"event": {"cnt": 1, "type": "StateChange", "state": "open", "t100ms": 0}}),
        &test_keys().derive_key(None),
    );
    for text in [stale, truncated_ciphertext_frame()] {
        let actions = session.handle_message(&text);
        assert!(
            matches!(
                errors(&actions).as_slice(),
                [SessionError::Crypto(CryptoError::Decrypt(_))]
            ),
            "{actions:?}"
        );
        assert!(sent(&actions).is_empty());
        assert_untouched(&session, Some(100), ConnectionPhase::Authenticating);
    }

    // the session keeps working afterwards
    let actions = session.handle_message(&query_response(101));
    assert!(events(&actions).contains(&SessionEvent::Authenticated));
}

#[test]
fn invalid_challenges_are_rejected_without_side_effects() {
    let mut session = open_session(Instant::now());
    let secret = test_keys().derive_key(None);

    let short_key = device_frame(
        json!({"challenge": {"sessionKey": "AAAA", "initialActionId": 5}}),
        &secret,
    );
    let out_of_range = device_frame(
        json!({"challenge": {"sessionKey": ZERO_SESSION_KEY, "initialActionId": ACTION_ID_MODULUS}}),
        &secret,
    );
    for text in [short_key, out_of_range] {
        let actions = session.handle_message(&text);
        assert!(
            matches!(
                errors(&actions).as_slice(),
                [SessionError::InvalidChallenge(_)]
            ),
            "{actions:?}"
        );
        assert!(sent(&actions).is_empty());
        assert_untouched(&session, None, ConnectionPhase::Connected);
    }

    let actions = session.handle_message(&zero_key_challenge(100));
    assert_eq!(sent(&actions).len(), 1);
    assert_eq!(session.last_action_id(), Some(100));
}

#[test]
fn closing_stops_keepalive() {
    let start = Instant::now();
    let mut session = open_session(start);
    assert!(session.next_keepalive_deadline().is_some());

    session.begin_close();
    assert_eq!(session.next_keepalive_deadline(), None);
    let actions = session.poll_keepalive(start + INTERVAL * 2);
    assert!(sent(&actions).is_empty());
    assert!(errors(&actions).is_empty());
}
