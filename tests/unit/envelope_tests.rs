/// Wire envelope shapes
use game_rpcd::jsonrpc::{Message, MessageKind, RpcError};
use serde_json::{json, Value};

fn reparse(message: &Message) -> Message {
    Message::decode(&message.encode().unwrap()).unwrap()
}

#[test]
fn test_request_and_notification_survive_the_wire() {
    let request = Message::request(7, "Install.Queue", Some(json!({"game": 3})));
    match reparse(&request).kind() {
        MessageKind::Request(r) => {
            assert_eq!(r.id, 7);
            assert_eq!(r.method, "Install.Queue");
            assert_eq!(r.params, Some(json!({"game": 3})));
        }
        other => panic!("expected a request, got {:?}", other),
    }

    let notification = Message::notification("Log", None);
    let frame = String::from_utf8(notification.encode().unwrap()).unwrap();
    assert!(!frame.contains("\"id\""));
    assert!(!frame.contains('\n'));
    assert!(matches!(
        reparse(&notification).kind(),
        MessageKind::Notification(_)
    ));
}

#[test]
fn test_null_result_is_still_a_result() {
    let message = Message::decode(br#"{"jsonrpc":"2.0","id":3,"result":null}"#).unwrap();
    match message.kind() {
        MessageKind::Response { id, outcome } => {
            assert_eq!(id, 3);
            assert_eq!(outcome.unwrap(), Value::Null);
        }
        other => panic!("expected a response, got {:?}", other),
    }
}

#[test]
fn test_error_wins_over_result() {
    let message = Message::decode(
        br#"{"jsonrpc":"2.0","id":3,"result":{},"error":{"code":-32603,"message":"boom"}}"#,
    )
    .unwrap();
    match message.kind() {
        MessageKind::Response { outcome, .. } => {
            assert_eq!(outcome.unwrap_err(), RpcError::internal("boom"));
        }
        other => panic!("expected a response, got {:?}", other),
    }
}

#[test]
fn test_response_without_outcome_is_invalid() {
    let message = Message::decode(br#"{"jsonrpc":"2.0","id":9}"#).unwrap();
    assert!(matches!(
        message.kind(),
        MessageKind::InvalidResponse { id: 9 }
    ));
}

#[test]
fn test_missing_version_is_detected() {
    let message = Message::decode(br#"{"id":1,"method":"Ping"}"#).unwrap();
    assert!(!message.has_valid_version());
}
