//! Tests for protocol error types

use crate::error::ProtocolError;

#[test]
fn test_error_creation_too_short() {
    let err = ProtocolError::too_short(4, 2);
    assert!(matches!(
        err,
        ProtocolError::MessageTooShort {
            expected: 4,
            actual: 2
        }
    ));
}

#[test]
fn test_error_display_invalid_length() {
    let err = ProtocolError::invalid_length("ACKN", 20, 19);
    assert_eq!(
        err.to_string(),
        "invalid ACKN length: expected 20 bytes, got 19"
    );
}

#[test]
fn test_error_display_unknown_tag() {
    let err = ProtocolError::UnknownTag(*b"ABCD");
    assert!(err.to_string().contains("65, 66, 67, 68"));
}

#[test]
fn test_error_from_json() {
    let json_err = serde_json::from_slice::<serde_json::Value>(b"{").unwrap_err();
    let err: ProtocolError = json_err.into();
    assert!(matches!(err, ProtocolError::InvalidEvent(_)));
    assert!(err.to_string().starts_with("invalid event"));
}

#[test]
fn test_error_is_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<ProtocolError>();
}
