use chrono::TimeZone;
use serde_json::json;

use super::*;

fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 9, 12, 30, 45).unwrap()
}

#[test]
fn test_builder_encodes_json() {
    let event = Event::builder("GET /index.html 200")
        .timestamp(fixed_time())
        .source("/var/log/nginx/access.log")
        .offset(1024)
        .field("host", "web-1")
        .build();

    let value: Value = serde_json::from_slice(event.encoded()).unwrap();
    assert_eq!(value["@timestamp"], "2024-03-09T12:30:45.000Z");
    assert_eq!(value["message"], "GET /index.html 200");
    assert_eq!(value["source"], "/var/log/nginx/access.log");
    assert_eq!(value["offset"], 1024);
    assert_eq!(value["host"], "web-1");
}

#[test]
fn test_builder_ignores_reserved_fields() {
    let event = Event::builder("line").field("message", "other").build();
    assert_eq!(event.message(), "line");
    assert!(event.fields().is_empty());
}

#[test]
fn test_decode_recovers_structure() {
    let original = Event::builder("line one")
        .timestamp(fixed_time())
        .source("app.log")
        .offset(9)
        .field("kubernetes", json!({"pod": "api-0"}))
        .build();

    let decoded = Event::decode(original.encoded().clone()).unwrap();
    assert_eq!(decoded, original);
}

#[test]
fn test_decode_foreign_event() {
    let bytes = Bytes::from_static(br#"{"message": 42, "level": "warn"}"#);
    let event = Event::decode(bytes).unwrap();
    assert_eq!(event.message(), "42");
    assert_eq!(event.source(), "");
    assert_eq!(event.offset(), None);
    assert_eq!(event.fields()["level"], "warn");
}

#[test]
fn test_decode_rejects_non_object() {
    assert!(Event::decode(Bytes::from_static(b"[1,2]")).is_err());
    assert!(Event::decode(Bytes::from_static(b"not json")).is_err());
}

#[test]
fn test_lookup_paths() {
    let event = Event::builder("msg")
        .source("a.log")
        .offset(5)
        .field("service", "billing")
        .field("http", json!({"status": 503, "route": {"name": "pay"}}))
        .build();

    assert_eq!(event.lookup("message").as_deref(), Some("msg"));
    assert_eq!(event.lookup("source").as_deref(), Some("a.log"));
    assert_eq!(event.lookup("offset").as_deref(), Some("5"));
    assert_eq!(event.lookup("service").as_deref(), Some("billing"));
    assert_eq!(event.lookup("http.status").as_deref(), Some("503"));
    assert_eq!(event.lookup("http.route.name").as_deref(), Some("pay"));
    assert_eq!(event.lookup("http.route"), None);
    assert_eq!(event.lookup("missing.path"), None);
}
