//! Log events
//!
//! An [`Event`] is produced upstream (one per log line) and carries its
//! serialized JSON form so transports can ship it without re-encoding.
//! Structured accessors exist for transports that remap events, such as
//! stream-load which splits fields into table columns.

use std::borrow::Cow;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Key holding the event timestamp in the encoded form
pub const TIMESTAMP_KEY: &str = "@timestamp";
/// Key holding the log line
pub const MESSAGE_KEY: &str = "message";
/// Key holding the source identifier (usually a file path)
pub const SOURCE_KEY: &str = "source";
/// Key holding the byte offset just past this line in its source
pub const OFFSET_KEY: &str = "offset";

/// A single log event
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    timestamp: DateTime<Utc>,
    message: String,
    source: String,
    offset: Option<u64>,
    fields: Map<String, Value>,
    encoded: Bytes,
}

impl Event {
    /// Start building an event for a log line
    pub fn builder(message: impl Into<String>) -> EventBuilder {
        EventBuilder {
            timestamp: Utc::now(),
            message: message.into(),
            source: String::new(),
            offset: None,
            fields: Map::new(),
        }
    }

    /// Parse an event from its encoded JSON form
    ///
    /// Unknown keys become fields. A missing or unparseable timestamp is
    /// replaced by the current time; the original bytes are kept as the
    /// encoding either way.
    pub fn decode(encoded: Bytes) -> Result<Self, ProtocolError> {
        let mut fields: Map<String, Value> = serde_json::from_slice(&encoded)?;

        let timestamp = fields
            .remove(TIMESTAMP_KEY)
            .and_then(|v| v.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok()))
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let message = match fields.remove(MESSAGE_KEY) {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let source = match fields.remove(SOURCE_KEY) {
            Some(Value::String(s)) => s,
            _ => String::new(),
        };
        let offset = fields.remove(OFFSET_KEY).and_then(|v| v.as_u64());

        Ok(Self {
            timestamp,
            message,
            source,
            offset,
            fields,
            encoded,
        })
    }

    #[inline]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[inline]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[inline]
    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// Additional fields, excluding timestamp, message, source and offset
    #[inline]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Serialized JSON form handed to transports
    #[inline]
    pub fn encoded(&self) -> &Bytes {
        &self.encoded
    }

    /// Look up a value by dotted path
    ///
    /// `message`, `source` and `offset` resolve to the built-in values;
    /// anything else walks nested objects in the fields.
    pub fn lookup(&self, path: &str) -> Option<Cow<'_, str>> {
        match path {
            MESSAGE_KEY => return Some(Cow::Borrowed(&self.message)),
            SOURCE_KEY => return Some(Cow::Borrowed(&self.source)),
            OFFSET_KEY => return self.offset.map(|o| Cow::Owned(o.to_string())),
            _ => {}
        }

        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        match current {
            Value::String(s) => Some(Cow::Borrowed(s)),
            Value::Null | Value::Object(_) | Value::Array(_) => None,
            other => Some(Cow::Owned(other.to_string())),
        }
    }
}

/// Builder for [`Event`]
#[derive(Debug, Clone)]
pub struct EventBuilder {
    timestamp: DateTime<Utc>,
    message: String,
    source: String,
    offset: Option<u64>,
    fields: Map<String, Value>,
}

impl EventBuilder {
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Add a field; built-in keys are ignored
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if !matches!(
            key.as_str(),
            TIMESTAMP_KEY | MESSAGE_KEY | SOURCE_KEY | OFFSET_KEY
        ) {
            self.fields.insert(key, value.into());
        }
        self
    }

    /// Encode and produce the event
    pub fn build(self) -> Event {
        let mut object = Map::with_capacity(self.fields.len() + 4);
        object.insert(
            TIMESTAMP_KEY.to_string(),
            Value::String(self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        object.insert(MESSAGE_KEY.to_string(), Value::String(self.message.clone()));
        if !self.source.is_empty() {
            object.insert(SOURCE_KEY.to_string(), Value::String(self.source.clone()));
        }
        if let Some(offset) = self.offset {
            object.insert(OFFSET_KEY.to_string(), Value::from(offset));
        }
        for (key, value) in &self.fields {
            object.insert(key.clone(), value.clone());
        }

        // A map of strings and JSON values always serializes
        let encoded = serde_json::to_vec(&Value::Object(object)).unwrap_or_default();

        Event {
            timestamp: self.timestamp,
            message: self.message,
            source: self.source,
            offset: self.offset,
            fields: self.fields,
            encoded: Bytes::from(encoded),
        }
    }
}

#[cfg(test)]
#[path = "event_test.rs"]
mod event_test;
