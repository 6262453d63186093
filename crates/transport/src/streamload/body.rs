//! Stream-load request and response bodies
//!
//! Events become newline-delimited JSON rows. The built-in fields and the
//! configured columns are top-level keys; every other field is nested
//! under the rest column. `@metadata` fields are never loaded.

use std::io::Write;

use bytes::Bytes;
use courier_protocol::{Event, MESSAGE_KEY, OFFSET_KEY, SOURCE_KEY};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::error::StreamLoadError;

/// Column holding the event timestamp
pub const TIMESTAMP_COLUMN: &str = "timestamp";

const METADATA_PREFIX: &str = "@metadata";

/// Timestamp layout accepted by `DATETIME(3)`
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Build one row
pub fn encode_row(event: &Event, columns: &[String], rest_column: &str) -> Map<String, Value> {
    let mut row = Map::new();
    row.insert(
        TIMESTAMP_COLUMN.to_string(),
        Value::String(event.timestamp().format(TIMESTAMP_FORMAT).to_string()),
    );
    row.insert(MESSAGE_KEY.to_string(), Value::String(event.message().to_string()));
    row.insert(SOURCE_KEY.to_string(), Value::String(event.source().to_string()));
    row.insert(
        OFFSET_KEY.to_string(),
        event.offset().map_or(Value::Null, Value::from),
    );

    let mut rest = Map::new();
    for (key, value) in event.fields() {
        if key.starts_with(METADATA_PREFIX) {
            continue;
        }
        if columns.iter().any(|c| c == key) {
            row.insert(key.clone(), value.clone());
        } else {
            rest.insert(key.clone(), value.clone());
        }
    }
    row.insert(rest_column.to_string(), Value::Object(rest));
    row
}

/// gzip-compressed NDJSON body for a group of events
pub fn encode_body<'a, I>(events: I, columns: &[String], rest_column: &str) -> Result<Bytes, StreamLoadError>
where
    I: IntoIterator<Item = &'a Event>,
{
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for event in events {
        let row = encode_row(event, columns, rest_column);
        serde_json::to_writer(&mut encoder, &row)?;
        encoder.write_all(b"\n")?;
    }
    Ok(Bytes::from(encoder.finish()?))
}

/// Stream-load response
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct LoadResponse {
    pub status: String,
    pub message: String,
    pub txn_id: i64,
    pub label: String,
    pub number_loaded_rows: u64,
    pub number_filtered_rows: u64,
    pub load_time_ms: u64,
    #[serde(rename = "ErrorURL")]
    pub error_url: String,
    pub first_error_message: String,
    /// Status of the earlier load when the label was already used
    pub existing_job_status: String,
}

impl LoadResponse {
    /// A load that committed, or whose publish is still in progress
    ///
    /// A retried request whose first attempt already finished reports the
    /// label as taken; that load is in the table too.
    pub fn is_success(&self) -> bool {
        match self.status.as_str() {
            "Success" | "Publish Timeout" => true,
            "Label Already Exists" => self.existing_job_status == "FINISHED",
            _ => false,
        }
    }
}
