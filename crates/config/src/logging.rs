//! `[log]` section: where the courier binary writes its own diagnostics
//!
//! The filter handed to the subscriber is built here so the CLI flag, the
//! configured level and per-crate overrides combine in one place.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::ConfigError;

/// Crates whose `info` output drowns the publisher's own
///
/// They are held at `warn` unless `[log.crates]` names them.
const CHATTY_CRATES: &[&str] = &["sqlx", "rustls", "hickory_proto", "hickory_resolver", "reqwest", "hyper"];

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    const ALL: [LogLevel; 5] = [Self::Trace, Self::Debug, Self::Info, Self::Warn, Self::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive, so `--log-level DEBUG` works
impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::invalid_value("log", "level", format!("unknown level '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Console,
    /// One JSON object per line
    Json,
}

/// Where diagnostics go
///
/// `receive` prints events on stdout, so the default keeps logs apart on
/// stderr. Any other string is a file path, opened for append.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stderr,
    Stdout,
    #[serde(untagged)]
    File(PathBuf),
}

impl LogOutput {
    /// Colour codes only make sense on a terminal stream
    pub fn wants_ansi(&self) -> bool {
        !matches!(self, Self::File(_))
    }
}

/// ```toml
/// [log]
/// level = "info"
/// format = "json"
/// output = "/var/log/courier/courier.log"
///
/// [log.crates]
/// courier_transport = "debug"
/// sqlx = "info"
/// ```
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Per-crate levels, by crate name as it appears in log targets
    pub crates: BTreeMap<String, LogLevel>,
}

impl LogConfig {
    /// Filter directive for `tracing_subscriber::EnvFilter`
    ///
    /// `level` overrides the configured base level; per-crate entries still
    /// apply on top of it.
    pub fn directive(&self, level: Option<LogLevel>) -> String {
        let base = level.unwrap_or(self.level);
        let mut parts = vec![base.to_string()];
        for name in CHATTY_CRATES {
            if !self.crates.contains_key(*name) {
                parts.push(format!("{name}={}", base.max(LogLevel::Warn)));
            }
        }
        parts.extend(self.crates.iter().map(|(name, level)| format!("{name}={level}")));
        parts.join(",")
    }
}
