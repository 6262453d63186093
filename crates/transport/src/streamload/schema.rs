//! Table management over the MySQL protocol
//!
//! Before the first load into a table its schema is checked on a
//! metadata server: missing tables are created with the canonical
//! layout, missing columns are added, and a column whose type differs
//! from the expected one is a fatal error. Work on every table in the
//! process goes through one lock so concurrent endpoints do not race
//! each other's DDL.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use courier_config::StreamLoadConfig;
use parking_lot::Mutex;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{Connection, Row};
use tokio_util::sync::CancellationToken;

use super::body::TIMESTAMP_COLUMN;
use super::error::SchemaError;
use crate::backoff::Backoff;

/// Port of the MySQL-protocol frontend when a server omits it
pub const DEFAULT_METADATA_PORT: u16 = 9030;

static SCHEMA_LOCK: LazyLock<tokio::sync::Mutex<()>> = LazyLock::new(|| tokio::sync::Mutex::new(()));

/// Schema queries against one metadata server
#[async_trait]
pub trait SchemaBackend: Send + Sync {
    /// `(name, type)` of every column, or `None` if the table does not exist
    async fn columns(
        &self,
        server: &str,
        database: &str,
        table: &str,
    ) -> Result<Option<Vec<(String, String)>>, SchemaError>;

    /// Run one DDL statement
    async fn execute(&self, server: &str, statement: &str) -> Result<(), SchemaError>;
}

/// [`SchemaBackend`] speaking the MySQL protocol through sqlx
pub struct MySqlSchemaBackend {
    username: Option<String>,
    password: Option<String>,
}

impl MySqlSchemaBackend {
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        Self { username, password }
    }

    async fn connect(&self, server: &str) -> Result<MySqlConnection, SchemaError> {
        let (host, port) = split_server(server)?;
        let mut options = MySqlConnectOptions::new().host(host).port(port);
        if let Some(username) = &self.username {
            options = options.username(username);
        }
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        Ok(MySqlConnection::connect_with(&options).await?)
    }
}

#[async_trait]
impl SchemaBackend for MySqlSchemaBackend {
    async fn columns(
        &self,
        server: &str,
        database: &str,
        table: &str,
    ) -> Result<Option<Vec<(String, String)>>, SchemaError> {
        let mut conn = self.connect(server).await?;
        // No arguments, so this goes over the text protocol; some frontends
        // do not prepare statements
        let query = format!(
            "SELECT COLUMN_NAME, COLUMN_TYPE FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = {} AND TABLE_NAME = {} ORDER BY ORDINAL_POSITION",
            quote_literal(database),
            quote_literal(table)
        );
        let rows = sqlx::Executor::fetch_all(&mut conn, query.as_str()).await?;
        let columns = rows
            .iter()
            .map(|row| Ok((row.try_get::<String, _>(0)?, row.try_get::<String, _>(1)?)))
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        conn.close().await?;

        Ok(if columns.is_empty() { None } else { Some(columns) })
    }

    async fn execute(&self, server: &str, statement: &str) -> Result<(), SchemaError> {
        let mut conn = self.connect(server).await?;
        sqlx::Executor::execute(&mut conn, statement).await?;
        conn.close().await?;
        Ok(())
    }
}

fn split_server(server: &str) -> Result<(&str, u16), SchemaError> {
    match server.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => port
            .parse()
            .map(|port| (host.trim_start_matches('[').trim_end_matches(']'), port))
            .map_err(|_| SchemaError::InvalidServer(server.to_string())),
        Some(_) => Err(SchemaError::InvalidServer(server.to_string())),
        None if !server.is_empty() => Ok((server, DEFAULT_METADATA_PORT)),
        None => Err(SchemaError::InvalidServer(server.to_string())),
    }
}

/// A column the loader writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub sql_type: String,
}

impl ColumnSpec {
    fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
        }
    }
}

/// Canonical columns followed by the configured ones
pub fn expected_columns(config: &StreamLoadConfig) -> Vec<ColumnSpec> {
    let mut columns = vec![
        ColumnSpec::new(TIMESTAMP_COLUMN, "DATETIME(3)"),
        ColumnSpec::new("message", "STRING"),
        ColumnSpec::new("source", "VARCHAR(1024)"),
        ColumnSpec::new("offset", "BIGINT"),
        ColumnSpec::new(config.rest_column.as_str(), "JSON"),
    ];
    for name in &config.columns {
        let sql_type = config
            .additional_columns
            .get(name)
            .map(String::as_str)
            .unwrap_or("STRING");
        columns.push(ColumnSpec::new(name.as_str(), sql_type));
    }
    columns
}

/// Compare column types the way the server reports them
pub fn types_match(expected: &str, actual: &str) -> bool {
    normalize_type(expected) == normalize_type(actual)
}

fn normalize_type(sql_type: &str) -> String {
    let lowered = sql_type.trim().to_ascii_lowercase();
    let lowered = lowered.replace("datetimev2", "datetime").replace("jsonb", "json");

    for int in ["tinyint", "smallint", "bigint", "largeint", "int"] {
        if let Some(rest) = lowered.strip_prefix(int) {
            if rest.is_empty() || rest.starts_with('(') {
                return int.to_string();
            }
        }
    }
    match lowered.as_str() {
        "text" | "string" => "string".to_string(),
        _ => lowered,
    }
}

fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

/// Ensures tables exist with the expected columns before loading
pub struct TableManager {
    backend: Arc<dyn SchemaBackend>,
    servers: Vec<String>,
    database: String,
    columns: Vec<ColumnSpec>,
    retention_days: u32,
    backoff_max: Duration,
    ensured: Mutex<HashSet<String>>,
}

impl TableManager {
    pub fn new(
        backend: Arc<dyn SchemaBackend>,
        servers: Vec<String>,
        config: &StreamLoadConfig,
        backoff_max: Duration,
    ) -> Self {
        Self {
            backend,
            servers,
            database: config.database.clone(),
            columns: expected_columns(config),
            retention_days: config.retention_days,
            backoff_max,
            ensured: Mutex::new(HashSet::new()),
        }
    }

    /// Make `table` ready for loads
    ///
    /// Tries each metadata server in turn, backing off between sweeps
    /// until one succeeds, the schema is found incompatible, or `cancel`
    /// fires.
    pub async fn ensure(&self, table: &str, cancel: &CancellationToken) -> Result<(), SchemaError> {
        if self.ensured.lock().contains(table) {
            return Ok(());
        }

        let _guard = tokio::select! {
            _ = cancel.cancelled() => return Err(SchemaError::Cancelled),
            guard = SCHEMA_LOCK.lock() => guard,
        };
        if self.ensured.lock().contains(table) {
            return Ok(());
        }

        let mut backoff = Backoff::new(Duration::from_secs(1), self.backoff_max);
        loop {
            for server in &self.servers {
                match self.ensure_on(server, table).await {
                    Ok(()) => {
                        self.ensured.lock().insert(table.to_string());
                        return Ok(());
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => tracing::warn!(
                        server = %server,
                        table = %table,
                        error = %e,
                        "schema check failed"
                    ),
                }
            }

            let wait = backoff.trigger();
            tracing::error!(
                table = %table,
                wait_secs = wait.as_secs_f64(),
                "no metadata server available for schema check"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(SchemaError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn ensure_on(&self, server: &str, table: &str) -> Result<(), SchemaError> {
        let Some(existing) = self.backend.columns(server, &self.database, table).await? else {
            self.backend.execute(server, &self.create_table_sql(table)).await?;
            tracing::info!(server = %server, database = %self.database, table = %table, "created table");
            return Ok(());
        };

        let existing: HashMap<String, String> = existing
            .into_iter()
            .map(|(name, sql_type)| (name.to_ascii_lowercase(), sql_type))
            .collect();

        for column in &self.columns {
            match existing.get(&column.name.to_ascii_lowercase()) {
                Some(actual) if types_match(&column.sql_type, actual) => {}
                Some(actual) => {
                    return Err(SchemaError::TypeMismatch {
                        table: format!("{}.{}", self.database, table),
                        column: column.name.clone(),
                        expected: column.sql_type.clone(),
                        actual: actual.clone(),
                    });
                }
                None => {
                    let statement = format!(
                        "ALTER TABLE {}.{} ADD COLUMN {} {}",
                        quote_ident(&self.database),
                        quote_ident(table),
                        quote_ident(&column.name),
                        column.sql_type
                    );
                    self.backend.execute(server, &statement).await?;
                    tracing::info!(table = %table, column = %column.name, "added column");
                }
            }
        }
        Ok(())
    }

    /// `CREATE TABLE` with daily dynamic partitions
    pub fn create_table_sql(&self, table: &str) -> String {
        let columns = self
            .columns
            .iter()
            .map(|c| {
                let null = if c.name == TIMESTAMP_COLUMN { " NOT NULL" } else { "" };
                format!("  {} {}{}", quote_ident(&c.name), c.sql_type, null)
            })
            .collect::<Vec<_>>()
            .join(",\n");

        let mut properties = vec![
            ("dynamic_partition.enable", "true".to_string()),
            ("dynamic_partition.time_unit", "DAY".to_string()),
            ("dynamic_partition.end", "3".to_string()),
            ("dynamic_partition.prefix", "p".to_string()),
        ];
        if self.retention_days > 0 {
            properties.push(("dynamic_partition.start", format!("-{}", self.retention_days)));
        }
        let properties = properties
            .iter()
            .map(|(k, v)| format!("  \"{k}\" = \"{v}\""))
            .collect::<Vec<_>>()
            .join(",\n");

        format!(
            "CREATE TABLE IF NOT EXISTS {}.{} (\n{columns}\n)\nDUPLICATE KEY({})\n\
             PARTITION BY RANGE({}) ()\nDISTRIBUTED BY RANDOM BUCKETS AUTO\nPROPERTIES (\n{properties}\n)",
            quote_ident(&self.database),
            quote_ident(table),
            quote_ident(TIMESTAMP_COLUMN),
            quote_ident(TIMESTAMP_COLUMN),
        )
    }
}

#[cfg(test)]
#[path = "schema_test.rs"]
mod schema_test;
