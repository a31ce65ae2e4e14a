//! WRDS Postgres client.
//!
//! Opens a single-connection pool to `wrds-pgdata` and blocks on each query
//! with a private current-thread runtime, so callers stay synchronous.
//! The password comes from `PGPASSWORD`.

use super::Warehouse;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::records::{CrosswalkEntry, NewsRecord, PriceRow};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use std::time::Duration;

pub struct WrdsWarehouse {
    runtime: tokio::runtime::Runtime,
    pool: PgPool,
}

impl WrdsWarehouse {
    /// Connect using the host/port/database from `config.wrds` and
    /// `config.wrds_username`.
    pub fn connect(config: &PipelineConfig) -> Result<Self> {
        if config.wrds_username.is_empty() {
            return Err(PipelineError::Config(
                "wrds_username is empty (set WRDS_USERNAME)".into(),
            ));
        }

        let mut options = PgConnectOptions::new()
            .host(&config.wrds.host)
            .port(config.wrds.port)
            .database(&config.wrds.database)
            .username(&config.wrds_username)
            .ssl_mode(PgSslMode::Require);
        if let Ok(password) = std::env::var("PGPASSWORD") {
            options = options.password(&password);
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(1)
                    .acquire_timeout(Duration::from_secs(60))
                    .connect_with(options),
            )
            .map_err(map_sqlx_error)?;

        tracing::info!(
            host = %config.wrds.host,
            user = %config.wrds_username,
            "connected to WRDS"
        );
        Ok(Self { runtime, pool })
    }

    fn fetch_all<T>(&self, sql: &str) -> Result<Vec<T>>
    where
        T: for<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> + Send + Unpin,
    {
        self.runtime
            .block_on(sqlx::query_as::<sqlx::Postgres, T>(sql).fetch_all(&self.pool))
            .map_err(map_sqlx_error)
    }
}

impl Drop for WrdsWarehouse {
    fn drop(&mut self) {
        self.runtime.block_on(self.pool.close());
    }
}

impl Warehouse for WrdsWarehouse {
    fn name(&self) -> &str {
        "wrds"
    }

    fn news(&self, sql: &str) -> Result<Vec<NewsRecord>> {
        self.fetch_all(sql)
    }

    fn crosswalk(&self, sql: &str) -> Result<Vec<CrosswalkEntry>> {
        self.fetch_all(sql)
    }

    fn prices(&self, sql: &str) -> Result<Vec<PriceRow>> {
        self.fetch_all(sql)
    }
}

/// Decode and column errors mean the query and the row type disagree; those
/// are schema problems and never retried. Server errors are sorted by
/// SQLSTATE. Everything else is treated as a connection-level failure.
fn map_sqlx_error(e: sqlx::Error) -> PipelineError {
    match e {
        sqlx::Error::ColumnNotFound(column) => PipelineError::MissingColumn {
            column,
            context: "warehouse result".into(),
        },
        sqlx::Error::ColumnDecode { index, source } => {
            PipelineError::Validation(format!("cannot decode column {index}: {source}"))
        }
        sqlx::Error::Decode(source) => PipelineError::Validation(format!("decode: {source}")),
        sqlx::Error::Configuration(source) => PipelineError::Config(source.to_string()),
        sqlx::Error::Database(db) => classify_sqlstate(db.code().as_deref(), db.message()),
        other => PipelineError::Warehouse(other.to_string()),
    }
}

/// Map a Postgres SQLSTATE to a pipeline error.
///
/// Connection, resource, operator and rollback classes (`08`, `40`, `53`,
/// `57`) stay retryable. Syntax, undefined objects and bad data (`42`,
/// `22`, `23`) fail at once, as do rejected credentials (`28`).
fn classify_sqlstate(code: Option<&str>, message: &str) -> PipelineError {
    let Some(code) = code else {
        return PipelineError::Warehouse(message.to_string());
    };
    let detail = format!("{message} (SQLSTATE {code})");

    match code {
        "42703" => PipelineError::MissingColumn {
            column: quoted_name(message).unwrap_or(message).to_string(),
            context: "warehouse query".into(),
        },
        c if c.starts_with("42") || c.starts_with("22") || c.starts_with("23") => {
            PipelineError::Validation(detail)
        }
        c if c.starts_with("28") => PipelineError::Config(detail),
        _ => PipelineError::Warehouse(detail),
    }
}

/// First double-quoted name in a server message, e.g. `column "css" does not exist`.
fn quoted_name(message: &str) -> Option<&str> {
    let (_, rest) = message.split_once('"')?;
    rest.split_once('"').map(|(name, _)| name)
}
