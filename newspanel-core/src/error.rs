//! Structured error types for pipeline stages.
//!
//! Errors fall into three groups: transient warehouse/network failures that
//! the retry policy may re-attempt, schema/validation failures that are fatal
//! immediately, and empty-input failures (nothing cached to combine).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("warehouse error: {0}")]
    Warehouse(String),

    #[error("network unreachable: {0}")]
    Network(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("gave up after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<PipelineError>,
    },

    #[error("missing column '{column}' in {context}")]
    MissingColumn { column: String, context: String },

    #[error("schema mismatch in {path}: expected {expected}, found {found}")]
    SchemaMismatch {
        path: String,
        expected: String,
        found: String,
    },

    #[error("invalid join mode '{0}' (expected 'left' or 'inner')")]
    InvalidJoinMode(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("empty input: {0}")]
    EmptyInput(String),

    #[error("parquet I/O error: {0}")]
    Parquet(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Warehouse(_) | Self::Network(_) | Self::RateLimited { .. }
        )
    }
}

impl From<polars::prelude::PolarsError> for PipelineError {
    fn from(e: polars::prelude::PolarsError) -> Self {
        match e {
            polars::prelude::PolarsError::ColumnNotFound(msg) => Self::MissingColumn {
                column: msg.to_string(),
                context: "dataframe".into(),
            },
            other => Self::Parquet(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
