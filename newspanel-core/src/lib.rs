//! newspanel core: RavenPack news x CRSP price panel construction.
//!
//! Stages, each persisted as a Parquet file under the configured data dir:
//! - Per-year incremental pull of single-firm news stories, with retry
//! - Streaming combine of the per-year files
//! - Entity -> PERMNO crosswalk via CUSIP/ISIN substring matching
//! - PERMNO attach and same-day merge onto the CRSP daily panel
//! - CRSP daily preprocessing and a top-1000 market-cap universe
//! - Russell 1000 constituents from ETF holdings

pub mod cache;
pub mod combine;
pub mod config;
pub mod crosswalk;
pub mod error;
pub mod fetch;
pub mod holdings;
pub mod merge;
pub mod prices;
pub mod query;
pub mod records;
pub mod retry;
pub mod schema;
pub mod warehouse;

pub use config::{DataLayout, PipelineConfig};
pub use error::{PipelineError, Result};
pub use merge::JoinMode;
pub use retry::RetryPolicy;
