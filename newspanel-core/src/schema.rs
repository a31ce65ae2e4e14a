//! Column names shared across stages, and required-column checks.

use crate::error::{PipelineError, Result};
use polars::prelude::*;

pub const TIMESTAMP_UTC: &str = "timestamp_utc";
pub const STORY_ID: &str = "rp_story_id";
pub const ENTITY_ID: &str = "rp_entity_id";
pub const PERMNO: &str = "permno";
pub const DATE: &str = "date";
pub const YEAR: &str = "year";
pub const NCUSIP: &str = "ncusip";
pub const ISIN: &str = "isin";
pub const MARKET_CAP: &str = "market_cap";

/// Columns every news frame must carry before linking.
pub const NEWS_KEY_COLUMNS: [&str; 3] = [TIMESTAMP_UTC, STORY_ID, ENTITY_ID];

/// Columns every crosswalk frame must carry.
pub const CROSSWALK_COLUMNS: [&str; 2] = [PERMNO, ENTITY_ID];

/// Columns the price panel must carry to be joined onto news.
pub const PRICE_KEY_COLUMNS: [&str; 2] = [PERMNO, DATE];

/// Fail with `MissingColumn` on the first absent column.
pub fn require_columns(schema: &Schema, columns: &[&str], context: &str) -> Result<()> {
    for name in columns {
        if !schema.contains(name) {
            return Err(PipelineError::MissingColumn {
                column: (*name).to_string(),
                context: context.to_string(),
            });
        }
    }
    Ok(())
}

/// Same check against a lazy frame's resolved schema.
pub fn require_lazy_columns(lf: &mut LazyFrame, columns: &[&str], context: &str) -> Result<()> {
    let schema = lf.collect_schema()?;
    require_columns(&schema, columns, context)
}

/// `name:dtype` listing used to compare and report frame layouts.
pub fn describe(df: &DataFrame) -> String {
    df.get_columns()
        .iter()
        .map(|c| format!("{}:{}", c.name(), c.dtype()))
        .collect::<Vec<_>>()
        .join(", ")
}
