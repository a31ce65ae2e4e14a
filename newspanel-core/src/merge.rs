//! News x crosswalk x price-panel joins.
//!
//! Step 1 attaches a PERMNO to each news row by `rp_entity_id`. The
//! crosswalk is first cut to one row per entity id so the join cannot
//! multiply news rows. Step 2 derives a daily `date` from `timestamp_utc`
//! and attaches same-day CRSP fields on (permno, date).

use crate::cache::{count_rows, scan_parquet, write_parquet_atomic};
use crate::error::{PipelineError, Result};
use crate::schema::{
    require_lazy_columns, CROSSWALK_COLUMNS, DATE, ENTITY_ID, NEWS_KEY_COLUMNS, PERMNO,
    PRICE_KEY_COLUMNS, TIMESTAMP_UTC,
};
use polars::prelude::*;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Join flavour for both merge steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JoinMode {
    /// Keep every news row; unmatched columns are null.
    #[default]
    Left,
    /// Keep only matched news rows.
    Inner,
}

impl JoinMode {
    fn join_type(self) -> JoinType {
        match self {
            Self::Left => JoinType::Left,
            Self::Inner => JoinType::Inner,
        }
    }
}

impl FromStr for JoinMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => Ok(Self::Left),
            "inner" => Ok(Self::Inner),
            _ => Err(PipelineError::InvalidJoinMode(s.to_string())),
        }
    }
}

impl fmt::Display for JoinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Left => "left",
            Self::Inner => "inner",
        })
    }
}

/// Row counts and match rate of a merge step.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeSummary {
    pub mode: JoinMode,
    pub input_rows: usize,
    pub output_rows: usize,
    /// Output rows whose join key found a partner.
    pub matched_rows: usize,
}

impl MergeSummary {
    pub fn match_share(&self) -> f64 {
        if self.output_rows == 0 {
            0.0
        } else {
            self.matched_rows as f64 / self.output_rows as f64
        }
    }
}

/// Attach `permno` to news rows by entity id.
pub fn attach_permno(mut news: LazyFrame, mut crosswalk: LazyFrame, mode: JoinMode) -> Result<LazyFrame> {
    require_lazy_columns(&mut news, &NEWS_KEY_COLUMNS, "news")?;
    require_lazy_columns(&mut crosswalk, &CROSSWALK_COLUMNS, "crosswalk")?;

    let one_per_entity = crosswalk
        .select([col(ENTITY_ID), col(PERMNO)])
        .unique_stable(Some(vec![ENTITY_ID.into()]), UniqueKeepStrategy::First);

    Ok(news.join(
        one_per_entity,
        [col(ENTITY_ID)],
        [col(ENTITY_ID)],
        JoinArgs::new(mode.join_type()),
    ))
}

/// Attach same-day price fields on (permno, date).
///
/// The price panel is cut to one row per (permno, date), first wins, so a
/// left join keeps exactly the news rows.
pub fn merge_with_prices(mut news: LazyFrame, mut prices: LazyFrame, mode: JoinMode) -> Result<LazyFrame> {
    require_lazy_columns(&mut news, &[TIMESTAMP_UTC, PERMNO], "news with permno")?;
    require_lazy_columns(&mut prices, &PRICE_KEY_COLUMNS, "price panel")?;

    let news = news.with_column(col(TIMESTAMP_UTC).dt().date().alias(DATE));
    let prices = prices
        .with_column(col(DATE).cast(DataType::Date))
        .unique_stable(
            Some(vec![PERMNO.into(), DATE.into()]),
            UniqueKeepStrategy::First,
        );

    Ok(news.join(
        prices,
        [col(PERMNO), col(DATE)],
        [col(PERMNO), col(DATE)],
        JoinArgs::new(mode.join_type()),
    ))
}

/// Read news and crosswalk files, attach permno, write `out_path`.
pub fn attach_permno_file(
    news_path: &Path,
    crosswalk_path: &Path,
    out_path: &Path,
    mode: JoinMode,
) -> Result<MergeSummary> {
    let news = scan_parquet(news_path)?;
    let input_rows = count_rows(news.clone())?;
    let mut out = attach_permno(news, scan_parquet(crosswalk_path)?, mode)?.collect()?;
    let summary = summarize(&out, mode, input_rows, PERMNO)?;

    write_parquet_atomic(&mut out, out_path)?;
    tracing::info!(
        output = %out_path.display(),
        rows = summary.output_rows,
        share_matched = format!("{:.3}", summary.match_share()),
        "attached permno"
    );
    Ok(summary)
}

/// Read news-with-permno and the price panel, join, write `out_path`.
///
/// Match rate is measured on the price panel's `prc` column when present,
/// otherwise on the first non-key price column.
pub fn merge_with_prices_file(
    news_path: &Path,
    prices_path: &Path,
    out_path: &Path,
    mode: JoinMode,
) -> Result<MergeSummary> {
    let news = scan_parquet(news_path)?;
    let mut prices = scan_parquet(prices_path)?;
    let input_rows = count_rows(news.clone())?;

    let price_schema = prices.collect_schema()?;
    let matched_column = if price_schema.contains("prc") {
        "prc".to_string()
    } else {
        price_schema
            .iter_names()
            .find(|n| n.as_str() != PERMNO && n.as_str() != DATE)
            .map(|n| n.to_string())
            .unwrap_or_else(|| DATE.to_string())
    };

    let mut out = merge_with_prices(news, prices, mode)?.collect()?;
    let summary = summarize(&out, mode, input_rows, &matched_column)?;

    write_parquet_atomic(&mut out, out_path)?;
    tracing::info!(
        output = %out_path.display(),
        mode = %mode,
        rows = summary.output_rows,
        "merged news with prices"
    );
    Ok(summary)
}

fn summarize(out: &DataFrame, mode: JoinMode, input_rows: usize, matched_column: &str) -> Result<MergeSummary> {
    let matched = out.height() - out.column(matched_column)?.null_count();
    Ok(MergeSummary {
        mode,
        input_rows,
        output_rows: out.height(),
        matched_rows: matched,
    })
}
