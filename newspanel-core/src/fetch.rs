//! Per-year RavenPack pull orchestrator.
//!
//! Years run sequentially. Each year is queried, filtered to single-firm
//! stories, tagged with its `year`, and written to the cache on its own, so
//! an interrupted run resumes where it stopped. A year is skipped when its
//! cache entry was pulled over the same dates with the same filter, unless
//! `force` is set; any other cached year is pulled again. Failures go through the retry
//! policy; once it gives up the error propagates and later years are not
//! attempted.

use crate::cache::{PullParams, YearCache, YearMeta};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::query::{NewsFilter, NewsQuery};
use crate::records::news_to_dataframe;
use crate::retry::RetryPolicy;
use crate::schema::{ENTITY_ID, NEWS_KEY_COLUMNS, STORY_ID, YEAR};
use crate::warehouse::Warehouse;
use polars::prelude::*;

/// Options for a multi-year pull.
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    pub filter: NewsFilter,
    /// Re-pull years that are already cached.
    pub force: bool,
    /// Keep only the first row of each story (drops per-event duplicates).
    pub one_row_per_story: bool,
}

/// Progress callback for the yearly loop.
pub trait PullProgress {
    fn on_start(&self, year: i32, index: usize, total: usize);

    fn on_skip(&self, year: i32, index: usize, total: usize);

    fn on_complete(&self, year: i32, index: usize, total: usize, meta: &YearMeta);

    fn on_batch_complete(&self, summary: &PullSummary);
}

/// Progress reporter that logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl PullProgress for LogProgress {
    fn on_start(&self, year: i32, index: usize, total: usize) {
        tracing::info!("[{}/{}] pulling RavenPack {year}", index + 1, total);
    }

    fn on_skip(&self, year: i32, index: usize, total: usize) {
        tracing::info!("[{}/{}] {year} already cached, skipping", index + 1, total);
    }

    fn on_complete(&self, year: i32, _index: usize, _total: usize, meta: &YearMeta) {
        tracing::info!(
            year,
            rows = meta.rows,
            start = %meta.start_date,
            end = %meta.end_date,
            "year cached"
        );
    }

    fn on_batch_complete(&self, summary: &PullSummary) {
        tracing::info!(
            pulled = summary.pulled.len(),
            skipped = summary.skipped.len(),
            rows = summary.rows_pulled(),
            "pull complete"
        );
    }
}

/// What a pull did.
#[derive(Debug, Default, Clone)]
pub struct PullSummary {
    pub pulled: Vec<YearMeta>,
    pub skipped: Vec<i32>,
}

impl PullOptions {
    /// The parts of these options that change what lands in the cache.
    pub fn params(&self) -> PullParams {
        PullParams {
            filter: self.filter.clone(),
            one_row_per_story: self.one_row_per_story,
        }
    }
}

impl PullSummary {
    pub fn rows_pulled(&self) -> usize {
        self.pulled.iter().map(|m| m.rows).sum()
    }
}

/// Pull every year of the configured window into `cache`.
pub fn pull_news_years(
    warehouse: &dyn Warehouse,
    cache: &YearCache,
    config: &PipelineConfig,
    opts: &PullOptions,
    retry: &RetryPolicy,
    progress: &dyn PullProgress,
) -> Result<PullSummary> {
    config.validate()?;
    let years: Vec<i32> = config.years().collect();
    let total = years.len();
    let params = opts.params();
    let mut summary = PullSummary::default();

    for (i, &year) in years.iter().enumerate() {
        let query = NewsQuery::for_year(year, config.start_date, config.end_date, opts.filter.clone());
        let window = (query.start, query.end);

        if !opts.force {
            if cache.is_current(year, window, &params) {
                progress.on_skip(year, i, total);
                summary.skipped.push(year);
                continue;
            }
            if cache.contains(year) {
                tracing::info!(year, "cached with different dates or filter, pulling again");
            }
        }

        progress.on_start(year, i, total);
        let mut df = retry.run(&format!("ravenpack {year}"), |_| {
            pull_year(warehouse, &query, opts.one_row_per_story)
        })?;

        let meta = cache.write(year, window, &params, warehouse.name(), &mut df)?;
        progress.on_complete(year, i, total, &meta);
        summary.pulled.push(meta);
    }

    progress.on_batch_complete(&summary);
    Ok(summary)
}

/// Fetch and filter one year. Nothing is written here.
pub fn pull_year(
    warehouse: &dyn Warehouse,
    query: &NewsQuery,
    one_row_per_story: bool,
) -> Result<DataFrame> {
    let rows = warehouse.news(&query.to_sql())?;
    let raw = news_to_dataframe(&rows)?;
    let before = raw.height();

    let mut lf = single_firm_filter(raw.lazy());
    if one_row_per_story {
        lf = lf.unique_stable(Some(vec![STORY_ID.into()]), UniqueKeepStrategy::First);
    }
    let df = lf.with_column(lit(query.year).alias(YEAR)).collect()?;

    tracing::debug!(
        year = query.year,
        raw = before,
        kept = df.height(),
        "single-firm filter applied"
    );
    Ok(df)
}

/// Keep rows whose story mentions exactly one distinct entity.
pub fn single_firm_filter(lf: LazyFrame) -> LazyFrame {
    lf.filter(
        col(ENTITY_ID)
            .n_unique()
            .over([col(STORY_ID)])
            .eq(lit(1u32)),
    )
}

/// Check that a frame honours the single-firm invariant.
pub fn check_single_firm(df: &DataFrame) -> Result<()> {
    crate::schema::require_columns(&df.schema(), &NEWS_KEY_COLUMNS, "news")?;
    let offenders = df
        .clone()
        .lazy()
        .group_by([col(STORY_ID)])
        .agg([col(ENTITY_ID).n_unique().alias("entities")])
        .filter(col("entities").gt(lit(1u32)))
        .collect()?;

    if offenders.height() > 0 {
        return Err(PipelineError::Validation(format!(
            "{} stories map to more than one entity",
            offenders.height()
        )));
    }
    Ok(())
}
