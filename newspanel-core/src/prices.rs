//! CRSP daily price panel: pull, clean, derive, and cut to a large-cap universe.

use crate::cache::write_parquet_atomic;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::query::crsp_daily_query;
use crate::records::prices_to_dataframe;
use crate::retry::RetryPolicy;
use crate::schema::{require_lazy_columns, DATE, MARKET_CAP, PERMNO, PRICE_KEY_COLUMNS};
use crate::warehouse::Warehouse;
use polars::prelude::*;
use std::path::Path;

/// Number of names kept per date by [`russell_1000_proxy`].
pub const RUSSELL_1000_SIZE: u32 = 1000;

/// Delisting codes that get a -30% return when CRSP has none
/// (500, 520, 551..=574, 580, 584).
const PERFORMANCE_CODES: [i32; 4] = [500, 520, 580, 584];
const PERFORMANCE_RANGE: (i32, i32) = (551, 574);
const PERFORMANCE_DELIST_RETURN: f64 = -0.3;
const OTHER_DELIST_RETURN: f64 = -1.0;

/// Outcome of [`pull_crsp_daily`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceSummary {
    pub rows_pulled: usize,
    pub rows_kept: usize,
    pub dates: usize,
}

/// Pull the CRSP daily file for the configured window, preprocess it, keep
/// the top names per date by nominal market cap, and write `out_path`.
pub fn pull_crsp_daily(
    warehouse: &dyn Warehouse,
    config: &PipelineConfig,
    retry: &RetryPolicy,
    out_path: &Path,
) -> Result<PriceSummary> {
    let sql = crsp_daily_query(config.start_date, config.end_date);
    tracing::info!(
        start = %config.start_date,
        end = %config.end_date,
        warehouse = warehouse.name(),
        "pulling CRSP daily"
    );
    let rows = retry.run("crsp daily", |_| warehouse.prices(&sql))?;
    if rows.is_empty() {
        return Err(PipelineError::EmptyInput(format!(
            "CRSP daily {}..{}",
            config.start_date, config.end_date
        )));
    }

    let raw = prices_to_dataframe(&rows)?;
    let mut universe =
        russell_1000_proxy(preprocess_prices(raw.lazy())?, RUSSELL_1000_SIZE)?.collect()?;

    let dates = universe.column(DATE)?.n_unique()?;
    write_parquet_atomic(&mut universe, out_path)?;

    let summary = PriceSummary {
        rows_pulled: rows.len(),
        rows_kept: universe.height(),
        dates,
    };
    tracing::info!(
        pulled = summary.rows_pulled,
        kept = summary.rows_kept,
        dates = summary.dates,
        output = %out_path.display(),
        "CRSP universe saved"
    );
    Ok(summary)
}

/// Clean a raw CRSP daily frame and add derived columns.
///
/// - one row per (permno, date), first seen wins
/// - `prc`/`openprc` made positive (CRSP stores bid/ask midpoints negated)
/// - `shrout` scaled from thousands to shares
/// - split-adjusted share count and prices, nominal and adjusted market cap
/// - missing delisting returns filled by delisting code, then `ret`/`retx`
///   filled from them
pub fn preprocess_prices(mut lf: LazyFrame) -> Result<LazyFrame> {
    require_lazy_columns(
        &mut lf,
        &[
            PERMNO, DATE, "ret", "retx", "prc", "openprc", "shrout", "cfacshr", "cfacpr",
            "dlret", "dlretx", "dlstcd",
        ],
        "CRSP daily",
    )?;

    let lf = lf
        .unique_stable(
            Some(vec![PERMNO.into(), DATE.into()]),
            UniqueKeepStrategy::First,
        )
        .with_columns([
            col("prc").abs(),
            col("openprc").abs(),
            (col("shrout") * lit(1000.0)).alias("shrout"),
        ])
        .with_columns([
            (col("shrout") * col("cfacshr")).alias("adj_shrout"),
            (col("prc") / col("cfacpr")).alias("adj_prc"),
            (col("openprc") / col("cfacpr")).alias("adj_openprc"),
            (col("prc") * col("shrout")).alias(MARKET_CAP),
        ])
        .with_columns([
            (col("adj_prc") * col("adj_shrout")).alias("market_cap_adj"),
            delisting_return("dlret"),
            delisting_return("dlretx"),
        ])
        .with_columns([
            col("ret").fill_null(col("dlret")),
            col("retx").fill_null(col("dlretx")),
        ]);

    Ok(lf)
}

/// Substitute a missing delisting return (`column`) from `dlstcd`.
fn delisting_return(column: &str) -> Expr {
    let code = col("dlstcd");
    let missing = col(column).is_null();

    let performance = PERFORMANCE_CODES
        .iter()
        .fold(
            code.clone()
                .gt_eq(lit(PERFORMANCE_RANGE.0))
                .and(code.clone().lt_eq(lit(PERFORMANCE_RANGE.1))),
            |acc, c| acc.or(code.clone().eq(lit(*c))),
        );

    when(missing.clone().and(performance))
        .then(lit(PERFORMANCE_DELIST_RETURN))
        .when(missing.and(code.gt_eq(lit(200))))
        .then(lit(OTHER_DELIST_RETURN))
        .otherwise(col(column))
        .alias(column)
}

/// Rank names by nominal market cap within each date (largest = 1, ties
/// averaged) and keep those ranked `top` or better.
pub fn russell_1000_proxy(mut lf: LazyFrame, top: u32) -> Result<LazyFrame> {
    require_lazy_columns(&mut lf, &PRICE_KEY_COLUMNS, "CRSP daily")?;
    require_lazy_columns(&mut lf, &[MARKET_CAP], "CRSP daily")?;

    Ok(lf
        .with_column(
            col(MARKET_CAP)
                .rank(
                    RankOptions {
                        method: RankMethod::Average,
                        descending: true,
                    },
                    None,
                )
                .over([col(DATE)])
                .cast(DataType::Float64)
                .alias("rank"),
        )
        .filter(col("rank").lt_eq(lit(top as f64))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{CrosswalkEntry, NewsRecord, PriceRow};
    use chrono::NaiveDate;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2010, 6, d).unwrap()
    }

    fn row(permno: i64, date: NaiveDate, prc: f64, shrout: f64) -> PriceRow {
        PriceRow {
            date,
            permno,
            permco: Some(permno + 50_000),
            cusip: Some(format!("{permno:08}")),
            ret: Some(0.01),
            retx: Some(0.01),
            prc: Some(prc),
            openprc: Some(prc),
            vol: Some(1_000.0),
            shrout: Some(shrout),
            cfacshr: Some(2.0),
            cfacpr: Some(2.0),
            dlret: None,
            dlretx: None,
            dlstcd: None,
        }
    }

    fn delisted(permno: i64, code: Option<i32>, dlret: Option<f64>) -> PriceRow {
        PriceRow {
            ret: None,
            retx: None,
            dlret,
            dlretx: dlret,
            dlstcd: code,
            ..row(permno, day(1), 10.0, 100.0)
        }
    }

    fn processed(rows: &[PriceRow]) -> DataFrame {
        let df = prices_to_dataframe(rows).unwrap();
        preprocess_prices(df.lazy())
            .unwrap()
            .sort([PERMNO], SortMultipleOptions::default())
            .collect()
            .unwrap()
    }

    #[test]
    fn derived_columns() {
        let df = processed(&[row(1, day(1), -20.0, 300.0)]);

        let get = |name: &str| df.column(name).unwrap().f64().unwrap().get(0).unwrap();
        assert_eq!(get("prc"), 20.0);
        assert_eq!(get("openprc"), 20.0);
        assert_eq!(get("shrout"), 300_000.0);
        assert_eq!(get("adj_shrout"), 600_000.0);
        assert_eq!(get("adj_prc"), 10.0);
        assert_eq!(get("adj_openprc"), 10.0);
        assert_eq!(get("market_cap"), 6_000_000.0);
        assert_eq!(get("market_cap_adj"), 6_000_000.0);
    }

    #[test]
    fn duplicate_keys_dropped() {
        let df = processed(&[
            row(1, day(1), 20.0, 1.0),
            row(1, day(1), 99.0, 1.0),
            row(1, day(2), 21.0, 1.0),
        ]);
        assert_eq!(df.height(), 2);
    }

    #[test]
    fn delisting_returns_follow_code_rules() {
        let df = processed(&[
            delisted(1, Some(500), None),
            delisted(2, Some(560), None),
            delisted(3, Some(584), None),
            delisted(4, Some(233), None),
            delisted(5, Some(575), None),
            delisted(6, Some(500), Some(0.05)),
            delisted(7, Some(100), None),
            delisted(8, None, None),
        ]);

        let dlret = df.column("dlret").unwrap().f64().unwrap();
        let ret = df.column("ret").unwrap().f64().unwrap();
        let retx = df.column("retx").unwrap().f64().unwrap();
        let expected = [
            Some(-0.3),
            Some(-0.3),
            Some(-0.3),
            Some(-1.0),
            Some(-1.0),
            Some(0.05),
            None,
            None,
        ];
        for (i, want) in expected.iter().enumerate() {
            assert_eq!(dlret.get(i), *want, "dlret row {i}");
            assert_eq!(ret.get(i), *want, "ret row {i}");
            assert_eq!(retx.get(i), *want, "retx row {i}");
        }
    }

    #[test]
    fn existing_return_not_overwritten() {
        let mut r = delisted(1, Some(500), None);
        r.ret = Some(0.02);
        let df = processed(&[r]);
        assert_eq!(df.column("ret").unwrap().f64().unwrap().get(0), Some(0.02));
        assert_eq!(df.column("dlret").unwrap().f64().unwrap().get(0), Some(-0.3));
    }

    #[test]
    fn proxy_keeps_top_names_per_date() {
        let rows: Vec<PriceRow> = (1..=5)
            .flat_map(|p| [row(p, day(1), p as f64, 1.0), row(p, day(2), (10 - p) as f64, 1.0)])
            .collect();
        let df = prices_to_dataframe(&rows).unwrap();
        let top = russell_1000_proxy(preprocess_prices(df.lazy()).unwrap(), 2)
            .unwrap()
            .sort([DATE, "rank"], SortMultipleOptions::default())
            .collect()
            .unwrap();

        assert_eq!(top.height(), 4);
        let permnos: Vec<Option<i64>> = top.column(PERMNO).unwrap().i64().unwrap().into_iter().collect();
        assert_eq!(permnos, vec![Some(5), Some(4), Some(1), Some(2)]);
        let ranks = top.column("rank").unwrap().f64().unwrap();
        assert_eq!(ranks.get(0), Some(1.0));
        assert_eq!(ranks.get(1), Some(2.0));
    }

    #[test]
    fn proxy_averages_ties() {
        let rows = vec![
            row(1, day(1), 10.0, 1.0),
            row(2, day(1), 10.0, 1.0),
            row(3, day(1), 5.0, 1.0),
        ];
        let df = prices_to_dataframe(&rows).unwrap();
        let out = russell_1000_proxy(preprocess_prices(df.lazy()).unwrap(), 1000)
            .unwrap()
            .sort([PERMNO], SortMultipleOptions::default())
            .collect()
            .unwrap();
        let ranks = out.column("rank").unwrap().f64().unwrap();
        assert_eq!(ranks.get(0), Some(1.5));
        assert_eq!(ranks.get(1), Some(1.5));
        assert_eq!(ranks.get(2), Some(3.0));
    }

    #[test]
    fn missing_columns_rejected() {
        let bad = df!("permno" => &[1i64]).unwrap().lazy();
        assert!(matches!(
            preprocess_prices(bad),
            Err(PipelineError::MissingColumn { .. })
        ));
    }

    struct PriceWarehouse(Vec<PriceRow>);

    impl Warehouse for PriceWarehouse {
        fn name(&self) -> &str {
            "prices"
        }
        fn news(&self, _: &str) -> Result<Vec<NewsRecord>> {
            Ok(Vec::new())
        }
        fn crosswalk(&self, _: &str) -> Result<Vec<CrosswalkEntry>> {
            Ok(Vec::new())
        }
        fn prices(&self, sql: &str) -> Result<Vec<PriceRow>> {
            assert!(sql.contains("shrcd IN (10, 11)"));
            Ok(self.0.clone())
        }
    }

    #[test]
    fn pull_writes_universe() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("crsp.parquet");
        let warehouse = PriceWarehouse(vec![row(1, day(1), 10.0, 1.0), row(2, day(2), 11.0, 1.0)]);

        let summary = pull_crsp_daily(
            &warehouse,
            &PipelineConfig::default(),
            &RetryPolicy::immediate(1),
            &out,
        )
        .unwrap();

        assert_eq!(
            summary,
            PriceSummary {
                rows_pulled: 2,
                rows_kept: 2,
                dates: 2
            }
        );
        assert!(out.is_file());
    }

    #[test]
    fn empty_pull_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = pull_crsp_daily(
            &PriceWarehouse(Vec::new()),
            &PipelineConfig::default(),
            &RetryPolicy::immediate(1),
            &dir.path().join("crsp.parquet"),
        );
        assert!(matches!(result, Err(PipelineError::EmptyInput(_))));
    }
}
