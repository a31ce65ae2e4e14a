//! SQL templates for the WRDS pulls.
//!
//! Everything here is pure string building. Table and column names follow
//! the vendors' published schemas; the filters mirror the paper's sample
//! construction (US companies, relevance >= 90, single-firm stories).

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

pub const RAVENPACK_SCHEMA: &str = "ravenpack_dj";
pub const RAVENPACK_TABLE_PREFIX: &str = "rpa_djpr_equities_";

/// Inclusive date bounds for one calendar year of the project window.
///
/// The first and last year are clipped to `start`/`end`; every interior
/// year spans Jan 1 through Dec 31.
pub fn year_bounds(year: i32, start: NaiveDate, end: NaiveDate) -> (NaiveDate, NaiveDate) {
    let jan1 = NaiveDate::from_ymd_opt(year, 1, 1).expect("Jan 1 exists in every year");
    let dec31 = NaiveDate::from_ymd_opt(year, 12, 31).expect("Dec 31 exists in every year");
    let lo = if year == start.year() { start.max(jan1) } else { jan1 };
    let hi = if year == end.year() { end.min(dec31) } else { dec31 };
    (lo, hi)
}

/// Filters and options for a yearly RavenPack pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsFilter {
    pub country_code: String,
    pub entity_type: String,
    pub min_relevance: f64,
    /// Only rows that carry an event sentiment score.
    pub event_only: bool,
    /// Row cap for trial runs. `None` pulls everything.
    pub limit: Option<u64>,
}

impl Default for NewsFilter {
    fn default() -> Self {
        Self {
            country_code: "US".into(),
            entity_type: "COMP".into(),
            min_relevance: 90.0,
            event_only: false,
            limit: None,
        }
    }
}

/// Columns selected from the RavenPack equities tables.
///
/// `group` and `type` are reserved words in Postgres; they are quoted and
/// renamed to `rp_group` / `rp_type`.
const NEWS_SELECT: &[(&str, &str)] = &[
    ("timestamp_utc", "timestamp_utc::timestamp"),
    ("rp_story_id", "rp_story_id::text"),
    ("rp_entity_id", "rp_entity_id::text"),
    ("entity_type", "entity_type::text"),
    ("entity_name", "entity_name::text"),
    ("country_code", "country_code::text"),
    ("relevance", "relevance::float8"),
    ("event_sentiment_score", "event_sentiment_score::float8"),
    ("event_relevance", "event_relevance::float8"),
    ("event_similarity_key", "event_similarity_key::text"),
    ("event_similarity_days", "event_similarity_days::float8"),
    ("topic", "topic::text"),
    ("rp_group", "\"group\"::text"),
    ("rp_type", "\"type\"::text"),
    ("sub_type", "sub_type::text"),
    ("property", "property::text"),
    ("fact_level", "fact_level::text"),
    ("category", "category::text"),
    ("news_type", "news_type::text"),
    ("rp_source_id", "rp_source_id::text"),
    ("provider_id", "provider_id::text"),
    ("provider_story_id", "provider_story_id::text"),
    ("source_name", "source_name::text"),
    ("headline", "headline::text"),
    ("css", "css::float8"),
];

/// One year's single-firm RavenPack query.
#[derive(Debug, Clone, PartialEq)]
pub struct NewsQuery {
    pub year: i32,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub filter: NewsFilter,
}

impl NewsQuery {
    /// Query for `year`, clipped to the project window.
    pub fn for_year(year: i32, window_start: NaiveDate, window_end: NaiveDate, filter: NewsFilter) -> Self {
        let (start, end) = year_bounds(year, window_start, window_end);
        Self {
            year,
            start,
            end,
            filter,
        }
    }

    pub fn table(&self) -> String {
        format!("{RAVENPACK_SCHEMA}.{RAVENPACK_TABLE_PREFIX}{}", self.year)
    }

    fn where_clause(&self, alias: &str) -> String {
        let p = if alias.is_empty() {
            String::new()
        } else {
            format!("{alias}.")
        };
        let mut clause = format!(
            "{p}entity_type = '{entity_type}'\n      AND {p}country_code = '{country}'\n      AND {p}relevance >= {rel}\n      AND {p}timestamp_utc >= '{start}'\n      AND {p}timestamp_utc < '{end}'::date + interval '1 day'",
            entity_type = escape(&self.filter.entity_type),
            country = escape(&self.filter.country_code),
            rel = self.filter.min_relevance,
            start = self.start,
            end = self.end,
        );
        if self.filter.event_only {
            clause.push_str(&format!("\n      AND {p}event_sentiment_score IS NOT NULL"));
        }
        clause
    }

    /// Render the SQL. The CTE keeps provider stories that mention exactly
    /// one distinct entity; the outer select joins back to pull every
    /// event row of those stories.
    pub fn to_sql(&self) -> String {
        let table = self.table();
        let select = NEWS_SELECT
            .iter()
            .map(|(alias, expr)| format!("t.{expr} AS {alias}"))
            .collect::<Vec<_>>()
            .join(",\n    ");
        let limit = self
            .filter
            .limit
            .map(|n| format!("\nLIMIT {n}"))
            .unwrap_or_default();

        format!(
            "WITH single_firm AS (
    SELECT provider_id, provider_story_id
    FROM {table}
    WHERE {inner}
    GROUP BY provider_id, provider_story_id
    HAVING COUNT(DISTINCT rp_entity_id) = 1
)
SELECT
    {select}
FROM {table} t
JOIN single_firm s
  ON t.provider_id = s.provider_id
 AND t.provider_story_id = s.provider_story_id
WHERE {outer}{limit}",
            inner = self.where_clause(""),
            outer = self.where_clause("t"),
        )
    }
}

/// How the RavenPack ISIN is cut down to an 8-character CUSIP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDerivation {
    /// Zero-based offset into the source key.
    pub offset: usize,
    pub len: usize,
}

impl Default for KeyDerivation {
    /// ISIN `US5949181045` -> CUSIP8 `59491810`.
    fn default() -> Self {
        Self { offset: 2, len: 8 }
    }
}

/// Crosswalk SQL: CRSP historical NCUSIP matched against a substring of the
/// RavenPack ISIN, null and empty keys excluded.
pub fn crosswalk_query(key: KeyDerivation) -> String {
    format!(
        "SELECT DISTINCT
    a.permno::bigint AS permno,
    b.rp_entity_id::text AS rp_entity_id
FROM crsp.dse AS a
JOIN rpna.wrds_rpa_company_names AS b
  ON a.ncusip = SUBSTRING(b.isin FROM {from} FOR {len})
WHERE a.ncusip IS NOT NULL
  AND a.ncusip <> ''
  AND b.isin IS NOT NULL
  AND b.isin <> ''
  AND b.rp_entity_id IS NOT NULL
  AND b.rp_entity_id <> ''",
        // SQL SUBSTRING is 1-based
        from = key.offset + 1,
        len = key.len,
    )
}

/// CRSP daily stock file with name history (share codes 10/11) and
/// same-month delisting info.
pub fn crsp_daily_query(start: NaiveDate, end: NaiveDate) -> String {
    format!(
        "SELECT
    dsf.date::date AS date,
    dsf.permno::bigint AS permno,
    dsf.permco::bigint AS permco,
    dsf.cusip::text AS cusip,
    dsf.ret::float8 AS ret,
    dsf.retx::float8 AS retx,
    dsf.prc::float8 AS prc,
    dsf.openprc::float8 AS openprc,
    dsf.vol::float8 AS vol,
    dsf.shrout::float8 AS shrout,
    dsf.cfacshr::float8 AS cfacshr,
    dsf.cfacpr::float8 AS cfacpr,
    msedelist.dlret::float8 AS dlret,
    msedelist.dlretx::float8 AS dlretx,
    msedelist.dlstcd::int4 AS dlstcd
FROM crsp.dsf AS dsf
LEFT JOIN crsp.msenames AS msenames
  ON dsf.permno = msenames.permno
 AND msenames.namedt <= dsf.date
 AND dsf.date <= msenames.nameendt
LEFT JOIN crsp.msedelist AS msedelist
  ON dsf.permno = msedelist.permno
 AND date_trunc('month', dsf.date)::date = date_trunc('month', msedelist.dlstdt)::date
WHERE dsf.date BETWEEN '{start}' AND '{end}'
  AND msenames.shrcd IN (10, 11)"
    )
}

fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn interior_year_uses_full_calendar() {
        let (lo, hi) = year_bounds(2010, d(2000, 1, 1), d(2019, 6, 30));
        assert_eq!((lo, hi), (d(2010, 1, 1), d(2010, 12, 31)));
    }

    #[test]
    fn edge_years_are_clipped() {
        let (lo, _) = year_bounds(2000, d(2000, 3, 15), d(2019, 6, 30));
        assert_eq!(lo, d(2000, 3, 15));
        let (_, hi) = year_bounds(2019, d(2000, 3, 15), d(2019, 6, 30));
        assert_eq!(hi, d(2019, 6, 30));
    }

    #[test]
    fn single_year_window_clips_both_ends() {
        let bounds = year_bounds(2015, d(2015, 2, 1), d(2015, 8, 31));
        assert_eq!(bounds, (d(2015, 2, 1), d(2015, 8, 31)));
    }

    #[test]
    fn news_query_targets_year_table_and_window() {
        let q = NewsQuery::for_year(2019, d(2000, 1, 1), d(2019, 6, 30), NewsFilter::default());
        let sql = q.to_sql();

        assert!(sql.contains("FROM ravenpack_dj.rpa_djpr_equities_2019 t"));
        assert!(sql.contains("timestamp_utc >= '2019-01-01'"));
        assert!(sql.contains("timestamp_utc < '2019-06-30'::date + interval '1 day'"));
        assert!(sql.contains("HAVING COUNT(DISTINCT rp_entity_id) = 1"));
        assert!(sql.contains("\"group\"::text AS rp_group"));
        for column in [
            "event_similarity_key",
            "event_similarity_days",
            "property",
            "fact_level",
            "rp_source_id",
        ] {
            assert!(sql.contains(&format!(" AS {column},")), "{column} not selected");
        }
        assert!(!sql.contains("LIMIT"));
        assert!(!sql.contains("event_sentiment_score IS NOT NULL"));
    }

    #[test]
    fn news_query_options_render() {
        let filter = NewsFilter {
            event_only: true,
            limit: Some(10_000),
            ..NewsFilter::default()
        };
        let sql = NewsQuery::for_year(2005, d(2000, 1, 1), d(2019, 6, 30), filter).to_sql();

        // once in the CTE, once in the outer select
        assert_eq!(sql.matches("event_sentiment_score IS NOT NULL").count(), 2);
        assert!(sql.ends_with("LIMIT 10000"));
    }

    #[test]
    fn filter_values_are_quoted() {
        let filter = NewsFilter {
            country_code: "O'X".into(),
            ..NewsFilter::default()
        };
        let sql = NewsQuery::for_year(2005, d(2005, 1, 1), d(2005, 12, 31), filter).to_sql();
        assert!(sql.contains("country_code = 'O''X'"));
    }

    #[test]
    fn crosswalk_query_uses_one_based_substring() {
        let sql = crosswalk_query(KeyDerivation::default());
        assert!(sql.contains("SUBSTRING(b.isin FROM 3 FOR 8)"));
        assert!(sql.contains("a.ncusip <> ''"));
    }

    #[test]
    fn crsp_query_restricts_share_codes() {
        let sql = crsp_daily_query(d(2000, 1, 1), d(2019, 6, 30));
        assert!(sql.contains("BETWEEN '2000-01-01' AND '2019-06-30'"));
        assert!(sql.contains("shrcd IN (10, 11)"));
    }
}
