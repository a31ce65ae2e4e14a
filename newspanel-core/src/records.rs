//! Typed rows returned by the warehouse, and their conversion to frames.

use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

/// One RavenPack event row. A story can produce several of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NewsRecord {
    pub timestamp_utc: NaiveDateTime,
    pub rp_story_id: String,
    pub rp_entity_id: String,
    pub entity_type: Option<String>,
    pub entity_name: Option<String>,
    pub country_code: Option<String>,
    pub relevance: Option<f64>,
    pub event_sentiment_score: Option<f64>,
    pub event_relevance: Option<f64>,
    /// Groups rows that report the same event.
    pub event_similarity_key: Option<String>,
    /// Days since the last event with the same similarity key.
    pub event_similarity_days: Option<f64>,
    pub topic: Option<String>,
    pub rp_group: Option<String>,
    pub rp_type: Option<String>,
    pub sub_type: Option<String>,
    pub property: Option<String>,
    pub fact_level: Option<String>,
    pub category: Option<String>,
    pub news_type: Option<String>,
    pub rp_source_id: Option<String>,
    pub provider_id: Option<String>,
    pub provider_story_id: Option<String>,
    pub source_name: Option<String>,
    pub headline: Option<String>,
    pub css: Option<f64>,
}

/// A (permno, rp_entity_id) link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::FromRow)]
pub struct CrosswalkEntry {
    pub permno: i64,
    pub rp_entity_id: String,
}

/// One CRSP daily stock file row, as pulled (before preprocessing).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PriceRow {
    pub date: NaiveDate,
    pub permno: i64,
    pub permco: Option<i64>,
    pub cusip: Option<String>,
    pub ret: Option<f64>,
    pub retx: Option<f64>,
    pub prc: Option<f64>,
    pub openprc: Option<f64>,
    pub vol: Option<f64>,
    pub shrout: Option<f64>,
    pub cfacshr: Option<f64>,
    pub cfacpr: Option<f64>,
    pub dlret: Option<f64>,
    pub dlretx: Option<f64>,
    pub dlstcd: Option<i32>,
}

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch is a valid date")
}

fn date_column(name: &str, dates: impl Iterator<Item = NaiveDate>) -> PolarsResult<Column> {
    let days: Vec<i32> = dates.map(|d| (d - epoch()).num_days() as i32).collect();
    Column::new(name.into(), days).cast(&DataType::Date)
}

fn datetime_column(name: &str, stamps: impl Iterator<Item = NaiveDateTime>) -> PolarsResult<Column> {
    let micros: Vec<i64> = stamps.map(|t| t.and_utc().timestamp_micros()).collect();
    Column::new(name.into(), micros).cast(&DataType::Datetime(TimeUnit::Microseconds, None))
}

fn opt_str<T>(rows: &[T], f: impl Fn(&T) -> &Option<String>) -> Vec<Option<String>> {
    rows.iter().map(|r| f(r).clone()).collect()
}

fn opt_f64<T>(rows: &[T], f: impl Fn(&T) -> Option<f64>) -> Vec<Option<f64>> {
    rows.iter().map(f).collect()
}

/// Build the news frame. Column order matches the pull query.
pub fn news_to_dataframe(rows: &[NewsRecord]) -> PolarsResult<DataFrame> {
    DataFrame::new(vec![
        datetime_column("timestamp_utc", rows.iter().map(|r| r.timestamp_utc))?,
        Column::new(
            "rp_story_id".into(),
            rows.iter().map(|r| r.rp_story_id.clone()).collect::<Vec<_>>(),
        ),
        Column::new(
            "rp_entity_id".into(),
            rows.iter().map(|r| r.rp_entity_id.clone()).collect::<Vec<_>>(),
        ),
        Column::new("entity_type".into(), opt_str(rows, |r| &r.entity_type)),
        Column::new("entity_name".into(), opt_str(rows, |r| &r.entity_name)),
        Column::new("country_code".into(), opt_str(rows, |r| &r.country_code)),
        Column::new("relevance".into(), opt_f64(rows, |r| r.relevance)),
        Column::new(
            "event_sentiment_score".into(),
            opt_f64(rows, |r| r.event_sentiment_score),
        ),
        Column::new("event_relevance".into(), opt_f64(rows, |r| r.event_relevance)),
        Column::new(
            "event_similarity_key".into(),
            opt_str(rows, |r| &r.event_similarity_key),
        ),
        Column::new(
            "event_similarity_days".into(),
            opt_f64(rows, |r| r.event_similarity_days),
        ),
        Column::new("topic".into(), opt_str(rows, |r| &r.topic)),
        Column::new("rp_group".into(), opt_str(rows, |r| &r.rp_group)),
        Column::new("rp_type".into(), opt_str(rows, |r| &r.rp_type)),
        Column::new("sub_type".into(), opt_str(rows, |r| &r.sub_type)),
        Column::new("property".into(), opt_str(rows, |r| &r.property)),
        Column::new("fact_level".into(), opt_str(rows, |r| &r.fact_level)),
        Column::new("category".into(), opt_str(rows, |r| &r.category)),
        Column::new("news_type".into(), opt_str(rows, |r| &r.news_type)),
        Column::new("rp_source_id".into(), opt_str(rows, |r| &r.rp_source_id)),
        Column::new("provider_id".into(), opt_str(rows, |r| &r.provider_id)),
        Column::new(
            "provider_story_id".into(),
            opt_str(rows, |r| &r.provider_story_id),
        ),
        Column::new("source_name".into(), opt_str(rows, |r| &r.source_name)),
        Column::new("headline".into(), opt_str(rows, |r| &r.headline)),
        Column::new("css".into(), opt_f64(rows, |r| r.css)),
    ])
}

pub fn crosswalk_to_dataframe(rows: &[CrosswalkEntry]) -> PolarsResult<DataFrame> {
    DataFrame::new(vec![
        Column::new(
            "permno".into(),
            rows.iter().map(|r| r.permno).collect::<Vec<_>>(),
        ),
        Column::new(
            "rp_entity_id".into(),
            rows.iter().map(|r| r.rp_entity_id.clone()).collect::<Vec<_>>(),
        ),
    ])
}

pub fn prices_to_dataframe(rows: &[PriceRow]) -> PolarsResult<DataFrame> {
    DataFrame::new(vec![
        date_column("date", rows.iter().map(|r| r.date))?,
        Column::new(
            "permno".into(),
            rows.iter().map(|r| r.permno).collect::<Vec<_>>(),
        ),
        Column::new(
            "permco".into(),
            rows.iter().map(|r| r.permco).collect::<Vec<_>>(),
        ),
        Column::new("cusip".into(), opt_str(rows, |r| &r.cusip)),
        Column::new("ret".into(), opt_f64(rows, |r| r.ret)),
        Column::new("retx".into(), opt_f64(rows, |r| r.retx)),
        Column::new("prc".into(), opt_f64(rows, |r| r.prc)),
        Column::new("openprc".into(), opt_f64(rows, |r| r.openprc)),
        Column::new("vol".into(), opt_f64(rows, |r| r.vol)),
        Column::new("shrout".into(), opt_f64(rows, |r| r.shrout)),
        Column::new("cfacshr".into(), opt_f64(rows, |r| r.cfacshr)),
        Column::new("cfacpr".into(), opt_f64(rows, |r| r.cfacpr)),
        Column::new("dlret".into(), opt_f64(rows, |r| r.dlret)),
        Column::new("dlretx".into(), opt_f64(rows, |r| r.dlretx)),
        Column::new(
            "dlstcd".into(),
            rows.iter().map(|r| r.dlstcd).collect::<Vec<_>>(),
        ),
    ])
}
