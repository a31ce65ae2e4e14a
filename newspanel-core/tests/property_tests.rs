//! Property tests for pipeline invariants.
//!
//! Uses proptest to verify:
//! 1. Year bounds: clipped only at the window edges, always inside the year
//! 2. Crosswalk: never contains a duplicate (permno, rp_entity_id) pair
//! 3. Left attach: output row count equals input row count
//! 4. Retry: a persistently transient failure is tried exactly max_attempts times

use chrono::{Datelike, NaiveDate};
use newspanel_core::crosswalk::derive_crosswalk;
use newspanel_core::merge::attach_permno;
use newspanel_core::query::{year_bounds, KeyDerivation};
use newspanel_core::{JoinMode, PipelineError, RetryPolicy};
use polars::prelude::*;
use proptest::prelude::*;
use std::cell::Cell;
use std::collections::HashSet;

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_date() -> impl Strategy<Value = NaiveDate> {
    (1995..2025i32, 1..=365u32).prop_map(|(y, doy)| {
        NaiveDate::from_yo_opt(y, doy).unwrap()
    })
}

fn arb_window() -> impl Strategy<Value = (NaiveDate, NaiveDate)> {
    (arb_date(), arb_date()).prop_map(|(a, b)| if a <= b { (a, b) } else { (b, a) })
}

/// Small key alphabet so joins actually collide.
fn arb_cusip() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["59491810", "03783310", "46625H10", ""]).prop_map(String::from)
}

fn arb_entity() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["E1", "E2", "E3", "E4"]).prop_map(String::from)
}

// ── 1. Year bounds ───────────────────────────────────────────────────

proptest! {
    #[test]
    fn year_bounds_stay_inside_window_and_year((start, end) in arb_window()) {
        for year in start.year()..=end.year() {
            let (lo, hi) = year_bounds(year, start, end);
            prop_assert!(lo <= hi);
            prop_assert!(lo >= start && hi <= end);
            prop_assert_eq!(lo.year(), year);
            prop_assert_eq!(hi.year(), year);

            if year > start.year() {
                prop_assert_eq!((lo.month(), lo.day()), (1, 1));
            }
            if year < end.year() {
                prop_assert_eq!((hi.month(), hi.day()), (12, 31));
            }
        }
    }
}

// ── 2. Crosswalk has no duplicate pairs ──────────────────────────────

proptest! {
    #[test]
    fn crosswalk_pairs_are_unique(
        names in prop::collection::vec((1i64..6, arb_cusip()), 0..20),
        companies in prop::collection::vec((arb_entity(), arb_cusip()), 0..20),
    ) {
        let names_df = df!(
            "permno" => names.iter().map(|n| n.0).collect::<Vec<_>>(),
            "ncusip" => names.iter().map(|n| n.1.clone()).collect::<Vec<_>>(),
        ).unwrap();
        let companies_df = df!(
            "rp_entity_id" => companies.iter().map(|c| c.0.clone()).collect::<Vec<_>>(),
            "isin" => companies.iter().map(|c| format!("US{}45", c.1)).collect::<Vec<_>>(),
        ).unwrap();

        let xw = derive_crosswalk(names_df.lazy(), companies_df.lazy(), KeyDerivation::default())
            .unwrap()
            .collect()
            .unwrap();

        let permnos = xw.column("permno").unwrap().i64().unwrap();
        let ids = xw.column("rp_entity_id").unwrap().str().unwrap();
        let mut seen = HashSet::new();
        for (p, e) in permnos.into_iter().zip(ids.into_iter()) {
            prop_assert!(seen.insert((p, e.map(str::to_string))), "duplicate pair {:?} {:?}", p, e);
        }
    }
}

// ── 3. Left attach preserves row count ───────────────────────────────

proptest! {
    #[test]
    fn left_attach_preserves_rows(
        stories in prop::collection::vec(arb_entity(), 0..30),
        links in prop::collection::vec((1i64..6, arb_entity()), 0..12),
    ) {
        let n = stories.len();
        let news = df!(
            "timestamp_utc" => (0..n as i64).map(|i| i * 3_600_000_000).collect::<Vec<_>>(),
            "rp_story_id" => (0..n).map(|i| format!("S{i}")).collect::<Vec<_>>(),
            "rp_entity_id" => stories,
        )
        .unwrap()
        .lazy()
        .with_column(col("timestamp_utc").cast(DataType::Datetime(TimeUnit::Microseconds, None)));
        let xw = df!(
            "permno" => links.iter().map(|l| l.0).collect::<Vec<_>>(),
            "rp_entity_id" => links.iter().map(|l| l.1.clone()).collect::<Vec<_>>(),
        )
        .unwrap()
        .lazy();

        let left = attach_permno(news.clone(), xw.clone(), JoinMode::Left).unwrap().collect().unwrap();
        let inner = attach_permno(news, xw, JoinMode::Inner).unwrap().collect().unwrap();

        prop_assert_eq!(left.height(), n);
        prop_assert!(inner.height() <= n);
        prop_assert_eq!(inner.height(), n - left.column("permno").unwrap().null_count());
    }
}

// ── 4. Retry ceiling ─────────────────────────────────────────────────

proptest! {
    #[test]
    fn transient_failures_use_every_attempt(max in 1u32..8) {
        let calls = Cell::new(0u32);
        let result: Result<(), _> = RetryPolicy::immediate(max).run("prop", |_| {
            calls.set(calls.get() + 1);
            Err(PipelineError::Network("down".into()))
        });

        prop_assert_eq!(calls.get(), max);
        let exhausted = matches!(result, Err(PipelineError::RetriesExhausted { attempts, .. }) if attempts == max);
        prop_assert!(exhausted);
    }

    #[test]
    fn permanent_failures_are_not_retried(max in 1u32..8) {
        let calls = Cell::new(0u32);
        let result: Result<(), _> = RetryPolicy::immediate(max).run("prop", |_| {
            calls.set(calls.get() + 1);
            Err(PipelineError::Validation("bad".into()))
        });

        prop_assert_eq!(calls.get(), 1);
        prop_assert!(matches!(result, Err(PipelineError::Validation(_))));
    }
}
