//! RavenPack entity -> CRSP PERMNO crosswalk.
//!
//! CRSP's historical NCUSIP is matched against characters 3..=10 of the
//! RavenPack ISIN (the issuer+issue part of a US ISIN). Rows with a null or
//! empty key on either side are excluded, and the result is deduplicated on
//! (permno, rp_entity_id). One-to-many links are kept as they are.

use crate::cache::write_parquet_atomic;
use crate::error::Result;
use crate::query::{crosswalk_query, KeyDerivation};
use crate::records::crosswalk_to_dataframe;
use crate::retry::RetryPolicy;
use crate::schema::{require_lazy_columns, CROSSWALK_COLUMNS, ENTITY_ID, ISIN, NCUSIP, PERMNO};
use crate::warehouse::Warehouse;
use polars::prelude::*;
use std::path::Path;

/// Pull the crosswalk from the warehouse and write it to `out_path`.
pub fn build_crosswalk(
    warehouse: &dyn Warehouse,
    key: KeyDerivation,
    retry: &RetryPolicy,
    out_path: &Path,
) -> Result<DataFrame> {
    let sql = crosswalk_query(key);
    let rows = retry.run("crosswalk", |_| warehouse.crosswalk(&sql))?;
    let raw = crosswalk_to_dataframe(&rows)?;
    let mut xw = dedupe_pairs(raw.lazy()).collect()?;

    write_parquet_atomic(&mut xw, out_path)?;
    tracing::info!(links = xw.height(), output = %out_path.display(), "crosswalk saved");
    Ok(xw)
}

/// Derive the crosswalk locally.
///
/// `names` needs `permno` and `ncusip`; `companies` needs `rp_entity_id`
/// and `isin`.
pub fn derive_crosswalk(
    mut names: LazyFrame,
    mut companies: LazyFrame,
    key: KeyDerivation,
) -> Result<LazyFrame> {
    require_lazy_columns(&mut names, &[PERMNO, NCUSIP], "CRSP names")?;
    require_lazy_columns(&mut companies, &[ENTITY_ID, ISIN], "RavenPack companies")?;

    let names = names
        .select([col(PERMNO), col(NCUSIP)])
        .filter(non_empty(NCUSIP));

    let companies = companies
        .filter(non_empty(ISIN).and(non_empty(ENTITY_ID)))
        .select([
            col(ENTITY_ID),
            col(ISIN)
                .str()
                .slice(lit(key.offset as i64), lit(key.len as u64))
                .alias("cusip8"),
        ]);

    let joined = names
        .join(
            companies,
            [col(NCUSIP)],
            [col("cusip8")],
            JoinArgs::new(JoinType::Inner),
        )
        .select([col(PERMNO), col(ENTITY_ID)]);

    Ok(dedupe_pairs(joined))
}

/// Drop duplicate (permno, rp_entity_id) pairs, keeping first-seen order.
pub fn dedupe_pairs(lf: LazyFrame) -> LazyFrame {
    lf.unique_stable(
        Some(vec![PERMNO.into(), ENTITY_ID.into()]),
        UniqueKeepStrategy::First,
    )
}

fn non_empty(name: &str) -> Expr {
    col(name).is_not_null().and(col(name).neq(lit("")))
}

/// Fan-out of the crosswalk in both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrosswalkStats {
    pub links: usize,
    /// Entity ids linked to more than one permno.
    pub entities_with_many_permnos: usize,
    /// Permnos linked to more than one entity id.
    pub permnos_with_many_entities: usize,
}

pub fn crosswalk_stats(xw: &DataFrame) -> Result<CrosswalkStats> {
    crate::schema::require_columns(&xw.schema(), &CROSSWALK_COLUMNS, "crosswalk")?;

    let fan_out = |key: &str, other: &str| -> Result<usize> {
        let counts = xw
            .clone()
            .lazy()
            .group_by([col(key)])
            .agg([col(other).n_unique().alias("n")])
            .filter(col("n").gt(lit(1u32)))
            .collect()?;
        Ok(counts.height())
    };

    Ok(CrosswalkStats {
        links: xw.height(),
        entities_with_many_permnos: fan_out(ENTITY_ID, PERMNO)?,
        permnos_with_many_entities: fan_out(PERMNO, ENTITY_ID)?,
    })
}
