//! Data warehouse abstraction.
//!
//! The `Warehouse` trait hides the vendor connection so the fetch loop and
//! the crosswalk builder can run against WRDS in production and against an
//! in-memory fake in tests. Implementations execute already-rendered SQL
//! and return typed rows; they know nothing about caching.

pub mod wrds;

pub use wrds::WrdsWarehouse;

use crate::error::Result;
use crate::records::{CrosswalkEntry, NewsRecord, PriceRow};

pub trait Warehouse {
    /// Human-readable name of this warehouse.
    fn name(&self) -> &str;

    /// Run a RavenPack pull.
    fn news(&self, sql: &str) -> Result<Vec<NewsRecord>>;

    /// Run a crosswalk query.
    fn crosswalk(&self, sql: &str) -> Result<Vec<CrosswalkEntry>>;

    /// Run a CRSP daily pull.
    fn prices(&self, sql: &str) -> Result<Vec<PriceRow>>;
}

impl<W: Warehouse + ?Sized> Warehouse for &W {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn news(&self, sql: &str) -> Result<Vec<NewsRecord>> {
        (**self).news(sql)
    }

    fn crosswalk(&self, sql: &str) -> Result<Vec<CrosswalkEntry>> {
        (**self).crosswalk(sql)
    }

    fn prices(&self, sql: &str) -> Result<Vec<PriceRow>> {
        (**self).prices(sql)
    }
}
