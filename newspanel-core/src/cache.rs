//! Per-year Parquet cache and atomic Parquet I/O.
//!
//! Layout: `{dir}/{year}.parquet` plus a `{year}.meta.json` sidecar.
//!
//! - Atomic writes (write to .tmp, rename into place)
//! - A year counts as cached only once both its Parquet file and its
//!   sidecar exist, so an interrupted pull leaves nothing behind to
//!   confuse the next run
//! - Metadata sidecar per year (window, pull parameters, row count,
//!   BLAKE3 hash, source)

use crate::error::{PipelineError, Result};
use crate::query::NewsFilter;
use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Query parameters that shaped a cached year.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PullParams {
    pub filter: NewsFilter,
    pub one_row_per_story: bool,
}

/// Metadata sidecar for one cached year.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct YearMeta {
    pub year: i32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Absent in sidecars that predate it; such years never match.
    #[serde(default)]
    pub params: Option<PullParams>,
    pub rows: usize,
    pub data_hash: String,
    pub source: String,
    pub pulled_at: chrono::NaiveDateTime,
}

/// Directory of per-year Parquet files.
#[derive(Debug, Clone)]
pub struct YearCache {
    dir: PathBuf,
}

impl YearCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `{dir}/{year}.parquet`
    pub fn year_path(&self, year: i32) -> PathBuf {
        self.dir.join(format!("{year}.parquet"))
    }

    fn meta_path(&self, year: i32) -> PathBuf {
        self.dir.join(format!("{year}.meta.json"))
    }

    /// Both the Parquet file and its sidecar are on disk.
    pub fn contains(&self, year: i32) -> bool {
        self.year_path(year).is_file() && self.meta_path(year).is_file()
    }

    /// `year` is cached and was pulled over `window` with `params`.
    pub fn is_current(
        &self,
        year: i32,
        window: (NaiveDate, NaiveDate),
        params: &PullParams,
    ) -> bool {
        if !self.year_path(year).is_file() {
            return false;
        }
        self.get_meta(year).is_some_and(|meta| {
            (meta.start_date, meta.end_date) == window && meta.params.as_ref() == Some(params)
        })
    }

    /// Persist one year's frame and its sidecar.
    ///
    /// The Parquet file goes first; the year only counts as cached once the
    /// sidecar has been renamed into place after it.
    pub fn write(
        &self,
        year: i32,
        window: (NaiveDate, NaiveDate),
        params: &PullParams,
        source: &str,
        df: &mut DataFrame,
    ) -> Result<YearMeta> {
        fs::create_dir_all(&self.dir)?;
        let meta_path = self.meta_path(year);
        // a stale sidecar must not vouch for the file about to replace it
        if meta_path.exists() {
            fs::remove_file(&meta_path)?;
        }
        let data_hash = write_parquet_atomic(df, &self.year_path(year))?;

        let meta = YearMeta {
            year,
            start_date: window.0,
            end_date: window.1,
            params: Some(params.clone()),
            rows: df.height(),
            data_hash,
            source: source.to_string(),
            pulled_at: chrono::Local::now().naive_local(),
        };
        let json = serde_json::to_string_pretty(&meta)
            .map_err(|e| PipelineError::Validation(format!("meta serialization: {e}")))?;
        write_bytes_atomic(json.as_bytes(), &meta_path)?;

        Ok(meta)
    }

    /// Read back one cached year.
    pub fn load(&self, year: i32) -> Result<DataFrame> {
        read_parquet(&self.year_path(year))
    }

    pub fn get_meta(&self, year: i32) -> Option<YearMeta> {
        let content = fs::read_to_string(self.meta_path(year)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Years with a Parquet file on disk, ascending.
    pub fn cached_years(&self) -> Result<Vec<i32>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut years = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
                continue;
            }
            if let Some(year) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i32>().ok())
            {
                years.push(year);
            }
        }
        years.sort_unstable();
        Ok(years)
    }

    /// Paths of the cached files for `years`, ascending. Years without a
    /// complete cache entry are left out with a warning.
    pub fn year_files_in(&self, years: impl IntoIterator<Item = i32>) -> Vec<PathBuf> {
        let mut years: Vec<i32> = years.into_iter().collect();
        years.sort_unstable();
        years.dedup();

        years
            .into_iter()
            .filter(|&year| {
                let cached = self.contains(year);
                if !cached {
                    tracing::warn!(year, dir = %self.dir.display(), "year not cached, left out");
                }
                cached
            })
            .map(|year| self.year_path(year))
            .collect()
    }
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

/// Write `df` to `path` via a `.tmp` sibling and a rename. Returns the
/// BLAKE3 hash of the written bytes.
pub fn write_parquet_atomic(df: &mut DataFrame, path: &Path) -> Result<String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = tmp_path(path);

    let written = (|| -> Result<String> {
        let file = fs::File::create(&tmp_path)?;
        ParquetWriter::new(file)
            .finish(df)
            .map_err(|e| PipelineError::Parquet(format!("write {}: {e}", path.display())))?;
        Ok(blake3::hash(&fs::read(&tmp_path)?).to_hex().to_string())
    })();

    match written {
        Ok(hash) => {
            fs::rename(&tmp_path, path).inspect_err(|_| {
                let _ = fs::remove_file(&tmp_path);
            })?;
            Ok(hash)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            Err(e)
        }
    }
}

/// Write `bytes` to `path` via a `.tmp` sibling and a rename.
pub fn write_bytes_atomic(bytes: &[u8], path: &Path) -> Result<()> {
    let tmp = tmp_path(path);
    fs::write(&tmp, bytes)
        .and_then(|()| fs::rename(&tmp, path))
        .inspect_err(|_| {
            let _ = fs::remove_file(&tmp);
        })?;
    Ok(())
}

/// Row count of a Parquet file, read from its metadata via a lazy scan.
pub fn count_parquet_rows(path: &Path) -> Result<usize> {
    count_rows(scan_parquet(path)?)
}

/// Row count of a lazy frame without materializing its columns.
pub fn count_rows(lf: LazyFrame) -> Result<usize> {
    let df = lf.select([len().alias("n")]).collect()?;
    let n = df.column("n")?.get(0)?.extract::<u64>().unwrap_or(0);
    Ok(n as usize)
}

/// `{path}.tmp`, kept next to the target so the rename stays on one filesystem.
pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Read a whole Parquet file.
pub fn read_parquet(path: &Path) -> Result<DataFrame> {
    let file = fs::File::open(path).map_err(|e| {
        PipelineError::Parquet(format!("open {}: {e}", path.display()))
    })?;
    ParquetReader::new(file)
        .finish()
        .map_err(|e| PipelineError::Parquet(format!("read {}: {e}", path.display())))
}

/// Lazily scan a Parquet file.
pub fn scan_parquet(path: &Path) -> Result<LazyFrame> {
    if !path.is_file() {
        return Err(PipelineError::Parquet(format!(
            "{} does not exist",
            path.display()
        )));
    }
    LazyFrame::scan_parquet(path, ScanArgsParquet::default())
        .map_err(|e| PipelineError::Parquet(format!("scan {}: {e}", path.display())))
}
