//! Combine per-year files into one Parquet file.
//!
//! Only the requested years are read; other files in the cache directory
//! are left alone.
//!
//! [`combine_streaming`] holds one input in memory at a time and appends it
//! to a batched Parquet writer; use it for full pulls. [`combine_in_memory`]
//! concatenates everything first and is only meant for small datasets.

use crate::cache::{read_parquet, tmp_path, write_parquet_atomic, YearCache};
use crate::error::{PipelineError, Result};
use crate::schema::describe;
use polars::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

/// Result of a combine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombineSummary {
    pub output: PathBuf,
    pub files: usize,
    pub rows: usize,
}

/// Stream the cached files for `years` into `out_path`.
pub fn combine_streaming(
    cache: &YearCache,
    years: impl IntoIterator<Item = i32>,
    out_path: &Path,
) -> Result<CombineSummary> {
    let inputs = cache.year_files_in(years);
    combine_files_streaming(&inputs, out_path, &cache.dir().display().to_string())
}

/// Stream `inputs` into `out_path`, in order.
///
/// Every input must have the same columns and types as the first one.
/// The output appears only after all inputs were written.
pub fn combine_files_streaming(
    inputs: &[PathBuf],
    out_path: &Path,
    origin: &str,
) -> Result<CombineSummary> {
    let Some((first_path, rest)) = inputs.split_first() else {
        return Err(PipelineError::EmptyInput(format!("no per-year files in {origin}")));
    };

    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(out_path);

    let streamed = (|| -> Result<usize> {
        let first = read_parquet(first_path)?;
        let expected = describe(&first);
        let schema = first.schema().clone();

        let file = fs::File::create(&tmp)?;
        let mut writer = ParquetWriter::new(file)
            .batched(&schema)
            .map_err(|e| PipelineError::Parquet(format!("open batched writer: {e}")))?;

        writer.write_batch(&first)?;
        let mut rows = first.height();
        tracing::debug!(file = %first_path.display(), rows, "appended");
        drop(first);

        for path in rest {
            let df = read_parquet(path)?;
            let found = describe(&df);
            if found != expected {
                return Err(PipelineError::SchemaMismatch {
                    path: path.display().to_string(),
                    expected,
                    found,
                });
            }
            writer.write_batch(&df)?;
            rows += df.height();
            tracing::debug!(file = %path.display(), rows = df.height(), "appended");
        }

        writer.finish()?;
        Ok(rows)
    })();

    match streamed {
        Ok(rows) => {
            fs::rename(&tmp, out_path)?;
            tracing::info!(
                files = inputs.len(),
                rows,
                output = %out_path.display(),
                "combined"
            );
            Ok(CombineSummary {
                output: out_path.to_path_buf(),
                files: inputs.len(),
                rows,
            })
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

/// Load the cached files for `years`, concatenate, and write once.
///
/// Peak memory is the whole dataset. Prefer [`combine_streaming`].
pub fn combine_in_memory(
    cache: &YearCache,
    years: impl IntoIterator<Item = i32>,
    out_path: &Path,
) -> Result<CombineSummary> {
    let inputs = cache.year_files_in(years);
    if inputs.is_empty() {
        return Err(PipelineError::EmptyInput(format!(
            "no per-year files in {}",
            cache.dir().display()
        )));
    }

    let frames = inputs
        .iter()
        .map(|p| read_parquet(p).map(IntoLazy::lazy))
        .collect::<Result<Vec<_>>>()?;
    let mut all = concat(frames, UnionArgs::default())?.collect()?;
    write_parquet_atomic(&mut all, out_path)?;

    Ok(CombineSummary {
        output: out_path.to_path_buf(),
        files: inputs.len(),
        rows: all.height(),
    })
}
