//! Pipeline configuration.
//!
//! One `PipelineConfig` is built at startup and passed by reference into
//! every stage. It can be read from a TOML file, and the environment
//! variables `DATA_DIR`, `WRDS_USERNAME`, `START_DATE` and `END_DATE`
//! override whatever the file says.

use crate::error::{PipelineError, Result};
use crate::retry::{Backoff, RetryPolicy};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for all pipeline stages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root directory for every persisted stage output.
    pub data_dir: PathBuf,

    /// WRDS account name.
    pub wrds_username: String,

    /// First day of the project window (inclusive).
    pub start_date: NaiveDate,

    /// Last day of the project window (inclusive).
    pub end_date: NaiveDate,

    pub wrds: WrdsSettings,

    pub retry: RetrySettings,
}

/// Connection settings for the WRDS Postgres endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WrdsSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
}

/// Retry settings, turned into a [`RetryPolicy`] by [`PipelineConfig::retry_policy`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub delay_secs: u64,
    /// Double the delay after every failed attempt instead of keeping it fixed.
    pub exponential: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("_data"),
            wrds_username: String::new(),
            start_date: NaiveDate::from_ymd_opt(2000, 1, 1).expect("valid date"),
            end_date: NaiveDate::from_ymd_opt(2019, 6, 30).expect("valid date"),
            wrds: WrdsSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl Default for WrdsSettings {
    fn default() -> Self {
        Self {
            host: "wrds-pgdata.wharton.upenn.edu".into(),
            port: 9737,
            database: "wrds".into(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_secs: 30,
            exponential: false,
        }
    }
}

impl PipelineConfig {
    /// Load a config from a TOML file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| PipelineError::Config(format!("parse TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `DATA_DIR`, `WRDS_USERNAME`, `START_DATE` and `END_DATE` from the environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(dir) = lookup("DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(user) = lookup("WRDS_USERNAME") {
            self.wrds_username = user;
        }
        if let Some(start) = lookup("START_DATE") {
            self.start_date = parse_date("START_DATE", &start)?;
        }
        if let Some(end) = lookup("END_DATE") {
            self.end_date = parse_date("END_DATE", &end)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject windows that end before they start.
    pub fn validate(&self) -> Result<()> {
        if self.end_date < self.start_date {
            return Err(PipelineError::Config(format!(
                "end_date {} is before start_date {}",
                self.end_date, self.start_date
            )));
        }
        Ok(())
    }

    /// Calendar years touched by the project window.
    pub fn years(&self) -> std::ops::RangeInclusive<i32> {
        self.start_date.year()..=self.end_date.year()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let delay = Duration::from_secs(self.retry.delay_secs);
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            backoff: if self.retry.exponential {
                Backoff::Exponential { base: delay }
            } else {
                Backoff::Fixed(delay)
            },
        }
    }

    pub fn layout(&self) -> DataLayout {
        DataLayout::new(&self.data_dir)
    }
}

fn parse_date(key: &str, value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|e| PipelineError::Config(format!("{key}={value}: {e}")))
}

/// Fixed file names of every stage output under the data directory.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one Parquet file per pulled year.
    pub fn news_years_dir(&self) -> PathBuf {
        self.root.join("ravenpack_djpr")
    }

    pub fn news(&self) -> PathBuf {
        self.root.join("ravenpack_djpr.parquet")
    }

    pub fn crosswalk(&self) -> PathBuf {
        self.root.join("raven_crsp_crosswalk.parquet")
    }

    pub fn news_with_permno(&self) -> PathBuf {
        self.root.join("ravenpack_djpr_with_permno.parquet")
    }

    pub fn crsp_daily(&self) -> PathBuf {
        self.root.join("CRSP_DAILY_PAPER_UNIVERSE.parquet")
    }

    pub fn merged(&self) -> PathBuf {
        self.root.join("ravenpack_crsp_merged.parquet")
    }

    pub fn russell_1000(&self) -> PathBuf {
        self.root.join("RUSSELL_1000_CONSTITUENTS.parquet")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_paper_window() {
        let config = PipelineConfig::default();
        assert_eq!(config.start_date, NaiveDate::from_ymd_opt(2000, 1, 1).unwrap());
        assert_eq!(config.end_date, NaiveDate::from_ymd_opt(2019, 6, 30).unwrap());
        assert_eq!(config.years().count(), 20);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
data_dir = "/tmp/panel"
wrds_username = "jdoe"

[retry]
max_attempts = 5
"#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/panel"));
        assert_eq!(config.wrds_username, "jdoe");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.delay_secs, 30);
        assert_eq!(config.wrds.port, 9737);
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("DATA_DIR", "/data/override"),
            ("START_DATE", "2005-03-01"),
            ("END_DATE", "2006-12-31"),
        ]
        .into_iter()
        .collect();

        let config = PipelineConfig::default()
            .with_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/data/override"));
        assert_eq!(config.years().collect::<Vec<_>>(), vec![2005, 2006]);
    }

    #[test]
    fn bad_date_override_is_config_error() {
        let result = PipelineConfig::default()
            .with_overrides(|k| (k == "END_DATE").then(|| "30/06/2019".to_string()));
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn inverted_window_rejected() {
        let result = PipelineConfig::from_toml(
            r#"
start_date = "2019-01-01"
end_date = "2018-01-01"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn layout_paths_live_under_data_dir() {
        let layout = DataLayout::new("/d");
        assert_eq!(layout.merged(), PathBuf::from("/d/ravenpack_crsp_merged.parquet"));
        assert_eq!(layout.news_years_dir(), PathBuf::from("/d/ravenpack_djpr"));
    }
}
