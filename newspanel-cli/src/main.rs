//! newspanel CLI: pull, combine, link, and merge commands.
//!
//! Commands:
//! - `pull news`: per-year RavenPack pull into the year cache
//! - `pull crsp`: CRSP daily file, preprocessed and cut to the top 1000
//! - `pull russell`: iShares IWB holdings as Russell 1000 constituents
//! - `combine`: stream the per-year files into one Parquet file
//! - `link crosswalk` / `link attach` / `link merge`: entity -> PERMNO -> prices
//! - `status`: report which stage outputs exist
//! - `all`: every stage in order

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use newspanel_core::cache::{count_parquet_rows, YearCache};
use newspanel_core::combine::{combine_in_memory, combine_streaming, CombineSummary};
use newspanel_core::crosswalk::{build_crosswalk, crosswalk_stats};
use newspanel_core::fetch::{pull_news_years, LogProgress, PullOptions, PullSummary};
use newspanel_core::holdings::{pull_russell_1000, IsharesClient};
use newspanel_core::merge::{attach_permno_file, merge_with_prices_file, MergeSummary};
use newspanel_core::prices::pull_crsp_daily;
use newspanel_core::query::{KeyDerivation, NewsFilter};
use newspanel_core::warehouse::WrdsWarehouse;
use newspanel_core::{JoinMode, PipelineConfig};
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "newspanel",
    about = "newspanel CLI: RavenPack news x CRSP daily panel builder"
)]
struct Cli {
    /// Path to a TOML config file. Environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory; overrides the config file and DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// First day of the window (YYYY-MM-DD).
    #[arg(long, global = true)]
    start: Option<String>,

    /// Last day of the window (YYYY-MM-DD).
    #[arg(long, global = true)]
    end: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pull source data from WRDS or iShares.
    Pull {
        #[command(subcommand)]
        source: PullSource,
    },
    /// Combine the per-year news files into one Parquet file.
    Combine {
        /// Concatenate in memory instead of streaming. Small datasets only.
        #[arg(long, default_value_t = false)]
        in_memory: bool,
    },
    /// Crosswalk and merge steps.
    Link {
        #[command(subcommand)]
        step: LinkStep,
    },
    /// Report which stage outputs exist.
    Status {
        /// Print the per-year metadata as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Run every stage in order.
    All {
        #[command(flatten)]
        news: NewsArgs,

        /// Join mode for both merge steps: left or inner.
        #[arg(long, default_value = "left")]
        how: String,
    },
}

#[derive(Subcommand)]
enum PullSource {
    /// RavenPack stories, one cached file per year.
    News {
        #[command(flatten)]
        args: NewsArgs,
    },
    /// CRSP daily stock file and the top-1000 universe.
    Crsp,
    /// Russell 1000 constituents from iShares IWB holdings.
    Russell,
}

#[derive(clap::Args)]
struct NewsArgs {
    /// Re-pull years that are already cached.
    #[arg(long, default_value_t = false)]
    force: bool,

    /// Only rows with an event sentiment score.
    #[arg(long, default_value_t = false)]
    event_only: bool,

    /// Row cap per year, for trial runs.
    #[arg(long)]
    limit: Option<u64>,

    /// Keep only the first row of each story.
    #[arg(long, default_value_t = false)]
    one_row_per_story: bool,

    /// Minimum RavenPack relevance (0-100).
    #[arg(long, default_value_t = 90.0)]
    min_relevance: f64,
}

#[derive(Subcommand)]
enum LinkStep {
    /// Build the RavenPack entity -> CRSP PERMNO crosswalk.
    Crosswalk,
    /// Attach PERMNO to the combined news file.
    Attach {
        /// left or inner.
        #[arg(long, default_value = "left")]
        how: String,
    },
    /// Merge news-with-permno onto the CRSP daily panel.
    Merge {
        /// left or inner.
        #[arg(long, default_value = "left")]
        how: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Pull { source } => match source {
            PullSource::News { args } => run_pull_news(&config, &args).map(|_| ()),
            PullSource::Crsp => run_pull_crsp(&config),
            PullSource::Russell => run_pull_russell(&config),
        },
        Commands::Combine { in_memory } => run_combine(&config, in_memory).map(|_| ()),
        Commands::Link { step } => match step {
            LinkStep::Crosswalk => run_crosswalk(&config),
            LinkStep::Attach { how } => run_attach(&config, how.parse()?).map(|_| ()),
            LinkStep::Merge { how } => run_merge(&config, how.parse()?).map(|_| ()),
        },
        Commands::Status { json } => run_status(&config, json),
        Commands::All { news, how } => run_all(&config, &news, how.parse()?),
    }
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    }
    .with_env_overrides()?;

    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(start) = &cli.start {
        config.start_date = NaiveDate::parse_from_str(start, "%Y-%m-%d")
            .with_context(|| format!("--start {start}"))?;
    }
    if let Some(end) = &cli.end {
        config.end_date = NaiveDate::parse_from_str(end, "%Y-%m-%d")
            .with_context(|| format!("--end {end}"))?;
    }
    config.validate()?;
    Ok(config)
}

fn connect(config: &PipelineConfig) -> Result<WrdsWarehouse> {
    WrdsWarehouse::connect(config).context("connecting to WRDS (is PGPASSWORD set?)")
}

fn run_pull_news(config: &PipelineConfig, args: &NewsArgs) -> Result<PullSummary> {
    let warehouse = connect(config)?;
    let cache = YearCache::new(config.layout().news_years_dir());
    let opts = PullOptions {
        filter: NewsFilter {
            min_relevance: args.min_relevance,
            event_only: args.event_only,
            limit: args.limit,
            ..NewsFilter::default()
        },
        force: args.force,
        one_row_per_story: args.one_row_per_story,
    };

    let summary = pull_news_years(
        &warehouse,
        &cache,
        config,
        &opts,
        &config.retry_policy(),
        &LogProgress,
    )?;

    println!(
        "Pulled {} year(s), skipped {} cached, {} rows",
        summary.pulled.len(),
        summary.skipped.len(),
        summary.rows_pulled()
    );
    Ok(summary)
}

fn run_pull_crsp(config: &PipelineConfig) -> Result<()> {
    let warehouse = connect(config)?;
    let out = config.layout().crsp_daily();
    let summary = pull_crsp_daily(&warehouse, config, &config.retry_policy(), &out)?;
    println!(
        "CRSP universe: {} of {} rows over {} dates -> {}",
        summary.rows_kept,
        summary.rows_pulled,
        summary.dates,
        out.display()
    );
    Ok(())
}

fn run_pull_russell(config: &PipelineConfig) -> Result<()> {
    let client = IsharesClient::new()?;
    let out = config.layout().russell_1000();
    let n = pull_russell_1000(&client, &config.retry_policy(), &out)?;
    println!("Russell 1000: {n} tickers -> {}", out.display());
    Ok(())
}

fn run_combine(config: &PipelineConfig, in_memory: bool) -> Result<CombineSummary> {
    let layout = config.layout();
    let cache = YearCache::new(layout.news_years_dir());
    let summary = if in_memory {
        combine_in_memory(&cache, config.years(), &layout.news())?
    } else {
        combine_streaming(&cache, config.years(), &layout.news())?
    };
    println!(
        "Combined {} file(s), {} rows -> {}",
        summary.files,
        summary.rows,
        summary.output.display()
    );
    Ok(summary)
}

fn run_crosswalk(config: &PipelineConfig) -> Result<()> {
    let warehouse = connect(config)?;
    let out = config.layout().crosswalk();
    let xw = build_crosswalk(
        &warehouse,
        KeyDerivation::default(),
        &config.retry_policy(),
        &out,
    )?;
    let stats = crosswalk_stats(&xw)?;
    println!("Crosswalk: {} links -> {}", stats.links, out.display());
    println!(
        "  entities with >1 permno: {}, permnos with >1 entity: {}",
        stats.entities_with_many_permnos, stats.permnos_with_many_entities
    );
    Ok(())
}

fn run_attach(config: &PipelineConfig, how: JoinMode) -> Result<MergeSummary> {
    let layout = config.layout();
    let summary = attach_permno_file(
        &layout.news(),
        &layout.crosswalk(),
        &layout.news_with_permno(),
        how,
    )?;
    println!(
        "Attached permno ({how}): {} rows, {:.1}% matched",
        summary.output_rows,
        summary.match_share() * 100.0
    );
    Ok(summary)
}

fn run_merge(config: &PipelineConfig, how: JoinMode) -> Result<MergeSummary> {
    let layout = config.layout();
    let summary = merge_with_prices_file(
        &layout.news_with_permno(),
        &layout.crsp_daily(),
        &layout.merged(),
        how,
    )?;
    println!(
        "Merged with CRSP ({how}): {} rows, {:.1}% with prices -> {}",
        summary.output_rows,
        summary.match_share() * 100.0,
        layout.merged().display()
    );
    Ok(summary)
}

fn run_all(config: &PipelineConfig, news: &NewsArgs, how: JoinMode) -> Result<()> {
    run_pull_news(config, news)?;
    run_combine(config, false)?;
    run_crosswalk(config)?;
    run_pull_crsp(config)?;
    run_attach(config, how)?;
    run_merge(config, how)?;
    Ok(())
}

fn run_status(config: &PipelineConfig, json: bool) -> Result<()> {
    let layout = config.layout();
    let cache = YearCache::new(layout.news_years_dir());
    let years = cache.cached_years()?;

    if json {
        let metas: Vec<_> = years.iter().filter_map(|&y| cache.get_meta(y)).collect();
        println!("{}", serde_json::to_string_pretty(&metas)?);
        return Ok(());
    }

    println!("Data dir: {}", layout.root().display());
    println!(
        "Window:   {} to {}",
        config.start_date, config.end_date
    );
    println!();
    println!("{:<6} {:<25} {:>10} {:>10}", "Year", "Window", "Rows", "Size");
    println!("{}", "-".repeat(54));
    for year in config.years() {
        let (window, rows) = match cache.get_meta(year) {
            Some(meta) => (
                format!("{} to {}", meta.start_date, meta.end_date),
                meta.rows.to_string(),
            ),
            None if cache.year_path(year).is_file() => ("(no meta)".into(), "?".into()),
            None => ("(missing)".into(), "-".into()),
        };
        let size = file_size(&cache.year_path(year));
        println!("{:<6} {:<25} {:>10} {:>10}", year, window, rows, size);
    }

    println!();
    let stages = [
        ("news", layout.news()),
        ("crosswalk", layout.crosswalk()),
        ("news+permno", layout.news_with_permno()),
        ("crsp daily", layout.crsp_daily()),
        ("merged", layout.merged()),
        ("russell 1000", layout.russell_1000()),
    ];
    for (label, path) in &stages {
        let rows = if path.is_file() {
            count_parquet_rows(path)
                .map(|n| format!("{n} rows"))
                .unwrap_or_else(|e| format!("unreadable: {e}"))
        } else {
            "missing".to_string()
        };
        println!("{:<14} {:<12} {:>10}  {}", label, rows, file_size(path), path.display());
    }

    Ok(())
}

fn file_size(path: &Path) -> String {
    match std::fs::metadata(path) {
        Ok(meta) => format_size(meta.len()),
        Err(_) => "-".into(),
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
