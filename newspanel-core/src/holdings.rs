//! Russell 1000 constituents from the iShares IWB holdings file.
//!
//! The index membership itself is proprietary, so the ETF's published
//! holdings stand in for it. The CSV carries a block of fund metadata
//! above the header row and cash/futures rows mixed in with equities.

use crate::cache::write_parquet_atomic;
use crate::error::{PipelineError, Result};
use crate::retry::RetryPolicy;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const IWB_HOLDINGS_URL: &str = "https://www.ishares.com/us/products/239707/ishares-russell-1000-etf/1467271812596.ajax?fileType=csv&fileName=IWB_holdings&dataType=fund";

/// Metadata lines above the header row.
pub const METADATA_LINES: usize = 9;

/// One ETF holding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub ticker: String,
    pub name: Option<String>,
    pub sector: Option<String>,
    pub asset_class: Option<String>,
    pub market_value: Option<f64>,
    pub weight: Option<f64>,
}

/// Somewhere a holdings CSV can be downloaded from.
pub trait HoldingsSource {
    fn name(&self) -> &str;

    /// Fetch the raw CSV text.
    fn fetch_csv(&self) -> Result<String>;
}

/// Blocking HTTP client for the iShares endpoint.
pub struct IsharesClient {
    client: reqwest::blocking::Client,
    url: String,
}

impl IsharesClient {
    pub fn new() -> Result<Self> {
        Self::with_url(IWB_HOLDINGS_URL)
    }

    pub fn with_url(url: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

impl HoldingsSource for IsharesClient {
    fn name(&self) -> &str {
        "ishares"
    }

    fn fetch_csv(&self) -> Result<String> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .map_err(|e| PipelineError::Network(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(PipelineError::RateLimited {
                retry_after_secs: retry_after,
            });
        }
        if status.is_server_error() {
            return Err(PipelineError::Network(format!("HTTP {status} from {}", self.url)));
        }
        if !status.is_success() {
            // 4xx other than 429 will not fix itself
            return Err(PipelineError::Validation(format!(
                "HTTP {status} from {}",
                self.url
            )));
        }

        resp.text()
            .map_err(|e| PipelineError::Network(format!("reading body: {e}")))
    }
}

/// Parse an iShares holdings CSV.
///
/// Skips [`METADATA_LINES`], requires a `Ticker` header, drops rows whose
/// ticker is empty or not purely alphabetic, and keeps only rows whose
/// `Asset Class` mentions "equity" when that column is present.
pub fn parse_holdings(text: &str) -> Result<Vec<Holding>> {
    let text = text.trim_start_matches('\u{feff}');
    let body: String = text
        .lines()
        .skip(METADATA_LINES)
        .collect::<Vec<_>>()
        .join("\n");

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(body.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| PipelineError::Validation(format!("holdings header: {e}")))?
        .clone();
    let index = |name: &str| headers.iter().position(|h| h.trim() == name);

    let ticker_at = index("Ticker").ok_or_else(|| PipelineError::MissingColumn {
        column: "Ticker".into(),
        context: "holdings CSV".into(),
    })?;
    let name_at = index("Name");
    let sector_at = index("Sector");
    let class_at = index("Asset Class");
    let value_at = index("Market Value");
    let weight_at = index("Weight (%)");

    let mut holdings = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| PipelineError::Validation(format!("holdings row: {e}")))?;
        let field = |at: Option<usize>| {
            at.and_then(|i| record.get(i))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let Some(ticker) = field(Some(ticker_at)) else {
            continue;
        };
        if !ticker.chars().all(char::is_alphabetic) {
            continue;
        }

        let asset_class = field(class_at);
        if class_at.is_some()
            && !asset_class
                .as_deref()
                .is_some_and(|c| c.to_lowercase().contains("equity"))
        {
            continue;
        }

        holdings.push(Holding {
            ticker,
            name: field(name_at),
            sector: field(sector_at),
            asset_class,
            market_value: field(value_at).and_then(|v| parse_number(&v)),
            weight: field(weight_at).and_then(|v| parse_number(&v)),
        });
    }

    Ok(holdings)
}

fn parse_number(s: &str) -> Option<f64> {
    s.replace(',', "").parse().ok()
}

fn strings(rows: &[Holding], f: impl Fn(&Holding) -> &Option<String>) -> Vec<Option<String>> {
    rows.iter().map(|r| f(r).clone()).collect()
}

pub fn holdings_to_dataframe(rows: &[Holding]) -> PolarsResult<DataFrame> {
    DataFrame::new(vec![
        Column::new(
            "ticker".into(),
            rows.iter().map(|r| r.ticker.clone()).collect::<Vec<_>>(),
        ),
        Column::new("name".into(), strings(rows, |r| &r.name)),
        Column::new("sector".into(), strings(rows, |r| &r.sector)),
        Column::new("asset_class".into(), strings(rows, |r| &r.asset_class)),
        Column::new(
            "market_value".into(),
            rows.iter().map(|r| r.market_value).collect::<Vec<_>>(),
        ),
        Column::new(
            "weight".into(),
            rows.iter().map(|r| r.weight).collect::<Vec<_>>(),
        ),
    ])
}

/// Download, parse, and write the constituents list.
pub fn pull_russell_1000(
    source: &dyn HoldingsSource,
    retry: &RetryPolicy,
    out_path: &Path,
) -> Result<usize> {
    let text = retry.run("iShares holdings", |_| source.fetch_csv())?;
    let holdings = parse_holdings(&text)?;
    if holdings.is_empty() {
        return Err(PipelineError::EmptyInput(format!(
            "{} holdings contained no equity rows",
            source.name()
        )));
    }

    let mut df = holdings_to_dataframe(&holdings)?;
    write_parquet_atomic(&mut df, out_path)?;
    tracing::info!(tickers = holdings.len(), output = %out_path.display(), "Russell 1000 constituents saved");
    Ok(holdings.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const SAMPLE: &str = "\u{feff}iShares Russell 1000 ETF
Fund Holdings as of,\"Jun 28, 2019\"
Inception Date,\"May 15, 2000\"
Shares Outstanding,\"100,000,000.00\"
Stock,\"-\"
Bond,\"-\"
Cash,\"-\"
Other,\"-\"
\u{a0}
Ticker,Name,Sector,Asset Class,Market Value,Weight (%),Notional Value
\"AAPL\",\"APPLE INC\",\"Information Technology\",\"Equity\",\"1,234,567.50\",\"3.52\",\"1,234,567.50\"
\"MSFT\",\"MICROSOFT CORP\",\"Information Technology\",\"Equity\",\"2,000,000.00\",\"4.10\",\"2,000,000.00\"
\"BRKB\",\"BERKSHIRE HATHAWAY INC CLASS B\",\"Financials\",\"Equity\",\"900.00\",\"1.60\",\"900.00\"
\"BRK.B\",\"BERKSHIRE OLD\",\"Financials\",\"Equity\",\"1.00\",\"0.00\",\"1.00\"
\"USD\",\"USD CASH\",\"Cash and/or Derivatives\",\"Cash\",\"50,000.00\",\"0.05\",\"50,000.00\"
\"ESU9\",\"S&P500 EMINI SEP 19\",\"Cash and/or Derivatives\",\"Futures\",\"0.00\",\"0.00\",\"1.00\"
\"-\",\"BLK CSH FND TREASURY SL AGENCY\",\"Cash and/or Derivatives\",\"Money Market\",\"10.00\",\"0.01\",\"10.00\"
\"\",\"NO TICKER\",\"Financials\",\"Equity\",\"1.00\",\"0.00\",\"1.00\"
\u{a0}
\"The content contained herein is owned or licensed by BlackRock\"
";

    #[test]
    fn parses_equity_rows_only() {
        let rows = parse_holdings(SAMPLE).unwrap();
        let tickers: Vec<&str> = rows.iter().map(|h| h.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["AAPL", "MSFT", "BRKB"]);

        assert_eq!(rows[0].name.as_deref(), Some("APPLE INC"));
        assert_eq!(rows[0].market_value, Some(1_234_567.5));
        assert_eq!(rows[0].weight, Some(3.52));
    }

    #[test]
    fn missing_ticker_header_is_schema_error() {
        let text = format!("{}Symbol,Name\nAAPL,Apple\n", "meta\n".repeat(METADATA_LINES));
        assert!(matches!(
            parse_holdings(&text),
            Err(PipelineError::MissingColumn { .. })
        ));
    }

    #[test]
    fn without_asset_class_keeps_all_alphabetic_tickers() {
        let text = format!(
            "{}Ticker,Name\nAAPL,Apple\nUSD,Cash\nBF.B,Brown Forman\n",
            "meta\n".repeat(METADATA_LINES)
        );
        let rows = parse_holdings(&text).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|h| h.asset_class.is_none()));
    }

    struct FlakySource {
        failures: Cell<u32>,
        body: String,
    }

    impl HoldingsSource for FlakySource {
        fn name(&self) -> &str {
            "flaky"
        }

        fn fetch_csv(&self) -> Result<String> {
            if self.failures.get() > 0 {
                self.failures.set(self.failures.get() - 1);
                return Err(PipelineError::Network("connection reset".into()));
            }
            Ok(self.body.clone())
        }
    }

    #[test]
    fn pull_retries_then_writes() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("r1000.parquet");
        let source = FlakySource {
            failures: Cell::new(2),
            body: SAMPLE.to_string(),
        };

        let n = pull_russell_1000(&source, &RetryPolicy::immediate(3), &out).unwrap();
        assert_eq!(n, 3);
        let df = crate::cache::read_parquet(&out).unwrap();
        assert_eq!(df.height(), 3);
        let names: Vec<&str> = df.get_column_names().iter().map(|n| n.as_str()).collect();
        assert_eq!(
            names,
            ["ticker", "name", "sector", "asset_class", "market_value", "weight"]
        );
    }

    #[test]
    fn all_cash_is_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let source = FlakySource {
            failures: Cell::new(0),
            body: format!(
                "{}Ticker,Asset Class\nUSD,Cash\n",
                "meta\n".repeat(METADATA_LINES)
            ),
        };
        let result = pull_russell_1000(&source, &RetryPolicy::immediate(1), &dir.path().join("x.parquet"));
        assert!(matches!(result, Err(PipelineError::EmptyInput(_))));
    }
}
