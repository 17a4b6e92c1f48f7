use futures_util::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{MarketDataProvider, MarketSnapshot};
use crate::config::ComparisonPolicy;
use crate::error::MarketDataError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuoteRecord {
    pub ticker: String,
    pub price: f64,
    pub change_percent: f64,
    #[serde(rename = "company", default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
}

impl QuoteRecord {
    /// Builds a quote from the last close of `snapshot`, or `None` when the
    /// history is empty.
    pub fn from_snapshot(ticker: &str, snapshot: &MarketSnapshot) -> Option<Self> {
        let price = snapshot.last_close()?;
        Some(Self {
            ticker: ticker.to_string(),
            price: round2(price),
            change_percent: round2(change_percent(price, snapshot.previous_close)),
            company_name: None,
        })
    }

    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company_name = Some(company.into());
        self
    }
}

/// Rounds to cents, breaking exact ties to the even neighbour.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round_ties_even() / 100.0
}

/// Percent change against the previous close; zero when it is missing or zero.
pub fn change_percent(current: f64, previous_close: Option<f64>) -> f64 {
    match previous_close {
        Some(previous) if previous != 0.0 && previous.is_finite() => {
            (current - previous) / previous * 100.0
        }
        _ => 0.0,
    }
}

/// Trims a ticker and rejects characters no exchange symbol uses.
pub fn normalize_ticker(raw: &str) -> Result<&str, MarketDataError> {
    let ticker = raw.trim();
    if ticker.is_empty() {
        return Err(MarketDataError::MalformedInput(
            "ticker must not be empty".to_string(),
        ));
    }

    if let Some(bad) = ticker
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '=')))
    {
        return Err(MarketDataError::MalformedInput(format!(
            "ticker '{ticker}' contains unsupported character '{bad}'"
        )));
    }

    Ok(ticker)
}

/// Splits a comma-separated list into trimmed, upper-cased tickers.
pub fn parse_ticker_list(raw: &str) -> Result<Vec<String>, MarketDataError> {
    let mut tickers = Vec::new();
    for entry in raw.split(',') {
        if entry.trim().is_empty() {
            continue;
        }
        tickers.push(normalize_ticker(entry)?.to_uppercase());
    }

    if tickers.is_empty() {
        return Err(MarketDataError::MalformedInput(format!(
            "no tickers found in '{raw}'"
        )));
    }

    Ok(tickers)
}

pub async fn fetch_quote(
    provider: &dyn MarketDataProvider,
    ticker: &str,
) -> Result<QuoteRecord, MarketDataError> {
    let ticker = normalize_ticker(ticker)?;
    let snapshot = provider.snapshot(ticker).await?;

    let company = snapshot.display_name().unwrap_or(ticker).to_string();
    QuoteRecord::from_snapshot(ticker, &snapshot)
        .map(|quote| quote.with_company(company))
        .ok_or_else(|| MarketDataError::TickerNotFound {
            ticker: ticker.to_string(),
        })
}

#[derive(Clone, Debug, PartialEq)]
pub struct TickerFailure {
    pub ticker: String,
    pub error: MarketDataError,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Comparison {
    /// Resolved quotes, in request order, without company names.
    pub quotes: Vec<QuoteRecord>,
    /// Tickers the provider had no data for.
    pub missing: Vec<String>,
    /// Provider failures; only populated under [`ComparisonPolicy::PerTicker`].
    pub failures: Vec<TickerFailure>,
}

/// Fetches every ticker and assembles an ordered comparison.
///
/// Fetches run through an order-preserving buffer of width `concurrency`.
/// Under [`ComparisonPolicy::AllOrNothing`] the first failing ticker, in
/// request order, fails the whole comparison.
pub async fn compare_quotes(
    provider: &dyn MarketDataProvider,
    tickers: &[String],
    policy: ComparisonPolicy,
    concurrency: usize,
) -> Result<Comparison, MarketDataError> {
    let outcomes = stream::iter(tickers.iter().cloned())
        .map(|ticker| async move {
            let outcome = provider.snapshot(&ticker).await;
            (ticker, outcome)
        })
        .buffered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

    let mut comparison = Comparison::default();
    for (ticker, outcome) in outcomes {
        match outcome {
            Ok(snapshot) => match QuoteRecord::from_snapshot(&ticker, &snapshot) {
                Some(quote) => comparison.quotes.push(quote),
                None => {
                    debug!(%ticker, "no history, dropping ticker from comparison");
                    comparison.missing.push(ticker);
                }
            },
            Err(MarketDataError::TickerNotFound { .. }) => comparison.missing.push(ticker),
            Err(error) => match policy {
                ComparisonPolicy::AllOrNothing => return Err(error),
                ComparisonPolicy::PerTicker => {
                    warn!(%ticker, error = %error, "comparison fetch failed");
                    comparison.failures.push(TickerFailure { ticker, error });
                }
            },
        }
    }

    Ok(comparison)
}
