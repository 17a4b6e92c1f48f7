//! Market data access: provider traits, quote normalization and the Yahoo
//! Finance client.

mod memory;
mod quote;
mod yahoo;

use async_trait::async_trait;

use crate::error::MarketDataError;

pub use memory::InMemoryMarket;
pub use quote::{
    Comparison, QuoteRecord, TickerFailure, change_percent, compare_quotes, fetch_quote,
    normalize_ticker, parse_ticker_list, round2,
};
pub use yahoo::{YahooFinance, YahooFinanceConfig};

/// One-day price history plus descriptive metadata for a ticker.
///
/// An empty `closes` vector means the provider has no data for the ticker.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MarketSnapshot {
    pub closes: Vec<f64>,
    pub previous_close: Option<f64>,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
}

impl MarketSnapshot {
    pub fn new(closes: Vec<f64>, previous_close: Option<f64>) -> Self {
        Self {
            closes,
            previous_close,
            long_name: None,
            short_name: None,
        }
    }

    pub fn with_long_name(mut self, name: impl Into<String>) -> Self {
        self.long_name = Some(name.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.closes.is_empty()
    }

    pub fn last_close(&self) -> Option<f64> {
        self.closes.last().copied()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.long_name.as_deref().or(self.short_name.as_deref())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewsArticle {
    pub title: String,
    pub publisher: Option<String>,
    pub link: Option<String>,
    pub published_at: Option<i64>,
}

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Fetches the most recent one-day history and metadata for `ticker`.
    async fn snapshot(&self, ticker: &str) -> Result<MarketSnapshot, MarketDataError>;
}

#[async_trait]
pub trait NewsProvider: Send + Sync {
    async fn recent_news(
        &self,
        ticker: &str,
        limit: usize,
    ) -> Result<Vec<NewsArticle>, MarketDataError>;
}
