use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{MarketDataProvider, MarketSnapshot, NewsArticle, NewsProvider};
use crate::error::MarketDataError;

/// Fixed market and news data served from memory, for offline runs and tests.
///
/// Tickers without a configured snapshot resolve to an empty history.
#[derive(Clone, Debug, Default)]
pub struct InMemoryMarket {
    snapshots: HashMap<String, Result<MarketSnapshot, MarketDataError>>,
    news: HashMap<String, Vec<NewsArticle>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl InMemoryMarket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(mut self, ticker: impl Into<String>, snapshot: MarketSnapshot) -> Self {
        self.snapshots.insert(ticker.into(), Ok(snapshot));
        self
    }

    pub fn with_failure(mut self, ticker: impl Into<String>, error: MarketDataError) -> Self {
        self.snapshots.insert(ticker.into(), Err(error));
        self
    }

    pub fn with_news(mut self, ticker: impl Into<String>, articles: Vec<NewsArticle>) -> Self {
        self.news.insert(ticker.into(), articles);
        self
    }

    /// Tickers requested so far, in request order.
    pub fn requested(&self) -> Vec<String> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn record(&self, ticker: &str) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(ticker.to_string());
        }
    }
}

#[async_trait]
impl MarketDataProvider for InMemoryMarket {
    async fn snapshot(&self, ticker: &str) -> Result<MarketSnapshot, MarketDataError> {
        self.record(ticker);
        self.snapshots
            .get(ticker)
            .cloned()
            .unwrap_or_else(|| Ok(MarketSnapshot::default()))
    }
}

#[async_trait]
impl NewsProvider for InMemoryMarket {
    async fn recent_news(
        &self,
        ticker: &str,
        limit: usize,
    ) -> Result<Vec<NewsArticle>, MarketDataError> {
        self.record(ticker);
        Ok(self
            .news
            .get(ticker)
            .map(|articles| articles.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}
