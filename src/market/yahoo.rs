use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::{MarketDataProvider, MarketSnapshot, NewsArticle, NewsProvider};
use crate::config::{DEFAULT_MARKET_BASE_URL, Settings};
use crate::error::MarketDataError;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; market-agent-rs)";
const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct YahooFinanceConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for YahooFinanceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_MARKET_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl From<&Settings> for YahooFinanceConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            base_url: settings.market_base_url.clone(),
            timeout: settings.request_timeout,
            ..Self::default()
        }
    }
}

/// Yahoo Finance client serving both quote snapshots (chart endpoint) and
/// headlines (search endpoint).
#[derive(Debug, Clone)]
pub struct YahooFinance {
    client: Client,
    config: YahooFinanceConfig,
}

impl YahooFinance {
    pub fn new(config: YahooFinanceConfig) -> Result<Self, MarketDataError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|err| MarketDataError::Unexpected(err.to_string()))?;

        Ok(Self { client, config })
    }

    fn base(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    fn chart_endpoint(&self, ticker: &str) -> String {
        format!("{}/v8/finance/chart/{ticker}", self.base())
    }

    fn search_endpoint(&self) -> String {
        format!("{}/v1/finance/search", self.base())
    }

    async fn get_text(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<(StatusCode, String), MarketDataError> {
        let response = request
            .send()
            .await
            .map_err(|err| MarketDataError::ProviderUnavailable(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| MarketDataError::ProviderUnavailable(err.to_string()))?;
        Ok((status, body))
    }
}

#[async_trait]
impl MarketDataProvider for YahooFinance {
    async fn snapshot(&self, ticker: &str) -> Result<MarketSnapshot, MarketDataError> {
        let url = self.chart_endpoint(ticker);
        debug!(%url, "requesting yahoo chart");

        let request = self
            .client
            .get(&url)
            .query(&[("range", "1d"), ("interval", "1d")]);
        let (status, body) = self.get_text(request).await?;

        parse_chart_response(status, &body)
    }
}

#[async_trait]
impl NewsProvider for YahooFinance {
    async fn recent_news(
        &self,
        ticker: &str,
        limit: usize,
    ) -> Result<Vec<NewsArticle>, MarketDataError> {
        let url = self.search_endpoint();
        debug!(%url, %ticker, "requesting yahoo news");

        let request = self.client.get(&url).query(&[
            ("q", ticker.to_string()),
            ("quotesCount", "0".to_string()),
            ("newsCount", limit.to_string()),
        ]);
        let (status, body) = self.get_text(request).await?;

        if !status.is_success() {
            return Err(MarketDataError::ProviderUnavailable(describe_failure(
                status, &body,
            )));
        }

        parse_search_response(ticker, &body, limit)
    }
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: ChartBody,
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: ChartMeta,
    #[serde(default)]
    indicators: Option<ChartIndicators>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    previous_close: Option<f64>,
    chart_previous_close: Option<f64>,
    long_name: Option<String>,
    short_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartIndicators {
    #[serde(default)]
    quote: Vec<ChartQuote>,
}

#[derive(Debug, Deserialize)]
struct ChartQuote {
    #[serde(default)]
    close: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    news: Vec<SearchNewsItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchNewsItem {
    title: Option<String>,
    publisher: Option<String>,
    link: Option<String>,
    provider_publish_time: Option<i64>,
    #[serde(default)]
    related_tickers: Vec<String>,
}

fn parse_chart_response(status: StatusCode, body: &str) -> Result<MarketSnapshot, MarketDataError> {
    if status == StatusCode::NOT_FOUND {
        return Ok(MarketSnapshot::default());
    }

    if !status.is_success() {
        return Err(MarketDataError::ProviderUnavailable(describe_failure(
            status, body,
        )));
    }

    let envelope = serde_json::from_str::<ChartEnvelope>(body).map_err(|err| {
        MarketDataError::Unexpected(format!("yahoo chart response is not valid JSON: {err}"))
    })?;

    if let Some(error) = envelope.chart.error {
        if error.code.as_deref() == Some("Not Found") {
            return Ok(MarketSnapshot::default());
        }
        return Err(MarketDataError::ProviderUnavailable(format!(
            "yahoo chart error {}: {}",
            error.code.unwrap_or_else(|| "unknown".to_string()),
            error.description.unwrap_or_default()
        )));
    }

    let Some(result) = envelope
        .chart
        .result
        .and_then(|results| results.into_iter().next())
    else {
        return Ok(MarketSnapshot::default());
    };

    let closes = result
        .indicators
        .and_then(|indicators| indicators.quote.into_iter().next())
        .map(|quote| {
            quote
                .close
                .into_iter()
                .flatten()
                .filter(|close| close.is_finite())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Ok(MarketSnapshot {
        closes,
        previous_close: result.meta.previous_close.or(result.meta.chart_previous_close),
        long_name: result.meta.long_name.filter(|name| !name.is_empty()),
        short_name: result.meta.short_name.filter(|name| !name.is_empty()),
    })
}

fn parse_search_response(
    ticker: &str,
    body: &str,
    limit: usize,
) -> Result<Vec<NewsArticle>, MarketDataError> {
    let response = serde_json::from_str::<SearchResponse>(body).map_err(|err| {
        MarketDataError::Unexpected(format!("yahoo search response is not valid JSON: {err}"))
    })?;

    Ok(response
        .news
        .into_iter()
        .filter(|item| {
            item.related_tickers.is_empty()
                || item
                    .related_tickers
                    .iter()
                    .any(|related| related.eq_ignore_ascii_case(ticker))
        })
        .filter_map(|item| {
            let title = item.title.filter(|title| !title.trim().is_empty())?;
            Some(NewsArticle {
                title,
                publisher: item.publisher,
                link: item.link,
                published_at: item.provider_publish_time,
            })
        })
        .take(limit)
        .collect())
}

fn describe_failure(status: StatusCode, body: &str) -> String {
    if let Ok(envelope) = serde_json::from_str::<ChartEnvelope>(body) {
        if let Some(description) = envelope.chart.error.and_then(|error| error.description) {
            return format!("yahoo finance request failed ({status}): {description}");
        }
    }

    let body = body.trim();
    if body.is_empty() {
        format!("yahoo finance request failed ({status})")
    } else {
        let snippet = body.chars().take(MAX_ERROR_BODY_CHARS).collect::<String>();
        format!("yahoo finance request failed ({status}): {snippet}")
    }
}
