use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::{Tool, single_string_schema, string_arg};
use crate::config::ComparisonPolicy;
use crate::error::ToolError;
use crate::market::{MarketDataProvider, compare_quotes, fetch_quote, parse_ticker_list};

/// `get_stock_price`: latest price, change against previous close, company name.
pub struct StockPriceTool {
    market: Arc<dyn MarketDataProvider>,
}

impl StockPriceTool {
    pub const NAME: &'static str = "get_stock_price";

    pub fn new(market: Arc<dyn MarketDataProvider>) -> Self {
        Self { market }
    }
}

#[async_trait]
impl Tool for StockPriceTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Get current stock price and basic info. Returns JSON with ticker, price, \
         change_percent and company."
    }

    fn parameters(&self) -> Value {
        single_string_schema("ticker", "Ticker symbol, e.g. AAPL")
    }

    async fn call(&self, args: Value) -> Result<String, ToolError> {
        let ticker = string_arg(Self::NAME, &args, "ticker")?;
        let quote = fetch_quote(self.market.as_ref(), ticker).await?;
        serde_json::to_string(&quote).map_err(|err| ToolError::Execution(err.to_string()))
    }
}

/// `compare_stocks`: quotes for a comma-separated ticker list, in request order.
pub struct CompareStocksTool {
    market: Arc<dyn MarketDataProvider>,
    policy: ComparisonPolicy,
    concurrency: usize,
}

impl CompareStocksTool {
    pub const NAME: &'static str = "compare_stocks";

    pub fn new(
        market: Arc<dyn MarketDataProvider>,
        policy: ComparisonPolicy,
        concurrency: usize,
    ) -> Self {
        Self {
            market,
            policy,
            concurrency: concurrency.max(1),
        }
    }
}

#[async_trait]
impl Tool for CompareStocksTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Compare multiple stocks (comma-separated tickers, e.g. \"AAPL,GOOGL,MSFT\"). \
         Returns a JSON list of ticker, price and change_percent; tickers without data \
         are left out."
    }

    fn parameters(&self) -> Value {
        single_string_schema("tickers", "Comma-separated ticker symbols")
    }

    async fn call(&self, args: Value) -> Result<String, ToolError> {
        let raw = string_arg(Self::NAME, &args, "tickers")?;
        let tickers = parse_ticker_list(raw)?;
        debug!(?tickers, policy = ?self.policy, "comparing stocks");

        let comparison =
            compare_quotes(self.market.as_ref(), &tickers, self.policy, self.concurrency).await?;

        let payload = match self.policy {
            ComparisonPolicy::AllOrNothing => serde_json::to_value(&comparison.quotes),
            ComparisonPolicy::PerTicker => serde_json::to_value(&comparison.quotes).map(|quotes| {
                let errors = comparison
                    .failures
                    .iter()
                    .map(|failure| {
                        json!({
                            "ticker": failure.ticker,
                            "kind": failure.error.kind(),
                            "message": failure.error.to_string(),
                        })
                    })
                    .collect::<Vec<_>>();
                json!({"quotes": quotes, "errors": errors})
            }),
        }
        .map_err(|err| ToolError::Execution(err.to_string()))?;

        Ok(payload.to_string())
    }
}
