use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{Tool, single_string_schema, string_arg};
use crate::error::ToolError;
use crate::market::{NewsArticle, NewsProvider, normalize_ticker};

/// `yahoo_finance_news`: recent headlines for a company ticker.
pub struct FinanceNewsTool {
    news: Arc<dyn NewsProvider>,
    limit: usize,
}

impl FinanceNewsTool {
    pub const NAME: &'static str = "yahoo_finance_news";

    pub fn new(news: Arc<dyn NewsProvider>, limit: usize) -> Self {
        Self {
            news,
            limit: limit.max(1),
        }
    }
}

#[async_trait]
impl Tool for FinanceNewsTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Useful for when you need to find financial news about a public company. \
         Input should be a company ticker. For example, AAPL for Apple, MSFT for Microsoft."
    }

    fn parameters(&self) -> Value {
        single_string_schema("query", "Company ticker to search news for")
    }

    async fn call(&self, args: Value) -> Result<String, ToolError> {
        let ticker = normalize_ticker(string_arg(Self::NAME, &args, "query")?)?.to_uppercase();
        let articles = self.news.recent_news(&ticker, self.limit).await?;

        if articles.is_empty() {
            return Ok(format!(
                "No news found for company that searched with {ticker} ticker."
            ));
        }

        Ok(articles
            .iter()
            .map(render_article)
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

fn render_article(article: &NewsArticle) -> String {
    let mut lines = vec![article.title.clone()];
    if let Some(publisher) = &article.publisher {
        lines.push(format!("Source: {publisher}"));
    }
    if let Some(link) = &article.link {
        lines.push(link.clone());
    }
    lines.join("\n")
}
