use std::collections::VecDeque;
use std::error::Error;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use market_agent_rs::{
    AgentEvent, ChatAdapter, ChatModel, FinancialAnalyst, FinancialToolOptions, InMemoryMarket,
    MarketSnapshot, ModelCompletion, ModelMessage, ModelToolChoice, ModelToolDefinition,
    NewsArticle, ProviderError, ToolRegistry,
};

/// Plain-text model replaying canned replies in the adapter's field format.
struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedModel {
    fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|reply| reply.to_string()).collect()),
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn invoke(
        &self,
        _messages: &[ModelMessage],
        _tools: &[ModelToolDefinition],
        _tool_choice: ModelToolChoice,
    ) -> Result<ModelCompletion, ProviderError> {
        let mut guard = self.replies.lock().expect("lock poisoned");
        let reply = guard.pop_front().ok_or_else(|| {
            ProviderError::Response("scripted model exhausted replies".to_string())
        })?;
        Ok(ModelCompletion {
            text: Some(reply),
            ..ModelCompletion::default()
        })
    }
}

fn market() -> InMemoryMarket {
    InMemoryMarket::new()
        .with_snapshot(
            "AAPL",
            MarketSnapshot::new(vec![189.12, 190.46], Some(187.0)).with_long_name("Apple Inc."),
        )
        .with_snapshot(
            "GOOGL",
            MarketSnapshot::new(vec![141.8], Some(142.5)).with_long_name("Alphabet Inc."),
        )
        .with_snapshot(
            "MSFT",
            MarketSnapshot::new(vec![415.1], Some(410.0)).with_long_name("Microsoft Corporation"),
        )
        .with_news(
            "AAPL",
            vec![NewsArticle {
                title: "Apple unveils new AI features across its product line".to_string(),
                publisher: Some("Reuters".to_string()),
                link: Some("https://www.reuters.com/technology/apple-ai".to_string()),
                published_at: None,
            }],
        )
}

const REPLIES: [&str; 4] = [
    "[[ ## next_thought ## ]]\nI should read Apple's recent headlines first.\n\n\
     [[ ## next_tool_name ## ]]\nyahoo_finance_news\n\n\
     [[ ## next_tool_args ## ]]\n{\"query\": \"AAPL\"}\n\n[[ ## completed ## ]]",
    "[[ ## next_thought ## ]]\nNow the current price.\n\n\
     [[ ## next_tool_name ## ]]\nget_stock_price\n\n\
     [[ ## next_tool_args ## ]]\n{\"ticker\": \"AAPL\"}\n\n[[ ## completed ## ]]",
    "[[ ## next_thought ## ]]\nCompare against peers.\n\n\
     [[ ## next_tool_name ## ]]\ncompare_stocks\n\n\
     [[ ## next_tool_args ## ]]\n{\"tickers\": \"AAPL, GOOGL, MSFT\"}\n\n[[ ## completed ## ]]",
    "[[ ## next_thought ## ]]\nI have news, a quote and a comparison.\n\n\
     [[ ## next_tool_name ## ]]\nfinish\n\n\
     [[ ## next_tool_args ## ]]\n{\"answer\": \"Apple's AI announcement is well received: \
     AAPL trades at 190.46 (+1.85%), ahead of GOOGL (-0.49%) and behind MSFT (+1.24%).\"}\n\n\
     [[ ## completed ## ]]",
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let market = Arc::new(market());
    let registry =
        ToolRegistry::financial(market.clone(), market, FinancialToolOptions::default())?;
    let model = ChatAdapter::new(ScriptedModel::new(&REPLIES))?;
    let mut analyst = FinancialAnalyst::new(Arc::new(model), registry, 6)?;

    let query = "What's the latest news about Apple (AAPL) and how might it affect the stock price?";
    println!("Query: {query}");

    let stream = analyst.analyze_stream(query);
    futures_util::pin_mut!(stream);
    while let Some(event) = stream.next().await {
        match event? {
            AgentEvent::Thinking { content } | AgentEvent::Text { content } => {
                println!("thought: {content}")
            }
            AgentEvent::ToolCall {
                tool,
                args_json,
                tool_call_id,
            } => println!("tool call [{tool_call_id}] {tool}: {args_json}"),
            AgentEvent::ToolResult {
                tool,
                result_text,
                is_error,
                ..
            } => println!("observation {tool} (error={is_error}): {result_text}"),
            AgentEvent::IterationLimitReached { max_iterations } => {
                println!("stopped after {max_iterations} steps")
            }
            AgentEvent::FinalResponse { content } => println!("Analysis: {content}"),
        }
    }
    println!("{}", "-".repeat(50));

    Ok(())
}
