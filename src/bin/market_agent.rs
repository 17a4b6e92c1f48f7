use std::error::Error;

use clap::Parser;
use futures_util::StreamExt;
use market_agent_rs::{
    AgentEvent, ComparisonPolicy, FinancialAnalyst, Settings, ToolCallingMode,
};
use tracing_subscriber::EnvFilter;

const DEFAULT_QUERIES: [&str; 3] = [
    "What's the latest news about Apple (AAPL) and how might it affect the stock price?",
    "Compare AAPL, GOOGL, and MSFT performance",
    "Find recent Tesla news and analyze sentiment",
];

#[derive(Parser, Debug)]
#[command(
    name = "market-agent",
    about = "Answer financial questions with live quotes, comparisons and company news"
)]
struct Cli {
    /// Queries to analyze; runs the built-in demo queries when empty
    queries: Vec<String>,

    /// Reasoning step limit per query (overrides MARKET_AGENT_MAX_ITERS)
    #[arg(long)]
    max_iters: Option<u32>,

    /// Report per-ticker failures in comparisons instead of failing the whole call
    #[arg(long)]
    per_ticker: bool,

    /// Send tool definitions natively instead of the text adapter
    #[arg(long)]
    native_tools: bool,

    /// Print every agent event as it happens
    #[arg(long)]
    stream: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut settings = Settings::from_env()?;
    if let Some(max_iters) = cli.max_iters {
        settings.max_iters = max_iters.max(1);
    }
    if cli.per_ticker {
        settings.comparison_policy = ComparisonPolicy::PerTicker;
    }
    if cli.native_tools {
        settings.tool_calling = ToolCallingMode::Native;
    }

    let mut analyst = FinancialAnalyst::from_settings(&settings)?;

    let queries = if cli.queries.is_empty() {
        DEFAULT_QUERIES.iter().map(|query| query.to_string()).collect()
    } else {
        cli.queries
    };

    for query in &queries {
        println!("Query: {query}");
        let analysis = if cli.stream {
            stream_analysis(&mut analyst, query).await?
        } else {
            analyst.analyze(query).await?
        };
        println!("Analysis: {analysis}");
        println!("{}", "-".repeat(50));
    }

    Ok(())
}

async fn stream_analysis(
    analyst: &mut FinancialAnalyst,
    query: &str,
) -> Result<String, Box<dyn Error>> {
    let stream = analyst.analyze_stream(query);
    futures_util::pin_mut!(stream);

    let mut analysis = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            AgentEvent::Thinking { content } => println!("  thinking: {}", truncate(&content, 160)),
            AgentEvent::Text { content } => println!("  thought: {}", truncate(&content, 160)),
            AgentEvent::ToolCall {
                tool, args_json, ..
            } => println!("  tool-call {tool}: {args_json}"),
            AgentEvent::ToolResult {
                tool,
                result_text,
                is_error,
                ..
            } => {
                let marker = if is_error { "error" } else { "ok" };
                println!("  tool-result {tool} [{marker}]: {}", truncate(&result_text, 200));
            }
            AgentEvent::IterationLimitReached { max_iterations } => {
                println!("  iteration limit of {max_iterations} reached")
            }
            AgentEvent::FinalResponse { content } => analysis = content,
        }
    }

    Ok(analysis)
}

fn truncate(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head = chars.by_ref().take(max_chars).collect::<String>();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
