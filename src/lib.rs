//! Financial analysis agent for Rust.
//!
//! - `Agent` reasoning loop (`Reasoning -> Acting -> Observing`) with a hard
//!   iteration cap and a best-effort answer when the cap is hit
//! - `get_stock_price`, `compare_stocks` and `yahoo_finance_news` tools over a
//!   pluggable market-data provider (Yahoo Finance or in-memory)
//! - OpenAI-compatible chat client (Perplexity by default) and a text-protocol
//!   `ChatAdapter` for backends without native function calling
//! - `Settings` loaded from the environment and `.env`

pub mod agent;
pub mod analyst;
pub mod config;
pub mod error;
pub mod llm;
pub mod market;
pub mod tools;

pub use agent::{Agent, AgentBuilder, AgentConfig, AgentEvent, AgentState, query, query_stream};
pub use analyst::FinancialAnalyst;
pub use config::{ComparisonPolicy, Settings, ToolCallingMode};
pub use error::{
    AgentError, MarketDataError, ProviderError, SchemaError, SettingsError, ToolError,
};
pub use llm::{
    ChatAdapter, ChatModel, ModelCompletion, ModelMessage, ModelToolCall, ModelToolChoice,
    ModelToolDefinition, OpenAiCompatibleConfig, OpenAiCompatibleModel,
};
pub use market::{
    InMemoryMarket, MarketDataProvider, MarketSnapshot, NewsArticle, NewsProvider, QuoteRecord,
    YahooFinance,
};
pub use tools::{
    CompareStocksTool, FinanceNewsTool, FinancialToolOptions, StockPriceTool, Tool, ToolRegistry,
};
