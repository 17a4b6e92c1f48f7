use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("tool schema must be a JSON object")]
    SchemaNotObject,
    #[error("tool schema must declare type=object")]
    RootTypeMustBeObject,
    #[error("required must be an array of strings")]
    InvalidRequired,
}

/// Failure kinds of the market-data layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarketDataError {
    /// The provider answered, but holds no price history for the ticker.
    #[error("Could not retrieve data for {ticker}")]
    TickerNotFound { ticker: String },
    #[error("market data provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("unexpected market data failure: {0}")]
    Unexpected(String),
}

impl MarketDataError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TickerNotFound { .. } => "ticker_not_found",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::MalformedInput(_) => "malformed_input",
            Self::Unexpected(_) => "unexpected",
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("duplicate tool registered: {0}")]
    DuplicateTool(String),
    #[error("invalid tool arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("tool {tool} timed out after {after:?}")]
    Timeout { tool: String, after: Duration },
    #[error("tool execution failed: {0}")]
    Execution(String),
    #[error(transparent)]
    Market(#[from] MarketDataError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider response invalid: {0}")]
    Response(String),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("missing API key: set PPLX_API_KEY or PERPLEXITY_API_KEY in the environment or .env")]
    MissingApiKey,
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("agent stream ended without final response")]
    MissingFinalResponse,
    #[error("agent configuration error: {0}")]
    Config(String),
}
