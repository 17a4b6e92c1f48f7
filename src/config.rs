//! Process settings, populated once at startup and passed down by value.

use std::str::FromStr;
use std::time::Duration;

use crate::error::SettingsError;

pub const DEFAULT_MODEL: &str = "sonar";
pub const DEFAULT_API_BASE_URL: &str = "https://api.perplexity.ai";
pub const DEFAULT_MARKET_BASE_URL: &str = "https://query1.finance.yahoo.com";
pub const DEFAULT_MAX_ITERS: u32 = 6;

/// How the agent asks the model to pick tools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ToolCallingMode {
    /// Text protocol driven by [`crate::llm::ChatAdapter`]; works with models
    /// that have no native function calling.
    #[default]
    Adapter,
    /// Native `tools` / `tool_calls` fields of the chat-completions API.
    Native,
}

impl FromStr for ToolCallingMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "adapter" | "chat" | "text" => Ok(Self::Adapter),
            "native" => Ok(Self::Native),
            other => Err(format!("expected 'adapter' or 'native', got '{other}'")),
        }
    }
}

/// Failure granularity of the comparison tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ComparisonPolicy {
    /// Any provider error aborts the whole comparison with a single error.
    #[default]
    AllOrNothing,
    /// Failing tickers are reported next to the successful quotes.
    PerTicker,
}

impl FromStr for ComparisonPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "all_or_nothing" | "batch" => Ok(Self::AllOrNothing),
            "per_ticker" => Ok(Self::PerTicker),
            other => Err(format!(
                "expected 'all_or_nothing' or 'per_ticker', got '{other}'"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub api_key: String,
    pub model_name: String,
    pub api_base_url: String,
    pub max_iters: u32,
    pub temperature: f32,
    pub request_timeout: Duration,
    pub tool_timeout: Duration,
    pub tool_calling: ToolCallingMode,
    pub comparison_policy: ComparisonPolicy,
    pub max_concurrent_fetches: usize,
    pub news_count: usize,
    pub market_base_url: String,
}

impl Settings {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model_name: DEFAULT_MODEL.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            max_iters: DEFAULT_MAX_ITERS,
            temperature: 0.0,
            request_timeout: Duration::from_secs(30),
            tool_timeout: Duration::from_secs(60),
            tool_calling: ToolCallingMode::default(),
            comparison_policy: ComparisonPolicy::default(),
            max_concurrent_fetches: 4,
            news_count: 5,
            market_base_url: DEFAULT_MARKET_BASE_URL.to_string(),
        }
    }

    /// Loads `.env` (if present) and reads settings from the process environment.
    pub fn from_env() -> Result<Self, SettingsError> {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                tracing::warn!(error = %err, "failed to load .env file");
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let api_key = get("PPLX_API_KEY")
            .or_else(|| get("PERPLEXITY_API_KEY"))
            .ok_or(SettingsError::MissingApiKey)?;

        let mut settings = Self::new(api_key.trim());

        if let Some(model) = get("PPLX_MODEL") {
            settings.model_name = normalize_model_name(&model);
        }
        if let Some(base) = get("PPLX_API_BASE") {
            settings.api_base_url = base.trim().to_string();
        }
        if let Some(value) = get("MARKET_AGENT_MAX_ITERS") {
            let max_iters = parse::<u32>("MARKET_AGENT_MAX_ITERS", &value)?;
            if max_iters == 0 {
                return Err(SettingsError::Invalid {
                    key: "MARKET_AGENT_MAX_ITERS".to_string(),
                    message: "must be greater than 0".to_string(),
                });
            }
            settings.max_iters = max_iters;
        }
        if let Some(value) = get("MARKET_AGENT_TOOL_CALLING") {
            settings.tool_calling = parse("MARKET_AGENT_TOOL_CALLING", &value)?;
        }
        if let Some(value) = get("MARKET_AGENT_COMPARISON_POLICY") {
            settings.comparison_policy = parse("MARKET_AGENT_COMPARISON_POLICY", &value)?;
        }
        if let Some(value) = get("MARKET_AGENT_REQUEST_TIMEOUT_SECS") {
            settings.request_timeout =
                Duration::from_secs(parse("MARKET_AGENT_REQUEST_TIMEOUT_SECS", &value)?);
        }
        if let Some(value) = get("MARKET_AGENT_TOOL_TIMEOUT_SECS") {
            settings.tool_timeout =
                Duration::from_secs(parse("MARKET_AGENT_TOOL_TIMEOUT_SECS", &value)?);
        }
        if let Some(value) = get("MARKET_AGENT_FETCH_CONCURRENCY") {
            settings.max_concurrent_fetches =
                parse::<usize>("MARKET_AGENT_FETCH_CONCURRENCY", &value)?.max(1);
        }
        if let Some(value) = get("MARKET_AGENT_NEWS_COUNT") {
            settings.news_count = parse("MARKET_AGENT_NEWS_COUNT", &value)?;
        }

        Ok(settings)
    }
}

/// LiteLLM-style names carry a provider prefix the HTTP API does not accept.
fn normalize_model_name(model: &str) -> String {
    let model = model.trim();
    model
        .strip_prefix("perplexity/")
        .unwrap_or(model)
        .to_string()
}

fn parse<T>(key: &str, value: &str) -> Result<T, SettingsError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|err| SettingsError::Invalid {
            key: key.to_string(),
            message: err.to_string(),
        })
}
