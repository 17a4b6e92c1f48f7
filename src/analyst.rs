//! The financial analysis agent: a Perplexity-backed reasoning loop over the
//! quote, comparison and news tools.

use std::sync::Arc;

use futures_util::Stream;
use tracing::info;

use crate::agent::{Agent, AgentEvent};
use crate::config::{Settings, ToolCallingMode};
use crate::error::{AgentError, ToolError};
use crate::llm::{ChatAdapter, ChatModel, OpenAiCompatibleModel};
use crate::market::{YahooFinance, YahooFinanceConfig};
use crate::tools::{FinancialToolOptions, ToolRegistry};

pub const SYSTEM_PROMPT: &str = "You are a financial analyst. Given a `financial_query`, \
produce an `analysis_response`. Use the available tools to look up current stock prices, \
compare several tickers, and read recent company news before answering. Base every figure \
you quote on a tool observation, name the tickers involved, and say plainly when data \
could not be retrieved.";

pub struct FinancialAnalyst {
    agent: Agent,
}

impl FinancialAnalyst {
    /// Builds an analyst from an already configured model and tool set.
    pub fn new(
        model: Arc<dyn ChatModel>,
        registry: ToolRegistry,
        max_iterations: u32,
    ) -> Result<Self, AgentError> {
        let agent = Agent::builder()
            .shared_model(model)
            .registry(registry)
            .system_prompt(SYSTEM_PROMPT)
            .max_iterations(max_iterations)
            .build()?;

        Ok(Self { agent })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, AgentError> {
        let backend = OpenAiCompatibleModel::from_settings(settings)?;
        let model: Arc<dyn ChatModel> = match settings.tool_calling {
            ToolCallingMode::Adapter => Arc::new(ChatAdapter::new(backend)?),
            ToolCallingMode::Native => Arc::new(backend),
        };

        let yahoo = Arc::new(
            YahooFinance::new(YahooFinanceConfig::from(settings)).map_err(ToolError::from)?,
        );
        let registry = ToolRegistry::financial(
            yahoo.clone(),
            yahoo,
            FinancialToolOptions::from(settings),
        )?;

        info!(
            model = %settings.model_name,
            tool_calling = ?settings.tool_calling,
            max_iters = settings.max_iters,
            "financial analyst ready"
        );

        let agent = Agent::builder()
            .shared_model(model)
            .registry(registry)
            .system_prompt(SYSTEM_PROMPT)
            .max_iterations(settings.max_iters)
            .tool_timeout(settings.tool_timeout)
            .build()?;

        Ok(Self { agent })
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Answers one query from a fresh conversation.
    pub async fn analyze(&mut self, query: &str) -> Result<String, AgentError> {
        self.agent.clear_history();
        self.agent.query(query).await
    }

    pub fn analyze_stream(
        &mut self,
        query: &str,
    ) -> impl Stream<Item = Result<AgentEvent, AgentError>> + '_ {
        self.agent.clear_history();
        self.agent.query_stream(query.to_string())
    }
}
