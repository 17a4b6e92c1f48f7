use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::error::{AgentError, MarketDataError, ToolError};
use crate::llm::{
    ChatModel, ModelCompletion, ModelMessage, ModelToolCall, ModelToolChoice, ModelToolDefinition,
};
use crate::tools::{Tool, ToolRegistry};

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_iterations: u32,
    pub system_prompt: Option<String>,
    pub tool_timeout: Option<Duration>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 6,
            system_prompt: None,
            tool_timeout: Some(DEFAULT_TOOL_TIMEOUT),
        }
    }
}

/// Phases of one query. `Acting` runs a single tool call, `Observing` folds its
/// result into the history; the loop ends in `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Reasoning,
    Acting,
    Observing,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Thinking {
        content: String,
    },
    Text {
        content: String,
    },
    ToolCall {
        tool: String,
        args_json: serde_json::Value,
        tool_call_id: String,
    },
    ToolResult {
        tool: String,
        result_text: String,
        tool_call_id: String,
        is_error: bool,
    },
    IterationLimitReached {
        max_iterations: u32,
    },
    FinalResponse {
        content: String,
    },
}

#[derive(Default)]
pub struct AgentBuilder {
    model: Option<Arc<dyn ChatModel>>,
    registry: ToolRegistry,
    config: AgentConfig,
    pending_error: Option<ToolError>,
}

impl AgentBuilder {
    pub fn model<M>(mut self, model: M) -> Self
    where
        M: ChatModel + 'static,
    {
        self.model = Some(Arc::new(model));
        self
    }

    pub fn shared_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn tool<T>(mut self, tool: T) -> Self
    where
        T: Tool + 'static,
    {
        if self.pending_error.is_none() {
            if let Err(err) = self.registry.register(Arc::new(tool)) {
                self.pending_error = Some(err);
            }
        }
        self
    }

    pub fn registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    pub fn tool_timeout(mut self, tool_timeout: Duration) -> Self {
        self.config.tool_timeout = Some(tool_timeout);
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        if let Some(err) = self.pending_error {
            return Err(AgentError::Config(err.to_string()));
        }

        let Some(model) = self.model else {
            return Err(AgentError::Config(
                "agent model must be configured via AgentBuilder::model(...)".to_string(),
            ));
        };

        if self.config.max_iterations == 0 {
            return Err(AgentError::Config(
                "max_iterations must be greater than 0".to_string(),
            ));
        }

        Ok(Agent {
            model,
            tool_definitions: self.registry.definitions(),
            registry: self.registry,
            config: self.config,
            history: Vec::new(),
        })
    }
}

pub struct Agent {
    model: Arc<dyn ChatModel>,
    registry: ToolRegistry,
    tool_definitions: Vec<ModelToolDefinition>,
    config: AgentConfig,
    history: Vec<ModelMessage>,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn messages(&self) -> &[ModelMessage] {
        &self.history
    }

    pub fn messages_len(&self) -> usize {
        self.history.len()
    }

    pub async fn query(&mut self, user_message: impl Into<String>) -> Result<String, AgentError> {
        let stream = self.query_stream(user_message);
        futures_util::pin_mut!(stream);

        let mut final_response: Option<String> = None;

        while let Some(event) = stream.next().await {
            if let AgentEvent::FinalResponse { content } = event? {
                final_response = Some(content);
            }
        }

        final_response.ok_or(AgentError::MissingFinalResponse)
    }

    pub fn query_stream(
        &mut self,
        user_message: impl Into<String>,
    ) -> impl Stream<Item = Result<AgentEvent, AgentError>> + '_ {
        let user_message = user_message.into();

        try_stream! {
            if self.history.is_empty() {
                if let Some(system_prompt) = &self.config.system_prompt {
                    self.history
                        .push(ModelMessage::System(system_prompt.clone()));
                }
            }

            self.history.push(ModelMessage::User(user_message));

            let tool_choice = if self.tool_definitions.is_empty() {
                ModelToolChoice::None
            } else {
                ModelToolChoice::Auto
            };

            let max_iterations = self.config.max_iterations;
            let mut state = AgentState::Reasoning;
            let mut iterations = 0_u32;
            let mut pending = VecDeque::<ModelToolCall>::new();
            let mut observation: Option<(ModelToolCall, ToolExecution)> = None;

            loop {
                match state {
                    AgentState::Reasoning => {
                        if iterations >= max_iterations {
                            warn!(max_iterations, "iteration limit reached without final answer");
                            yield AgentEvent::IterationLimitReached { max_iterations };
                            let content = self.best_effort_answer().await;
                            yield AgentEvent::FinalResponse { content };
                            state = AgentState::Done;
                            continue;
                        }

                        iterations += 1;
                        debug!(iteration = iterations, max_iterations, "reasoning");

                        let completion = self
                            .model
                            .invoke(&self.history, &self.tool_definitions, tool_choice.clone())
                            .await?;

                        if let Some(thinking) = completion.thinking.clone() {
                            yield AgentEvent::Thinking { content: thinking };
                        }

                        self.append_assistant_message(&completion);

                        if let Some(text) = completion.text.clone().filter(|text| !text.is_empty()) {
                            yield AgentEvent::Text { content: text };
                        }

                        if completion.tool_calls.is_empty() {
                            yield AgentEvent::FinalResponse {
                                content: completion.text.unwrap_or_default(),
                            };
                            state = AgentState::Done;
                        } else {
                            pending.extend(completion.tool_calls);
                            state = AgentState::Acting;
                        }
                    }
                    AgentState::Acting => {
                        let Some(tool_call) = pending.pop_front() else {
                            state = AgentState::Reasoning;
                            continue;
                        };

                        yield AgentEvent::ToolCall {
                            tool: tool_call.name.clone(),
                            args_json: tool_call.arguments.clone(),
                            tool_call_id: tool_call.id.clone(),
                        };

                        let execution = self.execute_tool_call(&tool_call).await;
                        observation = Some((tool_call, execution));
                        state = AgentState::Observing;
                    }
                    AgentState::Observing => {
                        let Some((tool_call, execution)) = observation.take() else {
                            state = AgentState::Reasoning;
                            continue;
                        };

                        self.history.push(ModelMessage::ToolResult {
                            tool_call_id: tool_call.id.clone(),
                            tool_name: tool_call.name.clone(),
                            content: execution.result_text.clone(),
                            is_error: execution.is_error,
                        });

                        yield AgentEvent::ToolResult {
                            tool: tool_call.name,
                            result_text: execution.result_text,
                            tool_call_id: tool_call.id,
                            is_error: execution.is_error,
                        };

                        state = if pending.is_empty() {
                            AgentState::Reasoning
                        } else {
                            AgentState::Acting
                        };
                    }
                    AgentState::Done => break,
                }
            }
        }
    }

    fn append_assistant_message(&mut self, completion: &ModelCompletion) {
        self.history.push(ModelMessage::Assistant {
            content: completion.text.clone(),
            tool_calls: completion.tool_calls.clone(),
        });
    }

    /// Asks the model once more, with tools disabled, for an answer built from
    /// the observations gathered so far. Falls back to the last observation.
    async fn best_effort_answer(&mut self) -> String {
        let max_iterations = self.config.max_iterations;
        self.history.push(ModelMessage::User(format!(
            "The limit of {max_iterations} reasoning steps has been reached. Do not call any \
             more tools; give your best final answer using the observations so far."
        )));

        match self
            .model
            .invoke(&self.history, &self.tool_definitions, ModelToolChoice::None)
            .await
        {
            Ok(completion) => {
                if let Some(text) = completion.text.filter(|text| !text.trim().is_empty()) {
                    self.history.push(ModelMessage::Assistant {
                        content: Some(text.clone()),
                        tool_calls: Vec::new(),
                    });
                    return text;
                }
                warn!("final answer extraction returned no text");
            }
            Err(err) => warn!(error = %err, "final answer extraction failed"),
        }

        let last_observation = self.history.iter().rev().find_map(|message| match message {
            ModelMessage::ToolResult { content, .. } => Some(content.as_str()),
            _ => None,
        });

        match last_observation {
            Some(observation) => format!(
                "Stopped after {max_iterations} reasoning steps without a final answer. \
                 Last observation: {observation}"
            ),
            None => format!("Stopped after {max_iterations} reasoning steps without a final answer."),
        }
    }

    async fn execute_tool_call(&self, tool_call: &ModelToolCall) -> ToolExecution {
        let started = Instant::now();
        let execution = self
            .registry
            .execute(&tool_call.name, tool_call.arguments.clone());

        let outcome = match self.config.tool_timeout {
            Some(limit) => match tokio::time::timeout(limit, execution).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ToolError::Timeout {
                    tool: tool_call.name.clone(),
                    after: limit,
                }),
            },
            None => execution.await,
        };

        let elapsed_ms = started.elapsed().as_millis();
        match outcome {
            Ok(text) => {
                info!(tool = %tool_call.name, elapsed_ms, "tool succeeded");
                ToolExecution {
                    result_text: text,
                    is_error: false,
                }
            }
            Err(err) => {
                warn!(tool = %tool_call.name, elapsed_ms, error = %err, "tool failed");
                ToolExecution {
                    result_text: render_tool_error(&err),
                    is_error: true,
                }
            }
        }
    }
}

/// Observation text for a failed tool call. Missing market data reads as a
/// plain sentence; everything else carries the `Error: ` prefix.
pub fn render_tool_error(err: &ToolError) -> String {
    match err {
        ToolError::Market(missing @ MarketDataError::TickerNotFound { .. }) => missing.to_string(),
        other => format!("Error: {other}"),
    }
}

struct ToolExecution {
    result_text: String,
    is_error: bool,
}

pub async fn query(
    agent: &mut Agent,
    user_message: impl Into<String>,
) -> Result<String, AgentError> {
    agent.query(user_message).await
}

pub fn query_stream(
    agent: &mut Agent,
    user_message: impl Into<String>,
) -> impl Stream<Item = Result<AgentEvent, AgentError>> + '_ {
    agent.query_stream(user_message)
}

#[cfg(test)]
mod tests;
