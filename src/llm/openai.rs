use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::{DEFAULT_API_BASE_URL, Settings};
use crate::error::ProviderError;
use crate::llm::{
    ChatModel, ModelCompletion, ModelMessage, ModelToolCall, ModelToolChoice, ModelToolDefinition,
    ModelUsage,
};

const EMPTY_USER_CONTENT_FALLBACK: &str = " ";

/// Connection settings for any `/chat/completions` endpoint speaking the
/// OpenAI wire format (Perplexity by default).
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleConfig {
    pub api_key: String,
    pub model: String,
    pub api_base_url: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout: Duration,
}

impl OpenAiCompatibleConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            api_base_url: None,
            temperature: None,
            top_p: None,
            max_tokens: Some(4096),
            timeout: Duration::from_secs(60),
        }
    }
}

impl From<&Settings> for OpenAiCompatibleConfig {
    fn from(settings: &Settings) -> Self {
        let mut config = Self::new(settings.api_key.clone(), settings.model_name.clone());
        config.api_base_url = Some(settings.api_base_url.clone());
        config.temperature = Some(settings.temperature);
        config.timeout = settings.request_timeout;
        config
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiCompatibleModel {
    client: Client,
    config: OpenAiCompatibleConfig,
}

impl OpenAiCompatibleModel {
    pub fn new(config: OpenAiCompatibleConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ProviderError> {
        Self::new(OpenAiCompatibleConfig::from(settings))
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/chat/completions")
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatibleModel {
    async fn invoke(
        &self,
        messages: &[ModelMessage],
        tools: &[ModelToolDefinition],
        tool_choice: ModelToolChoice,
    ) -> Result<ModelCompletion, ProviderError> {
        let request = build_request(messages, tools, tool_choice, &self.config);
        debug!(
            model = %self.config.model,
            messages = request.messages.len(),
            tools = tools.len(),
            "sending chat completion request"
        );

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::Request(extract_api_error(response).await));
        }

        let payload = response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|err| ProviderError::Response(err.to_string()))?;

        normalize_response(payload)
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<RequestMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinitionPayload>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum RequestMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<WireToolCall>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct ToolDefinitionPayload {
    #[serde(rename = "type")]
    type_: &'static str,
    function: ToolFunctionDefinition,
}

#[derive(Debug, Serialize)]
struct ToolFunctionDefinition {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    type_: String,
    function: WireToolCallFunction,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct WireToolCallFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<AssistantMessage>,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: Option<String>,
    #[serde(rename = "type")]
    type_: Option<String>,
    code: Option<Value>,
}

fn build_request(
    messages: &[ModelMessage],
    tools: &[ModelToolDefinition],
    tool_choice: ModelToolChoice,
    config: &OpenAiCompatibleConfig,
) -> ChatCompletionRequest {
    let request_messages = ensure_non_empty_messages(to_request_messages(messages));

    let (tools_payload, tool_choice_payload) = if tools.is_empty() {
        (None, None)
    } else {
        let definitions = tools
            .iter()
            .map(|tool| ToolDefinitionPayload {
                type_: "function",
                function: ToolFunctionDefinition {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                },
            })
            .collect::<Vec<_>>();

        let choice = match tool_choice {
            ModelToolChoice::Auto => "auto",
            ModelToolChoice::None => "none",
        };

        (Some(definitions), Some(choice))
    };

    ChatCompletionRequest {
        model: config.model.clone(),
        messages: request_messages,
        tools: tools_payload,
        tool_choice: tool_choice_payload,
        temperature: config.temperature,
        top_p: config.top_p,
        max_tokens: config.max_tokens,
    }
}

fn to_request_messages(messages: &[ModelMessage]) -> Vec<RequestMessage> {
    let mut request_messages = Vec::new();

    for message in messages {
        match message {
            ModelMessage::System(content) if !content.is_empty() => {
                request_messages.push(RequestMessage::System {
                    content: content.clone(),
                });
            }
            ModelMessage::User(content) if !content.is_empty() => {
                request_messages.push(RequestMessage::User {
                    content: content.clone(),
                });
            }
            ModelMessage::System(_) | ModelMessage::User(_) => {}
            ModelMessage::Assistant {
                content,
                tool_calls,
            } => {
                let wire_calls = tool_calls
                    .iter()
                    .map(|tool_call| WireToolCall {
                        id: tool_call.id.clone(),
                        type_: function_type(),
                        function: WireToolCallFunction {
                            name: tool_call.name.clone(),
                            arguments: tool_call.arguments.to_string(),
                        },
                    })
                    .collect::<Vec<_>>();

                let assistant_content = content.as_ref().filter(|text| !text.is_empty()).cloned();
                if assistant_content.is_none() && wire_calls.is_empty() {
                    continue;
                }

                request_messages.push(RequestMessage::Assistant {
                    content: assistant_content,
                    tool_calls: (!wire_calls.is_empty()).then_some(wire_calls),
                });
            }
            // Observations arrive already rendered by the agent loop.
            ModelMessage::ToolResult {
                tool_call_id,
                content,
                ..
            } => {
                request_messages.push(RequestMessage::Tool {
                    tool_call_id: tool_call_id.clone(),
                    content: content.clone(),
                });
            }
        }
    }

    request_messages
}

fn ensure_non_empty_messages(mut messages: Vec<RequestMessage>) -> Vec<RequestMessage> {
    if messages.is_empty() {
        messages.push(RequestMessage::User {
            content: EMPTY_USER_CONTENT_FALLBACK.to_string(),
        });
    }

    messages
}

fn normalize_response(response: ChatCompletionResponse) -> Result<ModelCompletion, ProviderError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Response("chat completion missing choices".to_string()))?;

    let message = choice.message.ok_or_else(|| {
        ProviderError::Response("chat completion missing choice message".to_string())
    })?;

    let mut tool_calls = Vec::with_capacity(message.tool_calls.len());
    for tool_call in message.tool_calls {
        let raw = tool_call.function.arguments;
        let arguments = if raw.trim().is_empty() {
            json!({})
        } else {
            // Unparseable arguments go to the registry, which reports them as an observation.
            serde_json::from_str::<Value>(&raw).unwrap_or_else(|err| {
                warn!(tool = %tool_call.function.name, error = %err, "tool call arguments are not valid JSON");
                Value::String(raw)
            })
        };

        tool_calls.push(ModelToolCall {
            id: tool_call.id,
            name: tool_call.function.name,
            arguments,
        });
    }

    let usage = response.usage.map(|usage| ModelUsage {
        input_tokens: usage.prompt_tokens.unwrap_or(0),
        output_tokens: usage.completion_tokens.unwrap_or(0),
    });

    Ok(ModelCompletion {
        text: message.content.filter(|text| !text.is_empty()),
        thinking: message.reasoning_content.filter(|text| !text.is_empty()),
        tool_calls,
        usage,
    })
}

async fn extract_api_error(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    if let Ok(parsed) = serde_json::from_str::<ErrorEnvelope>(&body) {
        let code = parsed
            .error
            .code
            .map(|value| match value {
                Value::String(value) => value,
                other => other.to_string(),
            })
            .unwrap_or_else(|| status.as_u16().to_string());
        let error_type = parsed
            .error
            .type_
            .unwrap_or_else(|| status.to_string().to_uppercase());
        let message = parsed
            .error
            .message
            .unwrap_or_else(|| "unknown api error".to_string());

        return format!("chat completion api error {code} {error_type}: {message}");
    }

    if body.is_empty() {
        format!("chat completion request failed ({status})")
    } else {
        format!("chat completion request failed ({status}): {body}")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn quote_tool_definition() -> ModelToolDefinition {
        ModelToolDefinition {
            name: "get_stock_price".to_string(),
            description: "Get current stock price".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "ticker": {"type": "string"}
                },
                "required": ["ticker"],
                "additionalProperties": false
            }),
        }
    }

    #[test]
    fn build_request_serializes_messages_tools_and_tool_choice() {
        let messages = vec![
            ModelMessage::System("You are a financial analyst".to_string()),
            ModelMessage::User("How is AAPL doing?".to_string()),
            ModelMessage::Assistant {
                content: Some("Fetching quote".to_string()),
                tool_calls: vec![ModelToolCall {
                    id: "call_1".to_string(),
                    name: "get_stock_price".to_string(),
                    arguments: json!({"ticker": "AAPL"}),
                }],
            },
            ModelMessage::ToolResult {
                tool_call_id: "call_1".to_string(),
                tool_name: "get_stock_price".to_string(),
                content: "Error: provider down".to_string(),
                is_error: true,
            },
        ];

        let mut config = OpenAiCompatibleConfig::new("key", "sonar");
        config.temperature = Some(0.0);
        config.max_tokens = Some(512);

        let request = build_request(
            &messages,
            &[quote_tool_definition()],
            ModelToolChoice::Auto,
            &config,
        );
        let value = serde_json::to_value(request).expect("serializes");

        assert_eq!(value["model"], "sonar");
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][2]["role"], "assistant");
        assert_eq!(
            value["messages"][2]["tool_calls"][0]["function"]["arguments"],
            "{\"ticker\":\"AAPL\"}"
        );
        assert_eq!(value["messages"][3]["role"], "tool");
        assert_eq!(value["messages"][3]["content"], "Error: provider down");
        assert_eq!(value["tools"][0]["function"]["name"], "get_stock_price");
        assert_eq!(value["tool_choice"], "auto");
        assert_eq!(value["temperature"], 0.0);
        assert_eq!(value["max_tokens"], 512);
    }

    #[test]
    fn build_request_omits_tools_when_none_are_offered() {
        let messages = vec![ModelMessage::User(String::new())];
        let config = OpenAiCompatibleConfig::new("key", "sonar");

        let request = build_request(&messages, &[], ModelToolChoice::Auto, &config);
        let value = serde_json::to_value(request).expect("serializes");

        assert_eq!(value["messages"].as_array().map(Vec::len), Some(1));
        assert_eq!(value["messages"][0]["content"], " ");
        assert!(value.get("tools").is_none());
        assert!(value.get("tool_choice").is_none());
    }

    #[test]
    fn normalize_response_extracts_text_tool_calls_and_usage() {
        let payload = serde_json::from_value::<ChatCompletionResponse>(json!({
            "id": "resp",
            "model": "sonar",
            "citations": ["https://example.com"],
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "checking",
                    "tool_calls": [{
                        "id": "call_x",
                        "type": "function",
                        "function": {"name": "compare_stocks", "arguments": "{\"tickers\":\"AAPL,MSFT\"}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 11, "completion_tokens": 7}
        }))
        .expect("payload deserializes");

        let completion = normalize_response(payload).expect("response normalizes");

        assert_eq!(completion.text.as_deref(), Some("checking"));
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].arguments["tickers"], "AAPL,MSFT");
        assert_eq!(
            completion.usage,
            Some(ModelUsage {
                input_tokens: 11,
                output_tokens: 7,
            })
        );
    }

    #[test]
    fn normalize_response_requires_choices() {
        let err = normalize_response(ChatCompletionResponse {
            choices: Vec::new(),
            usage: None,
        })
        .expect_err("should fail");

        match err {
            ProviderError::Response(message) => assert!(message.contains("missing choices")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn normalize_response_forwards_invalid_tool_arguments_verbatim() {
        let payload = serde_json::from_value::<ChatCompletionResponse>(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_x",
                        "function": {"name": "get_stock_price", "arguments": "{not json}"}
                    }]
                }
            }]
        }))
        .expect("payload deserializes");

        let completion = normalize_response(payload).expect("response normalizes");
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].name, "get_stock_price");
        assert_eq!(
            completion.tool_calls[0].arguments,
            Value::String("{not json}".to_string())
        );
    }

    #[test]
    fn settings_map_onto_client_config() {
        let mut settings = Settings::new("pk");
        settings.model_name = "sonar-pro".to_string();

        let config = OpenAiCompatibleConfig::from(&settings);

        assert_eq!(config.model, "sonar-pro");
        assert_eq!(config.api_base_url.as_deref(), Some(DEFAULT_API_BASE_URL));
        assert_eq!(config.temperature, Some(0.0));
    }
}
