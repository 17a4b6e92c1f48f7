use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Value, json};

use super::*;
use crate::error::ProviderError;
use crate::llm::ChatAdapter;
use crate::market::{InMemoryMarket, MarketSnapshot};
use crate::tools::{FinancialToolOptions, StockPriceTool};

#[derive(Default)]
struct MockModel {
    responses: Mutex<VecDeque<Result<ModelCompletion, ProviderError>>>,
    seen_choices: Mutex<Vec<ModelToolChoice>>,
}

impl MockModel {
    fn with_responses(responses: Vec<Result<ModelCompletion, ProviderError>>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from(responses)),
            seen_choices: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ChatModel for MockModel {
    async fn invoke(
        &self,
        _messages: &[ModelMessage],
        _tools: &[ModelToolDefinition],
        tool_choice: ModelToolChoice,
    ) -> Result<ModelCompletion, ProviderError> {
        self.seen_choices
            .lock()
            .expect("lock poisoned")
            .push(tool_choice);
        let mut guard = self.responses.lock().expect("lock poisoned");
        guard.pop_front().unwrap_or_else(|| {
            Err(ProviderError::Response(
                "no more mock model responses".to_string(),
            ))
        })
    }
}

/// Sleeps far longer than any timeout used below.
struct SlowTool;

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "never returns in time"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}, "additionalProperties": false})
    }

    async fn call(&self, _args: Value) -> Result<String, ToolError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok("late".to_string())
    }
}

fn tool_call(id: &str, name: &str, arguments: Value) -> ModelToolCall {
    ModelToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

fn text(content: &str) -> Result<ModelCompletion, ProviderError> {
    Ok(ModelCompletion {
        text: Some(content.to_string()),
        ..ModelCompletion::default()
    })
}

fn calls(tool_calls: Vec<ModelToolCall>) -> Result<ModelCompletion, ProviderError> {
    Ok(ModelCompletion {
        tool_calls,
        ..ModelCompletion::default()
    })
}

fn market() -> InMemoryMarket {
    InMemoryMarket::new()
        .with_snapshot(
            "AAPL",
            MarketSnapshot::new(vec![189.1, 190.456], Some(187.0)).with_long_name("Apple Inc."),
        )
        .with_failure(
            "MSFT",
            MarketDataError::ProviderUnavailable("upstream returned 503".to_string()),
        )
}

fn quote_agent(model: MockModel) -> Agent {
    Agent::builder()
        .model(model)
        .tool(StockPriceTool::new(Arc::new(market())))
        .build()
        .expect("agent builds")
}

async fn collect_events(agent: &mut Agent, message: &str) -> Vec<AgentEvent> {
    agent
        .query_stream(message)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .expect("events ok")
}

fn tool_results(events: &[AgentEvent]) -> Vec<(&str, bool)> {
    events
        .iter()
        .filter_map(|event| match event {
            AgentEvent::ToolResult {
                result_text,
                is_error,
                ..
            } => Some((result_text.as_str(), *is_error)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn query_returns_no_tool_response() {
    let model = MockModel::with_responses(vec![text("hello")]);

    let mut agent = Agent::builder().model(model).build().expect("agent builds");
    let response = agent.query("hi").await.expect("query succeeds");

    assert_eq!(response, "hello");
}

#[tokio::test]
async fn build_requires_a_model() {
    let err = Agent::builder().build().err().expect("must fail");
    assert!(matches!(err, AgentError::Config(_)));
}

#[tokio::test]
async fn build_rejects_duplicate_tools() {
    let err = Agent::builder()
        .model(MockModel::default())
        .tool(SlowTool)
        .tool(SlowTool)
        .build()
        .err()
        .expect("must fail");
    assert!(matches!(err, AgentError::Config(message) if message.contains("duplicate")));
}

#[tokio::test]
async fn tool_call_then_final_response_flow() {
    let model = MockModel::with_responses(vec![
        calls(vec![tool_call(
            "call_1",
            "get_stock_price",
            json!({"ticker": "AAPL"}),
        )]),
        text("Apple trades at 190.46."),
    ]);
    let mut agent = quote_agent(model);

    let events = collect_events(&mut agent, "How is AAPL doing?").await;

    assert_eq!(events.len(), 4);
    assert!(matches!(&events[0], AgentEvent::ToolCall { tool, .. } if tool == "get_stock_price"));
    let observation: Value = match &events[1] {
        AgentEvent::ToolResult {
            result_text,
            is_error: false,
            ..
        } => serde_json::from_str(result_text).expect("json observation"),
        other => panic!("unexpected event: {other:?}"),
    };
    assert_eq!(observation["ticker"], "AAPL");
    assert_eq!(observation["price"], 190.46);
    assert_eq!(observation["company"], "Apple Inc.");
    assert_eq!(
        events[3],
        AgentEvent::FinalResponse {
            content: "Apple trades at 190.46.".to_string()
        }
    );
}

#[tokio::test]
async fn observations_are_appended_to_history_in_call_order() {
    let model = MockModel::with_responses(vec![
        calls(vec![
            tool_call("call_1", "get_stock_price", json!({"ticker": "AAPL"})),
            tool_call("call_2", "get_stock_price", json!({"ticker": "NOPE"})),
        ]),
        text("done"),
    ]);
    let mut agent = quote_agent(model);

    agent.query("two quotes").await.expect("query succeeds");

    let observed = agent
        .messages()
        .iter()
        .filter_map(|message| match message {
            ModelMessage::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(observed, vec!["call_1", "call_2"]);
}

#[tokio::test]
async fn missing_ticker_is_a_plain_observation() {
    let model = MockModel::with_responses(vec![
        calls(vec![tool_call(
            "call_1",
            "get_stock_price",
            json!({"ticker": "ZZZZ"}),
        )]),
        text("No data for ZZZZ."),
    ]);
    let mut agent = quote_agent(model);

    let events = collect_events(&mut agent, "Price of ZZZZ?").await;

    assert_eq!(
        tool_results(&events),
        vec![("Could not retrieve data for ZZZZ", true)]
    );
    assert_eq!(
        events.last(),
        Some(&AgentEvent::FinalResponse {
            content: "No data for ZZZZ.".to_string()
        })
    );
}

#[tokio::test]
async fn provider_failures_are_prefixed_observations() {
    let model = MockModel::with_responses(vec![
        calls(vec![tool_call(
            "call_1",
            "get_stock_price",
            json!({"ticker": "MSFT"}),
        )]),
        text("Quote service is down."),
    ]);
    let mut agent = quote_agent(model);

    let events = collect_events(&mut agent, "Price of MSFT?").await;

    let results = tool_results(&events);
    assert_eq!(results.len(), 1);
    assert!(results[0].0.starts_with("Error: "));
    assert!(results[0].0.contains("503"));
    assert!(results[0].1);
}

#[tokio::test]
async fn unknown_tool_and_bad_arguments_do_not_abort_the_loop() {
    let model = MockModel::with_responses(vec![
        calls(vec![
            tool_call("call_1", "get_crypto_price", json!({"symbol": "BTC"})),
            tool_call("call_2", "get_stock_price", json!({"symbol": "AAPL"})),
        ]),
        text("recovered"),
    ]);
    let mut agent = quote_agent(model);

    let events = collect_events(&mut agent, "try").await;

    let results = tool_results(&events);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0], ("Error: tool not found: get_crypto_price", true));
    assert!(results[1].0.starts_with("Error: "));
    assert!(results[1].0.contains("missing required field: ticker"));
}

#[tokio::test]
async fn slow_tools_time_out_as_error_observations() {
    let model = MockModel::with_responses(vec![
        calls(vec![tool_call("call_1", "slow", json!({}))]),
        text("gave up waiting"),
    ]);
    let mut agent = Agent::builder()
        .model(model)
        .tool(SlowTool)
        .tool_timeout(Duration::from_millis(20))
        .build()
        .expect("agent builds");

    let events = collect_events(&mut agent, "wait").await;

    let results = tool_results(&events);
    assert_eq!(results.len(), 1);
    assert!(results[0].0.starts_with("Error: tool slow timed out"));
    assert!(results[0].1);
}

#[tokio::test]
async fn iteration_cap_extracts_a_best_effort_answer() {
    let model = MockModel::with_responses(vec![
        calls(vec![tool_call(
            "call_1",
            "get_stock_price",
            json!({"ticker": "AAPL"}),
        )]),
        calls(vec![tool_call(
            "call_2",
            "get_stock_price",
            json!({"ticker": "AAPL"}),
        )]),
        text("AAPL closed at 190.46."),
    ]);
    let mut agent = Agent::builder()
        .model(model)
        .tool(StockPriceTool::new(Arc::new(market())))
        .max_iterations(2)
        .build()
        .expect("agent builds");

    let events = collect_events(&mut agent, "loop").await;

    assert!(events.contains(&AgentEvent::IterationLimitReached { max_iterations: 2 }));
    assert_eq!(
        events.last(),
        Some(&AgentEvent::FinalResponse {
            content: "AAPL closed at 190.46.".to_string()
        })
    );
    assert_eq!(tool_results(&events).len(), 2);
}

#[tokio::test]
async fn iteration_cap_disables_tools_for_the_extraction_call() {
    let model = Arc::new(MockModel::with_responses(vec![
        calls(vec![tool_call(
            "call_1",
            "get_stock_price",
            json!({"ticker": "AAPL"}),
        )]),
        text("summary"),
    ]));
    let mut agent = Agent::builder()
        .shared_model(model.clone())
        .tool(StockPriceTool::new(Arc::new(market())))
        .max_iterations(1)
        .build()
        .expect("agent builds");

    let response = agent.query("loop").await.expect("query succeeds");

    assert_eq!(response, "summary");
    let choices = model.seen_choices.lock().expect("lock poisoned").clone();
    assert_eq!(choices, vec![ModelToolChoice::Auto, ModelToolChoice::None]);
}

#[tokio::test]
async fn iteration_cap_falls_back_to_last_observation() {
    let model = MockModel::with_responses(vec![calls(vec![tool_call(
        "call_1",
        "get_stock_price",
        json!({"ticker": "ZZZZ"}),
    )])]);
    let mut agent = Agent::builder()
        .model(model)
        .tool(StockPriceTool::new(Arc::new(market())))
        .max_iterations(1)
        .build()
        .expect("agent builds");

    let response = agent.query("loop").await.expect("never an error");

    assert_eq!(
        response,
        "Stopped after 1 reasoning steps without a final answer. \
         Last observation: Could not retrieve data for ZZZZ"
    );
}

#[tokio::test]
async fn provider_errors_surface_from_query() {
    let model = MockModel::with_responses(vec![Err(ProviderError::Request(
        "connection refused".to_string(),
    ))]);
    let mut agent = quote_agent(model);

    let err = agent.query("hi").await.expect_err("must fail");
    assert!(matches!(err, AgentError::Provider(_)));
}

#[tokio::test]
async fn system_prompt_is_sent_once_per_history() {
    let model = MockModel::with_responses(vec![text("one"), text("two")]);
    let mut agent = Agent::builder()
        .model(model)
        .system_prompt("You are a financial analyst.")
        .build()
        .expect("agent builds");

    agent.query("first").await.expect("first");
    agent.query("second").await.expect("second");

    let system_count = agent
        .messages()
        .iter()
        .filter(|message| matches!(message, ModelMessage::System(_)))
        .count();
    assert_eq!(system_count, 1);

    agent.clear_history();
    assert_eq!(agent.messages_len(), 0);
}

/// Plain-text model driven through the adapter, as with Perplexity.
#[tokio::test]
async fn adapter_protocol_drives_a_full_analysis() {
    let replies = vec![
        text(
            "[[ ## next_thought ## ]]\nI need Apple's quote.\n\n\
             [[ ## next_tool_name ## ]]\nget_stock_price\n\n\
             [[ ## next_tool_args ## ]]\n{\"ticker\": \"AAPL\"}\n\n\
             [[ ## completed ## ]]",
        ),
        text(
            "[[ ## next_thought ## ]]\nI have enough.\n\n\
             [[ ## next_tool_name ## ]]\nfinish\n\n\
             [[ ## next_tool_args ## ]]\n{\"answer\": \"AAPL is at 190.46, up 1.85%.\"}\n\n\
             [[ ## completed ## ]]",
        ),
    ];
    let model = ChatAdapter::new(MockModel::with_responses(replies)).expect("adapter");
    let market = Arc::new(market());
    let registry = ToolRegistry::financial(
        market.clone(),
        market.clone(),
        FinancialToolOptions::default(),
    )
    .expect("registry builds");
    let mut agent = Agent::builder()
        .model(model)
        .registry(registry)
        .build()
        .expect("agent builds");

    let response = agent
        .query("How is Apple doing?")
        .await
        .expect("query succeeds");

    assert_eq!(response, "AAPL is at 190.46, up 1.85%.");
    assert_eq!(market.requested(), vec!["AAPL".to_string()]);
}

#[test]
fn render_tool_error_distinguishes_missing_data() {
    let missing = ToolError::Market(MarketDataError::TickerNotFound {
        ticker: "AAPL".to_string(),
    });
    assert_eq!(render_tool_error(&missing), "Could not retrieve data for AAPL");

    let failed = ToolError::Execution("boom".to_string());
    assert_eq!(
        render_tool_error(&failed),
        "Error: tool execution failed: boom"
    );

#[tokio::test]
async fn unparseable_arguments_become_an_observation() {
    let model = MockModel::with_responses(vec![
        calls(vec![tool_call(
            "call_1",
            "get_stock_price",
            Value::String("{not json}".to_string()),
        )]),
        text("Retrying was not needed."),
    ]);
    let mut agent = quote_agent(model);

    let events = collect_events(&mut agent, "Price of AAPL?").await;

    let results = tool_results(&events);
    assert_eq!(results.len(), 1);
    assert!(
        results[0]
            .0
            .starts_with("Error: invalid tool arguments for get_stock_price")
    );
    assert!(results[0].1);
    assert_eq!(
        events.last(),
        Some(&AgentEvent::FinalResponse {
            content: "Retrying was not needed.".to_string()
        })
    );
}

#[test]
fn tool_calls_are_bounded_by_default() {
    let agent = Agent::builder()
        .model(MockModel::default())
        .build()
        .expect("agent builds");

    assert_eq!(agent.config().tool_timeout, Some(DEFAULT_TOOL_TIMEOUT));
    assert_eq!(agent.config().max_iterations, 6);
}
}
