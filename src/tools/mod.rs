mod market;
mod news;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::ComparisonPolicy;
use crate::error::{SchemaError, ToolError};
use crate::llm::ModelToolDefinition;
use crate::market::{MarketDataProvider, NewsProvider};

pub use market::{CompareStocksTool, StockPriceTool};
pub use news::FinanceNewsTool;

/// A capability the agent can invoke by name.
///
/// `parameters` is a JSON schema with `type: object` at the root; arguments are
/// validated against it before `call` runs.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters(&self) -> Value;

    async fn call(&self, args: Value) -> Result<String, ToolError>;
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The fixed financial tool set: news lookup, single quote, comparison.
    pub fn financial(
        market: Arc<dyn MarketDataProvider>,
        news: Arc<dyn NewsProvider>,
        options: FinancialToolOptions,
    ) -> Result<Self, ToolError> {
        Self::new()
            .with_tool(FinanceNewsTool::new(news, options.news_count))?
            .with_tool(StockPriceTool::new(market.clone()))?
            .with_tool(CompareStocksTool::new(
                market,
                options.comparison_policy,
                options.max_concurrent_fetches,
            ))
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        validate_schema(&tool.parameters())?;

        let name = tool.name().to_string();
        if self.index.contains_key(&name) {
            return Err(ToolError::DuplicateTool(name));
        }

        self.index.insert(name, self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    pub fn with_tool<T>(mut self, tool: T) -> Result<Self, ToolError>
    where
        T: Tool + 'static,
    {
        self.register(Arc::new(tool))?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.index.get(name).map(|position| &self.tools[*position])
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|tool| tool.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn definitions(&self) -> Vec<ModelToolDefinition> {
        self.tools
            .iter()
            .map(|tool| ModelToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }

    pub async fn execute(&self, name: &str, args: Value) -> Result<String, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        validate_arguments(tool.name(), &tool.parameters(), &args)?;
        tool.call(args).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FinancialToolOptions {
    pub comparison_policy: ComparisonPolicy,
    pub max_concurrent_fetches: usize,
    pub news_count: usize,
}

impl Default for FinancialToolOptions {
    fn default() -> Self {
        Self {
            comparison_policy: ComparisonPolicy::AllOrNothing,
            max_concurrent_fetches: 4,
            news_count: 5,
        }
    }
}

impl From<&crate::config::Settings> for FinancialToolOptions {
    fn from(settings: &crate::config::Settings) -> Self {
        Self {
            comparison_policy: settings.comparison_policy,
            max_concurrent_fetches: settings.max_concurrent_fetches,
            news_count: settings.news_count,
        }
    }
}

/// Schema for tools taking a single required string argument.
pub(crate) fn single_string_schema(field: &str, description: &str) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            field: {"type": "string", "description": description}
        },
        "required": [field],
        "additionalProperties": false
    })
}

pub(crate) fn string_arg<'a>(
    tool: &str,
    args: &'a Value,
    field: &str,
) -> Result<&'a str, ToolError> {
    args.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments {
            tool: tool.to_string(),
            message: format!("missing string field: {field}"),
        })
}

fn validate_schema(schema: &Value) -> Result<(), SchemaError> {
    let schema_obj = schema.as_object().ok_or(SchemaError::SchemaNotObject)?;

    let root_type = schema_obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(SchemaError::RootTypeMustBeObject)?;

    if root_type != "object" {
        return Err(SchemaError::RootTypeMustBeObject);
    }

    if let Some(required) = schema_obj.get("required") {
        let required_arr = required.as_array().ok_or(SchemaError::InvalidRequired)?;
        if required_arr.iter().any(|item| !item.is_string()) {
            return Err(SchemaError::InvalidRequired);
        }
    }

    Ok(())
}

fn validate_arguments(tool_name: &str, schema: &Value, args: &Value) -> Result<(), ToolError> {
    let invalid = |message: String| ToolError::InvalidArguments {
        tool: tool_name.to_string(),
        message,
    };

    let args_obj = args
        .as_object()
        .ok_or_else(|| invalid("arguments must be a JSON object".to_string()))?;

    let schema_obj = schema
        .as_object()
        .ok_or_else(|| invalid("tool schema must be a JSON object".to_string()))?;

    if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
        for field_name in required.iter().filter_map(Value::as_str) {
            if !args_obj.contains_key(field_name) {
                return Err(invalid(format!("missing required field: {field_name}")));
            }
        }
    }

    let properties = schema_obj
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if schema_obj
        .get("additionalProperties")
        .and_then(Value::as_bool)
        == Some(false)
    {
        if let Some(key) = args_obj.keys().find(|key| !properties.contains_key(*key)) {
            return Err(invalid(format!("unknown field: {key}")));
        }
    }

    for (key, value) in args_obj {
        let Some(type_name) = properties
            .get(key)
            .and_then(|field_schema| field_schema.get("type"))
            .and_then(Value::as_str)
        else {
            continue;
        };

        if !value_matches_type(value, type_name) {
            return Err(invalid(format!("field '{key}' must be of type {type_name}")));
        }
    }

    Ok(())
}

fn value_matches_type(value: &Value, type_name: &str) -> bool {
    match type_name {
        "string" => value.is_string(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "number" => value.as_f64().is_some(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}
