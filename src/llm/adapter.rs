//! Text protocol for models without native function calling.
//!
//! The adapter renders the tool list and the trajectory so far into a single
//! prompt built from `[[ ## field ## ]]` sections, asks the wrapped model for a
//! plain-text reply, and parses `next_thought` / `next_tool_name` /
//! `next_tool_args` back into a [`ModelCompletion`]. The wrapped model never
//! sees tool definitions or a JSON response format.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::ProviderError;
use crate::llm::{
    ChatModel, ModelCompletion, ModelMessage, ModelToolCall, ModelToolChoice, ModelToolDefinition,
};

/// Pseudo-tool the model calls to hand back its final answer.
pub const FINISH_TOOL: &str = "finish";

const FIELD_MARKER: &str = r"\[\[ ## (\w+) ## \]\]";

pub struct ChatAdapter<M> {
    inner: M,
    field_marker: Regex,
    next_call_id: AtomicU64,
}

impl<M> ChatAdapter<M>
where
    M: ChatModel,
{
    pub fn new(inner: M) -> Result<Self, ProviderError> {
        let field_marker = Regex::new(FIELD_MARKER)
            .map_err(|err| ProviderError::Request(format!("invalid field marker: {err}")))?;

        Ok(Self {
            inner,
            field_marker,
            next_call_id: AtomicU64::new(1),
        })
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    fn parse_fields(&self, reply: &str) -> HashMap<String, String> {
        let markers = self
            .field_marker
            .captures_iter(reply)
            .filter_map(|captures| {
                let whole = captures.get(0)?;
                let name = captures.get(1)?.as_str().to_string();
                Some((name, whole.start(), whole.end()))
            })
            .collect::<Vec<_>>();

        let mut fields = HashMap::new();
        for (position, (name, _, content_start)) in markers.iter().enumerate() {
            let content_end = markers
                .get(position + 1)
                .map_or(reply.len(), |(_, next_start, _)| *next_start);
            fields
                .entry(name.clone())
                .or_insert_with(|| reply[*content_start..content_end].trim().to_string());
        }
        fields
    }

    fn to_action(&self, mut fields: HashMap<String, String>, reply: &str) -> ModelCompletion {
        let thought = fields.remove("next_thought").filter(|text| !text.is_empty());

        let Some(tool_name) = fields
            .remove("next_tool_name")
            .map(|name| clean_tool_name(&name))
            .filter(|name| !name.is_empty())
        else {
            // No action section: take whatever the model said as its answer.
            let answer = fields
                .remove("answer")
                .unwrap_or_else(|| reply.trim().to_string());
            return ModelCompletion {
                text: Some(answer),
                thinking: thought,
                ..ModelCompletion::default()
            };
        };

        let arguments = parse_tool_args(fields.remove("next_tool_args").as_deref());

        if tool_name == FINISH_TOOL {
            let answer = arguments
                .get("answer")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| thought.clone())
                .unwrap_or_else(|| reply.trim().to_string());
            return ModelCompletion {
                text: Some(answer),
                thinking: thought,
                ..ModelCompletion::default()
            };
        }

        let id = format!("call_{}", self.next_call_id.fetch_add(1, Ordering::Relaxed));
        ModelCompletion {
            text: thought,
            thinking: None,
            tool_calls: vec![ModelToolCall {
                id,
                name: tool_name,
                arguments,
            }],
            usage: None,
        }
    }
}

#[async_trait]
impl<M> ChatModel for ChatAdapter<M>
where
    M: ChatModel,
{
    async fn invoke(
        &self,
        messages: &[ModelMessage],
        tools: &[ModelToolDefinition],
        tool_choice: ModelToolChoice,
    ) -> Result<ModelCompletion, ProviderError> {
        let acting = !tools.is_empty() && tool_choice != ModelToolChoice::None;
        let prompt = if acting {
            render_action_prompt(messages, tools)
        } else {
            render_answer_prompt(messages)
        };

        let completion = self
            .inner
            .invoke(&prompt, &[], ModelToolChoice::None)
            .await?;
        let reply = completion.text.unwrap_or_default();
        let fields = self.parse_fields(&reply);
        let field_names = fields.keys().cloned().collect::<Vec<_>>();
        debug!(acting, fields = ?field_names, "parsed adapter reply");

        let mut parsed = if acting {
            self.to_action(fields, &reply)
        } else {
            let mut fields = fields;
            ModelCompletion {
                text: Some(
                    fields
                        .remove("answer")
                        .unwrap_or_else(|| reply.trim().to_string()),
                ),
                thinking: fields.remove("reasoning").filter(|text| !text.is_empty()),
                ..ModelCompletion::default()
            }
        };

        if parsed.thinking.is_none() {
            parsed.thinking = completion.thinking;
        }
        parsed.usage = completion.usage;
        Ok(parsed)
    }
}

struct Transcript {
    instructions: Vec<String>,
    query: String,
    trajectory: String,
}

fn collect_transcript(messages: &[ModelMessage]) -> Transcript {
    let mut instructions = Vec::new();
    let mut query: Option<String> = None;
    let mut trajectory = String::new();
    let mut steps = HashMap::new();
    let mut step = 0_usize;

    for message in messages {
        match message {
            ModelMessage::System(content) => instructions.push(content.clone()),
            ModelMessage::User(content) => {
                if query.is_none() {
                    query = Some(content.clone());
                } else {
                    push_field(&mut trajectory, "note", content);
                }
            }
            ModelMessage::Assistant {
                content,
                tool_calls,
            } => {
                if tool_calls.is_empty() {
                    if let Some(content) = content {
                        push_field(&mut trajectory, "previous_answer", content);
                    }
                    continue;
                }
                for tool_call in tool_calls {
                    push_field(
                        &mut trajectory,
                        &format!("thought_{step}"),
                        content.as_deref().unwrap_or_default(),
                    );
                    push_field(&mut trajectory, &format!("tool_name_{step}"), &tool_call.name);
                    push_field(
                        &mut trajectory,
                        &format!("tool_args_{step}"),
                        &tool_call.arguments.to_string(),
                    );
                    steps.insert(tool_call.id.clone(), step);
                    step += 1;
                }
            }
            ModelMessage::ToolResult {
                tool_call_id,
                content,
                ..
            } => {
                let index = steps
                    .get(tool_call_id)
                    .copied()
                    .unwrap_or(step.saturating_sub(1));
                push_field(&mut trajectory, &format!("observation_{index}"), content);
            }
        }
    }

    Transcript {
        instructions,
        query: query.unwrap_or_default(),
        trajectory,
    }
}

fn push_field(buffer: &mut String, name: &str, content: &str) {
    let _ = write!(buffer, "[[ ## {name} ## ]]\n{content}\n\n");
}

fn render_action_prompt(
    messages: &[ModelMessage],
    tools: &[ModelToolDefinition],
) -> Vec<ModelMessage> {
    let transcript = collect_transcript(messages);

    let mut system = String::new();
    for instruction in &transcript.instructions {
        let _ = writeln!(system, "{instruction}\n");
    }
    system.push_str(
        "Your input fields are:\n\
         1. `query` (str)\n\
         2. `trajectory` (str)\n\
         Your output fields are:\n\
         1. `next_thought` (str)\n\
         2. `next_tool_name` (str): the name of one of the tools listed below\n\
         3. `next_tool_args` (str): a JSON object with the arguments for that tool\n\n\
         All interactions will be structured in the following way, with the appropriate values filled in.\n\n\
         [[ ## query ## ]]\n{query}\n\n\
         [[ ## trajectory ## ]]\n{trajectory}\n\n\
         [[ ## next_thought ## ]]\n{next_thought}\n\n\
         [[ ## next_tool_name ## ]]\n{next_tool_name}\n\n\
         [[ ## next_tool_args ## ]]\n{next_tool_args}\n\n\
         [[ ## completed ## ]]\n\n\
         In adhering to this structure, your objective is: answer the query by interleaving \
         thoughts with tool calls. Each observation is appended to the trajectory. When you \
         have enough information, call `finish` with the final answer.\n\n\
         Available tools:\n",
    );

    for (position, tool) in tools.iter().enumerate() {
        let arguments = tool
            .parameters
            .get("properties")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let _ = writeln!(
            system,
            "({}) {}. {} Arguments: {arguments}",
            position + 1,
            tool.name,
            tool.description
        );
    }
    let _ = writeln!(
        system,
        "({}) {FINISH_TOOL}. Marks the task as complete and returns the final answer. \
         Arguments: {{\"answer\": {{\"type\": \"string\"}}}}",
        tools.len() + 1
    );


    let trajectory = if transcript.trajectory.is_empty() {
        "None yet.".to_string()
    } else {
        transcript.trajectory.trim_end().to_string()
    };

    let user = format!(
        "[[ ## query ## ]]\n{}\n\n[[ ## trajectory ## ]]\n{trajectory}\n\n\
         Respond with the corresponding output fields, starting with the field \
         `[[ ## next_thought ## ]]`, then `[[ ## next_tool_name ## ]]`, then \
         `[[ ## next_tool_args ## ]]` (must be formatted as a valid JSON object), and then \
         ending with the marker for `[[ ## completed ## ]]`.",
        transcript.query
    );

    vec![ModelMessage::System(system), ModelMessage::User(user)]
}

fn render_answer_prompt(messages: &[ModelMessage]) -> Vec<ModelMessage> {
    let transcript = collect_transcript(messages);

    let mut system = String::new();
    for instruction in &transcript.instructions {
        let _ = writeln!(system, "{instruction}\n");
    }
    system.push_str(
        "Your input fields are:\n\
         1. `query` (str)\n\
         2. `trajectory` (str)\n\
         Your output fields are:\n\
         1. `reasoning` (str)\n\
         2. `answer` (str)\n\n\
         In adhering to this structure, your objective is: answer the query using the \
         observations in the trajectory.\n",
    );

    let trajectory = if transcript.trajectory.is_empty() {
        "None.".to_string()
    } else {
        transcript.trajectory.trim_end().to_string()
    };

    let user = format!(
        "[[ ## query ## ]]\n{}\n\n[[ ## trajectory ## ]]\n{trajectory}\n\n\
         Respond with the corresponding output fields, starting with the field \
         `[[ ## reasoning ## ]]`, then `[[ ## answer ## ]]`, and then ending with the marker \
         for `[[ ## completed ## ]]`.",
        transcript.query
    );

    vec![ModelMessage::System(system), ModelMessage::User(user)]
}

fn clean_tool_name(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c| c == '`' || c == '"' || c == '\'')
        .trim()
        .to_string()
}

/// Parses the args section; text that is not JSON is passed through as a
/// string so argument validation reports it back to the model.
fn parse_tool_args(raw: Option<&str>) -> Value {
    let Some(raw) = raw else {
        return json!({});
    };

    let unfenced = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    if unfenced.is_empty() {
        return json!({});
    }

    serde_json::from_str::<Value>(unfenced).unwrap_or_else(|_| Value::String(unfenced.to_string()))
}
