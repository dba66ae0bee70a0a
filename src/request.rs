use serde::Serialize;
use serde_json::json;

use crate::models::{ChatMessage, Settings, ToolCallRecord, ToolDefinition};

// Outbound message shapes for the chat-completions wire format.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ApiMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCallRecord>>,
    },
    Tool {
        content: String,
        tool_call_id: String,
    },
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionSpec,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: ParametersSpec,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ParametersSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub properties: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct UsageOptions {
    pub include: bool,
}

/// The full request payload for `POST /chat/completions`.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ApiMessage>,
    pub tool_choice: String,
    pub usage: UsageOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl ToolSpec {
    fn from_definition(tool: &ToolDefinition) -> Self {
        let mut properties = serde_json::Map::new();
        for arg in &tool.args {
            properties.insert(arg.name.clone(), json!({ "type": arg.arg_type }));
        }
        ToolSpec {
            kind: "function".to_string(),
            function: FunctionSpec {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: ParametersSpec {
                    kind: "object".to_string(),
                    properties,
                },
            },
        }
    }
}

/// Builds the outbound payload from conversation state.
///
/// `error` and `reasoning` messages never leave the client. Tool results
/// go out as `tool`-role entries tied to their call id; assistant entries
/// carry `tool_calls` only when the original message did. The system
/// prompt, when non-empty, is always the first entry.
pub fn build_completion_request(
    settings: &Settings,
    history: &[ChatMessage],
    tools: &[ToolDefinition],
    system_prompt: &str,
    stream: bool,
) -> CompletionRequest {
    let mut messages = Vec::with_capacity(history.len() + 1);
    if !system_prompt.is_empty() {
        messages.push(ApiMessage::System {
            content: system_prompt.to_string(),
        });
    }
    for message in history {
        match message {
            ChatMessage::User { content, .. } => messages.push(ApiMessage::User {
                content: content.clone(),
            }),
            ChatMessage::Assistant {
                content,
                tool_calls,
                ..
            } => messages.push(ApiMessage::Assistant {
                content: content.clone(),
                tool_calls: tool_calls.clone().filter(|calls| !calls.is_empty()),
            }),
            ChatMessage::Tool {
                tool_call_id,
                result,
                ..
            } => messages.push(ApiMessage::Tool {
                content: result.clone().unwrap_or_default(),
                tool_call_id: tool_call_id.clone(),
            }),
            ChatMessage::Error { .. } | ChatMessage::Reasoning { .. } => {}
        }
    }

    let active: Vec<ToolSpec> = tools
        .iter()
        .filter(|tool| !tool.disabled)
        .map(ToolSpec::from_definition)
        .collect();
    let tool_choice = if active.is_empty() { "none" } else { "auto" };

    CompletionRequest {
        model: settings.model.clone(),
        messages,
        tool_choice: tool_choice.to_string(),
        usage: UsageOptions { include: true },
        tools: (!active.is_empty()).then_some(active),
        stream: stream.then_some(true),
    }
}
