use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Connection settings for an OpenAI-compatible endpoint
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    pub api_base_url: String,
    // Either a literal token, an `env:VAR` reference, or `keyring`.
    // Absent means no Authorization header is sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    pub model: String,
}

// Argument/return types a tool definition may declare. Serialized verbatim
// into the request's JSON-schema `type` field.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArgType {
    String,
    Int,
    Bool,
    Object,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolArg {
    pub name: String,
    #[serde(rename = "type")]
    pub arg_type: ArgType,
}

// A user-authored simulated tool. The model may "call" it; the configured
// `return_value` is what the call reports back, no code is ever executed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolDefinition {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub args: Vec<ToolArg>,
    pub return_type: ArgType,
    #[serde(default)]
    pub return_value: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_call_type() -> String {
    "function".to_string()
}

// One tool invocation as the API represents it. `arguments` is a
// JSON-encoded string that streaming responses deliver in fragments.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolCallRecord {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    #[serde(default)]
    pub function: ToolCallFunction,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ToolCallFunction {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

impl Default for ToolCallRecord {
    fn default() -> Self {
        Self {
            id: String::new(),
            call_type: default_call_type(),
            function: ToolCallFunction::default(),
        }
    }
}

// A single conversation entry. The `id` is the removal key; `created_at`
// is kept for display and ordering only.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    User {
        #[serde(default = "Uuid::new_v4")]
        id: Uuid,
        content: String,
        #[serde(default = "Utc::now")]
        created_at: DateTime<Utc>,
    },
    Assistant {
        #[serde(default = "Uuid::new_v4")]
        id: Uuid,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCallRecord>>,
        #[serde(default = "Utc::now")]
        created_at: DateTime<Utc>,
    },
    Error {
        #[serde(default = "Uuid::new_v4")]
        id: Uuid,
        content: String,
        #[serde(default = "Utc::now")]
        created_at: DateTime<Utc>,
    },
    Reasoning {
        #[serde(default = "Uuid::new_v4")]
        id: Uuid,
        content: String,
        #[serde(default = "Utc::now")]
        created_at: DateTime<Utc>,
    },
    Tool {
        #[serde(default = "Uuid::new_v4")]
        id: Uuid,
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        args: serde_json::Map<String, serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default = "Utc::now")]
        created_at: DateTime<Utc>,
    },
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage::User {
            id: Uuid::new_v4(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Option<Vec<ToolCallRecord>>) -> Self {
        ChatMessage::Assistant {
            id: Uuid::new_v4(),
            content: content.into(),
            tool_calls,
            created_at: Utc::now(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        ChatMessage::Error {
            id: Uuid::new_v4(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn reasoning(content: impl Into<String>) -> Self {
        ChatMessage::Reasoning {
            id: Uuid::new_v4(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn tool(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: serde_json::Map<String, serde_json::Value>,
        result: Option<String>,
    ) -> Self {
        ChatMessage::Tool {
            id: Uuid::new_v4(),
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            args,
            result,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            ChatMessage::User { id, .. }
            | ChatMessage::Assistant { id, .. }
            | ChatMessage::Error { id, .. }
            | ChatMessage::Reasoning { id, .. }
            | ChatMessage::Tool { id, .. } => *id,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            ChatMessage::User { created_at, .. }
            | ChatMessage::Assistant { created_at, .. }
            | ChatMessage::Error { created_at, .. }
            | ChatMessage::Reasoning { created_at, .. }
            | ChatMessage::Tool { created_at, .. } => *created_at,
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            ChatMessage::User { .. } => "user",
            ChatMessage::Assistant { .. } => "assistant",
            ChatMessage::Error { .. } => "error",
            ChatMessage::Reasoning { .. } => "reasoning",
            ChatMessage::Tool { .. } => "tool",
        }
    }
}
