//! Core engine for a chat client speaking the OpenAI-style
//! chat-completions protocol: request building, incremental stream
//! assembly (content, fragmented tool calls, usage accounting), simulated
//! tool round trips and persistent conversation state. Rendering and
//! navigation are left to whatever UI subscribes to the controller.

// Declare the modules
pub mod api;
pub mod chat;
pub mod config;
pub mod error;
pub mod models;
pub mod request;
pub mod sse;
pub mod storage;
pub mod toolcalls;
pub mod usage;

pub use api::{CompletionClient, CompletionOutcome, HttpCompletionClient};
pub use chat::{ChatController, ChatEvent, ChatOptions, ToolExport};
pub use error::Error;
pub use models::{
    ArgType, ChatMessage, Settings, ToolArg, ToolCallFunction, ToolCallRecord, ToolDefinition,
};
pub use request::{build_completion_request, CompletionRequest};
pub use sse::SseDecoder;
pub use storage::{MemoryStore, SqliteStore, Store};
pub use toolcalls::ToolCallBuffer;
pub use usage::{Usage, UsageStats};
