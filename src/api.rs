use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;

use crate::config;
use crate::error::Error;
use crate::models::{Settings, ToolCallRecord};
use crate::request::CompletionRequest;
use crate::sse::SseDecoder;
use crate::toolcalls::{ToolCallBuffer, ToolCallDelta};
use crate::usage::Usage;

/// The normalized result of one completion round trip, streamed or not.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompletionOutcome {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Option<Vec<ToolCallRecord>>,
    pub usage: Option<Usage>,
}

// Trait defining the interface for chat-completions backends
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// One-shot round trip: the whole response body arrives at once.
    async fn complete(
        &self,
        settings: &Settings,
        request: &CompletionRequest,
    ) -> Result<CompletionOutcome, Error>;

    /// Streaming round trip. Content deltas are forwarded to `on_delta`
    /// in arrival order while the response is still in flight.
    async fn complete_streaming(
        &self,
        settings: &Settings,
        request: &CompletionRequest,
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<CompletionOutcome, Error>;
}

// --- Wire shapes for inbound responses ---

#[derive(Deserialize, Debug, Default)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallRecord>>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ResponseChoice {
    #[serde(default)]
    pub message: Option<ResponseMessage>,
}

#[derive(Deserialize, Debug, Default)]
pub struct CompletionResponse {
    #[serde(default)]
    pub error: Option<ApiErrorBody>,
    #[serde(default)]
    pub choices: Vec<ResponseChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

// One streamed chunk. Servers either send incremental `delta` fields or,
// occasionally, a complete `message` in a single chunk.
#[derive(Deserialize, Debug, Default)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize, Debug, Default)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    message: Option<ResponseMessage>,
}

#[derive(Deserialize, Debug, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

// Accumulates decoded stream events into a finished outcome.
#[derive(Default)]
struct StreamAssembler {
    content: String,
    reasoning: String,
    tool_calls: ToolCallBuffer,
    usage: Option<Usage>,
}

impl StreamAssembler {
    fn apply(&mut self, event: serde_json::Value, on_delta: &mut (dyn FnMut(&str) + Send)) {
        // Chunks with shapes we do not recognize carry nothing we need.
        let chunk: StreamChunk = serde_json::from_value(event).unwrap_or_default();
        if let Some(choice) = chunk.choices.into_iter().next() {
            if let Some(delta) = choice.delta {
                if let Some(content) = delta.content.as_deref().filter(|c| !c.is_empty()) {
                    self.content.push_str(content);
                    on_delta(content);
                }
                if let Some(reasoning) = delta.reasoning.as_deref() {
                    self.reasoning.push_str(reasoning);
                }
                for tool_call in delta.tool_calls.iter().flatten() {
                    self.tool_calls.apply_delta(tool_call);
                }
            }
            if let Some(message) = choice.message {
                if let Some(calls) = message.tool_calls {
                    self.tool_calls.replace(calls);
                }
                if let Some(reasoning) = message.reasoning.as_deref() {
                    self.reasoning.push_str(reasoning);
                }
            }
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }
    }

    fn finish(self) -> CompletionOutcome {
        CompletionOutcome {
            content: self.content,
            reasoning: (!self.reasoning.is_empty()).then_some(self.reasoning),
            tool_calls: self.tool_calls.into_calls(),
            usage: self.usage,
        }
    }
}

// --- HTTP implementation ---

pub struct HttpCompletionClient {
    client: Client,
}

impl HttpCompletionClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn send_request(
        &self,
        settings: &Settings,
        request: &CompletionRequest,
    ) -> Result<reqwest::Response, Error> {
        let url = format!(
            "{}/chat/completions",
            settings.api_base_url.trim_end_matches('/')
        );
        log::info!(
            "Sending chat completion request to {} using model {}",
            url,
            request.model
        );

        let mut builder = self.client.post(&url).json(request);
        let token = config::resolve_api_token(settings)
            .map_err(|e| Error::app(format!("{e:#}")))?;
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            log::error!("Chat completion request failed: {}", e);
            Error::api(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            // Prefer the server-provided message, fall back to the status line.
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<CompletionResponse>(&body)
                .ok()
                .and_then(|parsed| parsed.error)
                .and_then(|error| error.message)
                .unwrap_or_else(|| status_line(status));
            log::error!("Chat completion request failed with status {}: {}", status, message);
            return Err(Error::api(message));
        }
        Ok(response)
    }
}

impl Default for HttpCompletionClient {
    fn default() -> Self {
        Self::new()
    }
}

fn status_line(status: reqwest::StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(
        &self,
        settings: &Settings,
        request: &CompletionRequest,
    ) -> Result<CompletionOutcome, Error> {
        let response = self.send_request(settings, request).await?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::api(e.to_string()))?;
        let parsed: CompletionResponse = serde_json::from_str(&body)
            .map_err(|e| Error::api(format!("invalid response body: {e}")))?;

        if let Some(error) = parsed.error {
            let message = error.message.unwrap_or_else(|| status_line(status));
            log::error!("Chat completion response reported an error: {}", message);
            return Err(Error::api(message));
        }

        let message = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .unwrap_or_default();

        Ok(CompletionOutcome {
            content: message.content.unwrap_or_default(),
            reasoning: message.reasoning.filter(|r| !r.is_empty()),
            tool_calls: message.tool_calls,
            usage: parsed.usage,
        })
    }

    async fn complete_streaming(
        &self,
        settings: &Settings,
        request: &CompletionRequest,
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<CompletionOutcome, Error> {
        let response = self.send_request(settings, request).await?;

        let mut decoder = SseDecoder::new();
        let mut assembler = StreamAssembler::default();
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| {
                log::error!("Error reading stream chunk: {}", e);
                Error::api(e.to_string())
            })?;
            let events = decoder
                .feed(&chunk)
                .map_err(|e| Error::api(format!("invalid stream event: {e}")))?;
            for event in events {
                assembler.apply(event, on_delta);
            }
            if decoder.is_done() {
                break;
            }
        }

        Ok(assembler.finish())
    }
}
