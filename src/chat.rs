use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex};
use uuid::Uuid;

use crate::api::{CompletionClient, CompletionOutcome};
use crate::error::Error;
use crate::models::{ChatMessage, Settings, ToolDefinition};
use crate::request::{build_completion_request, CompletionRequest};
use crate::storage::{self, Store, HISTORY_KEY, SETTINGS_KEY, SYSTEM_PROMPT_KEY, TOOLS_KEY};
use crate::usage::{Usage, UsageStats};

/// State changes published to subscribers.
#[derive(Clone, Debug)]
pub enum ChatEvent {
    TurnStarted,
    /// One streamed fragment of the pending assistant reply.
    AssistantDelta(String),
    MessageAdded(ChatMessage),
    MessageRemoved(Uuid),
    UsageUpdated { last: Usage, total: Usage },
    /// The turn reached a final answer or a terminal error.
    TurnFinished,
    ChatReset,
    ToolsChanged,
}

#[derive(Clone, Debug)]
pub struct ChatOptions {
    /// Request streamed responses and publish deltas as they arrive.
    pub streaming: bool,
    /// Upper bound on tool-call round trips within one turn. A backend
    /// that keeps requesting tools would otherwise loop forever.
    pub max_tool_rounds: usize,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            streaming: true,
            max_tool_rounds: 8,
        }
    }
}

/// Export/import payload for the tool panel.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolExport {
    #[serde(default)]
    pub system_prompt: String,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Default)]
struct ChatState {
    settings: Option<Settings>,
    messages: Vec<ChatMessage>,
    tools: Vec<ToolDefinition>,
    system_prompt: String,
    usage: UsageStats,
    turn_active: bool,
}

enum TurnStep {
    Continue,
    Stop,
}

/// Owns all conversation state and drives assistant turns.
///
/// Commands persist first and then publish the new state through
/// [`subscribe`](ChatController::subscribe); the live pending assistant
/// text is exposed via [`subscribe_pending`](ChatController::subscribe_pending).
/// Only one turn may be in flight at a time; a reset abandons the running
/// turn and anything it still produces is dropped.
#[derive(Clone)]
pub struct ChatController {
    state: Arc<Mutex<ChatState>>,
    store: Arc<dyn Store>,
    client: Arc<dyn CompletionClient>,
    events: broadcast::Sender<ChatEvent>,
    pending: Arc<watch::Sender<String>>,
    // Turn generation counter: bumped on reset so commits from abandoned
    // turns can be recognized and dropped.
    epoch: Arc<AtomicU64>,
    options: ChatOptions,
}

impl ChatController {
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<dyn CompletionClient>,
        options: ChatOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let (pending, _) = watch::channel(String::new());
        Self {
            state: Arc::new(Mutex::new(ChatState::default())),
            store,
            client,
            events,
            pending: Arc::new(pending),
            epoch: Arc::new(AtomicU64::new(0)),
            options,
        }
    }

    /// Populates settings, history, tools and the system prompt from the
    /// store, falling back to empty defaults for absent keys.
    pub async fn load(&self) -> Result<(), Error> {
        let store = self.store.as_ref();
        let settings = storage::load_value::<Settings>(store, SETTINGS_KEY).await?;
        let messages = storage::load_value::<Vec<ChatMessage>>(store, HISTORY_KEY)
            .await?
            .unwrap_or_default();
        let tools = storage::load_value::<Vec<ToolDefinition>>(store, TOOLS_KEY)
            .await?
            .unwrap_or_default();
        let system_prompt = storage::load_value::<String>(store, SYSTEM_PROMPT_KEY)
            .await?
            .unwrap_or_default();

        let mut state = self.state.lock().await;
        state.settings = settings;
        state.messages = messages;
        state.tools = tools;
        state.system_prompt = system_prompt;
        log::info!(
            "Loaded state: {} messages, {} tools",
            state.messages.len(),
            state.tools.len()
        );
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// The continuously-updated text of the assistant reply currently
    /// being streamed; empty whenever no reply is in flight.
    pub fn subscribe_pending(&self) -> watch::Receiver<String> {
        self.pending.subscribe()
    }

    pub async fn settings(&self) -> Option<Settings> {
        self.state.lock().await.settings.clone()
    }

    pub async fn set_settings(&self, settings: Settings) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        storage::save_value(self.store.as_ref(), SETTINGS_KEY, &settings).await?;
        state.settings = Some(settings);
        Ok(())
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.state.lock().await.messages.clone()
    }

    pub async fn tools(&self) -> Vec<ToolDefinition> {
        self.state.lock().await.tools.clone()
    }

    pub async fn system_prompt(&self) -> String {
        self.state.lock().await.system_prompt.clone()
    }

    pub async fn set_system_prompt(&self, prompt: impl Into<String>) -> Result<(), Error> {
        let prompt = prompt.into();
        let mut state = self.state.lock().await;
        storage::save_value(self.store.as_ref(), SYSTEM_PROMPT_KEY, &prompt).await?;
        state.system_prompt = prompt;
        Ok(())
    }

    pub async fn usage(&self) -> UsageStats {
        self.state.lock().await.usage.clone()
    }

    pub async fn is_turn_active(&self) -> bool {
        self.state.lock().await.turn_active
    }

    /// Submits a user message and drives the turn to completion: stream
    /// the reply, surface tool results, loop for tool-call round trips,
    /// stop on the final answer or the first error.
    ///
    /// Rejected with [`Error::Busy`] while another turn is in flight and
    /// with [`Error::NotConfigured`] before settings exist.
    pub async fn send_message(&self, content: impl Into<String>) -> Result<(), Error> {
        let content = content.into();
        let (settings, epoch) = {
            let mut state = self.state.lock().await;
            let Some(settings) = state.settings.clone() else {
                return Err(Error::NotConfigured);
            };
            if state.turn_active {
                log::warn!("Rejecting send: a turn is already in flight");
                return Err(Error::Busy);
            }
            state.turn_active = true;
            (settings, self.epoch.load(Ordering::SeqCst))
        };
        let _ = self.events.send(ChatEvent::TurnStarted);
        log::info!("Turn started ({} chars)", content.len());

        let result = self.drive_turn(epoch, &settings, content).await;

        self.clear_pending(epoch);
        {
            let mut state = self.state.lock().await;
            if self.epoch.load(Ordering::SeqCst) == epoch {
                state.turn_active = false;
            }
        }
        let _ = self.events.send(ChatEvent::TurnFinished);
        result
    }

    async fn drive_turn(
        &self,
        epoch: u64,
        settings: &Settings,
        content: String,
    ) -> Result<(), Error> {
        if !self.commit(epoch, ChatMessage::user(content)).await? {
            return Ok(());
        }

        let mut rounds = 0usize;
        loop {
            rounds += 1;
            if rounds > self.options.max_tool_rounds {
                log::warn!(
                    "Stopping turn: tool-call loop hit the {} round-trip cap",
                    self.options.max_tool_rounds
                );
                self.commit(
                    epoch,
                    ChatMessage::error(format!(
                        "❌ App: tool-call loop stopped after {} round trips",
                        self.options.max_tool_rounds
                    )),
                )
                .await?;
                return Ok(());
            }

            let request = {
                let state = self.state.lock().await;
                build_completion_request(
                    settings,
                    &state.messages,
                    &state.tools,
                    &state.system_prompt,
                    self.options.streaming,
                )
            };

            let outcome = self.execute_round(epoch, settings, &request).await;
            self.clear_pending(epoch);

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(err) => {
                    log::error!("Turn failed: {}", err);
                    self.commit(epoch, ChatMessage::error(err.chat_text())).await?;
                    return Ok(());
                }
            };

            match self.apply_outcome(epoch, outcome).await? {
                TurnStep::Continue => continue,
                TurnStep::Stop => return Ok(()),
            }
        }
    }

    async fn execute_round(
        &self,
        epoch: u64,
        settings: &Settings,
        request: &CompletionRequest,
    ) -> Result<CompletionOutcome, Error> {
        if !self.options.streaming {
            return self.client.complete(settings, request).await;
        }

        let pending = Arc::clone(&self.pending);
        let events = self.events.clone();
        let current_epoch = Arc::clone(&self.epoch);
        let mut sink = move |delta: &str| {
            // A reset mid-stream abandons the turn; stop echoing it.
            if current_epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            pending.send_modify(|text| text.push_str(delta));
            let _ = events.send(ChatEvent::AssistantDelta(delta.to_string()));
        };
        self.client
            .complete_streaming(settings, request, &mut sink)
            .await
    }

    async fn apply_outcome(
        &self,
        epoch: u64,
        outcome: CompletionOutcome,
    ) -> Result<TurnStep, Error> {
        // Reasoning always precedes the answer it led to.
        if let Some(reasoning) = outcome.reasoning.filter(|r| !r.is_empty()) {
            if !self.commit(epoch, ChatMessage::reasoning(reasoning)).await? {
                return Ok(TurnStep::Stop);
            }
        }

        // An empty-content assistant message is still recorded: it anchors
        // the tool_calls reference the next round trip's history needs.
        let tool_calls = outcome.tool_calls;
        if !self
            .commit(
                epoch,
                ChatMessage::assistant(outcome.content, tool_calls.clone()),
            )
            .await?
        {
            return Ok(TurnStep::Stop);
        }

        if let Some(usage) = outcome.usage {
            self.record_usage(epoch, usage).await;
        }

        let calls = match tool_calls {
            Some(calls) if !calls.is_empty() => calls,
            _ => return Ok(TurnStep::Stop),
        };

        let known_tools = { self.state.lock().await.tools.clone() };
        for call in &calls {
            let args = parse_tool_args(&call.function.arguments);
            let tool = known_tools
                .iter()
                .find(|tool| tool.name == call.function.name);
            if tool.is_none() {
                log::warn!("Model called unknown tool: {}", call.function.name);
            }
            let message = ChatMessage::tool(
                call.id.clone(),
                call.function.name.clone(),
                args,
                tool.map(|tool| tool.return_value.clone()),
            );
            if !self.commit(epoch, message).await? {
                return Ok(TurnStep::Stop);
            }
        }

        // At least one tool call: go around again with the extended history.
        Ok(TurnStep::Continue)
    }

    async fn record_usage(&self, epoch: u64, usage: Usage) {
        let mut state = self.state.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        state.usage.record(usage);
        let _ = self.events.send(ChatEvent::UsageUpdated {
            last: state.usage.last.clone().unwrap_or_default(),
            total: state.usage.total.clone().unwrap_or_default(),
        });
    }

    /// Appends a message unless the turn has been abandoned by a reset.
    /// Returns whether the message was actually committed.
    async fn commit(&self, epoch: u64, message: ChatMessage) -> Result<bool, Error> {
        let mut state = self.state.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            log::debug!("Dropping {} message from abandoned turn", message.role());
            return Ok(false);
        }
        let mut messages = state.messages.clone();
        messages.push(message.clone());
        storage::save_value(self.store.as_ref(), HISTORY_KEY, &messages).await?;
        state.messages = messages;
        let _ = self.events.send(ChatEvent::MessageAdded(message));
        Ok(true)
    }

    fn clear_pending(&self, epoch: u64) {
        if self.epoch.load(Ordering::SeqCst) == epoch {
            self.pending.send_replace(String::new());
        }
    }

    /// Removes exactly the message with the given id.
    pub async fn remove_message(&self, id: Uuid) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let messages: Vec<ChatMessage> = state
            .messages
            .iter()
            .filter(|message| message.id() != id)
            .cloned()
            .collect();
        storage::save_value(self.store.as_ref(), HISTORY_KEY, &messages).await?;
        state.messages = messages;
        let _ = self.events.send(ChatEvent::MessageRemoved(id));
        Ok(())
    }

    /// Clears messages and usage counters in one step and abandons any
    /// in-flight turn.
    pub async fn reset_chat(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        self.store
            .remove(HISTORY_KEY)
            .await
            .map_err(Error::Storage)?;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        state.turn_active = false;
        state.messages.clear();
        state.usage.reset();
        self.pending.send_replace(String::new());
        let _ = self.events.send(ChatEvent::ChatReset);
        log::info!("Conversation reset");
        Ok(())
    }

    // --- Tool management ---

    pub async fn add_tool(&self, tool: ToolDefinition) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let mut tools = state.tools.clone();
        tools.push(tool);
        storage::save_value(self.store.as_ref(), TOOLS_KEY, &tools).await?;
        state.tools = tools;
        let _ = self.events.send(ChatEvent::ToolsChanged);
        Ok(())
    }

    pub async fn update_tool(&self, tool: ToolDefinition) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let tools: Vec<ToolDefinition> = state
            .tools
            .iter()
            .map(|existing| {
                if existing.id == tool.id {
                    tool.clone()
                } else {
                    existing.clone()
                }
            })
            .collect();
        storage::save_value(self.store.as_ref(), TOOLS_KEY, &tools).await?;
        state.tools = tools;
        let _ = self.events.send(ChatEvent::ToolsChanged);
        Ok(())
    }

    pub async fn remove_tool(&self, id: Uuid) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let tools: Vec<ToolDefinition> = state
            .tools
            .iter()
            .filter(|tool| tool.id != id)
            .cloned()
            .collect();
        storage::save_value(self.store.as_ref(), TOOLS_KEY, &tools).await?;
        state.tools = tools;
        let _ = self.events.send(ChatEvent::ToolsChanged);
        Ok(())
    }

    pub async fn set_tools(&self, tools: Vec<ToolDefinition>) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        storage::save_value(self.store.as_ref(), TOOLS_KEY, &tools).await?;
        state.tools = tools;
        let _ = self.events.send(ChatEvent::ToolsChanged);
        Ok(())
    }

    pub async fn clear_tools(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        self.store.remove(TOOLS_KEY).await.map_err(Error::Storage)?;
        state.tools.clear();
        let _ = self.events.send(ChatEvent::ToolsChanged);
        Ok(())
    }

    /// Pretty JSON of the system prompt plus all tool definitions.
    pub async fn export_tools(&self) -> Result<String, Error> {
        let state = self.state.lock().await;
        let export = ToolExport {
            system_prompt: state.system_prompt.clone(),
            tools: state.tools.clone(),
        };
        serde_json::to_string_pretty(&export).map_err(|e| Error::app(e.to_string()))
    }

    /// Replaces tools and system prompt with an exported payload. A
    /// malformed payload is rejected up front; nothing changes.
    pub async fn import_tools(&self, json: &str) -> Result<(), Error> {
        let parsed: ToolExport =
            serde_json::from_str(json).map_err(|e| Error::InvalidImport(e.to_string()))?;
        let mut state = self.state.lock().await;
        storage::save_value(self.store.as_ref(), TOOLS_KEY, &parsed.tools).await?;
        storage::save_value(self.store.as_ref(), SYSTEM_PROMPT_KEY, &parsed.system_prompt)
            .await?;
        state.tools = parsed.tools;
        state.system_prompt = parsed.system_prompt;
        let _ = self.events.send(ChatEvent::ToolsChanged);
        Ok(())
    }
}

fn parse_tool_args(arguments: &str) -> serde_json::Map<String, serde_json::Value> {
    match serde_json::from_str(arguments) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => {
            log::warn!("Tool call arguments were not a JSON object, substituting an empty one");
            serde_json::Map::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArgType, ToolArg, ToolCallFunction, ToolCallRecord};
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[derive(Default)]
    struct MockClient {
        outcomes: StdMutex<VecDeque<Result<CompletionOutcome, Error>>>,
        deltas: StdMutex<VecDeque<Vec<String>>>,
        requests: StdMutex<Vec<CompletionRequest>>,
        streamed: StdMutex<Vec<bool>>,
        gate: Option<Arc<Notify>>,
    }

    impl MockClient {
        fn next_outcome(&self) -> Result<CompletionOutcome, Error> {
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(CompletionOutcome::default()))
        }

        fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionClient for MockClient {
        async fn complete(
            &self,
            _settings: &Settings,
            request: &CompletionRequest,
        ) -> Result<CompletionOutcome, Error> {
            self.requests.lock().unwrap().push(request.clone());
            self.streamed.lock().unwrap().push(false);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.next_outcome()
        }

        async fn complete_streaming(
            &self,
            _settings: &Settings,
            request: &CompletionRequest,
            on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
        ) -> Result<CompletionOutcome, Error> {
            self.requests.lock().unwrap().push(request.clone());
            self.streamed.lock().unwrap().push(true);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let script = self.deltas.lock().unwrap().pop_front();
            for delta in script.unwrap_or_default() {
                on_delta(&delta);
            }
            self.next_outcome()
        }
    }

    fn settings() -> Settings {
        Settings {
            api_base_url: "https://api".to_string(),
            api_token: None,
            model: "gpt".to_string(),
        }
    }

    fn tool_named(name: &str, return_value: &str) -> ToolDefinition {
        ToolDefinition {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
            args: vec![ToolArg {
                name: "a".to_string(),
                arg_type: ArgType::Int,
            }],
            return_type: ArgType::String,
            return_value: return_value.to_string(),
            disabled: false,
            created_at: Utc::now(),
        }
    }

    fn call(id: &str, name: &str, arguments: &str) -> ToolCallRecord {
        ToolCallRecord {
            id: id.to_string(),
            function: ToolCallFunction {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
            ..ToolCallRecord::default()
        }
    }

    async fn controller_with(client: MockClient, options: ChatOptions) -> (ChatController, Arc<MockClient>) {
        let client = Arc::new(client);
        let controller = ChatController::new(
            Arc::new(MemoryStore::new()),
            Arc::clone(&client) as Arc<dyn CompletionClient>,
            options,
        );
        controller.set_settings(settings()).await.unwrap();
        (controller, client)
    }

    fn outcome_with_content(content: &str) -> CompletionOutcome {
        CompletionOutcome {
            content: content.to_string(),
            ..CompletionOutcome::default()
        }
    }

    #[tokio::test]
    async fn streamed_turn_commits_one_assistant_message() {
        init_logging();
        let client = MockClient {
            outcomes: StdMutex::new(VecDeque::from([Ok(CompletionOutcome {
                content: "hello".to_string(),
                usage: Some(Usage {
                    prompt_tokens: Some(1),
                    completion_tokens: Some(1),
                    total_tokens: Some(2),
                    ..Usage::default()
                }),
                ..CompletionOutcome::default()
            })])),
            deltas: StdMutex::new(VecDeque::from([vec![
                "hel".to_string(),
                "lo".to_string(),
            ]])),
            ..MockClient::default()
        };
        let (controller, _client) = controller_with(client, ChatOptions::default()).await;
        let mut events = controller.subscribe();

        controller.send_message("hi").await.unwrap();

        let messages = controller.messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role(), "user");
        match &messages[1] {
            ChatMessage::Assistant {
                content,
                tool_calls,
                ..
            } => {
                assert_eq!(content, "hello");
                assert_eq!(*tool_calls, None);
            }
            other => panic!("expected assistant message, got {other:?}"),
        }

        let usage = controller.usage().await;
        assert_eq!(usage.last.as_ref().unwrap().total_tokens, Some(2));
        assert_eq!(usage.total.as_ref().unwrap().total_tokens, Some(2));

        // Deltas were published in order; each one extends the previous
        // prefix of the final content.
        let mut streamed = String::new();
        while let Ok(event) = events.try_recv() {
            if let ChatEvent::AssistantDelta(delta) = event {
                streamed.push_str(&delta);
                assert!("hello".starts_with(&streamed));
            }
        }
        assert_eq!(streamed, "hello");
        // The live view is empty again once the reply is committed.
        assert_eq!(*controller.subscribe_pending().borrow(), "");
    }

    #[tokio::test]
    async fn tool_calls_loop_into_a_second_request() {
        init_logging();
        let client = MockClient {
            outcomes: StdMutex::new(VecDeque::from([
                Ok(CompletionOutcome {
                    content: String::new(),
                    tool_calls: Some(vec![call("call_1", "foo", "{\"a\":1}")]),
                    ..CompletionOutcome::default()
                }),
                Ok(outcome_with_content("done")),
            ])),
            ..MockClient::default()
        };
        let (controller, client) = controller_with(client, ChatOptions::default()).await;
        controller.add_tool(tool_named("foo", "bar")).await.unwrap();

        controller.send_message("hi").await.unwrap();

        let messages = controller.messages().await;
        let roles: Vec<&str> = messages.iter().map(|m| m.role()).collect();
        assert_eq!(roles, vec!["user", "assistant", "tool", "assistant"]);
        match &messages[2] {
            ChatMessage::Tool {
                tool_call_id,
                tool_name,
                args,
                result,
                ..
            } => {
                assert_eq!(tool_call_id, "call_1");
                assert_eq!(tool_name, "foo");
                assert_eq!(args.get("a"), Some(&serde_json::json!(1)));
                assert_eq!(result.as_deref(), Some("bar"));
            }
            other => panic!("expected tool message, got {other:?}"),
        }

        // The second round trip carried the tool result back.
        let requests = client.requests();
        assert_eq!(requests.len(), 2);
        let second = serde_json::to_value(&requests[1]).unwrap();
        let tool_entry = second["messages"]
            .as_array()
            .unwrap()
            .iter()
            .find(|m| m["role"] == "tool")
            .expect("tool entry in follow-up request");
        assert_eq!(tool_entry["content"], "bar");
        assert_eq!(tool_entry["tool_call_id"], "call_1");
    }

    #[tokio::test]
    async fn unknown_tools_get_no_result() {
        let client = MockClient {
            outcomes: StdMutex::new(VecDeque::from([
                Ok(CompletionOutcome {
                    tool_calls: Some(vec![call("call_1", "nope", "{}")]),
                    ..CompletionOutcome::default()
                }),
                Ok(outcome_with_content("done")),
            ])),
            ..MockClient::default()
        };
        let (controller, _client) = controller_with(client, ChatOptions::default()).await;

        controller.send_message("hi").await.unwrap();

        let messages = controller.messages().await;
        match &messages[2] {
            ChatMessage::Tool { result, .. } => assert_eq!(*result, None),
            other => panic!("expected tool message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_tool_arguments_become_an_empty_object() {
        let client = MockClient {
            outcomes: StdMutex::new(VecDeque::from([
                Ok(CompletionOutcome {
                    tool_calls: Some(vec![call("call_1", "foo", "{broken")]),
                    ..CompletionOutcome::default()
                }),
                Ok(outcome_with_content("done")),
            ])),
            ..MockClient::default()
        };
        let (controller, _client) = controller_with(client, ChatOptions::default()).await;
        controller.add_tool(tool_named("foo", "bar")).await.unwrap();

        controller.send_message("hi").await.unwrap();

        let messages = controller.messages().await;
        match &messages[2] {
            ChatMessage::Tool { args, .. } => assert!(args.is_empty()),
            other => panic!("expected tool message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reasoning_precedes_the_assistant_message() {
        let client = MockClient {
            outcomes: StdMutex::new(VecDeque::from([Ok(CompletionOutcome {
                content: "answer".to_string(),
                reasoning: Some("thinking".to_string()),
                ..CompletionOutcome::default()
            })])),
            ..MockClient::default()
        };
        let (controller, _client) = controller_with(client, ChatOptions::default()).await;

        controller.send_message("hi").await.unwrap();

        let roles: Vec<&str> = controller.messages().await.iter().map(|m| m.role()).collect();
        assert_eq!(roles, vec!["user", "reasoning", "assistant"]);
    }

    #[tokio::test]
    async fn api_errors_become_inline_error_messages() {
        let client = MockClient {
            outcomes: StdMutex::new(VecDeque::from([Err(Error::api("boom"))])),
            ..MockClient::default()
        };
        let (controller, client) = controller_with(client, ChatOptions::default()).await;

        controller.send_message("hi").await.unwrap();

        let messages = controller.messages().await;
        assert_eq!(messages.len(), 2);
        match &messages[1] {
            ChatMessage::Error { content, .. } => assert_eq!(content, "❌ API: boom"),
            other => panic!("expected error message, got {other:?}"),
        }
        // No retry happened.
        assert_eq!(client.requests().len(), 1);
        // The guard is released: a new send goes through.
        controller.send_message("again").await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_sends_are_rejected() {
        let gate = Arc::new(Notify::new());
        let client = MockClient {
            outcomes: StdMutex::new(VecDeque::from([Ok(outcome_with_content("late"))])),
            gate: Some(Arc::clone(&gate)),
            ..MockClient::default()
        };
        let (controller, _client) = controller_with(client, ChatOptions::default()).await;

        let background = controller.clone();
        let handle = tokio::spawn(async move { background.send_message("first").await });

        // Wait until the turn is actually in flight.
        while !controller.is_turn_active().await {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            controller.send_message("second").await,
            Err(Error::Busy)
        ));

        gate.notify_one();
        handle.await.unwrap().unwrap();
        assert!(!controller.is_turn_active().await);
    }

    #[tokio::test]
    async fn reset_abandons_the_in_flight_turn() {
        let gate = Arc::new(Notify::new());
        let client = MockClient {
            outcomes: StdMutex::new(VecDeque::from([Ok(outcome_with_content("late"))])),
            gate: Some(Arc::clone(&gate)),
            ..MockClient::default()
        };
        let (controller, _client) = controller_with(client, ChatOptions::default()).await;

        let background = controller.clone();
        let handle = tokio::spawn(async move { background.send_message("first").await });
        while !controller.is_turn_active().await {
            tokio::task::yield_now().await;
        }

        controller.reset_chat().await.unwrap();
        assert!(controller.messages().await.is_empty());
        assert!(!controller.is_turn_active().await);

        // Let the abandoned turn finish; nothing it produces may land.
        gate.notify_one();
        handle.await.unwrap().unwrap();
        assert!(controller.messages().await.is_empty());
        assert_eq!(controller.usage().await, UsageStats::default());
    }

    #[tokio::test]
    async fn reset_clears_messages_and_usage_together() {
        let client = MockClient {
            outcomes: StdMutex::new(VecDeque::from([Ok(CompletionOutcome {
                content: "hello".to_string(),
                usage: Some(Usage {
                    total_tokens: Some(2),
                    ..Usage::default()
                }),
                ..CompletionOutcome::default()
            })])),
            ..MockClient::default()
        };
        let (controller, _client) = controller_with(client, ChatOptions::default()).await;
        controller.send_message("hi").await.unwrap();
        assert!(!controller.messages().await.is_empty());

        controller.reset_chat().await.unwrap();
        assert!(controller.messages().await.is_empty());
        assert_eq!(controller.usage().await, UsageStats::default());
    }

    #[tokio::test]
    async fn runaway_tool_loops_hit_the_round_cap() {
        let looping = || {
            Ok(CompletionOutcome {
                tool_calls: Some(vec![call("call_x", "foo", "{}")]),
                ..CompletionOutcome::default()
            })
        };
        let client = MockClient {
            outcomes: StdMutex::new(VecDeque::from([looping(), looping(), looping()])),
            ..MockClient::default()
        };
        let options = ChatOptions {
            max_tool_rounds: 2,
            ..ChatOptions::default()
        };
        let (controller, client) = controller_with(client, options).await;

        controller.send_message("hi").await.unwrap();

        assert_eq!(client.requests().len(), 2);
        let messages = controller.messages().await;
        match messages.last().unwrap() {
            ChatMessage::Error { content, .. } => {
                assert!(content.starts_with("❌ App:"), "got {content}");
            }
            other => panic!("expected error message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn remove_message_removes_exactly_one() {
        let client = MockClient {
            outcomes: StdMutex::new(VecDeque::from([
                Ok(outcome_with_content("a")),
                Ok(outcome_with_content("b")),
            ])),
            ..MockClient::default()
        };
        let (controller, _client) = controller_with(client, ChatOptions::default()).await;
        controller.send_message("one").await.unwrap();
        controller.send_message("two").await.unwrap();

        let before = controller.messages().await;
        assert_eq!(before.len(), 4);
        controller.remove_message(before[1].id()).await.unwrap();

        let after = controller.messages().await;
        let ids: Vec<Uuid> = after.iter().map(|m| m.id()).collect();
        assert_eq!(
            ids,
            vec![before[0].id(), before[2].id(), before[3].id()]
        );
    }

    #[tokio::test]
    async fn non_streaming_mode_uses_the_one_shot_path() {
        let client = MockClient {
            outcomes: StdMutex::new(VecDeque::from([Ok(outcome_with_content("hello"))])),
            ..MockClient::default()
        };
        let options = ChatOptions {
            streaming: false,
            ..ChatOptions::default()
        };
        let (controller, client) = controller_with(client, options).await;

        controller.send_message("hi").await.unwrap();

        assert_eq!(*client.streamed.lock().unwrap(), vec![false]);
        let request = &client.requests()[0];
        assert_eq!(request.stream, None);
    }

    #[tokio::test]
    async fn send_requires_settings() {
        let controller = ChatController::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MockClient::default()),
            ChatOptions::default(),
        );
        assert!(matches!(
            controller.send_message("hi").await,
            Err(Error::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn state_survives_a_reload_from_the_same_store() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(MockClient {
            outcomes: StdMutex::new(VecDeque::from([Ok(outcome_with_content("hello"))])),
            ..MockClient::default()
        });
        let controller = ChatController::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&client) as Arc<dyn CompletionClient>,
            ChatOptions::default(),
        );
        controller.set_settings(settings()).await.unwrap();
        controller.set_system_prompt("be terse").await.unwrap();
        controller.add_tool(tool_named("foo", "bar")).await.unwrap();
        controller.send_message("hi").await.unwrap();

        let reloaded = ChatController::new(
            store,
            Arc::new(MockClient::default()),
            ChatOptions::default(),
        );
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.settings().await, Some(settings()));
        assert_eq!(reloaded.system_prompt().await, "be terse");
        assert_eq!(reloaded.tools().await.len(), 1);
        assert_eq!(reloaded.messages().await.len(), 2);
    }

    #[tokio::test]
    async fn import_rejects_malformed_payloads_without_changes() {
        let (controller, _client) =
            controller_with(MockClient::default(), ChatOptions::default()).await;
        controller.add_tool(tool_named("keep", "v")).await.unwrap();
        controller.set_system_prompt("keep me").await.unwrap();

        assert!(matches!(
            controller.import_tools("{not json").await,
            Err(Error::InvalidImport(_))
        ));
        assert_eq!(controller.tools().await.len(), 1);
        assert_eq!(controller.system_prompt().await, "keep me");

        // A valid export round-trips through import.
        let exported = controller.export_tools().await.unwrap();
        controller.clear_tools().await.unwrap();
        assert!(controller.tools().await.is_empty());
        controller.import_tools(&exported).await.unwrap();
        assert_eq!(controller.tools().await.len(), 1);
        assert_eq!(controller.tools().await[0].name, "keep");
        assert_eq!(controller.system_prompt().await, "keep me");
    }

    #[tokio::test]
    async fn tool_updates_toggle_and_remove() {
        let (controller, _client) =
            controller_with(MockClient::default(), ChatOptions::default()).await;
        let tool = tool_named("foo", "bar");
        let id = tool.id;
        controller.add_tool(tool.clone()).await.unwrap();

        let mut toggled = tool;
        toggled.disabled = true;
        controller.update_tool(toggled).await.unwrap();
        assert!(controller.tools().await[0].disabled);

        controller.remove_tool(id).await.unwrap();
        assert!(controller.tools().await.is_empty());
    }
}
