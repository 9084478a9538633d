//! The completion orchestrator.
//!
//! ```text
//! PREPARE → CALL_MODEL_1 → [tool calls?] → EXECUTE_TOOLS → CALL_MODEL_2 → FINALIZE
//! ```
//!
//! The second model call never carries the tool catalog, so a user turn makes
//! at most two model calls. Tool calls requested by the second call are
//! ignored.

use chrono::Utc;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use streamweave_config::AppConfig;
use streamweave_core::channel::ChannelContext;
use streamweave_core::error::{Error, Result};
use streamweave_core::event::{DomainEvent, EventBus};
use streamweave_core::generation::{ChatCompletion, GenerationRequest};
use streamweave_core::message::{Message, MessageToolCall};
use streamweave_core::provider::{Provider, ProviderRequest, ToolCallDelta, Usage};
use streamweave_core::store::{ConversationTurn, KnowledgeSource, Persistence, SessionContext};
use streamweave_core::tool::{ToolCall, ToolRegistry};
use streamweave_providers::ProviderRouter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::prompt::PromptAssembler;
use crate::stream_event::{GenerationEvent, GenerationStage};

/// A fresh generation identifier.
pub fn new_stream_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Model used when neither the request nor the channel names one
    pub default_model: String,
    pub default_temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub history_window: usize,
    /// Buffer between the producer task and its transport
    pub event_capacity: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_model: "gpt-4o-mini".into(),
            default_temperature: 0.7,
            max_tokens: 4096,
            timeout_secs: 60,
            max_retries: 3,
            history_window: 10,
            event_capacity: 256,
        }
    }
}

impl From<&AppConfig> for OrchestratorSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            default_model: config.default_model.clone(),
            default_temperature: config.default_temperature,
            max_tokens: config.default_max_tokens,
            timeout_secs: config.llm.timeout_secs,
            max_retries: config.llm.max_retries,
            history_window: config.assistant.history_window,
            ..Self::default()
        }
    }
}

/// Everything needed to run a generation, resolved before the first model
/// call so lookup and validation failures surface before any output.
pub struct PreparedGeneration {
    pub stream_id: String,
    pub model: String,
    pub session_id: Option<String>,
    pub user_message: Option<String>,
    provider: Arc<dyn Provider>,
    request: ProviderRequest,
}

impl PreparedGeneration {
    /// The first model call's parameters.
    pub fn request(&self) -> &ProviderRequest {
        &self.request
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }
}

/// Drives generations through at most one tool round-trip.
pub struct Orchestrator {
    router: Arc<ProviderRouter>,
    tools: Arc<ToolRegistry>,
    persistence: Arc<dyn Persistence>,
    knowledge: Arc<dyn KnowledgeSource>,
    prompts: PromptAssembler,
    events: Arc<EventBus>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        router: Arc<ProviderRouter>,
        tools: Arc<ToolRegistry>,
        persistence: Arc<dyn Persistence>,
        knowledge: Arc<dyn KnowledgeSource>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            router,
            tools,
            persistence,
            knowledge,
            prompts: PromptAssembler::new("Assistant"),
            events,
            settings: OrchestratorSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_prompts(mut self, prompts: PromptAssembler) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // ── PREPARE ──

    /// Validate the request, resolve channel and session, assemble the system
    /// prompt and pick the model and provider.
    pub async fn prepare(&self, req: &GenerationRequest, stream_id: String) -> Result<PreparedGeneration> {
        req.validate()?;
        let (channel, session) = self.resolve_context(req).await?;

        let has_knowledge = if PromptAssembler::needs_knowledge_check(channel.as_ref()) {
            match self.knowledge.has_active_knowledge().await {
                Ok(present) => present,
                Err(e) => {
                    warn!(error = %e, "Knowledge lookup failed, assuming none");
                    false
                }
            }
        } else {
            false
        };
        let system = self.prompts.build(channel.as_ref(), has_knowledge, &self.tools.catalog());

        let mut messages = vec![Message::system(system)];
        if let Some(session) = &session {
            // Stored most-recent-first
            messages.extend(session.history.iter().rev().cloned());
        }
        messages.extend(req.messages.iter().cloned());

        let model = self.effective_model(req, channel.as_ref());
        let provider = self
            .router
            .resolve(channel.as_ref().and_then(|c| c.provider.as_deref()))?;

        let definitions = self.tools.definitions();
        let tool_choice = (!definitions.is_empty()).then(|| req.tool_choice.clone());
        let request = ProviderRequest {
            temperature: req.temperature.unwrap_or(self.settings.default_temperature),
            max_tokens: Some(req.max_tokens.unwrap_or(self.settings.max_tokens)),
            top_p: req.top_p,
            presence_penalty: req.presence_penalty,
            frequency_penalty: req.frequency_penalty,
            tools: definitions,
            tool_choice,
            timeout_secs: self.settings.timeout_secs,
            max_retries: self.settings.max_retries,
            ..ProviderRequest::new(model.clone(), messages)
        };

        debug!(
            stream_id = %stream_id,
            model = %model,
            provider = provider.name(),
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Generation prepared"
        );

        Ok(PreparedGeneration {
            stream_id,
            model,
            session_id: session.map(|s| s.id),
            user_message: req.last_user_message().map(str::to_string),
            provider,
            request,
        })
    }

    async fn resolve_context(
        &self,
        req: &GenerationRequest,
    ) -> Result<(Option<ChannelContext>, Option<SessionContext>)> {
        let mut channel = match &req.channel_id {
            Some(id) => Some(
                self.persistence
                    .load_channel(id)
                    .await?
                    .ok_or_else(|| Error::not_found("channel", id))?,
            ),
            None => None,
        };

        let session = match &req.session_id {
            Some(id) => Some(
                self.persistence
                    .load_session(id, self.settings.history_window)
                    .await?
                    .ok_or_else(|| Error::not_found("session", id))?,
            ),
            None => None,
        };

        if channel.is_none() {
            if let Some(channel_id) = session.as_ref().and_then(|s| s.channel_id.as_deref()) {
                channel = self.persistence.load_channel(channel_id).await?;
                if channel.is_none() {
                    warn!(channel_id, "Session refers to a missing channel");
                }
            }
        }

        Ok((channel, session))
    }

    fn effective_model(&self, req: &GenerationRequest, channel: Option<&ChannelContext>) -> String {
        if !req.uses_default_model() {
            return req.model.clone();
        }
        channel
            .and_then(|c| c.model.as_deref())
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.settings.default_model.clone())
    }

    // ── Non-streaming ──

    /// Run a generation to completion and return the final content.
    pub async fn complete(&self, req: &GenerationRequest) -> Result<ChatCompletion> {
        let stream_id = req.stream_id.clone().unwrap_or_else(new_stream_id);
        let prepared = match self.prepare(req, stream_id.clone()).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.fail(&stream_id, GenerationStage::Prepare, &e);
                return Err(e);
            }
        };
        self.complete_prepared(prepared).await
    }

    pub async fn complete_prepared(&self, prepared: PreparedGeneration) -> Result<ChatCompletion> {
        let started = Instant::now();
        self.publish_started(&prepared);
        let PreparedGeneration { stream_id, model, session_id, user_message, provider, request } = prepared;

        let first = match provider.complete(request.clone()).await {
            Ok(response) => response,
            Err(e) => {
                let e = Error::from(e);
                self.fail(&stream_id, GenerationStage::FirstCall, &e);
                return Err(e);
            }
        };

        let mut usage = first.usage;
        let calls = first.message.tool_calls;
        let tool_calls_made = calls.len();

        let content = if calls.is_empty() {
            first.message.content
        } else {
            let follow_up = self
                .follow_up_request(&stream_id, request, first.message.content, calls)
                .await;
            match provider.complete(follow_up).await {
                Ok(second) => {
                    if !second.message.tool_calls.is_empty() {
                        debug!(stream_id = %stream_id, "Ignoring tool calls from follow-up call");
                    }
                    usage = Usage::combine(usage, second.usage);
                    second.message.content
                }
                Err(e) => {
                    let e = Error::from(e);
                    self.fail(&stream_id, GenerationStage::ToolFollowUp, &e);
                    return Err(e);
                }
            }
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        self.finalize(&stream_id, &model, session_id, user_message, &content, usage, tool_calls_made, latency_ms)
            .await;
        Ok(ChatCompletion::new(stream_id, model, content, usage))
    }

    // ── Streaming ──

    /// Start a streaming generation on its own task.
    ///
    /// The task runs to completion whether or not the receiver is still
    /// listening; dropping the receiver only stops delivery.
    pub fn stream(self: &Arc<Self>, prepared: PreparedGeneration) -> mpsc::Receiver<GenerationEvent> {
        let (tx, rx) = mpsc::channel(self.settings.event_capacity.max(1));
        let this = Arc::clone(self);
        tokio::spawn(async move { this.drive_stream(prepared, Emitter::new(tx)).await });
        rx
    }

    async fn drive_stream(&self, prepared: PreparedGeneration, mut out: Emitter) {
        let started = Instant::now();
        self.publish_started(&prepared);
        let PreparedGeneration { stream_id, model, session_id, user_message, provider, request } = prepared;

        out.emit(GenerationEvent::Started {
            stream_id: stream_id.clone(),
            model: model.clone(),
        })
        .await;

        let mut delivered = String::new();
        let first = match stream_round(provider.as_ref(), request.clone(), &mut out, &mut delivered).await {
            Ok(round) => round,
            Err(e) => {
                self.fail(&stream_id, GenerationStage::FirstCall, &e);
                out.emit(GenerationEvent::error(GenerationStage::FirstCall, &e)).await;
                return;
            }
        };

        let mut usage = first.usage;
        let tool_calls_made = first.tool_calls.len();

        if tool_calls_made > 0 {
            let follow_up = self
                .follow_up_request(&stream_id, request, first.content, first.tool_calls)
                .await;
            match stream_round(provider.as_ref(), follow_up, &mut out, &mut delivered).await {
                Ok(second) => {
                    if !second.tool_calls.is_empty() {
                        debug!(stream_id = %stream_id, "Ignoring tool calls from follow-up call");
                    }
                    usage = Usage::combine(usage, second.usage);
                }
                Err(e) => {
                    self.fail(&stream_id, GenerationStage::ToolFollowUp, &e);
                    out.emit(GenerationEvent::error(GenerationStage::ToolFollowUp, &e)).await;
                    return;
                }
            }
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        self.finalize(&stream_id, &model, session_id, user_message, &delivered, usage, tool_calls_made, latency_ms)
            .await;
        out.emit(GenerationEvent::Done {
            model,
            usage,
            latency_ms,
            tool_calls_made,
        })
        .await;
    }

    // ── EXECUTE_TOOLS ──

    /// Run the tool round and build the second call: the original request
    /// without tools, plus the assistant's tool-call message and one result
    /// message per call.
    async fn follow_up_request(
        &self,
        stream_id: &str,
        request: ProviderRequest,
        first_content: String,
        calls: Vec<MessageToolCall>,
    ) -> ProviderRequest {
        let results = self.run_tools(stream_id, &calls).await;
        let mut request = request.without_tools();
        request.messages.push(Message::assistant_with_tools(first_content, calls));
        request.messages.extend(results);
        request
    }

    /// Execute one round of tool calls concurrently. Results keep call order.
    async fn run_tools(&self, stream_id: &str, calls: &[MessageToolCall]) -> Vec<Message> {
        info!(stream_id, count = calls.len(), "Executing tool calls");

        let runs = calls.iter().map(|requested| async move {
            let call = ToolCall::from_message(requested);
            let start = Instant::now();
            let outcome = self.tools.invoke(&call).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            match &outcome.result {
                Ok(_) => debug!(stream_id, tool = %call.name, duration_ms, "Tool executed"),
                Err(e) => warn!(stream_id, tool = %call.name, error = %e, "Tool execution failed"),
            }
            self.events.publish(DomainEvent::ToolExecuted {
                stream_id: stream_id.to_string(),
                tool_name: call.name.clone(),
                success: outcome.is_success(),
                duration_ms,
                timestamp: Utc::now(),
            });

            outcome.into_message()
        });

        join_all(runs).await
    }

    // ── FINALIZE ──

    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        stream_id: &str,
        model: &str,
        session_id: Option<String>,
        user_message: Option<String>,
        content: &str,
        usage: Option<Usage>,
        tool_calls: usize,
        latency_ms: u64,
    ) {
        let tokens_used = usage.map(|u| u.total_tokens).unwrap_or(0);
        info!(stream_id, model, tokens_used, tool_calls, latency_ms, "Generation complete");

        if let Some(session_id) = session_id {
            let turn = ConversationTurn {
                session_id,
                user_message: user_message.unwrap_or_default(),
                assistant_content: content.to_string(),
                model: model.to_string(),
                created_at: Utc::now(),
            };
            if let Err(e) = self.persistence.save_turn(turn).await {
                warn!(stream_id, error = %e, "Failed to save conversation turn");
            }
        }

        self.events.publish(DomainEvent::GenerationCompleted {
            stream_id: stream_id.to_string(),
            model: model.to_string(),
            tokens_used,
            tool_calls,
            latency_ms,
            timestamp: Utc::now(),
        });
    }

    fn publish_started(&self, prepared: &PreparedGeneration) {
        info!(
            stream_id = %prepared.stream_id,
            model = %prepared.model,
            provider = prepared.provider.name(),
            "Generation started"
        );
        self.events.publish(DomainEvent::GenerationStarted {
            stream_id: prepared.stream_id.clone(),
            model: prepared.model.clone(),
            session_id: prepared.session_id.clone(),
            timestamp: Utc::now(),
        });
    }

    fn fail(&self, stream_id: &str, stage: GenerationStage, error: &Error) {
        warn!(stream_id, stage = stage.as_str(), error = %error, "Generation failed");
        self.events.publish(DomainEvent::GenerationFailed {
            stream_id: stream_id.to_string(),
            stage: stage.as_str().to_string(),
            error_message: error.to_string(),
            timestamp: Utc::now(),
        });
    }
}

/// Sends events to the transport until it goes away, then drops them.
struct Emitter {
    tx: mpsc::Sender<GenerationEvent>,
    connected: bool,
}

impl Emitter {
    fn new(tx: mpsc::Sender<GenerationEvent>) -> Self {
        Self { tx, connected: true }
    }

    async fn emit(&mut self, event: GenerationEvent) {
        if self.connected && self.tx.send(event).await.is_err() {
            debug!("Event receiver dropped, generation continues");
            self.connected = false;
        }
    }
}

/// Output of one streamed model call.
struct StreamRound {
    content: String,
    tool_calls: Vec<MessageToolCall>,
    usage: Option<Usage>,
}

/// Stream one model call, forwarding content deltas and collecting tool-call
/// fragments.
async fn stream_round(
    provider: &dyn Provider,
    request: ProviderRequest,
    out: &mut Emitter,
    delivered: &mut String,
) -> Result<StreamRound> {
    let mut rx = provider.stream(request).await?;
    let mut content = String::new();
    let mut fragments = ToolCallAccumulator::default();
    let mut usage = None;

    while let Some(item) = rx.recv().await {
        let chunk = item?;
        if let Some(text) = chunk.content.filter(|t| !t.is_empty()) {
            content.push_str(&text);
            delivered.push_str(&text);
            out.emit(GenerationEvent::Delta { content: text }).await;
        }
        fragments.absorb(&chunk.tool_calls);
        if chunk.usage.is_some() {
            usage = chunk.usage;
        }
        if chunk.done {
            break;
        }
    }

    Ok(StreamRound {
        content,
        tool_calls: fragments.finish(),
        usage,
    })
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Reassembles streamed tool calls keyed by index.
#[derive(Default)]
struct ToolCallAccumulator {
    calls: BTreeMap<usize, PartialCall>,
}

impl ToolCallAccumulator {
    fn absorb(&mut self, deltas: &[ToolCallDelta]) {
        for delta in deltas {
            let call = self.calls.entry(delta.index).or_default();
            if let Some(id) = delta.id.as_deref().filter(|id| !id.is_empty()) {
                call.id = id.to_string();
            }
            if let Some(name) = &delta.name {
                call.name.push_str(name);
            }
            if let Some(arguments) = &delta.arguments {
                call.arguments.push_str(arguments);
            }
        }
    }

    fn finish(self) -> Vec<MessageToolCall> {
        self.calls
            .into_iter()
            .map(|(index, call)| {
                let id = if call.id.is_empty() { format!("call_{index}") } else { call.id };
                MessageToolCall::new(id, call.name, call.arguments)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_event::ErrorKind;
    use crate::test_helpers::{EchoTool, Reply, ScriptedProvider, tool_call, usage};
    use serde_json::json;
    use streamweave_core::error::ProviderError;
    use streamweave_core::message::Role;
    use streamweave_core::store::KnowledgeEntry;
    use streamweave_store::InMemoryStore;

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        provider: Arc<ScriptedProvider>,
        store: Arc<InMemoryStore>,
    }

    fn harness(replies: Vec<Reply>) -> Harness {
        harness_with(replies, OrchestratorSettings::default())
    }

    fn harness_with(replies: Vec<Reply>, settings: OrchestratorSettings) -> Harness {
        let provider = Arc::new(ScriptedProvider::new(replies));
        let mut router = ProviderRouter::new("mock");
        router.register("mock", provider.clone());

        let mut tools = ToolRegistry::new();
        tools.register(Box::new(EchoTool));

        let store = Arc::new(InMemoryStore::new());
        let orchestrator = Orchestrator::new(
            Arc::new(router),
            Arc::new(tools),
            store.clone(),
            store.clone(),
            Arc::new(EventBus::default()),
        )
        .with_settings(settings);

        Harness { orchestrator: Arc::new(orchestrator), provider, store }
    }

    fn ask(text: &str) -> GenerationRequest {
        GenerationRequest::new(vec![Message::user(text)])
    }

    fn echo_then(answer: &str) -> Vec<Reply> {
        vec![
            Reply::Tools {
                content: "Let me check. ".into(),
                calls: vec![tool_call("call_1", "echo", json!({"text": "ping", "extra": 1}))],
            },
            Reply::Text(answer.into()),
        ]
    }

    async fn collect(h: &Harness, req: GenerationRequest) -> Vec<GenerationEvent> {
        let prepared = h.orchestrator.prepare(&req, "gen-1".into()).await.unwrap();
        let mut rx = h.orchestrator.stream(prepared);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn deltas(events: &[GenerationEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::Delta { content } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn no_tool_calls_returns_first_content() {
        let h = harness(vec![Reply::Text("Hello there!".into())]);
        let completion = h.orchestrator.complete(&ask("hi")).await.unwrap();

        assert_eq!(completion.content(), "Hello there!");
        assert_eq!(completion.object, "chat.completion");
        assert_eq!(h.provider.call_count(), 1);

        let request = &h.provider.requests()[0];
        assert_eq!(request.tools.len(), 1);
        assert_eq!(request.tool_choice, Some(json!("auto")));
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.max_tokens, Some(4096));
        assert_eq!(request.timeout_secs, 60);
    }

    #[tokio::test]
    async fn tool_round_trip_uses_second_call_content() {
        let h = harness(echo_then("The echo said ping."));
        let completion = h.orchestrator.complete(&ask("echo ping")).await.unwrap();

        assert_eq!(completion.content(), "The echo said ping.");
        assert_eq!(completion.usage.unwrap().total_tokens, usage().total_tokens * 2);

        let requests = h.provider.requests();
        assert_eq!(requests.len(), 2);
        let follow_up = &requests[1];
        assert!(follow_up.tools.is_empty());
        assert!(follow_up.tool_choice.is_none());

        let n = follow_up.messages.len();
        let assistant = &follow_up.messages[n - 2];
        assert_eq!(assistant.role, Role::Assistant);
        assert_eq!(assistant.content, "Let me check. ");
        assert_eq!(assistant.tool_calls[0].id, "call_1");

        let result = &follow_up.messages[n - 1];
        assert_eq!(result.role, Role::Tool);
        assert_eq!(result.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(result.name.as_deref(), Some("echo"));
        // Undeclared "extra" argument was dropped before execution
        assert_eq!(result.content, r#"{"echo":"ping"}"#);
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_payload_and_continues() {
        let h = harness(vec![
            Reply::Tools { content: String::new(), calls: vec![tool_call("c9", "nope", json!({}))] },
            Reply::Text("Sorry, I could not do that.".into()),
        ]);
        let completion = h.orchestrator.complete(&ask("do it")).await.unwrap();
        assert_eq!(completion.content(), "Sorry, I could not do that.");

        let follow_up = &h.provider.requests()[1];
        let result = follow_up.messages.last().unwrap();
        assert_eq!(result.content, r#"{"error":"Tool 'nope' not found"}"#);
    }

    #[tokio::test]
    async fn exactly_one_tool_round_even_if_follow_up_requests_tools() {
        let again = || Reply::Tools {
            content: "still thinking".into(),
            calls: vec![tool_call("c2", "echo", json!({"text": "again"}))],
        };
        let h = harness(vec![again(), again(), Reply::Text("never".into())]);

        let completion = h.orchestrator.complete(&ask("loop")).await.unwrap();
        assert_eq!(completion.content(), "still thinking");
        assert_eq!(h.provider.call_count(), 2);

        let h = harness(vec![again(), again(), Reply::Text("never".into())]);
        let events = collect(&h, ask("loop")).await;
        assert!(matches!(events.last(), Some(GenerationEvent::Done { tool_calls_made: 1, .. })));
        assert_eq!(h.provider.call_count(), 2);
    }

    #[tokio::test]
    async fn stream_forwards_content_but_not_tool_fragments() {
        let h = harness(echo_then("The echo said ping."));
        let events = collect(&h, ask("echo ping")).await;

        assert_eq!(
            events.first(),
            Some(&GenerationEvent::Started { stream_id: "gen-1".into(), model: "gpt-4o-mini".into() })
        );
        assert_eq!(deltas(&events), "Let me check. The echo said ping.");
        assert!(events.iter().all(|e| match e {
            GenerationEvent::Delta { content } => !content.contains("ping\"}"),
            _ => true,
        }));
        match events.last() {
            Some(GenerationEvent::Done { usage, tool_calls_made, .. }) => {
                assert_eq!(*tool_calls_made, 1);
                assert_eq!(usage.unwrap().total_tokens, 30);
            }
            other => panic!("expected done, got {other:?}"),
        }

        // Fragments were reassembled into the original call
        let follow_up = &h.provider.requests()[1];
        let call = &follow_up.messages[follow_up.messages.len() - 2].tool_calls[0];
        assert_eq!(call.function.name, "echo");
        assert_eq!(call.function.arguments, json!({"text": "ping", "extra": 1}).to_string());
    }

    #[tokio::test]
    async fn first_call_failure_emits_single_error() {
        let h = harness(vec![Reply::Fail(ProviderError::Timeout("60s".into()))]);
        let events = collect(&h, ask("hi")).await;

        assert_eq!(events.len(), 2);
        match &events[1] {
            GenerationEvent::Error { stage, kind, .. } => {
                assert_eq!(*stage, GenerationStage::FirstCall);
                assert_eq!(*kind, ErrorKind::Timeout);
            }
            other => panic!("expected error, got {other:?}"),
        }

        let h = harness(vec![Reply::Fail(ProviderError::Network("reset".into()))]);
        let err = h.orchestrator.complete(&ask("hi")).await.unwrap_err();
        assert!(matches!(err, Error::Provider(ProviderError::Network(_))));
    }

    #[tokio::test]
    async fn first_call_broken_mid_stream_keeps_delivered_content_then_errors() {
        let h = harness(vec![Reply::BreakAfter {
            content: "Partial".into(),
            error: ProviderError::StreamInterrupted("reset".into()),
        }]);
        let session = h.store.create_session(None).await.unwrap();
        let mut req = ask("hi");
        req.session_id = Some(session.clone());

        let events = collect(&h, req).await;
        assert_eq!(deltas(&events), "Partial");
        assert!(matches!(
            events.last(),
            Some(GenerationEvent::Error { stage: GenerationStage::FirstCall, .. })
        ));
        assert!(!events.iter().any(|e| matches!(e, GenerationEvent::Done { .. })));
        assert_eq!(h.store.message_count(&session).await, Some(0));
    }

    #[tokio::test]
    async fn follow_up_failure_keeps_delivered_content_then_errors() {
        let replies = || {
            vec![
                Reply::Tools {
                    content: "Checking. ".into(),
                    calls: vec![tool_call("c1", "echo", json!({"text": "x"}))],
                },
                Reply::Fail(ProviderError::RateLimited { retry_after_secs: 5 }),
            ]
        };

        let h = harness(replies());
        let session = h.store.create_session(None).await.unwrap();
        let mut req = ask("hi");
        req.session_id = Some(session.clone());

        let events = collect(&h, req.clone()).await;
        assert_eq!(deltas(&events), "Checking. ");
        assert!(matches!(
            events.last(),
            Some(GenerationEvent::Error { stage: GenerationStage::ToolFollowUp, kind: ErrorKind::RateLimited, .. })
        ));
        assert_eq!(h.store.message_count(&session).await, Some(0));

        let h = harness(replies());
        let err = h.orchestrator.complete(&ask("hi")).await.unwrap_err();
        assert!(matches!(err, Error::Provider(ProviderError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn session_history_is_prepended_oldest_first_and_turn_saved_once() {
        let h = harness(vec![Reply::Text("Fine, thanks.".into())]);
        let session = h.store.create_session(None).await.unwrap();
        h.store
            .save_turn(ConversationTurn {
                session_id: session.clone(),
                user_message: "first question".into(),
                assistant_content: "first answer".into(),
                model: "m".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let mut req = ask("how are you?");
        req.session_id = Some(session.clone());
        h.orchestrator.complete(&req).await.unwrap();

        let contents: Vec<_> = h.provider.requests()[0]
            .messages
            .iter()
            .skip(1)
            .map(|m| m.content.clone())
            .collect();
        assert_eq!(contents, vec!["first question", "first answer", "how are you?"]);

        assert_eq!(h.store.message_count(&session).await, Some(4));
        let loaded = h.store.load_session(&session, 2).await.unwrap().unwrap();
        assert_eq!(loaded.history[0].content, "Fine, thanks.");
        assert_eq!(loaded.history[1].content, "how are you?");
    }

    #[tokio::test]
    async fn sessionless_generation_saves_nothing() {
        let h = harness(vec![Reply::Text("ok".into())]);
        let session = h.store.create_session(None).await.unwrap();
        h.orchestrator.complete(&ask("hi")).await.unwrap();
        assert_eq!(h.store.message_count(&session).await, Some(0));
    }

    #[tokio::test]
    async fn unknown_session_or_channel_is_not_found() {
        let h = harness(vec![]);
        let mut req = ask("hi");
        req.session_id = Some("missing".into());
        assert!(matches!(
            h.orchestrator.complete(&req).await,
            Err(Error::NotFound { kind: "session", .. })
        ));

        let mut req = ask("hi");
        req.channel_id = Some("missing".into());
        assert!(matches!(
            h.orchestrator.prepare(&req, "g".into()).await,
            Err(Error::NotFound { kind: "channel", .. })
        ));
        assert_eq!(h.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn invalid_request_is_rejected_before_model_call() {
        let h = harness(vec![Reply::Text("x".into())]);
        let mut req = ask("hi");
        req.temperature = Some(3.0);
        assert!(matches!(h.orchestrator.complete(&req).await, Err(Error::Validation(_))));
        assert_eq!(h.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn model_precedence() {
        let h = harness_with(
            vec![],
            OrchestratorSettings { default_model: "cfg-model".into(), ..OrchestratorSettings::default() },
        );
        h.store
            .put_channel(ChannelContext { model: Some("chan-model".into()), ..ChannelContext::new("c1") })
            .await
            .unwrap();

        let prepared = h.orchestrator.prepare(&ask("hi"), "g".into()).await.unwrap();
        assert_eq!(prepared.model, "cfg-model");

        let mut req = ask("hi");
        req.channel_id = Some("c1".into());
        let prepared = h.orchestrator.prepare(&req, "g".into()).await.unwrap();
        assert_eq!(prepared.model, "chan-model");

        req.model = "explicit".into();
        let prepared = h.orchestrator.prepare(&req, "g".into()).await.unwrap();
        assert_eq!(prepared.model, "explicit");
        assert_eq!(prepared.request().model, "explicit");
    }

    #[tokio::test]
    async fn channel_provider_and_scope_via_session() {
        let h = harness(vec![]);
        let orchestrator = {
            let other = Arc::new(ScriptedProvider::named("other", vec![]));
            let mut router = ProviderRouter::new("mock");
            router.register("mock", h.provider.clone());
            router.register("other", other);
            Orchestrator::new(
                Arc::new(router),
                Arc::new(ToolRegistry::new()),
                h.store.clone(),
                h.store.clone(),
                Arc::new(EventBus::default()),
            )
        };

        h.store
            .put_channel(ChannelContext {
                provider: Some("other".into()),
                context: Some("Acme Billing".into()),
                ..ChannelContext::new("billing")
            })
            .await
            .unwrap();
        let session = h.store.create_session(Some("billing")).await.unwrap();

        let mut req = ask("hi");
        req.session_id = Some(session);
        let prepared = orchestrator.prepare(&req, "g".into()).await.unwrap();
        assert_eq!(prepared.provider_name(), "other");

        let system = &prepared.request().messages[0].content;
        assert!(system.contains("You are the assistant for: Acme Billing"));
        // Empty registry: no catalog, no tool choice
        assert!(prepared.request().tools.is_empty());
        assert!(prepared.request().tool_choice.is_none());
        assert!(!system.contains("You have access to the following tools"));
    }

    #[tokio::test]
    async fn knowledge_presence_selects_soft_guard() {
        let h = harness(vec![]);
        let prepared = h.orchestrator.prepare(&ask("hi"), "g".into()).await.unwrap();
        assert!(!prepared.request().messages[0].content.contains("KNOWLEDGE BOUNDARIES"));

        h.store
            .add_entry(KnowledgeEntry {
                id: "k1".into(),
                title: "Refunds".into(),
                content: "14 days".into(),
                content_type: "text".into(),
                active: true,
            })
            .await
            .unwrap();
        let prepared = h.orchestrator.prepare(&ask("hi"), "g".into()).await.unwrap();
        assert!(prepared.request().messages[0].content.starts_with("## KNOWLEDGE BOUNDARIES"));
    }

    #[tokio::test]
    async fn domain_events_are_published() {
        let h = harness(echo_then("done"));
        let mut events = h.orchestrator.events().subscribe();
        h.orchestrator.complete(&ask("echo")).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind());
        }
        assert_eq!(kinds, vec!["generation_started", "tool_executed", "generation_completed"]);
    }

    #[tokio::test]
    async fn generation_continues_after_receiver_drops() {
        let h = harness(vec![Reply::Text("a long answer".into())]);
        let session = h.store.create_session(None).await.unwrap();
        let mut req = ask("hi");
        req.session_id = Some(session.clone());

        let mut bus = h.orchestrator.events().subscribe();
        let prepared = h.orchestrator.prepare(&req, "gen-1".into()).await.unwrap();
        drop(h.orchestrator.stream(prepared));

        loop {
            let event = bus.recv().await.unwrap();
            if event.kind() == "generation_completed" {
                break;
            }
        }
        assert_eq!(h.store.message_count(&session).await, Some(2));
    }

    #[test]
    fn accumulator_concatenates_fragments_by_index() {
        let mut acc = ToolCallAccumulator::default();
        acc.absorb(&[
            ToolCallDelta { index: 1, id: Some("b".into()), name: Some("query_".into()), arguments: Some("{\"q".into()) },
            ToolCallDelta { index: 0, name: Some("get_current_datetime".into()), ..ToolCallDelta::default() },
        ]);
        acc.absorb(&[ToolCallDelta {
            index: 1,
            name: Some("knowledge".into()),
            arguments: Some("uery\":\"x\"}".into()),
            ..ToolCallDelta::default()
        }]);

        let calls = acc.finish();
        assert_eq!(calls[0].id, "call_0");
        assert_eq!(calls[0].function.name, "get_current_datetime");
        assert_eq!(calls[1].id, "b");
        assert_eq!(calls[1].function.name, "query_knowledge");
        assert_eq!(calls[1].function.arguments, r#"{"query":"x"}"#);
    }
}
