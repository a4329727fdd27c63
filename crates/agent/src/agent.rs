use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use colloquy_core::config::{AppConfig, DEFAULT_MAX_TOOL_ATTEMPTS};
use colloquy_core::domain::agent::AgentConfiguration;
use colloquy_core::domain::message::{
    ChatMessage, FinishReason, MessageContent, Role, ToolCallData,
};
use colloquy_core::domain::usage::TokenUsage;
use colloquy_core::errors::ApplicationError;
use colloquy_core::events::{EventSink, WorkflowEvent};

use crate::enrichment::ContextEnrichment;
use crate::history::ChatHistory;
use crate::llm::{
    CompletionParams, CompletionRequest, CompletionResponse, CompletionStream, LlmClient,
    ProviderError, ToolCallDelta,
};
use crate::stream::{CancelSignal, StreamOutcome, TurnOutput};
use crate::tools::Toolchain;
use crate::usage::UsageRecorder;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("provider protocol violation: {0}")]
    ProtocolViolation(String),
}

impl From<AgentError> for ApplicationError {
    fn from(value: AgentError) -> Self {
        match value {
            AgentError::Provider(error) => ApplicationError::Provider(error.to_string()),
            AgentError::ProtocolViolation(message) => ApplicationError::ProtocolViolation(message),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AgentSettings {
    /// Tool round-trips allowed per turn; the call after the last one is made without tools.
    pub max_tool_attempts: u32,
    pub request_timeout: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self { max_tool_attempts: DEFAULT_MAX_TOOL_ATTEMPTS, request_timeout: Duration::from_secs(60) }
    }
}

impl From<&AppConfig> for AgentSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_tool_attempts: config.agent.max_tool_attempts,
            request_timeout: Duration::from_secs(config.llm.timeout_secs),
        }
    }
}

pub struct AgentParts {
    pub configuration: Arc<AgentConfiguration>,
    pub client: Arc<dyn LlmClient>,
    pub history: Box<dyn ChatHistory>,
    pub enrichment: ContextEnrichment,
    pub toolchain: Toolchain,
    pub usage: UsageRecorder,
    pub sink: Arc<dyn EventSink>,
    pub settings: AgentSettings,
}

/// Drives single turns against one completion client. Owns the conversation's history.
pub struct WorkflowAgent {
    configuration: Arc<AgentConfiguration>,
    client: Arc<dyn LlmClient>,
    history: Box<dyn ChatHistory>,
    enrichment: ContextEnrichment,
    toolchain: Toolchain,
    usage: UsageRecorder,
    sink: Arc<dyn EventSink>,
    settings: AgentSettings,
}

enum StreamAttempt {
    Finished { message: ChatMessage, finish_reason: FinishReason },
    Cancelled { partial: String },
    Failed(AgentError),
}

#[derive(Default)]
struct PendingToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

impl PendingToolCall {
    fn merge(&mut self, delta: ToolCallDelta) {
        if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
            self.id = Some(id);
        }
        if let Some(name) = delta.name {
            self.name.push_str(&name);
        }
        if let Some(arguments) = delta.arguments {
            self.arguments.push_str(&arguments);
        }
    }

    fn into_call(self, index: usize) -> ToolCallData {
        let id = self.id.unwrap_or_else(|| format!("call_{index}"));
        ToolCallData::new(id, self.name, self.arguments)
    }
}

impl WorkflowAgent {
    pub fn new(parts: AgentParts) -> Self {
        Self {
            configuration: parts.configuration,
            client: parts.client,
            history: parts.history,
            enrichment: parts.enrichment,
            toolchain: parts.toolchain,
            usage: parts.usage,
            sink: parts.sink,
            settings: parts.settings,
        }
    }

    pub fn configuration(&self) -> &Arc<AgentConfiguration> {
        &self.configuration
    }

    pub fn history(&self) -> &dyn ChatHistory {
        self.history.as_ref()
    }

    pub fn toolchain_mut(&mut self) -> &mut Toolchain {
        &mut self.toolchain
    }

    /// Adds a finished turn to the history.
    pub fn remember(&mut self, turn: Vec<ChatMessage>) {
        self.history.add(turn);
    }

    pub async fn complete_turn(&mut self, user_message: ChatMessage) -> Result<TurnOutput, AgentError> {
        let outgoing = self.enriched(&user_message).await;
        let mut buffer = Vec::new();
        let mut usage = TokenUsage::default();
        let mut attempt = 0;

        loop {
            let request = self.build_request(&outgoing, &buffer, attempt);
            let response = self.call_completion(request).await?;
            if let Some(reported) = response.usage {
                self.record_usage(reported, &mut usage);
            }

            let choice = response.choices.into_iter().next().ok_or_else(|| {
                AgentError::ProtocolViolation("completion returned no choices".to_string())
            })?;
            let finish_reason = choice.finish_reason.unwrap_or(FinishReason::Stop);
            let message = ChatMessage { role: Role::Assistant, ..choice.message };

            if self.absorb(message, &mut buffer, &mut attempt).await {
                continue;
            }
            return Ok(self.finish(user_message, buffer, finish_reason, usage, attempt));
        }
    }

    pub async fn stream_turn(
        &mut self,
        user_message: ChatMessage,
        mut cancel: CancelSignal,
    ) -> StreamOutcome {
        let outgoing = self.enriched(&user_message).await;
        let mut buffer = Vec::new();
        let mut usage = TokenUsage::default();
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return StreamOutcome::Cancelled(self.cancelled(user_message, buffer, usage));
            }

            let request = self.build_request(&outgoing, &buffer, attempt);
            let stream = match self.open_stream(request).await {
                Ok(stream) => stream,
                Err(error) => return StreamOutcome::Failed(error),
            };

            match self.consume_stream(stream, &mut cancel, &mut usage).await {
                StreamAttempt::Finished { message, finish_reason } => {
                    if self.absorb(message, &mut buffer, &mut attempt).await {
                        continue;
                    }
                    return StreamOutcome::Completed(
                        self.finish(user_message, buffer, finish_reason, usage, attempt),
                    );
                }
                StreamAttempt::Cancelled { partial } => {
                    if !partial.is_empty() {
                        buffer.push(ChatMessage::assistant_text(partial));
                    }
                    return StreamOutcome::Cancelled(self.cancelled(user_message, buffer, usage));
                }
                StreamAttempt::Failed(error) => return StreamOutcome::Failed(error),
            }
        }
    }

    /// Enrichment runs once per turn and only changes the outgoing copy of the user message.
    async fn enriched(&self, user_message: &ChatMessage) -> ChatMessage {
        if self.enrichment.is_empty() {
            return user_message.clone();
        }
        let Some(text) = user_message.text() else {
            return user_message.clone();
        };

        let enriched = self.enrichment.enrich(&text).await;
        if enriched == text {
            user_message.clone()
        } else {
            user_message.with_text(enriched)
        }
    }

    fn build_request(
        &self,
        user_message: &ChatMessage,
        buffer: &[ChatMessage],
        attempt: u32,
    ) -> CompletionRequest {
        let history = self.history.snapshot();
        let mut messages = Vec::with_capacity(history.len() + buffer.len() + 2);
        if !self.configuration.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(self.configuration.system_prompt.as_str()));
        }
        messages.extend(history);
        messages.push(user_message.clone());
        messages.extend(buffer.iter().cloned());

        let tools = if attempt < self.settings.max_tool_attempts {
            self.toolchain.list_tool_schemas()
        } else {
            Vec::new()
        };

        CompletionRequest {
            model: self.configuration.model.clone(),
            messages,
            tools,
            params: CompletionParams {
                temperature: self.configuration.temperature,
                max_tokens: self.configuration.max_tokens,
            },
        }
    }

    async fn call_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, AgentError> {
        match tokio::time::timeout(self.settings.request_timeout, self.client.chat_completion(request))
            .await
        {
            Ok(result) => result.map_err(AgentError::from),
            Err(_) => Err(self.timeout_error()),
        }
    }

    async fn open_stream(&self, request: CompletionRequest) -> Result<CompletionStream, AgentError> {
        match tokio::time::timeout(
            self.settings.request_timeout,
            self.client.completion_stream(request),
        )
        .await
        {
            Ok(result) => result.map_err(AgentError::from),
            Err(_) => Err(self.timeout_error()),
        }
    }

    fn timeout_error(&self) -> AgentError {
        AgentError::Provider(ProviderError::Request(format!(
            "{} did not answer within {}s",
            self.client.name(),
            self.settings.request_timeout.as_secs()
        )))
    }

    async fn consume_stream(
        &self,
        mut stream: CompletionStream,
        cancel: &mut CancelSignal,
        usage: &mut TokenUsage,
    ) -> StreamAttempt {
        let mut content = String::new();
        let mut calls = BTreeMap::<usize, PendingToolCall>::new();
        let mut finish_reason = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(
                        event_name = "agent.stream.cancelled",
                        buffered_chars = content.len(),
                        "stream cancelled; provider stream released"
                    );
                    return StreamAttempt::Cancelled { partial: content };
                }
                next = tokio::time::timeout(self.settings.request_timeout, stream.next()) => match next {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(
                            event_name = "agent.stream.stalled",
                            provider = %self.client.name(),
                            buffered_chars = content.len(),
                            "no stream chunk within the request timeout; provider stream released"
                        );
                        return StreamAttempt::Failed(self.timeout_error());
                    }
                },
            };

            match next {
                None => break,
                Some(Err(error)) => return StreamAttempt::Failed(error.into()),
                Some(Ok(chunk)) => {
                    if let Some(text) = chunk.content.filter(|text| !text.is_empty()) {
                        self.sink.emit(WorkflowEvent::StreamChunk { content: text.clone() });
                        content.push_str(&text);
                    }
                    for delta in chunk.tool_calls {
                        calls.entry(delta.index).or_default().merge(delta);
                    }
                    if let Some(reason) = chunk.finish_reason {
                        finish_reason = Some(reason);
                    }
                    if let Some(reported) = chunk.usage {
                        self.record_usage(reported, usage);
                    }
                }
            }
        }

        let Some(finish_reason) = finish_reason else {
            return StreamAttempt::Failed(AgentError::ProtocolViolation(
                "stream ended without a finish reason".to_string(),
            ));
        };

        let tool_calls =
            calls.into_iter().map(|(index, pending)| pending.into_call(index)).collect();
        let content = (!content.is_empty()).then(|| MessageContent::Text(content));
        StreamAttempt::Finished { message: ChatMessage::assistant(content, tool_calls), finish_reason }
    }

    /// Appends the assistant message and runs its tool calls. Returns true when another
    /// completion is needed.
    async fn absorb(
        &self,
        mut message: ChatMessage,
        buffer: &mut Vec<ChatMessage>,
        attempt: &mut u32,
    ) -> bool {
        if message.has_tool_calls() && *attempt >= self.settings.max_tool_attempts {
            warn!(
                event_name = "agent.tool.attempts_exhausted",
                agent_id = %self.configuration.agent_id.0,
                attempts = *attempt,
                dropped_calls = message.tool_calls.len(),
                "tool calls requested after the attempt ceiling; ending turn"
            );
            message.tool_calls.clear();
        }

        if !message.has_tool_calls() {
            if !message.has_content() {
                warn!(
                    event_name = "agent.turn.empty_completion",
                    agent_id = %self.configuration.agent_id.0,
                    "assistant returned neither content nor tool calls"
                );
            }
            buffer.push(message);
            return false;
        }

        let calls = message.tool_calls.clone();
        buffer.push(message);
        for call in &calls {
            let result = self.toolchain.process_tool_call(call).await;
            buffer.push(ChatMessage::tool(result));
        }
        *attempt += 1;
        true
    }

    fn record_usage(&self, reported: TokenUsage, total: &mut TokenUsage) {
        total.prompt_tokens += reported.prompt_tokens;
        total.completion_tokens += reported.completion_tokens;
        self.usage.record_completion(reported, &self.configuration.model, self.client.name());
    }

    fn finish(
        &self,
        user_message: ChatMessage,
        buffer: Vec<ChatMessage>,
        finish_reason: FinishReason,
        usage: TokenUsage,
        attempts: u32,
    ) -> TurnOutput {
        info!(
            event_name = "agent.turn.completed",
            agent_id = %self.configuration.agent_id.0,
            version = self.configuration.version,
            tool_attempts = attempts,
            finish_reason = finish_reason.as_str(),
            "turn completed"
        );
        let mut messages = Vec::with_capacity(buffer.len() + 1);
        messages.push(user_message);
        messages.extend(buffer);
        TurnOutput { messages, finish_reason, usage }
    }

    fn cancelled(
        &self,
        user_message: ChatMessage,
        buffer: Vec<ChatMessage>,
        usage: TokenUsage,
    ) -> TurnOutput {
        info!(
            event_name = "agent.turn.cancelled",
            agent_id = %self.configuration.agent_id.0,
            produced_messages = buffer.len(),
            "turn cancelled"
        );
        let mut messages = Vec::with_capacity(buffer.len() + 1);
        messages.push(user_message);
        messages.extend(buffer);
        TurnOutput { messages, finish_reason: FinishReason::ManualStop, usage }
    }
}
