use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use colloquy_core::domain::message::{ChatMessage, FinishReason};
use colloquy_core::domain::usage::TokenUsage;

use crate::tools::ToolDefinition;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("model `{0}` is not supported by this provider")]
    UnsupportedModel(String),
    #[error("provider stream failed: {0}")]
    Stream(String),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompletionParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Empty when tools must not be offered for this call.
    pub tools: Vec<ToolDefinition>,
    pub params: CompletionParams,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompletionChoice {
    pub message: ChatMessage,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompletionResponse {
    pub choices: Vec<CompletionChoice>,
    pub usage: Option<TokenUsage>,
}

/// Fragment of a streamed tool call. Fragments sharing `index` belong to the same call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamChunk {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<TokenUsage>,
}

impl StreamChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: Some(content.into()), ..Self::default() }
    }

    pub fn finish(reason: FinishReason) -> Self {
        Self { finish_reason: Some(reason), ..Self::default() }
    }
}

pub type CompletionStream = BoxStream<'static, Result<StreamChunk, ProviderError>>;

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &str;

    async fn chat_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError>;

    async fn completion_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionStream, ProviderError>;

    fn supports_model(&self, model: &str) -> bool;

    async fn list_models(&self) -> Result<Vec<String>, ProviderError>;
}

/// Completion clients known to a factory, looked up by provider name.
#[derive(Clone, Default)]
pub struct LlmRegistry {
    clients: Vec<Arc<dyn LlmClient>>,
}

impl LlmRegistry {
    pub fn register(&mut self, client: Arc<dyn LlmClient>) {
        self.clients.retain(|existing| existing.name() != client.name());
        self.clients.push(client);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LlmClient>> {
        self.clients.iter().find(|client| client.name() == name).cloned()
    }

    /// The named provider, only when it serves `model`. Never reroutes to another provider.
    pub fn resolve(&self, provider: &str, model: &str) -> Option<Arc<dyn LlmClient>> {
        self.get(provider).filter(|client| client.supports_model(model))
    }

    /// First registered client serving `model`, whatever its provider.
    pub fn serving(&self, model: &str) -> Option<Arc<dyn LlmClient>> {
        self.clients.iter().find(|client| client.supports_model(model)).cloned()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
