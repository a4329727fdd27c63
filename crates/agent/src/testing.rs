//! In-process fakes for the provider seams, used by unit and integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;

use colloquy_core::domain::message::{ChatMessage, FinishReason, ToolCallData};
use colloquy_core::domain::usage::TokenUsage;

use crate::history::Tokenizer;
use crate::llm::{
    CompletionChoice, CompletionRequest, CompletionResponse, CompletionStream, LlmClient,
    ProviderError, StreamChunk,
};
use crate::providers::{
    CollectionInfo, Embedding, EmbeddingProvider, ScoredChunk, VectorProvider, VectorQuery,
};
use crate::tools::{ToolCapabilities, ToolHandler};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub fn text_response(text: &str) -> CompletionResponse {
    CompletionResponse {
        choices: vec![CompletionChoice {
            message: ChatMessage::assistant_text(text),
            finish_reason: Some(FinishReason::Stop),
        }],
        usage: Some(TokenUsage { prompt_tokens: 10, completion_tokens: 5 }),
    }
}

pub fn tool_call_response(content: Option<&str>, calls: Vec<ToolCallData>) -> CompletionResponse {
    CompletionResponse {
        choices: vec![CompletionChoice {
            message: ChatMessage::assistant(content.map(Into::into), calls),
            finish_reason: Some(FinishReason::ToolCalls),
        }],
        usage: None,
    }
}

struct ScriptedStream {
    chunks: Vec<Result<StreamChunk, ProviderError>>,
    hang: bool,
}

/// Completion client replaying queued responses and streams, recording every request.
pub struct ScriptedLlm {
    name: String,
    models: Vec<String>,
    responses: Mutex<VecDeque<Result<CompletionResponse, ProviderError>>>,
    repeat: Mutex<Option<CompletionResponse>>,
    streams: Mutex<VecDeque<ScriptedStream>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            models: Vec::new(),
            responses: Mutex::new(VecDeque::new()),
            repeat: Mutex::new(None),
            streams: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Restricts the models this client claims. No models means every model.
    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = models.iter().map(|model| model.to_string()).collect();
        self
    }

    pub fn push_response(&self, response: CompletionResponse) {
        lock(&self.responses).push_back(Ok(response));
    }

    pub fn push_error(&self, error: ProviderError) {
        lock(&self.responses).push_back(Err(error));
    }

    /// Served once the queue is empty, forever.
    pub fn repeat_response(&self, response: CompletionResponse) {
        *lock(&self.repeat) = Some(response);
    }

    pub fn push_stream(&self, chunks: Vec<Result<StreamChunk, ProviderError>>) {
        lock(&self.streams).push_back(ScriptedStream { chunks, hang: false });
    }

    /// A stream that yields `chunks` and then never ends.
    pub fn push_hanging_stream(&self, chunks: Vec<Result<StreamChunk, ProviderError>>) {
        lock(&self.streams).push_back(ScriptedStream { chunks, hang: true });
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        lock(&self.requests).push(request);
        if let Some(next) = lock(&self.responses).pop_front() {
            return next;
        }
        lock(&self.repeat)
            .as_ref()
            .cloned()
            .ok_or_else(|| ProviderError::Request("no scripted response left".to_string()))
    }

    async fn completion_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionStream, ProviderError> {
        lock(&self.requests).push(request);
        let scripted = lock(&self.streams)
            .pop_front()
            .ok_or_else(|| ProviderError::Stream("no scripted stream left".to_string()))?;

        let replay = stream::iter(scripted.chunks);
        if scripted.hang {
            Ok(replay.chain(stream::pending()).boxed())
        } else {
            Ok(replay.boxed())
        }
    }

    fn supports_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|known| known == model)
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.models.clone())
    }
}

/// One token per whitespace-separated word.
pub struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

pub struct StaticEmbedding {
    name: String,
    failing: bool,
    calls: Arc<AtomicUsize>,
}

impl StaticEmbedding {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), failing: false, calls: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl EmbeddingProvider for StaticEmbedding {
    fn name(&self) -> &str {
        &self.name
    }

    async fn embed(&self, text: &str, _model: &str) -> Result<Embedding, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(ProviderError::Request("embedding backend down".to_string()));
        }
        Ok(Embedding { vector: vec![1.0, 0.0], usage: Some(text.split_whitespace().count() as u64) })
    }
}

/// Vector provider with fixed chunks per collection.
pub struct StaticVectorStore {
    name: String,
    collections: HashMap<String, (Vec<String>, Vec<String>)>,
    failing: bool,
    queries: AtomicUsize,
}

impl StaticVectorStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            collections: HashMap::new(),
            failing: false,
            queries: AtomicUsize::new(0),
        }
    }

    pub fn with_collection(mut self, name: &str, groups: &[&str], chunks: &[&str]) -> Self {
        self.collections.insert(
            name.to_string(),
            (
                groups.iter().map(|group| group.to_string()).collect(),
                chunks.iter().map(|chunk| chunk.to_string()).collect(),
            ),
        );
        self
    }

    /// Queries fail; metadata lookups still succeed.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorProvider for StaticVectorStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>, ProviderError> {
        Ok(self
            .collections
            .get(name)
            .map(|(groups, _)| CollectionInfo { name: name.to_string(), groups: groups.clone() }))
    }

    async fn query(
        &self,
        batch: Vec<VectorQuery>,
    ) -> Result<HashMap<String, Vec<ScoredChunk>>, ProviderError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(ProviderError::Request("vector store unavailable".to_string()));
        }

        let mut results = HashMap::new();
        for query in batch {
            let chunks = self
                .collections
                .get(&query.collection)
                .map(|(_, chunks)| {
                    chunks
                        .iter()
                        .take(query.amount as usize)
                        .map(|content| ScoredChunk { content: content.clone(), score: 0.1 })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            results.insert(query.collection, chunks);
        }
        Ok(results)
    }
}

/// Tool answering every call with the same text.
pub struct FixedTool(pub String);

#[async_trait]
impl ToolHandler for FixedTool {
    async fn call(&self, _capabilities: &ToolCapabilities, _arguments: Value) -> Result<String> {
        Ok(self.0.clone())
    }
}
