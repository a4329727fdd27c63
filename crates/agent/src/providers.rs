use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::ProviderError;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    /// Tokens consumed, when the provider reports it.
    pub usage: Option<u64>,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn embed(&self, text: &str, model: &str) -> Result<Embedding, ProviderError>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectionInfo {
    pub name: String,
    pub groups: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VectorQuery {
    pub collection: String,
    pub amount: u32,
    pub max_distance: f32,
    pub vector: Vec<f32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScoredChunk {
    pub content: String,
    pub score: f32,
}

#[async_trait]
pub trait VectorProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>, ProviderError>;

    /// One round-trip for every collection in `batch`, keyed by collection name.
    async fn query(
        &self,
        batch: Vec<VectorQuery>,
    ) -> Result<HashMap<String, Vec<ScoredChunk>>, ProviderError>;
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    embeddings: HashMap<String, Arc<dyn EmbeddingProvider>>,
    vectors: HashMap<String, Arc<dyn VectorProvider>>,
}

impl ProviderRegistry {
    pub fn register_embedding(&mut self, provider: Arc<dyn EmbeddingProvider>) {
        self.embeddings.insert(provider.name().to_string(), provider);
    }

    pub fn register_vector(&mut self, provider: Arc<dyn VectorProvider>) {
        self.vectors.insert(provider.name().to_string(), provider);
    }

    pub fn embedding(&self, name: &str) -> Option<Arc<dyn EmbeddingProvider>> {
        self.embeddings.get(name).cloned()
    }

    pub fn vector(&self, name: &str) -> Option<Arc<dyn VectorProvider>> {
        self.vectors.get(name).cloned()
    }
}
