//! Retrieval-augmented prompt enrichment.
//!
//! For every collection binding the caller may read, the prompt is embedded (once per distinct
//! embedding provider and model), collections are queried in one batch per vector provider, and
//! the retrieved chunks are prepended to the prompt behind the binding's instruction. Every
//! provider failure degrades to "nothing retrieved"; `enrich` itself cannot fail.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use colloquy_core::domain::agent::CollectionBinding;
use colloquy_core::domain::identity::Identity;
use colloquy_core::domain::usage::{TokenUsageRecord, UsageType};

use crate::access::CollectionAccessPolicy;
use crate::providers::{
    EmbeddingProvider, ProviderRegistry, ScoredChunk, VectorProvider, VectorQuery,
};
use crate::usage::UsageRecorder;

type EmbeddingKey = (String, String);
type ProviderBatch = (Arc<dyn VectorProvider>, Vec<usize>, Vec<VectorQuery>);

struct ResolvedBinding<'a> {
    index: usize,
    binding: &'a CollectionBinding,
    vector: Arc<dyn VectorProvider>,
}

pub struct ContextEnrichment {
    bindings: Vec<CollectionBinding>,
    providers: ProviderRegistry,
    identity: Identity,
    usage: UsageRecorder,
    policy: CollectionAccessPolicy,
}

impl ContextEnrichment {
    pub fn new(
        bindings: Vec<CollectionBinding>,
        providers: ProviderRegistry,
        identity: Identity,
        usage: UsageRecorder,
    ) -> Self {
        Self { bindings, providers, identity, usage, policy: CollectionAccessPolicy }
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub async fn enrich(&self, prompt: &str) -> String {
        if self.bindings.is_empty() {
            return prompt.to_string();
        }

        let resolved = self.resolve_accessible().await;
        if resolved.is_empty() {
            return prompt.to_string();
        }

        let vectors = self.embed_prompt(prompt, &resolved).await;
        let retrieved = self.query_providers(&resolved, &vectors).await;

        let mut context = String::new();
        for item in &resolved {
            let Some(chunks) = retrieved.get(&item.index).filter(|chunks| !chunks.is_empty())
            else {
                continue;
            };
            context.push_str(&item.binding.instruction);
            context.push_str("\n\"\"\n");
            for chunk in chunks {
                context.push('\t');
                context.push_str(&chunk.content);
                context.push('\n');
            }
            context.push_str("\"\"\n");
        }

        if context.is_empty() {
            return prompt.to_string();
        }
        context.push_str(prompt);
        context
    }

    /// Bindings whose providers exist, whose metadata resolves, and that the caller may read.
    async fn resolve_accessible(&self) -> Vec<ResolvedBinding<'_>> {
        let mut resolved = Vec::new();

        for (index, binding) in self.bindings.iter().enumerate() {
            let Some(vector) = self.providers.vector(&binding.vector_provider) else {
                warn!(
                    event_name = "agent.rag.vector_provider_missing",
                    collection = %binding.name,
                    provider = %binding.vector_provider,
                    "skipping collection with unknown vector provider"
                );
                continue;
            };
            if self.providers.embedding(&binding.embedding_provider).is_none() {
                warn!(
                    event_name = "agent.rag.embedding_provider_missing",
                    collection = %binding.name,
                    provider = %binding.embedding_provider,
                    "skipping collection with unknown embedding provider"
                );
                continue;
            }

            let info = match vector.collection_info(&binding.name).await {
                Ok(Some(info)) => info,
                Ok(None) => {
                    warn!(
                        event_name = "agent.rag.collection_missing",
                        collection = %binding.name,
                        "collection metadata not found"
                    );
                    continue;
                }
                Err(error) => {
                    warn!(
                        event_name = "agent.rag.collection_info_failed",
                        collection = %binding.name,
                        error = %error,
                        "collection metadata lookup failed"
                    );
                    continue;
                }
            };

            let required = self.policy.required_groups(&info.groups, &binding.groups);
            if !self.policy.evaluate(&self.identity, required).is_allowed() {
                debug!(
                    event_name = "agent.rag.access_denied",
                    collection = %binding.name,
                    user_id = %self.identity.user_id
                );
                continue;
            }

            resolved.push(ResolvedBinding { index, binding, vector });
        }

        resolved
    }

    async fn embed_prompt(
        &self,
        prompt: &str,
        resolved: &[ResolvedBinding<'_>],
    ) -> HashMap<EmbeddingKey, Vec<f32>> {
        let mut keys = Vec::<(EmbeddingKey, Arc<dyn EmbeddingProvider>)>::new();
        for item in resolved {
            let key =
                (item.binding.embedding_provider.clone(), item.binding.embedding_model.clone());
            if keys.iter().any(|(existing, _)| *existing == key) {
                continue;
            }
            if let Some(provider) = self.providers.embedding(&key.0) {
                keys.push((key, provider));
            }
        }

        let embeddings = join_all(keys.into_iter().map(|(key, provider)| async move {
            let result = provider.embed(prompt, &key.1).await;
            (key, result)
        }))
        .await;

        let mut vectors = HashMap::new();
        for ((provider, model), result) in embeddings {
            match result {
                Ok(embedding) => {
                    if let Some(tokens) = embedding.usage.filter(|tokens| *tokens > 0) {
                        self.usage.record(TokenUsageRecord::new(
                            tokens,
                            UsageType::Embedding,
                            model.as_str(),
                            provider.as_str(),
                        ));
                    }
                    vectors.insert((provider, model), embedding.vector);
                }
                Err(error) => warn!(
                    event_name = "agent.rag.embedding_failed",
                    provider = %provider,
                    model = %model,
                    error = %error,
                    "prompt embedding failed; dependent collections skipped"
                ),
            }
        }
        vectors
    }

    /// One batched query per vector provider, run concurrently. Keyed by binding index.
    /// Each collection is queried at most once per provider.
    async fn query_providers(
        &self,
        resolved: &[ResolvedBinding<'_>],
        vectors: &HashMap<EmbeddingKey, Vec<f32>>,
    ) -> HashMap<usize, Vec<ScoredChunk>> {
        let mut batches = BTreeMap::<String, ProviderBatch>::new();
        for item in resolved {
            let key =
                (item.binding.embedding_provider.clone(), item.binding.embedding_model.clone());
            let Some(vector) = vectors.get(&key) else {
                continue;
            };
            let entry = batches
                .entry(item.binding.vector_provider.clone())
                .or_insert_with(|| (item.vector.clone(), Vec::new(), Vec::new()));
            // Results come back keyed by collection name, so a repeated collection would
            // share the first query's results. The first binding wins.
            if entry.2.iter().any(|query| query.collection == item.binding.name) {
                warn!(
                    event_name = "agent.rag.duplicate_collection",
                    collection = %item.binding.name,
                    provider = %item.binding.vector_provider,
                    "collection bound twice on one provider; later binding skipped"
                );
                continue;
            }
            entry.1.push(item.index);
            entry.2.push(VectorQuery {
                collection: item.binding.name.clone(),
                amount: item.binding.amount,
                max_distance: item.binding.max_distance,
                vector: vector.clone(),
            });
        }

        let responses = join_all(batches.into_iter().map(
            |(provider_name, (provider, indices, queries))| async move {
                let collections =
                    queries.iter().map(|query| query.collection.clone()).collect::<Vec<_>>();
                let result = provider.query(queries).await;
                (provider_name, indices, collections, result)
            },
        ))
        .await;

        let mut retrieved = HashMap::new();
        for (provider_name, indices, collections, result) in responses {
            let by_collection = match result {
                Ok(results) => results,
                Err(error) => {
                    warn!(
                        event_name = "agent.rag.query_failed",
                        provider = %provider_name,
                        error = %error,
                        "vector query failed; treating as empty results"
                    );
                    continue;
                }
            };
            for (index, collection) in indices.into_iter().zip(collections) {
                let chunks = by_collection.get(&collection).cloned().unwrap_or_default();
                retrieved.insert(index, chunks);
            }
        }
        retrieved
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use colloquy_core::domain::agent::CollectionBinding;
    use colloquy_core::domain::identity::Identity;
    use colloquy_core::domain::usage::UsageType;
    use colloquy_db::{InMemoryTokenUsageRepository, TokenUsageRepository};

    use super::ContextEnrichment;
    use crate::providers::ProviderRegistry;
    use crate::testing::{StaticEmbedding, StaticVectorStore};
    use crate::usage::UsageRecorder;

    const PROMPT: &str = "How do I pass the butter?";

    fn binding(name: &str, instruction: &str, groups: &[&str]) -> CollectionBinding {
        CollectionBinding {
            name: name.to_string(),
            vector_provider: "qdrant".to_string(),
            embedding_provider: "openai".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            amount: 3,
            max_distance: 0.5,
            instruction: instruction.to_string(),
            groups: groups.iter().map(|group| group.to_string()).collect(),
        }
    }

    fn registry(embedding: StaticEmbedding, store: Arc<StaticVectorStore>) -> ProviderRegistry {
        let mut providers = ProviderRegistry::default();
        providers.register_embedding(Arc::new(embedding));
        providers.register_vector(store);
        providers
    }

    #[tokio::test]
    async fn retrieved_chunks_are_wrapped_and_prepended() {
        let store = Arc::new(
            StaticVectorStore::new("qdrant").with_collection("kitchen", &[], &["the butter passes"]),
        );
        let enrichment = ContextEnrichment::new(
            vec![binding("kitchen", "Use this:", &[])],
            registry(StaticEmbedding::new("openai"), store),
            Identity::new("u-1"),
            UsageRecorder::disabled(),
        );

        let enriched = enrichment.enrich(PROMPT).await;

        assert_eq!(enriched, format!("Use this:\n\"\"\n\tthe butter passes\n\"\"\n{PROMPT}"));
    }

    #[tokio::test]
    async fn unreadable_collection_is_skipped_silently() {
        let store = Arc::new(
            StaticVectorStore::new("qdrant")
                .with_collection("secrets", &["admin"], &["launch codes"])
                .with_collection("faq", &[], &["opening hours are 9-5"]),
        );
        let enrichment = ContextEnrichment::new(
            vec![binding("secrets", "Admin notes:", &[]), binding("faq", "FAQ:", &[])],
            registry(StaticEmbedding::new("openai"), store),
            Identity::new("u-2").with_group("user"),
            UsageRecorder::disabled(),
        );

        let enriched = enrichment.enrich(PROMPT).await;

        assert!(!enriched.contains("launch codes"));
        assert!(!enriched.contains("Admin notes:"));
        assert!(enriched.starts_with("FAQ:\n"));
    }

    #[tokio::test]
    async fn binding_groups_apply_when_metadata_declares_none() {
        let store = Arc::new(
            StaticVectorStore::new("qdrant").with_collection("hr", &[], &["salary bands"]),
        );
        let enrichment = ContextEnrichment::new(
            vec![binding("hr", "HR:", &["hr"])],
            registry(StaticEmbedding::new("openai"), store),
            Identity::new("u-3").with_group("user"),
            UsageRecorder::disabled(),
        );

        assert_eq!(enrichment.enrich(PROMPT).await, PROMPT);
    }

    #[tokio::test]
    async fn failing_providers_return_plain_prompt() {
        let store = Arc::new(
            StaticVectorStore::new("qdrant")
                .with_collection("kitchen", &[], &["the butter passes"])
                .failing(),
        );
        let enrichment = ContextEnrichment::new(
            vec![binding("kitchen", "Use this:", &[])],
            registry(StaticEmbedding::new("openai"), store),
            Identity::new("u-4"),
            UsageRecorder::disabled(),
        );
        assert_eq!(enrichment.enrich(PROMPT).await, PROMPT);

        let store = Arc::new(
            StaticVectorStore::new("qdrant").with_collection("kitchen", &[], &["the butter passes"]),
        );
        let enrichment = ContextEnrichment::new(
            vec![binding("kitchen", "Use this:", &[])],
            registry(StaticEmbedding::new("openai").failing(), store),
            Identity::new("u-4"),
            UsageRecorder::disabled(),
        );
        assert_eq!(enrichment.enrich(PROMPT).await, PROMPT);
    }

    #[tokio::test]
    async fn one_query_per_provider_and_one_embedding_per_model() {
        let store = Arc::new(
            StaticVectorStore::new("qdrant")
                .with_collection("a", &[], &["alpha"])
                .with_collection("b", &[], &["beta"]),
        );
        let embedding = StaticEmbedding::new("openai");
        let embed_calls = embedding.calls();
        let repository = Arc::new(InMemoryTokenUsageRepository::default());
        let (usage, _worker) = UsageRecorder::spawn(repository.clone());

        let enrichment = ContextEnrichment::new(
            vec![binding("a", "A:", &[]), binding("b", "B:", &[])],
            registry(embedding, store.clone()),
            Identity::new("u-5"),
            usage.clone(),
        );

        let enriched = enrichment.enrich(PROMPT).await;
        usage.flush().await;

        assert_eq!(enriched, format!("A:\n\"\"\n\talpha\n\"\"\nB:\n\"\"\n\tbeta\n\"\"\n{PROMPT}"));
        assert_eq!(store.query_count(), 1);
        assert_eq!(embed_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        let usage_types = repository
            .list()
            .await
            .expect("list usage")
            .into_iter()
            .map(|record| record.usage_type)
            .collect::<Vec<_>>();
        assert_eq!(usage_types, vec![UsageType::Embedding]);
    }

    #[tokio::test]
    async fn failing_provider_does_not_hide_other_providers() {
        let healthy = Arc::new(
            StaticVectorStore::new("qdrant")
                .with_collection("a", &[], &["alpha"])
                .with_collection("c", &[], &["gamma"]),
        );
        let broken = Arc::new(
            StaticVectorStore::new("pinecone").with_collection("b", &[], &["beta"]).failing(),
        );
        let mut providers = registry(StaticEmbedding::new("openai"), healthy.clone());
        providers.register_vector(broken.clone());
        let mut on_broken = binding("b", "B:", &[]);
        on_broken.vector_provider = "pinecone".to_string();

        let enrichment = ContextEnrichment::new(
            vec![binding("a", "A:", &[]), on_broken, binding("c", "C:", &[])],
            providers,
            Identity::new("u-7"),
            UsageRecorder::disabled(),
        );

        let enriched = enrichment.enrich("q").await;

        assert_eq!(enriched, "A:\n\"\"\n\talpha\n\"\"\nC:\n\"\"\n\tgamma\n\"\"\nq");
        assert_eq!(healthy.query_count(), 1);
        assert_eq!(broken.query_count(), 1);
    }

    #[tokio::test]
    async fn collection_bound_twice_is_queried_once() {
        let store = Arc::new(
            StaticVectorStore::new("qdrant").with_collection("kitchen", &[], &["one", "two"]),
        );
        let mut wide = binding("kitchen", "Everything:", &[]);
        wide.amount = 2;
        let mut narrow = binding("kitchen", "Top hit:", &[]);
        narrow.amount = 1;

        let enrichment = ContextEnrichment::new(
            vec![wide, narrow],
            registry(StaticEmbedding::new("openai"), store.clone()),
            Identity::new("u-8"),
            UsageRecorder::disabled(),
        );

        let enriched = enrichment.enrich("q").await;

        assert_eq!(enriched, "Everything:\n\"\"\n\tone\n\ttwo\n\"\"\nq");
        assert_eq!(store.query_count(), 1);
    }

    #[tokio::test]
    async fn no_bindings_leaves_prompt_untouched() {
        let enrichment = ContextEnrichment::new(
            Vec::new(),
            ProviderRegistry::default(),
            Identity::new("u-6"),
            UsageRecorder::disabled(),
        );
        assert!(enrichment.is_empty());
        assert_eq!(enrichment.enrich(PROMPT).await, PROMPT);
    }
}
