//! Text, semantic, and hybrid retrieval on top of the repository.
//!
//! The retriever owns the optional [`EmbeddingProvider`]. Callers pass
//! plain query text; the retriever decides whether a query embedding is
//! needed, obtains it under a timeout, and hands a [`KnowledgeQuery`] to
//! the repository.
//!
//! Without a provider, semantic and hybrid search degrade to lexical
//! search instead of failing.
//!
//! # Error mapping
//!
//! | Cause | Surfaces as |
//! |-------|-------------|
//! | Provider failure or embed timeout | `KnowledgeError::Embedding` |
//! | Missing base/source/item | passed through unchanged |
//! | Invalid query, tenant violation | passed through unchanged |
//! | Anything else, including search timeout | `KnowledgeError::Retrieval` |

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use grounded_core::error::{KnowledgeError, Result};
use grounded_core::models::{
    ItemUpdate, KnowledgeItem, KnowledgeQuery, Metadata, RetrievalResult, RetrievalResults,
    SearchType,
};
use grounded_core::EmbeddingProvider;

use crate::repository::KnowledgeRepository;

/// Default bound on a single embedding call.
pub const DEFAULT_EMBED_TIMEOUT: Duration = Duration::from_secs(30);
/// Default bound on a whole hybrid search, embedding included.
pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-call search knobs shared by every search mode.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    pub limit: usize,
    pub offset: usize,
    pub source_ids: Option<Vec<String>>,
    pub filters: Metadata,
    pub min_score: f64,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: KnowledgeQuery::DEFAULT_LIMIT,
            offset: 0,
            source_ids: None,
            filters: Metadata::new(),
            min_score: 0.0,
        }
    }
}

impl SearchOptions {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    fn to_query(&self, base_id: &str) -> KnowledgeQuery {
        KnowledgeQuery::new(base_id)
            .with_limit(self.limit)
            .with_offset(self.offset)
            .with_source_ids(self.source_ids.clone())
            .with_filters(self.filters.clone())
            .with_min_score(self.min_score)
    }
}

/// Second-stage scorer applied to an already ranked list.
#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    /// Reorder `results` for `query_text`. Implementations may rescore but
    /// must not invent results.
    async fn rerank(
        &self,
        query_text: &str,
        results: Vec<RetrievalResult>,
    ) -> anyhow::Result<Vec<RetrievalResult>>;
}

/// Keeps the incoming order.
pub struct PassthroughReranker;

#[async_trait]
impl Reranker for PassthroughReranker {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn rerank(
        &self,
        _query_text: &str,
        results: Vec<RetrievalResult>,
    ) -> anyhow::Result<Vec<RetrievalResult>> {
        Ok(results)
    }
}

/// Search orchestration with an optional embedding provider.
pub struct KnowledgeRetriever {
    repository: Arc<KnowledgeRepository>,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    reranker: Arc<dyn Reranker>,
    embed_timeout: Duration,
    search_timeout: Duration,
}

impl KnowledgeRetriever {
    pub fn new(
        repository: Arc<KnowledgeRepository>,
        provider: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Self {
        match &provider {
            Some(p) => info!(provider = p.name(), model = p.model_name(), "retriever using embeddings"),
            None => warn!("no embedding provider configured; semantic and hybrid search fall back to text search"),
        }
        Self {
            repository,
            provider,
            reranker: Arc::new(PassthroughReranker),
            embed_timeout: DEFAULT_EMBED_TIMEOUT,
            search_timeout: DEFAULT_SEARCH_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, embed_timeout: Duration, search_timeout: Duration) -> Self {
        self.embed_timeout = embed_timeout;
        self.search_timeout = search_timeout;
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = reranker;
        self
    }

    pub fn repository(&self) -> &Arc<KnowledgeRepository> {
        &self.repository
    }

    pub fn provider(&self) -> Option<&Arc<dyn EmbeddingProvider>> {
        self.provider.as_ref()
    }

    pub fn has_embeddings(&self) -> bool {
        self.provider.is_some()
    }

    /// Embed one text under the embed timeout.
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let provider = self.require_provider()?;
        match tokio::time::timeout(self.embed_timeout, provider.embed(text)).await {
            Ok(Ok(vector)) => Ok(vector),
            Ok(Err(e)) => Err(embedding_error(provider.as_ref(), "embedding request failed", e)),
            Err(_) => Err(embedding_error(
                provider.as_ref(),
                "embedding request timed out",
                anyhow::anyhow!("no response within {:?}", self.embed_timeout),
            )),
        }
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let provider = self.require_provider()?;
        let vectors = match tokio::time::timeout(self.embed_timeout, provider.embed_batch(texts)).await {
            Ok(Ok(vectors)) => vectors,
            Ok(Err(e)) => {
                return Err(embedding_error(provider.as_ref(), "batch embedding failed", e))
            }
            Err(_) => {
                return Err(embedding_error(
                    provider.as_ref(),
                    "batch embedding timed out",
                    anyhow::anyhow!("no response within {:?}", self.embed_timeout),
                ))
            }
        };
        if vectors.len() != texts.len() {
            return Err(embedding_error(
                provider.as_ref(),
                "provider returned the wrong number of vectors",
                anyhow::anyhow!("expected {}, got {}", texts.len(), vectors.len()),
            ));
        }
        Ok(vectors)
    }

    fn require_provider(&self) -> Result<&Arc<dyn EmbeddingProvider>> {
        self.provider.as_ref().ok_or_else(|| KnowledgeError::Embedding {
            message: "no embedding provider configured".to_string(),
            provider: "none".to_string(),
            source: anyhow::anyhow!("embedding provider is disabled"),
        })
    }

    // ============ Search ============

    /// Lexical search: query text only.
    pub async fn search(&self, base_id: &str, query_text: &str, opts: &SearchOptions) -> Result<RetrievalResults> {
        let query = opts.to_query(base_id).with_text(query_text);
        self.repository
            .search(&query)
            .await
            .map_err(|e| retrieval_error(e, query_text))
    }

    /// Vector search: query embedding only.
    pub async fn semantic_search(
        &self,
        base_id: &str,
        query_text: &str,
        opts: &SearchOptions,
    ) -> Result<RetrievalResults> {
        if !self.has_embeddings() {
            warn!(base_id, "semantic search without embedding provider; using text search");
            return self.search(base_id, query_text, opts).await;
        }
        let started = Instant::now();
        let embedding = self.embed_text(query_text).await?;
        let query = opts.to_query(base_id).with_embedding(embedding);
        let mut results = self
            .repository
            .search(&query)
            .await
            .map_err(|e| retrieval_error(e, query_text))?;
        results.query_time_ms = elapsed_ms(started);
        Ok(results)
    }

    /// Text and embedding together; the default path.
    ///
    /// `query_time_ms` covers embedding generation. The whole call is
    /// bounded by the search timeout.
    pub async fn hybrid_search(
        &self,
        base_id: &str,
        query_text: &str,
        opts: &SearchOptions,
    ) -> Result<RetrievalResults> {
        match tokio::time::timeout(self.search_timeout, self.hybrid_inner(base_id, query_text, opts)).await {
            Ok(result) => result,
            Err(_) => Err(KnowledgeError::Retrieval {
                message: "hybrid search timed out".to_string(),
                query: Some(query_text.to_string()),
                source: anyhow::anyhow!("no result within {:?}", self.search_timeout),
            }),
        }
    }

    async fn hybrid_inner(
        &self,
        base_id: &str,
        query_text: &str,
        opts: &SearchOptions,
    ) -> Result<RetrievalResults> {
        if !self.has_embeddings() {
            warn!(base_id, "hybrid search without embedding provider; using text search");
            return self.search(base_id, query_text, opts).await;
        }
        let started = Instant::now();
        let embedding = self.embed_text(query_text).await?;
        let query = opts
            .to_query(base_id)
            .with_text(query_text)
            .with_embedding(embedding);
        let mut results = self
            .repository
            .search(&query)
            .await
            .map_err(|e| retrieval_error(e, query_text))?;
        results.query_time_ms = elapsed_ms(started);
        debug!(base_id, hits = results.total_count, "hybrid search");
        Ok(results)
    }

    /// Dispatch on [`SearchType`].
    pub async fn search_with_type(
        &self,
        base_id: &str,
        query_text: &str,
        search_type: SearchType,
        opts: &SearchOptions,
    ) -> Result<RetrievalResults> {
        match search_type {
            SearchType::Text => self.search(base_id, query_text, opts).await,
            SearchType::Semantic => self.semantic_search(base_id, query_text, opts).await,
            SearchType::Hybrid => self.hybrid_search(base_id, query_text, opts).await,
        }
    }

    // ============ Embedding ============

    /// Embed an item's title and content and persist the vector.
    ///
    /// Without a provider the item is returned unchanged.
    pub async fn embed_item(&self, base_id: &str, item_id: &str) -> Result<KnowledgeItem> {
        let item = self.repository.get_item(item_id, base_id).await?;
        if !self.has_embeddings() {
            return Ok(item);
        }
        let embedding = self.embed_text(&item.embedding_text()).await?;
        self.repository
            .update_item(
                item_id,
                base_id,
                ItemUpdate {
                    embedding: Some(embedding),
                    ..ItemUpdate::default()
                },
            )
            .await
    }

    /// Embed several items of one base with a single batch call.
    pub async fn embed_items(&self, base_id: &str, item_ids: &[String]) -> Result<Vec<KnowledgeItem>> {
        let mut items = Vec::with_capacity(item_ids.len());
        for item_id in item_ids {
            items.push(self.repository.get_item(item_id, base_id).await?);
        }
        if !self.has_embeddings() || items.is_empty() {
            return Ok(items);
        }

        let texts: Vec<String> = items.iter().map(KnowledgeItem::embedding_text).collect();
        let vectors = self.embed_texts(&texts).await?;

        let mut updated = Vec::with_capacity(items.len());
        for (item, vector) in items.iter().zip(vectors) {
            let stored = self
                .repository
                .update_item(
                    &item.id,
                    base_id,
                    ItemUpdate {
                        embedding: Some(vector),
                        ..ItemUpdate::default()
                    },
                )
                .await?;
            updated.push(stored);
        }
        debug!(base_id, count = updated.len(), "embedded items");
        Ok(updated)
    }

    // ============ Similar items / reranking ============

    /// Items closest to `item_id`, excluding the item itself and, if asked,
    /// everything from its source. Ranks restart at 1.
    ///
    /// Uses the stored vector, embeds on demand when a provider exists, and
    /// otherwise falls back to a text query built from the item's own text.
    pub async fn get_similar_items(
        &self,
        base_id: &str,
        item_id: &str,
        limit: usize,
        exclude_same_source: bool,
    ) -> Result<RetrievalResults> {
        let started = Instant::now();
        let mut item = self.repository.get_item(item_id, base_id).await?;
        if !item.has_embedding() && self.has_embeddings() {
            item = self.embed_item(base_id, item_id).await?;
        }

        let mut fetch = limit + 1;
        if exclude_same_source {
            fetch += self
                .repository
                .count_items(base_id, Some(&item.source_id))
                .await
                .map_err(|e| retrieval_error(e, item_id))?;
        }

        let query = match &item.embedding {
            Some(vector) if !vector.is_empty() => {
                KnowledgeQuery::new(base_id).with_embedding(vector.clone())
            }
            _ => {
                warn!(base_id, item_id, "similar items without embeddings; using text search");
                KnowledgeQuery::new(base_id).with_text(item.embedding_text())
            }
        }
        .with_limit(fetch);

        let mut results = self
            .repository
            .search(&query)
            .await
            .map_err(|e| retrieval_error(e, item_id))?;

        let filtered: Vec<RetrievalResult> = results
            .results
            .into_iter()
            .filter(|r| r.item.id != item.id)
            .filter(|r| !(exclude_same_source && r.item.source_id == item.source_id))
            .take(limit)
            .enumerate()
            .map(|(i, mut r)| {
                r.rank = i + 1;
                r
            })
            .collect();

        results.total_count = filtered.len();
        results.results = filtered;
        results.query_time_ms = elapsed_ms(started);
        Ok(results)
    }

    /// Run the configured reranker, then keep at most `top_k` results.
    pub async fn rerank_results(
        &self,
        results: Vec<RetrievalResult>,
        query_text: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<RetrievalResult>> {
        let mut reranked = self
            .reranker
            .rerank(query_text, results)
            .await
            .map_err(|e| KnowledgeError::Retrieval {
                message: format!("reranker '{}' failed", self.reranker.name()),
                query: Some(query_text.to_string()),
                source: e,
            })?;
        if let Some(k) = top_k {
            reranked.truncate(k);
        }
        Ok(reranked)
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

fn embedding_error(provider: &dyn EmbeddingProvider, message: &str, source: anyhow::Error) -> KnowledgeError {
    KnowledgeError::Embedding {
        message: message.to_string(),
        provider: provider.name().to_string(),
        source,
    }
}

/// Wrap unexpected failures as `Retrieval`, leaving typed caller-facing
/// errors untouched.
fn retrieval_error(err: KnowledgeError, query: &str) -> KnowledgeError {
    match err {
        KnowledgeError::BaseNotFound { .. }
        | KnowledgeError::SourceNotFound { .. }
        | KnowledgeError::ItemNotFound { .. }
        | KnowledgeError::TenantIsolation { .. }
        | KnowledgeError::InvalidQuery(_)
        | KnowledgeError::Embedding { .. }
        | KnowledgeError::Retrieval { .. } => err,
        other => KnowledgeError::Retrieval {
            message: other.to_string(),
            query: Some(query.to_string()),
            source: anyhow::Error::new(other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbeddingProvider;
    use grounded_core::models::{ItemStatus, NewBase, NewItem, NewSource};
    use grounded_core::InMemoryStore;

    async fn fixture() -> Arc<KnowledgeRepository> {
        let repo = Arc::new(KnowledgeRepository::new(Arc::new(InMemoryStore::new())));
        repo.create_base(NewBase {
            id: Some("kb".to_string()),
            name: "KB".to_string(),
            owner_type: "organization".to_string(),
            owner_id: "org".to_string(),
            ..NewBase::default()
        })
        .await
        .unwrap();
        for source in ["s1", "s2"] {
            repo.create_source(NewSource {
                id: Some(source.to_string()),
                base_id: "kb".to_string(),
                name: source.to_uppercase(),
                ..NewSource::default()
            })
            .await
            .unwrap();
        }
        let items = [
            ("a", "s1", "Employees receive 20 vacation days per year."),
            ("b", "s1", "Vacation requests need manager approval."),
            ("c", "s2", "Vacation days roll over once."),
            ("d", "s2", "The cafeteria opens at noon."),
        ];
        for (id, source, content) in items {
            repo.create_item(NewItem {
                id: Some(id.to_string()),
                base_id: "kb".to_string(),
                source_id: source.to_string(),
                content: content.to_string(),
                ..NewItem::default()
            })
            .await
            .unwrap();
        }
        repo
    }

    struct FailingProvider;

    #[async_trait]
    impl EmbeddingProvider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }
        fn model_name(&self) -> &str {
            "none"
        }
        fn dims(&self) -> usize {
            4
        }
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            anyhow::bail!("upstream unavailable")
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl EmbeddingProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }
        fn model_name(&self) -> &str {
            "sleepy"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![1.0, 0.0])
        }
    }

    /// Reverses the incoming order.
    struct ReverseReranker;

    #[async_trait]
    impl Reranker for ReverseReranker {
        fn name(&self) -> &str {
            "reverse"
        }
        async fn rerank(
            &self,
            _query_text: &str,
            mut results: Vec<RetrievalResult>,
        ) -> anyhow::Result<Vec<RetrievalResult>> {
            results.reverse();
            Ok(results)
        }
    }

    #[tokio::test]
    async fn hybrid_without_provider_degrades_to_text() {
        let retriever = KnowledgeRetriever::new(fixture().await, None);
        let results = retriever
            .hybrid_search("kb", "How many vacation days?", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(results.results[0].item.id, "a");
        assert!(results.results[0].text_score.unwrap() > 0.0);
        assert!(results.results[0].vector_score.is_none());

        let semantic = retriever
            .semantic_search("kb", "vacation", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(semantic.total_count, 3);
    }

    #[tokio::test]
    async fn provider_failures_are_embedding_errors() {
        let retriever = KnowledgeRetriever::new(fixture().await, Some(Arc::new(FailingProvider)));
        let err = retriever
            .hybrid_search("kb", "vacation", &SearchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "EMBEDDING_ERROR");
        assert_eq!(err.details()["provider"], "failing");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_providers_time_out() {
        let retriever = KnowledgeRetriever::new(fixture().await, Some(Arc::new(SlowProvider)))
            .with_timeouts(Duration::from_millis(100), Duration::from_secs(10));
        let err = retriever
            .semantic_search("kb", "vacation", &SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::Embedding { .. }));

        let retriever = KnowledgeRetriever::new(fixture().await, Some(Arc::new(SlowProvider)))
            .with_timeouts(Duration::from_secs(10), Duration::from_millis(100));
        let err = retriever
            .hybrid_search("kb", "vacation", &SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::Retrieval { .. }));
    }

    #[tokio::test]
    async fn missing_base_is_not_masked() {
        let retriever = KnowledgeRetriever::new(fixture().await, None);
        let err = retriever
            .search("nope", "vacation", &SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::BaseNotFound { .. }));
    }

    #[tokio::test]
    async fn embed_items_persists_vectors() {
        let repo = fixture().await;
        let retriever = KnowledgeRetriever::new(repo.clone(), Some(Arc::new(HashEmbeddingProvider::new(32))));
        let ids = vec!["a".to_string(), "b".to_string()];
        let embedded = retriever.embed_items("kb", &ids).await.unwrap();
        assert!(embedded.iter().all(|i| i.status == ItemStatus::Indexed));

        let stored = repo.get_item("a", "kb").await.unwrap();
        assert_eq!(stored.embedding.as_ref().map(Vec::len), Some(32));
        assert_eq!(stored.embedding, embedded[0].embedding);
    }

    #[tokio::test]
    async fn embed_item_without_provider_is_a_no_op() {
        let retriever = KnowledgeRetriever::new(fixture().await, None);
        let item = retriever.embed_item("kb", "a").await.unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert!(item.embedding.is_none());
    }

    #[tokio::test]
    async fn similar_items_exclude_self_and_renumber() {
        let retriever = KnowledgeRetriever::new(fixture().await, None);
        let similar = retriever
            .get_similar_items("kb", "a", 5, false)
            .await
            .unwrap();
        let ids: Vec<&str> = similar.results.iter().map(|r| r.item.id.as_str()).collect();
        assert!(!ids.contains(&"a"));
        assert_eq!(ids[0], "c");
        let ranks: Vec<usize> = similar.results.iter().map(|r| r.rank).collect();
        assert_eq!(ranks, (1..=ids.len()).collect::<Vec<_>>());
        assert_eq!(similar.total_count, ids.len());

        let other_sources = retriever
            .get_similar_items("kb", "a", 5, true)
            .await
            .unwrap();
        assert!(other_sources.results.iter().all(|r| r.item.source_id == "s2"));
    }

    #[tokio::test]
    async fn similar_items_use_hash_vectors_when_available() {
        let repo = fixture().await;
        let retriever = KnowledgeRetriever::new(repo.clone(), Some(Arc::new(HashEmbeddingProvider::new(16))));
        let ids: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        retriever.embed_items("kb", &ids).await.unwrap();

        let mut duplicate = NewItem {
            id: Some("a-copy".to_string()),
            base_id: "kb".to_string(),
            source_id: "s2".to_string(),
            content: "Employees receive 20 vacation days per year.".to_string(),
            ..NewItem::default()
        };
        duplicate.embedding = repo.get_item("a", "kb").await.unwrap().embedding;
        repo.create_item(duplicate).await.unwrap();

        let similar = retriever.get_similar_items("kb", "a", 1, false).await.unwrap();
        assert_eq!(similar.results.len(), 1);
        assert_eq!(similar.results[0].item.id, "a-copy");
        assert_eq!(similar.results[0].rank, 1);
    }

    #[tokio::test]
    async fn rerank_runs_the_reranker_then_truncates() {
        let retriever = KnowledgeRetriever::new(fixture().await, None)
            .with_reranker(Arc::new(ReverseReranker));
        let results = retriever
            .search("kb", "vacation", &SearchOptions::default())
            .await
            .unwrap();
        let last = results.results.last().unwrap().item.id.clone();
        let reranked = retriever
            .rerank_results(results.results, "vacation", Some(2))
            .await
            .unwrap();
        assert_eq!(reranked.len(), 2);
        assert_eq!(reranked[0].item.id, last);

        let passthrough = KnowledgeRetriever::new(fixture().await, None);
        let results = passthrough
            .search("kb", "vacation", &SearchOptions::default())
            .await
            .unwrap();
        let first = results.results[0].item.id.clone();
        let kept = passthrough
            .rerank_results(results.results, "vacation", None)
            .await
            .unwrap();
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].item.id, first);
    }
}
