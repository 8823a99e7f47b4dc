//! Top-level entry point that wires storage, retrieval and answering.
//!
//! A [`KnowledgeService`] is built explicitly from a store and an optional
//! embedding provider; there is no process-wide instance. Callers that
//! hold a service get the whole pipeline:
//!
//! ```text
//! KnowledgeService
//!   ├── KnowledgeRepository  (CRUD, tenant checks)
//!   ├── KnowledgeRetriever   (text / semantic / hybrid, embeddings)
//!   └── KnowledgeAnswerer    (answer text + citations)
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use grounded_core::error::{KnowledgeError, Result};
use grounded_core::models::{
    AnswerVerification, BaseUpdate, GroundedAnswer, KnowledgeBase, KnowledgeItem, KnowledgeSource,
    ItemUpdate, Metadata, NewBase, NewItem, NewSource, RetrievalResults, SearchType, SourceType, SourceUpdate,
    StoreStats,
};
use grounded_core::store::{BaseFilter, ItemFilter, Page};
use grounded_core::{EmbeddingProvider, InMemoryStore, KnowledgeStore};

use crate::answerer::{AnswerOptions, KnowledgeAnswerer};
use crate::config::Config;
use crate::embedding::create_provider;
use crate::repository::KnowledgeRepository;
use crate::retriever::{KnowledgeRetriever, SearchOptions};

pub struct KnowledgeService {
    repository: Arc<KnowledgeRepository>,
    retriever: Arc<KnowledgeRetriever>,
    answerer: KnowledgeAnswerer,
    default_search_type: SearchType,
}

impl KnowledgeService {
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        provider: Option<Arc<dyn EmbeddingProvider>>,
        config: &Config,
    ) -> Self {
        let backend = store.name().to_string();
        let repository = Arc::new(KnowledgeRepository::new(store));
        let retriever = Arc::new(
            KnowledgeRetriever::new(repository.clone(), provider).with_timeouts(
                Duration::from_secs(config.embedding.timeout_secs),
                Duration::from_secs(config.retrieval.search_timeout_secs),
            ),
        );
        let answerer =
            KnowledgeAnswerer::new(repository.clone(), retriever.clone(), config.answer.clone());

        info!(
            backend = %backend,
            embeddings = retriever.has_embeddings(),
            "knowledge service ready"
        );
        Self {
            repository,
            retriever,
            answerer,
            default_search_type: config.retrieval.search_type(),
        }
    }

    /// Build the store and provider named by `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        crate::config::validate(config)?;
        let store: Arc<dyn KnowledgeStore> = match config.storage.backend.as_str() {
            "memory" => Arc::new(InMemoryStore::new()),
            other => anyhow::bail!("Unknown storage backend: '{}'", other),
        };
        let provider = create_provider(&config.embedding)?;
        Ok(Self::new(store, provider, config))
    }

    pub fn repository(&self) -> &Arc<KnowledgeRepository> {
        &self.repository
    }

    pub fn retriever(&self) -> &Arc<KnowledgeRetriever> {
        &self.retriever
    }

    pub fn answerer(&self) -> &KnowledgeAnswerer {
        &self.answerer
    }

    pub fn default_search_type(&self) -> SearchType {
        self.default_search_type
    }

    // ============ Bases ============

    pub async fn create_knowledge_base(&self, new: NewBase) -> Result<KnowledgeBase> {
        self.repository.create_base(new).await
    }

    pub async fn get_knowledge_base(&self, base_id: &str) -> Result<KnowledgeBase> {
        self.repository.get_base(base_id).await
    }

    pub async fn list_knowledge_bases(&self, filter: &BaseFilter, page: Page) -> Result<Vec<KnowledgeBase>> {
        self.repository.list_bases(filter, page).await
    }

    pub async fn update_knowledge_base(&self, base_id: &str, update: BaseUpdate) -> Result<KnowledgeBase> {
        self.repository.update_base(base_id, update).await
    }

    pub async fn delete_knowledge_base(&self, base_id: &str) -> Result<()> {
        self.repository.delete_base(base_id).await
    }

    // ============ Sources ============

    pub async fn create_source(&self, new: NewSource) -> Result<KnowledgeSource> {
        self.repository.create_source(new).await
    }

    pub async fn get_source(&self, source_id: &str, base_id: &str) -> Result<KnowledgeSource> {
        self.repository.get_source(source_id, base_id).await
    }

    pub async fn list_sources(
        &self,
        base_id: &str,
        source_type: Option<SourceType>,
        page: Page,
    ) -> Result<Vec<KnowledgeSource>> {
        self.repository.list_sources(base_id, source_type, page).await
    }

    pub async fn update_source(
        &self,
        source_id: &str,
        base_id: &str,
        update: SourceUpdate,
    ) -> Result<KnowledgeSource> {
        self.repository.update_source(source_id, base_id, update).await
    }

    pub async fn delete_source(&self, source_id: &str, base_id: &str) -> Result<()> {
        self.repository.delete_source(source_id, base_id).await
    }

    pub async fn count_sources(&self, base_id: &str) -> Result<usize> {
        self.repository.count_sources(base_id).await
    }

    // ============ Items ============

    /// Store one piece of content, embedding it when asked and a provider
    /// is configured.
    pub async fn add_knowledge(
        &self,
        base_id: &str,
        source_id: &str,
        content: &str,
        title: Option<String>,
        metadata: Metadata,
        generate_embedding: bool,
    ) -> Result<KnowledgeItem> {
        let item = self
            .repository
            .create_item(NewItem {
                base_id: base_id.to_string(),
                source_id: source_id.to_string(),
                content: content.to_string(),
                title,
                metadata,
                ..NewItem::default()
            })
            .await?;

        if generate_embedding && self.retriever.has_embeddings() {
            return self.retriever.embed_item(base_id, &item.id).await;
        }
        Ok(item)
    }

    /// Store several items under one source. Items whose `chunk_index` is 0
    /// get their position in `items`; base and source ids are overridden.
    pub async fn add_knowledge_batch(
        &self,
        base_id: &str,
        source_id: &str,
        items: Vec<NewItem>,
        generate_embeddings: bool,
    ) -> Result<Vec<KnowledgeItem>> {
        let news: Vec<NewItem> = items
            .into_iter()
            .enumerate()
            .map(|(i, mut new)| {
                new.base_id = base_id.to_string();
                new.source_id = source_id.to_string();
                if new.chunk_index == 0 {
                    new.chunk_index = i;
                }
                new
            })
            .collect();

        let created = self.repository.create_items(news).await?;
        if !generate_embeddings || !self.retriever.has_embeddings() || created.is_empty() {
            return Ok(created);
        }

        let ids: Vec<String> = created.iter().map(|item| item.id.clone()).collect();
        self.retriever.embed_items(base_id, &ids).await
    }

    pub async fn get_item(&self, item_id: &str, base_id: &str) -> Result<KnowledgeItem> {
        self.repository.get_item(item_id, base_id).await
    }

    pub async fn list_items(&self, base_id: &str, filter: &ItemFilter, page: Page) -> Result<Vec<KnowledgeItem>> {
        self.repository.list_items(base_id, filter, page).await
    }

    /// Partial item update. Content edits do not re-embed; call
    /// [`KnowledgeRetriever::embed_item`] afterwards if the vector should follow.
    pub async fn update_item(
        &self,
        item_id: &str,
        base_id: &str,
        update: ItemUpdate,
    ) -> Result<KnowledgeItem> {
        self.repository.update_item(item_id, base_id, update).await
    }

    pub async fn delete_item(&self, item_id: &str, base_id: &str) -> Result<()> {
        self.repository.delete_item(item_id, base_id).await
    }

    pub async fn count_items(&self, base_id: &str, source_id: Option<&str>) -> Result<usize> {
        self.repository.count_items(base_id, source_id).await
    }

    // ============ Search / answers ============

    pub async fn search(
        &self,
        base_id: &str,
        query: &str,
        search_type: SearchType,
        opts: &SearchOptions,
    ) -> Result<RetrievalResults> {
        self.retriever
            .search_with_type(base_id, query, search_type, opts)
            .await
    }

    pub async fn get_similar_items(
        &self,
        base_id: &str,
        item_id: &str,
        limit: usize,
        exclude_same_source: bool,
    ) -> Result<RetrievalResults> {
        self.retriever
            .get_similar_items(base_id, item_id, limit, exclude_same_source)
            .await
    }

    pub async fn get_answer(&self, base_id: &str, question: &str, opts: &AnswerOptions) -> Result<GroundedAnswer> {
        self.answerer.get_answer(base_id, question, opts).await
    }

    pub async fn get_answer_with_context(
        &self,
        base_id: &str,
        question: &str,
        context: &str,
        opts: &AnswerOptions,
    ) -> Result<GroundedAnswer> {
        self.answerer
            .get_answer_with_context(base_id, question, context, opts)
            .await
    }

    pub fn verify_answer(&self, answer: &GroundedAnswer) -> AnswerVerification {
        self.answerer.verify_answer(answer)
    }

    /// Storage counters, for one base or the whole store.
    pub async fn stats(&self, base_id: Option<&str>) -> Result<StoreStats> {
        self.repository.stats(base_id).await
    }
}

impl std::fmt::Debug for KnowledgeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeService")
            .field("backend", &self.repository.store().name())
            .field("embeddings", &self.retriever.has_embeddings())
            .field("default_search_type", &self.default_search_type)
            .finish()
    }
}

/// `true` for the errors a caller can fix by changing its input.
pub fn is_client_error(err: &KnowledgeError) -> bool {
    err.is_not_found()
        || matches!(
            err,
            KnowledgeError::DuplicateBase { .. }
                | KnowledgeError::DuplicateSource { .. }
                | KnowledgeError::DuplicateItem { .. }
                | KnowledgeError::InvalidQuery(_)
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbeddingProvider;
    use grounded_core::models::ItemStatus;

    async fn service(provider: Option<Arc<dyn EmbeddingProvider>>) -> KnowledgeService {
        let svc = KnowledgeService::new(Arc::new(InMemoryStore::new()), provider, &Config::default());
        svc.create_knowledge_base(NewBase {
            id: Some("kb".to_string()),
            name: "Support".to_string(),
            owner_type: "project".to_string(),
            owner_id: "p1".to_string(),
            ..NewBase::default()
        })
        .await
        .unwrap();
        svc.create_source(NewSource {
            id: Some("faq".to_string()),
            base_id: "kb".to_string(),
            name: "FAQ".to_string(),
            ..NewSource::default()
        })
        .await
        .unwrap();
        svc
    }

    fn new_item(content: &str) -> NewItem {
        NewItem {
            content: content.to_string(),
            ..NewItem::default()
        }
    }

    #[tokio::test]
    async fn from_default_config_is_lexical_only() {
        let svc = KnowledgeService::from_config(&Config::default()).unwrap();
        assert!(!svc.retriever().has_embeddings());
        assert_eq!(svc.default_search_type(), SearchType::Hybrid);
        assert_eq!(svc.stats(None).await.unwrap().backend, "in_memory");
    }

    #[tokio::test]
    async fn add_knowledge_embeds_when_possible() {
        let svc = service(Some(Arc::new(HashEmbeddingProvider::new(8)))).await;
        let item = svc
            .add_knowledge("kb", "faq", "Resetting a password takes a minute.", None, Metadata::new(), true)
            .await
            .unwrap();
        assert_eq!(item.status, ItemStatus::Indexed);
        assert_eq!(item.embedding.as_ref().map(Vec::len), Some(8));

        let plain = svc
            .add_knowledge("kb", "faq", "No vector here.", None, Metadata::new(), false)
            .await
            .unwrap();
        assert_eq!(plain.status, ItemStatus::Pending);
    }

    #[tokio::test]
    async fn add_knowledge_without_provider_stays_pending() {
        let svc = service(None).await;
        let item = svc
            .add_knowledge("kb", "faq", "Text only.", Some("T".to_string()), Metadata::new(), true)
            .await
            .unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert!(item.embedding.is_none());
    }

    #[tokio::test]
    async fn batch_assigns_positions_and_embeddings() {
        let svc = service(Some(Arc::new(HashEmbeddingProvider::new(8)))).await;
        let items = svc
            .add_knowledge_batch(
                "kb",
                "faq",
                vec![new_item("first"), new_item("second"), new_item("third")],
                true,
            )
            .await
            .unwrap();
        let positions: Vec<usize> = items.iter().map(|i| i.chunk_index).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert!(items.iter().all(|i| i.has_embedding()));
        assert_eq!(svc.count_items("kb", Some("faq")).await.unwrap(), 3);
        assert_eq!(svc.stats(Some("kb")).await.unwrap().embedded_item_count, 3);
    }

    #[tokio::test]
    async fn batch_into_missing_source_writes_nothing() {
        let svc = service(None).await;
        let err = svc
            .add_knowledge_batch("kb", "nope", vec![new_item("x")], false)
            .await
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::SourceNotFound { .. }));
        assert!(is_client_error(&err));
        assert_eq!(svc.count_items("kb", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn update_item_goes_through_the_facade() {
        let svc = service(None).await;
        let item = svc
            .add_knowledge("kb", "faq", "Office opens at eight.", None, Metadata::new(), false)
            .await
            .unwrap();
        let updated = svc
            .update_item(
                &item.id,
                "kb",
                ItemUpdate {
                    content: Some("Office opens at nine.".to_string()),
                    ..ItemUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.content, "Office opens at nine.");
        let hits = svc
            .search("kb", "nine", SearchType::Text, &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(hits.total_count, 1);

        let err = svc
            .update_item(&item.id, "other", ItemUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::ItemNotFound { .. }));
    }

    #[tokio::test]
    async fn search_and_answer_through_the_facade() {
        let svc = service(None).await;
        svc.add_knowledge("kb", "faq", "Refunds are issued within 14 days.", None, Metadata::new(), true)
            .await
            .unwrap();

        let results = svc
            .search("kb", "refunds", SearchType::Text, &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(results.total_count, 1);

        let answer = svc
            .get_answer("kb", "When are refunds issued?", &AnswerOptions::default())
            .await
            .unwrap();
        assert_eq!(answer.citations[0].source_name, "FAQ");
        assert!(svc.verify_answer(&answer).verified);
    }

    #[tokio::test]
    async fn deleting_the_base_removes_everything() {
        let svc = service(None).await;
        svc.add_knowledge("kb", "faq", "gone soon", None, Metadata::new(), false)
            .await
            .unwrap();
        svc.delete_knowledge_base("kb").await.unwrap();
        let err = svc
            .search("kb", "gone", SearchType::Hybrid, &SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::BaseNotFound { .. }));
        assert_eq!(svc.stats(None).await.unwrap().item_count, 0);
    }
}
