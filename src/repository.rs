//! Tenant-aware CRUD over a [`KnowledgeStore`].
//!
//! The repository is the only component that talks to storage. It turns
//! the store's `Ok(false)` / `Ok(None)` answers into typed errors
//! (`BaseNotFound`, `SourceNotFound`, `ItemNotFound`, `Duplicate*`) and
//! resolves every parent before a child is written. Parent resolution is
//! keyed by `(child_id, parent_id)`, which is what keeps one tenant's
//! sources and items out of another tenant's reach.
//!
//! Creates go through the store's insert-only writes and updates through
//! its replace-only writes, so an existing id is reported as `Duplicate*`
//! instead of overwritten, and an entity deleted mid-update stays deleted.
//!
//! Updates replace scalar fields and merge metadata.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use grounded_core::error::{KnowledgeError, Result};
use grounded_core::models::{
    new_id, validate_embedding, BaseUpdate, ItemStatus, ItemUpdate, KnowledgeBase, KnowledgeItem, KnowledgeQuery,
    KnowledgeSource, NewBase, NewItem, NewSource, RetrievalResults, SourceType, SourceUpdate,
    StoreStats,
};
use grounded_core::store::{BaseFilter, ItemFilter, KnowledgeStore, Page};

/// CRUD and search façade over a storage backend.
#[derive(Clone)]
pub struct KnowledgeRepository {
    store: Arc<dyn KnowledgeStore>,
}

fn tenant_violation(kind: &str, id: &str, found_in: &str, requested: &str) -> KnowledgeError {
    KnowledgeError::TenantIsolation {
        message: format!(
            "{kind} '{id}' belongs to base '{found_in}' but was requested through base '{requested}'"
        ),
        base_id: requested.to_string(),
        requested_resource: Some(format!("{kind}:{id}")),
    }
}

fn write_failed(operation: &str, what: String) -> KnowledgeError {
    KnowledgeError::Storage {
        operation: operation.to_string(),
        message: format!("store rejected {what}"),
    }
}

impl KnowledgeRepository {
    pub fn new(store: Arc<dyn KnowledgeStore>) -> Self {
        Self { store }
    }

    /// The underlying backend.
    pub fn store(&self) -> &Arc<dyn KnowledgeStore> {
        &self.store
    }

    // ============ Bases ============

    pub async fn create_base(&self, new: NewBase) -> Result<KnowledgeBase> {
        let id = new.id.unwrap_or_else(new_id);

        let now = Utc::now();
        let base = KnowledgeBase {
            id,
            name: new.name,
            description: new.description,
            owner_type: new.owner_type,
            owner_id: new.owner_id,
            status: Default::default(),
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        };

        if !self.store.insert_base(&base).await? {
            return Err(KnowledgeError::DuplicateBase { base_id: base.id });
        }
        debug!(base_id = %base.id, name = %base.name, "created knowledge base");
        Ok(base)
    }

    pub async fn get_base(&self, base_id: &str) -> Result<KnowledgeBase> {
        self.get_base_or_none(base_id)
            .await?
            .ok_or_else(|| KnowledgeError::BaseNotFound {
                base_id: base_id.to_string(),
            })
    }

    pub async fn get_base_or_none(&self, base_id: &str) -> Result<Option<KnowledgeBase>> {
        self.store.get_base(base_id).await
    }

    pub async fn update_base(&self, base_id: &str, update: BaseUpdate) -> Result<KnowledgeBase> {
        let mut base = self.get_base(base_id).await?;

        if let Some(name) = update.name {
            base.name = name;
        }
        if let Some(description) = update.description {
            base.description = description;
        }
        if let Some(status) = update.status {
            base.status = status;
        }
        if let Some(metadata) = update.metadata {
            base.metadata.extend(metadata);
        }
        base.updated_at = Utc::now();

        if !self.store.replace_base(&base).await? {
            return Err(KnowledgeError::BaseNotFound {
                base_id: base_id.to_string(),
            });
        }
        Ok(base)
    }

    /// Delete a base and everything beneath it.
    pub async fn delete_base(&self, base_id: &str) -> Result<()> {
        if !self.store.delete_base(base_id).await? {
            return Err(KnowledgeError::BaseNotFound {
                base_id: base_id.to_string(),
            });
        }
        debug!(base_id, "deleted knowledge base");
        Ok(())
    }

    pub async fn list_bases(&self, filter: &BaseFilter, page: Page) -> Result<Vec<KnowledgeBase>> {
        self.store.list_bases(filter, page).await
    }

    pub async fn count_bases(&self, filter: &BaseFilter) -> Result<usize> {
        self.store.count_bases(filter).await
    }

    async fn ensure_base(&self, base_id: &str) -> Result<()> {
        if self.store.base_exists(base_id).await? {
            Ok(())
        } else {
            Err(KnowledgeError::BaseNotFound {
                base_id: base_id.to_string(),
            })
        }
    }

    // ============ Sources ============

    pub async fn create_source(&self, new: NewSource) -> Result<KnowledgeSource> {
        self.ensure_base(&new.base_id).await?;

        let now = Utc::now();
        let source = KnowledgeSource {
            id: new.id.unwrap_or_else(new_id),
            base_id: new.base_id,
            name: new.name,
            description: new.description,
            source_type: new.source_type,
            source_uri: new.source_uri,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        };

        if !self.store.insert_source(&source).await? {
            self.ensure_base(&source.base_id).await?;
            return Err(KnowledgeError::DuplicateSource {
                source_id: source.id,
                base_id: source.base_id,
            });
        }
        debug!(source_id = %source.id, base_id = %source.base_id, "created knowledge source");
        Ok(source)
    }

    pub async fn get_source(&self, source_id: &str, base_id: &str) -> Result<KnowledgeSource> {
        self.get_source_or_none(source_id, base_id)
            .await?
            .ok_or_else(|| KnowledgeError::SourceNotFound {
                source_id: source_id.to_string(),
                base_id: base_id.to_string(),
            })
    }

    pub async fn get_source_or_none(
        &self,
        source_id: &str,
        base_id: &str,
    ) -> Result<Option<KnowledgeSource>> {
        match self.store.get_source(source_id, base_id).await? {
            Some(source) if source.base_id != base_id => Err(tenant_violation(
                "source",
                source_id,
                &source.base_id,
                base_id,
            )),
            other => Ok(other),
        }
    }

    pub async fn update_source(
        &self,
        source_id: &str,
        base_id: &str,
        update: SourceUpdate,
    ) -> Result<KnowledgeSource> {
        let mut source = self.get_source(source_id, base_id).await?;

        if let Some(name) = update.name {
            source.name = name;
        }
        if let Some(description) = update.description {
            source.description = description;
        }
        if let Some(source_type) = update.source_type {
            source.source_type = source_type;
        }
        if let Some(uri) = update.source_uri {
            source.source_uri = Some(uri);
        }
        if let Some(metadata) = update.metadata {
            source.metadata.extend(metadata);
        }
        source.updated_at = Utc::now();

        if !self.store.replace_source(&source).await? {
            return Err(KnowledgeError::SourceNotFound {
                source_id: source_id.to_string(),
                base_id: base_id.to_string(),
            });
        }
        Ok(source)
    }

    /// Delete a source and all its items.
    pub async fn delete_source(&self, source_id: &str, base_id: &str) -> Result<()> {
        if !self.store.delete_source(source_id, base_id).await? {
            return Err(KnowledgeError::SourceNotFound {
                source_id: source_id.to_string(),
                base_id: base_id.to_string(),
            });
        }
        debug!(source_id, base_id, "deleted knowledge source");
        Ok(())
    }

    pub async fn list_sources(
        &self,
        base_id: &str,
        source_type: Option<SourceType>,
        page: Page,
    ) -> Result<Vec<KnowledgeSource>> {
        self.ensure_base(base_id).await?;
        self.store.list_sources(base_id, source_type, page).await
    }

    pub async fn count_sources(&self, base_id: &str) -> Result<usize> {
        self.ensure_base(base_id).await?;
        self.store.count_sources(base_id).await
    }

    // ============ Items ============

    fn build_item(new: NewItem) -> KnowledgeItem {
        let now = Utc::now();
        let status = match &new.embedding {
            Some(v) if !v.is_empty() => ItemStatus::Indexed,
            _ => ItemStatus::Pending,
        };
        let end_char = if new.end_char == 0 && new.start_char == 0 {
            new.content.chars().count()
        } else {
            new.end_char
        };
        KnowledgeItem {
            id: new.id.unwrap_or_else(new_id),
            base_id: new.base_id,
            source_id: new.source_id,
            content: new.content,
            title: new.title,
            embedding: new.embedding,
            status,
            chunk_index: new.chunk_index,
            start_char: new.start_char,
            end_char,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check a batch: finite vectors, existing sources, and ids that are
    /// neither taken nor repeated. Reports the first problem found.
    async fn check_new_items(&self, items: &[KnowledgeItem]) -> Result<()> {
        let mut checked_sources: HashSet<(&str, &str)> = HashSet::new();
        let mut seen_ids: HashMap<&str, HashSet<&str>> = HashMap::new();

        for item in items {
            if let Some(embedding) = &item.embedding {
                validate_embedding(embedding)?;
            }
            if checked_sources.insert((item.base_id.as_str(), item.source_id.as_str())) {
                self.get_source(&item.source_id, &item.base_id).await?;
            }
            let fresh = seen_ids
                .entry(item.base_id.as_str())
                .or_default()
                .insert(item.id.as_str());
            if !fresh || self.store.item_exists(&item.id, &item.base_id).await? {
                return Err(KnowledgeError::DuplicateItem {
                    item_id: item.id.clone(),
                    base_id: item.base_id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Create one item. Its source must exist within its base.
    pub async fn create_item(&self, new: NewItem) -> Result<KnowledgeItem> {
        if let Some(embedding) = &new.embedding {
            validate_embedding(embedding)?;
        }
        self.get_source(&new.source_id, &new.base_id).await?;

        let item = Self::build_item(new);
        if !self.store.insert_item(&item).await? {
            self.get_source(&item.source_id, &item.base_id).await?;
            return Err(KnowledgeError::DuplicateItem {
                item_id: item.id,
                base_id: item.base_id,
            });
        }
        debug!(item_id = %item.id, base_id = %item.base_id, "created knowledge item");
        Ok(item)
    }

    /// Create many items, all or none. Parents, vectors, and explicit ids
    /// are checked before the write, so a bad entry leaves the store untouched.
    pub async fn create_items(&self, news: Vec<NewItem>) -> Result<Vec<KnowledgeItem>> {
        let items: Vec<KnowledgeItem> = news.into_iter().map(Self::build_item).collect();
        self.check_new_items(&items).await?;

        if !self.store.insert_items(&items).await? {
            // a concurrent writer got there first
            self.check_new_items(&items).await?;
            return Err(write_failed(
                "create_items",
                format!("a batch of {} items", items.len()),
            ));
        }
        debug!(count = items.len(), "created knowledge items");
        Ok(items)
    }

    pub async fn get_item(&self, item_id: &str, base_id: &str) -> Result<KnowledgeItem> {
        self.get_item_or_none(item_id, base_id)
            .await?
            .ok_or_else(|| KnowledgeError::ItemNotFound {
                item_id: item_id.to_string(),
                base_id: base_id.to_string(),
            })
    }

    pub async fn get_item_or_none(&self, item_id: &str, base_id: &str) -> Result<Option<KnowledgeItem>> {
        match self.store.get_item(item_id, base_id).await? {
            Some(item) if item.base_id != base_id => {
                Err(tenant_violation("item", item_id, &item.base_id, base_id))
            }
            other => Ok(other),
        }
    }

    /// Apply a partial update. Attaching an embedding marks the item
    /// `indexed` unless the update names a status explicitly.
    ///
    /// Content and title edits do not re-embed; the caller decides when to.
    pub async fn update_item(
        &self,
        item_id: &str,
        base_id: &str,
        update: ItemUpdate,
    ) -> Result<KnowledgeItem> {
        let mut item = self.get_item(item_id, base_id).await?;

        if let Some(content) = update.content {
            item.content = content;
        }
        if let Some(title) = update.title {
            item.title = Some(title);
        }
        if let Some(embedding) = update.embedding {
            validate_embedding(&embedding)?;
            item.embedding = Some(embedding);
            item.status = ItemStatus::Indexed;
        }
        if let Some(status) = update.status {
            item.status = status;
        }
        if let Some(metadata) = update.metadata {
            item.metadata.extend(metadata);
        }
        item.updated_at = Utc::now();

        if !self.store.replace_item(&item).await? {
            return Err(KnowledgeError::ItemNotFound {
                item_id: item_id.to_string(),
                base_id: base_id.to_string(),
            });
        }
        Ok(item)
    }

    pub async fn delete_item(&self, item_id: &str, base_id: &str) -> Result<()> {
        if !self.store.delete_item(item_id, base_id).await? {
            return Err(KnowledgeError::ItemNotFound {
                item_id: item_id.to_string(),
                base_id: base_id.to_string(),
            });
        }
        debug!(item_id, base_id, "deleted knowledge item");
        Ok(())
    }

    pub async fn list_items(
        &self,
        base_id: &str,
        filter: &ItemFilter,
        page: Page,
    ) -> Result<Vec<KnowledgeItem>> {
        self.ensure_base(base_id).await?;
        self.store.list_items(base_id, filter, page).await
    }

    pub async fn count_items(&self, base_id: &str, source_id: Option<&str>) -> Result<usize> {
        self.ensure_base(base_id).await?;
        self.store.count_items(base_id, source_id).await
    }

    // ============ Search ============

    pub async fn search(&self, query: &KnowledgeQuery) -> Result<RetrievalResults> {
        query.validate()?;
        self.ensure_base(&query.base_id).await?;
        self.store.search(query).await
    }

    pub async fn search_by_text(
        &self,
        base_id: &str,
        text: &str,
        limit: usize,
        source_ids: Option<Vec<String>>,
    ) -> Result<RetrievalResults> {
        let query = KnowledgeQuery::new(base_id)
            .with_text(text)
            .with_limit(limit)
            .with_source_ids(source_ids);
        self.search(&query).await
    }

    pub async fn search_by_embedding(
        &self,
        base_id: &str,
        embedding: Vec<f32>,
        limit: usize,
        min_score: f64,
        source_ids: Option<Vec<String>>,
    ) -> Result<RetrievalResults> {
        let query = KnowledgeQuery::new(base_id)
            .with_embedding(embedding)
            .with_limit(limit)
            .with_min_score(min_score)
            .with_source_ids(source_ids);
        self.search(&query).await
    }

    pub async fn stats(&self, base_id: Option<&str>) -> Result<StoreStats> {
        if let Some(base_id) = base_id {
            self.ensure_base(base_id).await?;
        }
        self.store.stats(base_id).await
    }
}
