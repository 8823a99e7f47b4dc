//! Storage abstraction for knowledge bases.
//!
//! The [`KnowledgeStore`] trait defines every persistence and index
//! operation the repository needs, so that a durable, vector-capable
//! backend can replace the in-memory one without touching the
//! repository, retriever, or answerer.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Error convention
//!
//! Expected conditions (missing parent, missing entity) are reported as
//! `Ok(false)` / `Ok(None)`. `Err(KnowledgeError::Storage)` is reserved for
//! real faults. Turning absence into typed not-found errors is the
//! repository's job.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    BaseStatus, ItemStatus, KnowledgeBase, KnowledgeItem, KnowledgeQuery, KnowledgeSource,
    RetrievalResults, SourceType, StoreStats,
};

/// Limit/offset window for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Page {
    pub const DEFAULT_LIMIT: usize = 100;

    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LIMIT, 0)
    }
}

/// Optional constraints for base listings. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaseFilter {
    pub owner_type: Option<String>,
    pub owner_id: Option<String>,
    pub status: Option<BaseStatus>,
}

impl BaseFilter {
    pub fn owner(owner_type: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            owner_type: Some(owner_type.into()),
            owner_id: Some(owner_id.into()),
            status: None,
        }
    }

    pub fn matches(&self, base: &KnowledgeBase) -> bool {
        self.owner_type.as_ref().map_or(true, |t| t == &base.owner_type)
            && self.owner_id.as_ref().map_or(true, |o| o == &base.owner_id)
            && self.status.map_or(true, |s| s == base.status)
    }
}

/// Optional constraints for item listings within a base.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemFilter {
    pub source_id: Option<String>,
    pub status: Option<ItemStatus>,
}

impl ItemFilter {
    pub fn source(source_id: impl Into<String>) -> Self {
        Self {
            source_id: Some(source_id.into()),
            status: None,
        }
    }

    pub fn matches(&self, item: &KnowledgeItem) -> bool {
        self.source_id.as_ref().map_or(true, |s| s == &item.source_id)
            && self.status.map_or(true, |s| s == item.status)
    }
}

/// Abstract storage backend for knowledge bases, sources, and items.
///
/// Every source and item operation is keyed by an `(id, base_id)` pair;
/// an id that exists only under another base is simply absent.
///
/// The `store_*` methods upsert. The repository writes through the
/// `insert_*` and `replace_*` methods instead, which check existence and
/// write under one lock, so a concurrent create cannot overwrite an entity
/// and a concurrent delete cannot be undone by an update.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`store_base`](KnowledgeStore::store_base) | Insert or replace a base |
/// | [`insert_base`](KnowledgeStore::insert_base) / [`replace_base`](KnowledgeStore::replace_base) | Create-only / update-only base writes |
/// | [`delete_base`](KnowledgeStore::delete_base) | Delete a base and everything beneath it |
/// | [`store_source`](KnowledgeStore::store_source) | Insert or replace a source under an existing base |
/// | [`insert_source`](KnowledgeStore::insert_source) / [`replace_source`](KnowledgeStore::replace_source) | Create-only / update-only source writes |
/// | [`delete_source`](KnowledgeStore::delete_source) | Delete a source and its items |
/// | [`store_item`](KnowledgeStore::store_item) | Insert or replace an item and re-index it |
/// | [`insert_item`](KnowledgeStore::insert_item) / [`insert_items`](KnowledgeStore::insert_items) / [`replace_item`](KnowledgeStore::replace_item) | Create-only / update-only item writes |
/// | [`delete_item`](KnowledgeStore::delete_item) | Delete an item and its postings |
/// | [`search`](KnowledgeStore::search) | Candidate selection, scoring, and pagination |
/// | [`stats`](KnowledgeStore::stats) | Entity and index counters |
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Backend identifier (e.g. `"in_memory"`).
    fn name(&self) -> &str;

    /// Insert or replace a base. Replacing keeps its sources and items.
    async fn store_base(&self, base: &KnowledgeBase) -> Result<bool>;

    /// Insert a base. Returns `false` if the id is taken.
    async fn insert_base(&self, base: &KnowledgeBase) -> Result<bool>;

    /// Replace an existing base, keeping its contents. Returns `false` if it is gone.
    async fn replace_base(&self, base: &KnowledgeBase) -> Result<bool>;

    async fn get_base(&self, base_id: &str) -> Result<Option<KnowledgeBase>>;

    async fn base_exists(&self, base_id: &str) -> Result<bool> {
        Ok(self.get_base(base_id).await?.is_some())
    }

    /// Delete a base with all its sources, items, and postings.
    async fn delete_base(&self, base_id: &str) -> Result<bool>;

    /// Bases matching `filter`, newest first.
    async fn list_bases(&self, filter: &BaseFilter, page: Page) -> Result<Vec<KnowledgeBase>>;

    async fn count_bases(&self, filter: &BaseFilter) -> Result<usize>;

    /// Insert or replace a source. Returns `false` if its base does not exist.
    async fn store_source(&self, source: &KnowledgeSource) -> Result<bool>;

    /// Insert a source. Returns `false` if its base is missing or the id is taken.
    async fn insert_source(&self, source: &KnowledgeSource) -> Result<bool>;

    /// Replace an existing source. Returns `false` if it is gone.
    async fn replace_source(&self, source: &KnowledgeSource) -> Result<bool>;

    async fn get_source(&self, source_id: &str, base_id: &str) -> Result<Option<KnowledgeSource>>;

    async fn source_exists(&self, source_id: &str, base_id: &str) -> Result<bool> {
        Ok(self.get_source(source_id, base_id).await?.is_some())
    }

    /// Delete a source with all its items and their postings.
    async fn delete_source(&self, source_id: &str, base_id: &str) -> Result<bool>;

    /// Sources of a base, optionally of one type, newest first.
    async fn list_sources(
        &self,
        base_id: &str,
        source_type: Option<SourceType>,
        page: Page,
    ) -> Result<Vec<KnowledgeSource>>;

    async fn count_sources(&self, base_id: &str) -> Result<usize>;

    /// Insert or replace an item, rebuilding its postings.
    ///
    /// Returns `false` if the item's source does not exist in its base.
    async fn store_item(&self, item: &KnowledgeItem) -> Result<bool>;

    /// Store items one by one; returns how many were stored.
    async fn store_items(&self, items: &[KnowledgeItem]) -> Result<usize> {
        let mut stored = 0;
        for item in items {
            if self.store_item(item).await? {
                stored += 1;
            }
        }
        Ok(stored)
    }

    /// Insert an item and index it. Returns `false` if its source is
    /// missing or the id is taken.
    async fn insert_item(&self, item: &KnowledgeItem) -> Result<bool>;

    /// Insert all items or none. Returns `false`, writing nothing, if any
    /// source is missing or any id is taken or repeated.
    async fn insert_items(&self, items: &[KnowledgeItem]) -> Result<bool>;

    /// Replace an existing item and re-index it. Returns `false` if it is gone.
    async fn replace_item(&self, item: &KnowledgeItem) -> Result<bool>;

    async fn get_item(&self, item_id: &str, base_id: &str) -> Result<Option<KnowledgeItem>>;

    async fn item_exists(&self, item_id: &str, base_id: &str) -> Result<bool> {
        Ok(self.get_item(item_id, base_id).await?.is_some())
    }

    async fn delete_item(&self, item_id: &str, base_id: &str) -> Result<bool>;

    /// Items of a base matching `filter`, newest first.
    async fn list_items(
        &self,
        base_id: &str,
        filter: &ItemFilter,
        page: Page,
    ) -> Result<Vec<KnowledgeItem>>;

    async fn count_items(&self, base_id: &str, source_id: Option<&str>) -> Result<usize>;

    /// Run a query against one base. A missing base yields no results.
    async fn search(&self, query: &KnowledgeQuery) -> Result<RetrievalResults>;

    async fn search_by_text(&self, base_id: &str, text: &str, limit: usize) -> Result<RetrievalResults> {
        let query = KnowledgeQuery::new(base_id).with_text(text).with_limit(limit);
        self.search(&query).await
    }

    async fn search_by_embedding(
        &self,
        base_id: &str,
        embedding: &[f32],
        limit: usize,
    ) -> Result<RetrievalResults> {
        let query = KnowledgeQuery::new(base_id)
            .with_embedding(embedding.to_vec())
            .with_limit(limit);
        self.search(&query).await
    }

    /// Counters for one base, or for the whole store when `base_id` is `None`.
    async fn stats(&self, base_id: Option<&str>) -> Result<StoreStats>;

    /// Drop everything.
    async fn clear(&self) -> Result<()>;
}
