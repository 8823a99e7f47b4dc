//! In-memory [`KnowledgeStore`] implementation.
//!
//! Data is sharded per base: each shard holds the base record, its
//! sources, its items, and an inverted token index, behind its own
//! `std::sync::RwLock`. The shard map sits behind an outer `RwLock`.
//!
//! Every mutation updates the item map and the token index under one
//! shard write guard, so a concurrent search never sees an item without
//! its postings or postings without their item. Deleting a base takes
//! the outer write lock and drops the whole shard.
//!
//! Create-only (`insert_*`) and update-only (`replace_*`) writes test for
//! the entity under the same guard that performs the write. A batch insert
//! spanning several bases locks their shards in base id order.
//!
//! Vector search is brute force: without query text every item of the
//! base is a candidate.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{KnowledgeError, Result};
use crate::models::{
    KnowledgeBase, KnowledgeItem, KnowledgeQuery, KnowledgeSource, RetrievalResults, SourceType,
    StoreStats,
};
use crate::search::{rank_candidates, PreparedQuery};
use crate::text::tokenize;

use super::{BaseFilter, ItemFilter, KnowledgeStore, Page};

/// A stored value plus its creation sequence number.
struct Stored<T> {
    seq: u64,
    value: T,
}

struct Shard {
    base: Stored<KnowledgeBase>,
    sources: HashMap<String, Stored<KnowledgeSource>>,
    items: HashMap<String, Stored<KnowledgeItem>>,
    /// token -> ids of items in this base whose content or title contains it
    postings: HashMap<String, BTreeSet<String>>,
}

impl Shard {
    fn new(base: Stored<KnowledgeBase>) -> Self {
        Self {
            base,
            sources: HashMap::new(),
            items: HashMap::new(),
            postings: HashMap::new(),
        }
    }

    fn index(&mut self, item: &KnowledgeItem) {
        for token in item_tokens(item) {
            self.postings
                .entry(token)
                .or_default()
                .insert(item.id.clone());
        }
    }

    fn unindex(&mut self, item: &KnowledgeItem) {
        for token in item_tokens(item) {
            if let Some(ids) = self.postings.get_mut(&token) {
                ids.remove(&item.id);
                if ids.is_empty() {
                    self.postings.remove(&token);
                }
            }
        }
    }

    /// Insert or replace `item`, keeping the sequence of a replaced entry.
    fn put_item(&mut self, item: &KnowledgeItem, seq: u64) {
        let seq = match self.items.remove(&item.id) {
            Some(previous) => {
                self.unindex(&previous.value);
                previous.seq
            }
            None => seq,
        };
        self.index(item);
        self.items.insert(
            item.id.clone(),
            Stored {
                seq,
                value: item.clone(),
            },
        );
    }

    fn put_source(&mut self, source: &KnowledgeSource, seq: u64) {
        let seq = self.sources.get(&source.id).map_or(seq, |s| s.seq);
        self.sources.insert(
            source.id.clone(),
            Stored {
                seq,
                value: source.clone(),
            },
        );
    }

    fn accepts_new_item(&self, item: &KnowledgeItem) -> bool {
        self.sources.contains_key(&item.source_id) && !self.items.contains_key(&item.id)
    }

    fn remove_item(&mut self, item_id: &str) -> bool {
        match self.items.remove(item_id) {
            Some(stored) => {
                self.unindex(&stored.value);
                true
            }
            None => false,
        }
    }

    fn embedded_count(&self) -> usize {
        self.items
            .values()
            .filter(|s| s.value.has_embedding())
            .count()
    }
}

fn item_tokens(item: &KnowledgeItem) -> BTreeSet<String> {
    let mut tokens = tokenize(&item.content);
    if let Some(title) = &item.title {
        tokens.extend(tokenize(title));
    }
    tokens
}

/// Newest first, then the requested window.
fn newest_first<'a, T: Clone + 'a>(
    stored: impl Iterator<Item = &'a Stored<T>>,
    page: Page,
) -> Vec<T> {
    let mut all: Vec<&Stored<T>> = stored.collect();
    all.sort_by(|a, b| b.seq.cmp(&a.seq));
    all.into_iter()
        .skip(page.offset)
        .take(page.limit)
        .map(|s| s.value.clone())
        .collect()
}

fn read<'a, T>(lock: &'a RwLock<T>, operation: &str) -> Result<RwLockReadGuard<'a, T>> {
    lock.read()
        .map_err(|_| KnowledgeError::storage(operation, "lock poisoned"))
}

fn write<'a, T>(lock: &'a RwLock<T>, operation: &str) -> Result<RwLockWriteGuard<'a, T>> {
    lock.write()
        .map_err(|_| KnowledgeError::storage(operation, "lock poisoned"))
}

/// In-memory store, the default backend and the reference for tests.
pub struct InMemoryStore {
    shards: RwLock<HashMap<String, RwLock<Shard>>>,
    next_seq: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Run `f` with read access to one shard; `None` if the base is absent.
    fn with_shard<R>(
        &self,
        base_id: &str,
        operation: &str,
        f: impl FnOnce(&Shard) -> R,
    ) -> Result<Option<R>> {
        let shards = read(&self.shards, operation)?;
        match shards.get(base_id) {
            Some(lock) => {
                let shard = read(lock, operation)?;
                Ok(Some(f(&*shard)))
            }
            None => Ok(None),
        }
    }

    /// Run `f` with write access to one shard; `None` if the base is absent.
    fn with_shard_mut<R>(
        &self,
        base_id: &str,
        operation: &str,
        f: impl FnOnce(&mut Shard) -> R,
    ) -> Result<Option<R>> {
        let shards = read(&self.shards, operation)?;
        match shards.get(base_id) {
            Some(lock) => {
                let mut shard = write(lock, operation)?;
                Ok(Some(f(&mut *shard)))
            }
            None => Ok(None),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn store_base(&self, base: &KnowledgeBase) -> Result<bool> {
        let mut shards = write(&self.shards, "store_base")?;
        match shards.get(&base.id) {
            Some(lock) => {
                let mut shard = write(lock, "store_base")?;
                shard.base.value = base.clone();
                debug!(base_id = %base.id, "updated knowledge base");
            }
            None => {
                let stored = Stored {
                    seq: self.next_seq(),
                    value: base.clone(),
                };
                shards.insert(base.id.clone(), RwLock::new(Shard::new(stored)));
                debug!(base_id = %base.id, "stored knowledge base");
            }
        }
        Ok(true)
    }

    async fn insert_base(&self, base: &KnowledgeBase) -> Result<bool> {
        let mut shards = write(&self.shards, "insert_base")?;
        if shards.contains_key(&base.id) {
            return Ok(false);
        }
        let stored = Stored {
            seq: self.next_seq(),
            value: base.clone(),
        };
        shards.insert(base.id.clone(), RwLock::new(Shard::new(stored)));
        debug!(base_id = %base.id, "inserted knowledge base");
        Ok(true)
    }

    async fn replace_base(&self, base: &KnowledgeBase) -> Result<bool> {
        let replaced = self
            .with_shard_mut(&base.id, "replace_base", |shard| {
                shard.base.value = base.clone();
            })?
            .is_some();
        if replaced {
            debug!(base_id = %base.id, "replaced knowledge base");
        }
        Ok(replaced)
    }

    async fn get_base(&self, base_id: &str) -> Result<Option<KnowledgeBase>> {
        self.with_shard(base_id, "get_base", |shard| shard.base.value.clone())
    }

    async fn delete_base(&self, base_id: &str) -> Result<bool> {
        let mut shards = write(&self.shards, "delete_base")?;
        match shards.remove(base_id) {
            Some(lock) => {
                let shard = lock
                    .into_inner()
                    .map_err(|_| KnowledgeError::storage("delete_base", "lock poisoned"))?;
                debug!(
                    base_id,
                    sources = shard.sources.len(),
                    items = shard.items.len(),
                    "deleted knowledge base with contents"
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_bases(&self, filter: &BaseFilter, page: Page) -> Result<Vec<KnowledgeBase>> {
        let shards = read(&self.shards, "list_bases")?;
        let mut matching: Vec<(u64, KnowledgeBase)> = Vec::new();
        for lock in shards.values() {
            let shard = read(lock, "list_bases")?;
            if filter.matches(&shard.base.value) {
                matching.push((shard.base.seq, shard.base.value.clone()));
            }
        }
        matching.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(matching
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .map(|(_, base)| base)
            .collect())
    }

    async fn count_bases(&self, filter: &BaseFilter) -> Result<usize> {
        let shards = read(&self.shards, "count_bases")?;
        let mut count = 0;
        for lock in shards.values() {
            if filter.matches(&read(lock, "count_bases")?.base.value) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn store_source(&self, source: &KnowledgeSource) -> Result<bool> {
        let seq = self.next_seq();
        let stored = self.with_shard_mut(&source.base_id, "store_source", |shard| {
            shard.put_source(source, seq);
        })?;
        if stored.is_some() {
            debug!(source_id = %source.id, base_id = %source.base_id, "stored knowledge source");
        }
        Ok(stored.is_some())
    }

    async fn insert_source(&self, source: &KnowledgeSource) -> Result<bool> {
        let seq = self.next_seq();
        let inserted = self
            .with_shard_mut(&source.base_id, "insert_source", |shard| {
                if shard.sources.contains_key(&source.id) {
                    return false;
                }
                shard.put_source(source, seq);
                true
            })?
            .unwrap_or(false);
        if inserted {
            debug!(source_id = %source.id, base_id = %source.base_id, "inserted knowledge source");
        }
        Ok(inserted)
    }

    async fn replace_source(&self, source: &KnowledgeSource) -> Result<bool> {
        let replaced = self
            .with_shard_mut(&source.base_id, "replace_source", |shard| {
                match shard.sources.get_mut(&source.id) {
                    Some(stored) => {
                        stored.value = source.clone();
                        true
                    }
                    None => false,
                }
            })?
            .unwrap_or(false);
        if replaced {
            debug!(source_id = %source.id, base_id = %source.base_id, "replaced knowledge source");
        }
        Ok(replaced)
    }

    async fn get_source(&self, source_id: &str, base_id: &str) -> Result<Option<KnowledgeSource>> {
        Ok(self
            .with_shard(base_id, "get_source", |shard| {
                shard.sources.get(source_id).map(|s| s.value.clone())
            })?
            .flatten())
    }

    async fn delete_source(&self, source_id: &str, base_id: &str) -> Result<bool> {
        let removed = self.with_shard_mut(base_id, "delete_source", |shard| {
            shard.sources.remove(source_id)?;
            let item_ids: Vec<String> = shard
                .items
                .values()
                .filter(|s| s.value.source_id == source_id)
                .map(|s| s.value.id.clone())
                .collect();
            for item_id in &item_ids {
                shard.remove_item(item_id);
            }
            Some(item_ids.len())
        })?;
        match removed.flatten() {
            Some(items) => {
                debug!(source_id, base_id, items, "deleted knowledge source with items");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_sources(
        &self,
        base_id: &str,
        source_type: Option<SourceType>,
        page: Page,
    ) -> Result<Vec<KnowledgeSource>> {
        Ok(self
            .with_shard(base_id, "list_sources", |shard| {
                newest_first(
                    shard
                        .sources
                        .values()
                        .filter(|s| source_type.map_or(true, |t| s.value.source_type == t)),
                    page,
                )
            })?
            .unwrap_or_default())
    }

    async fn count_sources(&self, base_id: &str) -> Result<usize> {
        Ok(self
            .with_shard(base_id, "count_sources", |shard| shard.sources.len())?
            .unwrap_or(0))
    }

    async fn store_item(&self, item: &KnowledgeItem) -> Result<bool> {
        let seq = self.next_seq();
        let stored = self.with_shard_mut(&item.base_id, "store_item", |shard| {
            if !shard.sources.contains_key(&item.source_id) {
                return false;
            }
            shard.put_item(item, seq);
            true
        })?;
        let stored = stored.unwrap_or(false);
        if stored {
            debug!(item_id = %item.id, base_id = %item.base_id, "stored knowledge item");
        }
        Ok(stored)
    }

    async fn insert_item(&self, item: &KnowledgeItem) -> Result<bool> {
        let seq = self.next_seq();
        let inserted = self
            .with_shard_mut(&item.base_id, "insert_item", |shard| {
                if !shard.accepts_new_item(item) {
                    return false;
                }
                shard.put_item(item, seq);
                true
            })?
            .unwrap_or(false);
        if inserted {
            debug!(item_id = %item.id, base_id = %item.base_id, "inserted knowledge item");
        }
        Ok(inserted)
    }

    async fn insert_items(&self, items: &[KnowledgeItem]) -> Result<bool> {
        let mut by_base: BTreeMap<&str, Vec<&KnowledgeItem>> = BTreeMap::new();
        for item in items {
            by_base.entry(item.base_id.as_str()).or_default().push(item);
        }

        let shards = read(&self.shards, "insert_items")?;
        // Shard guards are taken in base id order.
        let mut locked = Vec::with_capacity(by_base.len());
        for (base_id, batch) in &by_base {
            let Some(lock) = shards.get(*base_id) else {
                return Ok(false);
            };
            locked.push((write(lock, "insert_items")?, batch));
        }

        for (shard, batch) in &locked {
            let mut ids: HashSet<&str> = HashSet::new();
            for item in batch.iter() {
                if !shard.accepts_new_item(item) || !ids.insert(item.id.as_str()) {
                    return Ok(false);
                }
            }
        }
        for (shard, batch) in locked.iter_mut() {
            for item in batch.iter() {
                let seq = self.next_seq();
                shard.put_item(item, seq);
            }
        }
        debug!(count = items.len(), bases = locked.len(), "inserted knowledge items");
        Ok(true)
    }

    async fn replace_item(&self, item: &KnowledgeItem) -> Result<bool> {
        let replaced = self
            .with_shard_mut(&item.base_id, "replace_item", |shard| {
                if !shard.items.contains_key(&item.id) || !shard.sources.contains_key(&item.source_id) {
                    return false;
                }
                // existing entry keeps its sequence
                shard.put_item(item, 0);
                true
            })?
            .unwrap_or(false);
        if replaced {
            debug!(item_id = %item.id, base_id = %item.base_id, "replaced knowledge item");
        }
        Ok(replaced)
    }

    async fn get_item(&self, item_id: &str, base_id: &str) -> Result<Option<KnowledgeItem>> {
        Ok(self
            .with_shard(base_id, "get_item", |shard| {
                shard.items.get(item_id).map(|s| s.value.clone())
            })?
            .flatten())
    }

    async fn delete_item(&self, item_id: &str, base_id: &str) -> Result<bool> {
        let removed = self
            .with_shard_mut(base_id, "delete_item", |shard| shard.remove_item(item_id))?
            .unwrap_or(false);
        if removed {
            debug!(item_id, base_id, "deleted knowledge item");
        }
        Ok(removed)
    }

    async fn list_items(
        &self,
        base_id: &str,
        filter: &ItemFilter,
        page: Page,
    ) -> Result<Vec<KnowledgeItem>> {
        Ok(self
            .with_shard(base_id, "list_items", |shard| {
                newest_first(
                    shard.items.values().filter(|s| filter.matches(&s.value)),
                    page,
                )
            })?
            .unwrap_or_default())
    }

    async fn count_items(&self, base_id: &str, source_id: Option<&str>) -> Result<usize> {
        Ok(self
            .with_shard(base_id, "count_items", |shard| match source_id {
                Some(source_id) => shard
                    .items
                    .values()
                    .filter(|s| s.value.source_id == source_id)
                    .count(),
                None => shard.items.len(),
            })?
            .unwrap_or(0))
    }

    async fn search(&self, query: &KnowledgeQuery) -> Result<RetrievalResults> {
        let started = Instant::now();
        let prepared = PreparedQuery::new(query);

        let results = self.with_shard(&query.base_id, "search", |shard| {
            match &prepared.tokens {
                Some(tokens) => {
                    let mut candidate_ids: BTreeSet<&String> = BTreeSet::new();
                    for token in tokens {
                        if let Some(ids) = shard.postings.get(token) {
                            candidate_ids.extend(ids.iter());
                        }
                    }
                    let candidates = candidate_ids
                        .into_iter()
                        .filter_map(|id| shard.items.get(id))
                        .map(|s| (s.seq, &s.value));
                    rank_candidates(&prepared, candidates)
                }
                None => rank_candidates(
                    &prepared,
                    shard.items.values().map(|s| (s.seq, &s.value)),
                ),
            }
        })?;

        let mut results = results.unwrap_or_default();
        results.query_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        Ok(results)
    }

    async fn stats(&self, base_id: Option<&str>) -> Result<StoreStats> {
        let shards = read(&self.shards, "stats")?;
        let mut stats = StoreStats {
            backend: self.name().to_string(),
            base_id: base_id.map(str::to_string),
            ..StoreStats::default()
        };
        for (id, lock) in shards.iter() {
            if base_id.is_some_and(|b| b != id) {
                continue;
            }
            let shard = read(lock, "stats")?;
            stats.base_count += 1;
            stats.source_count += shard.sources.len();
            stats.item_count += shard.items.len();
            stats.embedded_item_count += shard.embedded_count();
            stats.indexed_token_count += shard.postings.len();
        }
        Ok(stats)
    }

    async fn clear(&self) -> Result<()> {
        write(&self.shards, "clear")?.clear();
        debug!("cleared in-memory store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BaseStatus, ItemStatus, Metadata};
    use chrono::Utc;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn base(id: &str) -> KnowledgeBase {
        let now = Utc::now();
        KnowledgeBase {
            id: id.to_string(),
            name: format!("Base {id}"),
            description: String::new(),
            owner_type: "organization".to_string(),
            owner_id: "org-1".to_string(),
            status: BaseStatus::Active,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn source(id: &str, base_id: &str) -> KnowledgeSource {
        let now = Utc::now();
        KnowledgeSource {
            id: id.to_string(),
            base_id: base_id.to_string(),
            name: format!("Source {id}"),
            description: String::new(),
            source_type: SourceType::Document,
            source_uri: None,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn item(id: &str, base_id: &str, source_id: &str, content: &str) -> KnowledgeItem {
        let now = Utc::now();
        KnowledgeItem {
            id: id.to_string(),
            base_id: base_id.to_string(),
            source_id: source_id.to_string(),
            content: content.to_string(),
            title: None,
            embedding: None,
            status: ItemStatus::Pending,
            chunk_index: 0,
            start_char: 0,
            end_char: 0,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    async fn seeded() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.store_base(&base("kb1")).await.unwrap();
        store.store_source(&source("s1", "kb1")).await.unwrap();
        store
    }

    fn ids(results: &RetrievalResults) -> Vec<String> {
        results.results.iter().map(|r| r.item.id.clone()).collect()
    }

    #[tokio::test]
    async fn store_requires_existing_parents() {
        let store = InMemoryStore::new();
        assert!(!store.store_source(&source("s1", "missing")).await.unwrap());

        let store = seeded().await;
        assert!(!store
            .store_item(&item("i1", "kb1", "nope", "text"))
            .await
            .unwrap());
        assert!(store
            .store_item(&item("i1", "kb1", "s1", "text"))
            .await
            .unwrap());

        let mixed = [item("i2", "kb1", "s1", "kept"), item("i3", "kb1", "nope", "dropped")];
        assert_eq!(store.store_items(&mixed).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lookups_are_scoped_to_the_base() {
        let store = seeded().await;
        store.store_base(&base("kb2")).await.unwrap();
        store
            .store_item(&item("i1", "kb1", "s1", "secret plans"))
            .await
            .unwrap();

        assert!(store.get_item("i1", "kb1").await.unwrap().is_some());
        assert!(store.get_item("i1", "kb2").await.unwrap().is_none());
        assert!(store.get_source("s1", "kb2").await.unwrap().is_none());
        assert!(!store.delete_item("i1", "kb2").await.unwrap());

        let hits = store.search_by_text("kb2", "secret", 10).await.unwrap();
        assert_eq!(hits.total_count, 0);
    }

    #[tokio::test]
    async fn restoring_an_item_replaces_its_postings() {
        let store = seeded().await;
        store
            .store_item(&item("i1", "kb1", "s1", "old words here"))
            .await
            .unwrap();
        store
            .store_item(&item("i1", "kb1", "s1", "fresh content"))
            .await
            .unwrap();

        let stale = store.search_by_text("kb1", "old", 10).await.unwrap();
        assert!(stale.results.is_empty());
        let fresh = store.search_by_text("kb1", "fresh", 10).await.unwrap();
        assert_eq!(ids(&fresh), vec!["i1"]);

        let stats = store.stats(Some("kb1")).await.unwrap();
        assert_eq!(stats.indexed_token_count, 2);
        assert_eq!(stats.item_count, 1);
    }

    #[tokio::test]
    async fn restoring_keeps_creation_order() {
        let store = seeded().await;
        store
            .store_item(&item("first", "kb1", "s1", "shared"))
            .await
            .unwrap();
        store
            .store_item(&item("second", "kb1", "s1", "shared"))
            .await
            .unwrap();
        store
            .store_item(&item("first", "kb1", "s1", "shared again"))
            .await
            .unwrap();

        let hits = store.search_by_text("kb1", "shared", 10).await.unwrap();
        assert_eq!(ids(&hits), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn deleting_a_source_cascades_to_items_and_postings() {
        let store = seeded().await;
        store.store_source(&source("s2", "kb1")).await.unwrap();
        store
            .store_item(&item("a", "kb1", "s1", "alpha"))
            .await
            .unwrap();
        store
            .store_item(&item("b", "kb1", "s2", "alpha beta"))
            .await
            .unwrap();

        assert!(store.delete_source("s1", "kb1").await.unwrap());
        assert!(!store.delete_source("s1", "kb1").await.unwrap());
        assert!(store.get_item("a", "kb1").await.unwrap().is_none());

        let hits = store.search_by_text("kb1", "alpha", 10).await.unwrap();
        assert_eq!(ids(&hits), vec!["b"]);
        assert_eq!(store.count_items("kb1", None).await.unwrap(), 1);
        assert_eq!(store.stats(Some("kb1")).await.unwrap().indexed_token_count, 2);
    }

    #[tokio::test]
    async fn deleting_a_base_drops_everything() {
        let store = seeded().await;
        store
            .store_item(&item("a", "kb1", "s1", "alpha"))
            .await
            .unwrap();

        assert!(store.delete_base("kb1").await.unwrap());
        assert!(!store.delete_base("kb1").await.unwrap());
        assert!(store.get_base("kb1").await.unwrap().is_none());
        assert!(store.get_item("a", "kb1").await.unwrap().is_none());
        assert_eq!(store.count_sources("kb1").await.unwrap(), 0);

        let hits = store.search_by_text("kb1", "alpha", 10).await.unwrap();
        assert!(!hits.has_results());
        assert_eq!(store.stats(None).await.unwrap().base_count, 0);
    }

    #[tokio::test]
    async fn listings_are_newest_first_and_paginated() {
        let store = InMemoryStore::new();
        for id in ["b1", "b2", "b3"] {
            store.store_base(&base(id)).await.unwrap();
        }
        let mut other = base("b4");
        other.owner_id = "org-2".to_string();
        store.store_base(&other).await.unwrap();

        let filter = BaseFilter::owner("organization", "org-1");
        let listed: Vec<String> = store
            .list_bases(&filter, Page::new(2, 0))
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(listed, vec!["b3", "b2"]);
        assert_eq!(store.count_bases(&filter).await.unwrap(), 3);
        assert_eq!(store.count_bases(&BaseFilter::default()).await.unwrap(), 4);

        store.store_source(&source("s1", "b1")).await.unwrap();
        for id in ["i1", "i2", "i3"] {
            store
                .store_item(&item(id, "b1", "s1", "text"))
                .await
                .unwrap();
        }
        let page: Vec<String> = store
            .list_items("b1", &ItemFilter::source("s1"), Page::new(10, 1))
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(page, vec!["i2", "i1"]);
    }

    #[tokio::test]
    async fn vector_queries_consider_every_embedded_item() {
        let store = seeded().await;
        let mut near = item("near", "kb1", "s1", "one");
        near.embedding = Some(vec![1.0, 0.1]);
        let mut far = item("far", "kb1", "s1", "two");
        far.embedding = Some(vec![-1.0, 0.0]);
        let plain = item("plain", "kb1", "s1", "three");
        for it in [&near, &far, &plain] {
            store.store_item(it).await.unwrap();
        }

        let hits = store
            .search_by_embedding("kb1", &[1.0, 0.0], 10)
            .await
            .unwrap();
        assert_eq!(ids(&hits), vec!["near"]);

        let q = KnowledgeQuery::new("kb1")
            .with_embedding(vec![1.0, 0.0])
            .with_min_score(-1.0);
        let hits = store.search(&q).await.unwrap();
        assert_eq!(ids(&hits), vec!["near", "far"]);
        assert!(hits.results[1].score < 0.0);
        assert_eq!(store.stats(None).await.unwrap().embedded_item_count, 2);
    }

    #[tokio::test]
    async fn clear_empties_the_store() {
        let store = seeded().await;
        store.clear().await.unwrap();
        assert!(store.get_base("kb1").await.unwrap().is_none());
        assert_eq!(store.stats(None).await.unwrap(), StoreStats {
            backend: "in_memory".to_string(),
            ..StoreStats::default()
        });
    }

    #[tokio::test]
    async fn inserts_never_overwrite() {
        let store = seeded().await;
        assert!(!store.insert_base(&base("kb1")).await.unwrap());
        assert_eq!(store.count_sources("kb1").await.unwrap(), 1);

        assert!(!store.insert_source(&source("s1", "kb1")).await.unwrap());
        assert!(!store.insert_source(&source("s9", "missing")).await.unwrap());
        assert!(store.insert_source(&source("s2", "kb1")).await.unwrap());

        assert!(store
            .insert_item(&item("i1", "kb1", "s1", "original words"))
            .await
            .unwrap());
        assert!(!store
            .insert_item(&item("i1", "kb1", "s1", "intruder"))
            .await
            .unwrap());
        assert!(!store
            .insert_item(&item("i2", "kb1", "nope", "orphan"))
            .await
            .unwrap());
        let kept = store.get_item("i1", "kb1").await.unwrap().unwrap();
        assert_eq!(kept.content, "original words");
        assert_eq!(store.search_by_text("kb1", "intruder", 10).await.unwrap().total_count, 0);
    }

    #[tokio::test]
    async fn replacing_a_deleted_entity_does_not_revive_it() {
        let store = seeded().await;
        store
            .insert_item(&item("i1", "kb1", "s1", "ghost story"))
            .await
            .unwrap();
        let mut edited = item("i1", "kb1", "s1", "edited story");
        assert!(store.replace_item(&edited).await.unwrap());
        assert_eq!(store.search_by_text("kb1", "edited", 10).await.unwrap().total_count, 1);

        assert!(store.delete_item("i1", "kb1").await.unwrap());
        edited.content = "late edit".to_string();
        assert!(!store.replace_item(&edited).await.unwrap());
        assert!(store.get_item("i1", "kb1").await.unwrap().is_none());
        assert_eq!(store.stats(Some("kb1")).await.unwrap().indexed_token_count, 0);

        let mut renamed = source("s1", "kb1");
        renamed.name = "Renamed".to_string();
        assert!(store.replace_source(&renamed).await.unwrap());
        assert!(store.delete_source("s1", "kb1").await.unwrap());
        assert!(!store.replace_source(&renamed).await.unwrap());
        assert!(store.get_source("s1", "kb1").await.unwrap().is_none());

        assert!(store.replace_base(&base("kb1")).await.unwrap());
        store.delete_base("kb1").await.unwrap();
        assert!(!store.replace_base(&base("kb1")).await.unwrap());
        assert!(store.get_base("kb1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_insert_is_all_or_nothing() {
        let store = seeded().await;
        store.insert_item(&item("taken", "kb1", "s1", "first")).await.unwrap();

        let clashing = vec![
            item("a", "kb1", "s1", "alpha"),
            item("taken", "kb1", "s1", "second"),
        ];
        assert!(!store.insert_items(&clashing).await.unwrap());
        let repeated = vec![item("b", "kb1", "s1", "beta"), item("b", "kb1", "s1", "beta")];
        assert!(!store.insert_items(&repeated).await.unwrap());
        let orphaned = vec![item("c", "kb1", "s1", "gamma"), item("d", "kb1", "nope", "delta")];
        assert!(!store.insert_items(&orphaned).await.unwrap());
        assert_eq!(store.count_items("kb1", None).await.unwrap(), 1);

        store.store_base(&base("kb2")).await.unwrap();
        store.store_source(&source("s2", "kb2")).await.unwrap();
        let spread = vec![
            item("a", "kb1", "s1", "alpha"),
            item("a", "kb2", "s2", "alpha"),
            item("e", "kb1", "s1", "epsilon"),
        ];
        assert!(store.insert_items(&spread).await.unwrap());
        assert_eq!(store.count_items("kb1", None).await.unwrap(), 3);
        assert_eq!(store.count_items("kb2", None).await.unwrap(), 1);
        let listed: Vec<String> = store
            .list_items("kb1", &ItemFilter::default(), Page::default())
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(listed, vec!["e", "a", "taken"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_inserts_have_one_winner() {
        let store = Arc::new(seeded().await);
        let mut handles = Vec::new();
        for n in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let content = format!("writer{n}");
                let won = store
                    .insert_item(&item("x", "kb1", "s1", &content))
                    .await
                    .unwrap();
                (won, content)
            }));
        }
        let mut winners = Vec::new();
        for handle in handles {
            let (won, content) = handle.await.unwrap();
            if won {
                winners.push(content);
            }
        }
        assert_eq!(winners.len(), 1);
        let stored = store.get_item("x", "kb1").await.unwrap().unwrap();
        assert_eq!(stored.content, winners[0]);
        assert_eq!(store.stats(Some("kb1")).await.unwrap().indexed_token_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn searches_during_writes_see_consistent_postings() {
        let store = Arc::new(seeded().await);
        for n in 0..5 {
            store
                .insert_item(&item(&format!("stable-{n}"), "kb1", "s1", "alpha stable"))
                .await
                .unwrap();
        }

        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for round in 0..300usize {
                    let churn = format!("churn-{}", round % 8);
                    let content = if round % 2 == 0 {
                        format!("alpha churn r{round}")
                    } else {
                        format!("beta churn r{round}")
                    };
                    store
                        .store_item(&item(&churn, "kb1", "s1", &content))
                        .await
                        .unwrap();
                    let stable = format!("stable-{}", round % 5);
                    let edited = format!("alpha stable v{round}");
                    assert!(store
                        .replace_item(&item(&stable, "kb1", "s1", &edited))
                        .await
                        .unwrap());
                    store
                        .delete_item(&format!("churn-{}", (round + 3) % 8), "kb1")
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..3 {
            let store = Arc::clone(&store);
            readers.push(tokio::spawn(async move {
                for _ in 0..300 {
                    let hits = store.search_by_text("kb1", "alpha", 50).await.unwrap();
                    let mut stable = 0;
                    for hit in &hits.results {
                        assert!(tokenize(&hit.item.content).contains("alpha"), "{}", hit.item.content);
                        assert!(hit.text_score.is_some_and(|t| t > 0.0));
                        if hit.item.id.starts_with("stable-") {
                            stable += 1;
                            assert!(store.get_item(&hit.item.id, "kb1").await.unwrap().is_some());
                        }
                    }
                    assert_eq!(stable, 5);
                    tokio::task::yield_now().await;
                }
            }));
        }

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }

        let items = store
            .list_items("kb1", &ItemFilter::default(), Page::default())
            .await
            .unwrap();
        let mut expected: BTreeSet<String> = BTreeSet::new();
        for it in &items {
            expected.extend(item_tokens(it));
        }
        let stats = store.stats(Some("kb1")).await.unwrap();
        assert_eq!(stats.indexed_token_count, expected.len());
        assert_eq!(stats.item_count, items.len());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn index_tracks_latest_content(versions in prop::collection::vec("[a-e]{1,3}( [a-e]{1,3}){0,3}", 1..6)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = seeded().await;
                for content in &versions {
                    store.store_item(&item("i", "kb1", "s1", content)).await.unwrap();
                }
                let current = tokenize(versions.last().unwrap());
                for version in &versions {
                    for token in tokenize(version) {
                        let hits = store.search_by_text("kb1", &token, 10).await.unwrap();
                        assert_eq!(hits.total_count, usize::from(current.contains(&token)));
                    }
                }
                let stats = store.stats(Some("kb1")).await.unwrap();
                assert_eq!(stats.indexed_token_count, current.len());
            });
        }
    }
}
