//! JSON corpus files for the `gk` binary.
//!
//! A corpus describes one knowledge base and its sources and items:
//!
//! ```json
//! {
//!   "base": { "id": "B1", "name": "Handbook", "owner_type": "organization", "owner_id": "acme" },
//!   "sources": [
//!     {
//!       "id": "S1",
//!       "name": "HR Policies",
//!       "source_type": "document",
//!       "items": [
//!         { "id": "I1", "title": "Vacation Policy", "content": "Employees receive 20 vacation days per year." }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! Loading creates everything through a [`KnowledgeService`], embedding
//! items when a provider is configured.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use grounded_core::models::{Metadata, NewBase, NewItem, NewSource, SourceType};

use crate::service::KnowledgeService;

#[derive(Debug, Deserialize)]
pub struct CorpusFile {
    pub base: NewBase,
    #[serde(default)]
    pub sources: Vec<CorpusSource>,
}

#[derive(Debug, Deserialize)]
pub struct CorpusSource {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source_type: SourceType,
    #[serde(default)]
    pub source_uri: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub items: Vec<CorpusItem>,
}

#[derive(Debug, Deserialize)]
pub struct CorpusItem {
    #[serde(default)]
    pub id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// What a load created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedCorpus {
    pub base_id: String,
    pub source_count: usize,
    pub item_count: usize,
}

pub fn read_corpus(path: &Path) -> Result<CorpusFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read corpus file: {}", path.display()))?;
    parse_corpus(&content).with_context(|| format!("Invalid corpus file: {}", path.display()))
}

pub fn parse_corpus(content: &str) -> Result<CorpusFile> {
    let corpus: CorpusFile = serde_json::from_str(content)?;
    if corpus.base.name.trim().is_empty() {
        anyhow::bail!("base.name must not be empty");
    }
    for source in &corpus.sources {
        if source.name.trim().is_empty() {
            anyhow::bail!("every source needs a name");
        }
    }
    Ok(corpus)
}

/// Create the corpus's base, sources and items in `service`.
pub async fn load_corpus(service: &KnowledgeService, corpus: CorpusFile) -> Result<LoadedCorpus> {
    let base = service
        .create_knowledge_base(corpus.base)
        .await
        .context("Failed to create knowledge base")?;

    let mut item_count = 0;
    let source_count = corpus.sources.len();
    for source in corpus.sources {
        let created = service
            .create_source(NewSource {
                id: source.id,
                base_id: base.id.clone(),
                name: source.name,
                description: source.description,
                source_type: source.source_type,
                source_uri: source.source_uri,
                metadata: source.metadata,
            })
            .await
            .with_context(|| format!("Failed to create source in base '{}'", base.id))?;

        let items: Vec<NewItem> = source
            .items
            .into_iter()
            .map(|item| NewItem {
                id: item.id,
                content: item.content,
                title: item.title,
                metadata: item.metadata,
                ..NewItem::default()
            })
            .collect();
        if items.is_empty() {
            continue;
        }

        let stored = service
            .add_knowledge_batch(&base.id, &created.id, items, true)
            .await
            .with_context(|| format!("Failed to add items to source '{}'", created.name))?;
        item_count += stored.len();
    }

    info!(base_id = %base.id, sources = source_count, items = item_count, "loaded corpus");
    Ok(LoadedCorpus {
        base_id: base.id,
        source_count,
        item_count,
    })
}

/// Read `path` and load it into `service`.
pub async fn load_corpus_file(service: &KnowledgeService, path: &Path) -> Result<LoadedCorpus> {
    let corpus = read_corpus(path)?;
    load_corpus(service, corpus).await
}
