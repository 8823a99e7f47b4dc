//! Core data models for knowledge storage and retrieval.
//!
//! The entity hierarchy is `KnowledgeBase → KnowledgeSource → KnowledgeItem`.
//! A base is the tenant boundary: every source and item carries the id of
//! the base it lives in, and every lookup is keyed by `(id, base_id)`.
//!
//! Queries and results ([`KnowledgeQuery`], [`RetrievalResult`],
//! [`GroundedAnswer`]) are transient and never persisted.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::KnowledgeError;

/// Free-form metadata attached to bases, sources, and items.
///
/// Query filters compare values for exact equality.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Generate a fresh entity id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Reject vectors holding NaN or infinite components.
pub fn validate_embedding(embedding: &[f32]) -> crate::error::Result<()> {
    match embedding.iter().position(|x| !x.is_finite()) {
        Some(index) => Err(KnowledgeError::InvalidQuery(format!(
            "embedding component {index} is not a finite number"
        ))),
        None => Ok(()),
    }
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Canonical lowercase name.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = KnowledgeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(KnowledgeError::InvalidQuery(format!(
                        "unknown {}: '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Lifecycle status of a knowledge base. Archiving never deletes data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseStatus {
    #[default]
    Active,
    Inactive,
    Archived,
}

string_enum!(BaseStatus {
    Active => "active",
    Inactive => "inactive",
    Archived => "archived",
});

/// Kind of origin a source was ingested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[default]
    Document,
    DocumentCollection,
    Manual,
    Api,
    WebScrape,
    Database,
    Other,
}

string_enum!(SourceType {
    Document => "document",
    DocumentCollection => "document_collection",
    Manual => "manual",
    Api => "api",
    WebScrape => "web_scrape",
    Database => "database",
    Other => "other",
});

/// Processing status of an item. `Indexed` means an embedding is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    Processing,
    Indexed,
    Failed,
}

string_enum!(ItemStatus {
    Pending => "pending",
    Processing => "processing",
    Indexed => "indexed",
    Failed => "failed",
});

/// Top-level tenant container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Kind of owner, e.g. `"organization"`, `"project"`, `"user"`.
    pub owner_type: String,
    pub owner_id: String,
    #[serde(default)]
    pub status: BaseStatus,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Named grouping of items within a base, e.g. one ingested document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeSource {
    pub id: String,
    pub base_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source_type: SourceType,
    pub source_uri: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Atomic retrievable unit of content.
///
/// `base_id` is denormalized from the parent source so that every lookup
/// can be scoped to the tenant without a join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub id: String,
    pub base_id: String,
    pub source_id: String,
    pub content: String,
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default)]
    pub chunk_index: usize,
    #[serde(default)]
    pub start_char: usize,
    #[serde(default)]
    pub end_char: usize,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeItem {
    pub fn has_embedding(&self) -> bool {
        self.embedding.as_ref().is_some_and(|v| !v.is_empty())
    }

    pub fn character_count(&self) -> usize {
        self.content.chars().count()
    }

    pub fn word_count(&self) -> usize {
        self.content.split_whitespace().count()
    }

    /// Text fed to the embedding provider: the title (if any) followed by
    /// the content, separated by a blank line.
    pub fn embedding_text(&self) -> String {
        match &self.title {
            Some(title) if !title.trim().is_empty() => format!("{}\n\n{}", title, self.content),
            _ => self.content.clone(),
        }
    }
}

/// Input for creating a knowledge base.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewBase {
    /// Explicit id; a collision is reported as `DuplicateBase`.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub owner_type: String,
    pub owner_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Input for creating a source under an existing base.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSource {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub base_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source_type: SourceType,
    #[serde(default)]
    pub source_uri: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Input for creating an item under an existing source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub base_id: String,
    #[serde(default)]
    pub source_id: String,
    pub content: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub chunk_index: usize,
    #[serde(default)]
    pub start_char: usize,
    #[serde(default)]
    pub end_char: usize,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Partial update for a base. `None` leaves a field untouched; metadata is merged.
#[derive(Debug, Clone, Default)]
pub struct BaseUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<BaseStatus>,
    pub metadata: Option<Metadata>,
}

/// Partial update for a source. `None` leaves a field untouched; metadata is merged.
#[derive(Debug, Clone, Default)]
pub struct SourceUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub source_type: Option<SourceType>,
    pub source_uri: Option<String>,
    pub metadata: Option<Metadata>,
}

/// Partial update for an item. `None` leaves a field untouched; metadata is merged.
///
/// Editing `content` or `title` does not re-embed the item.
#[derive(Debug, Clone, Default)]
pub struct ItemUpdate {
    pub content: Option<String>,
    pub title: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub status: Option<ItemStatus>,
    pub metadata: Option<Metadata>,
}

/// Which signals a search should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    Text,
    Semantic,
    #[default]
    Hybrid,
}

impl SearchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Semantic => "semantic",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchType {
    type Err = KnowledgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "keyword" => Ok(Self::Text),
            "semantic" | "vector" => Ok(Self::Semantic),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(KnowledgeError::InvalidQuery(format!(
                "unknown search type '{}'; use text, semantic, or hybrid",
                other
            ))),
        }
    }
}

/// A search request, always scoped to a single base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeQuery {
    pub base_id: String,
    pub query_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_embedding: Option<Vec<f32>>,
    /// Restrict candidates to these sources (exact membership).
    pub source_ids: Option<Vec<String>>,
    /// Exact-equality metadata filters, all of which must match.
    #[serde(default)]
    pub filters: Metadata,
    pub limit: usize,
    pub offset: usize,
    pub min_score: f64,
    /// When false, highlights are not computed.
    pub include_content: bool,
    /// When false, item metadata is stripped from results.
    pub include_metadata: bool,
}

impl KnowledgeQuery {
    pub const DEFAULT_LIMIT: usize = 10;

    pub fn new(base_id: impl Into<String>) -> Self {
        Self {
            base_id: base_id.into(),
            query_text: None,
            query_embedding: None,
            source_ids: None,
            filters: Metadata::new(),
            limit: Self::DEFAULT_LIMIT,
            offset: 0,
            min_score: 0.0,
            include_content: true,
            include_metadata: true,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.query_text = Some(text.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.query_embedding = Some(embedding);
        self
    }

    pub fn with_source_ids(mut self, source_ids: Option<Vec<String>>) -> Self {
        self.source_ids = source_ids;
        self
    }

    pub fn with_filters(mut self, filters: Metadata) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = min_score;
        self
    }

    /// Reject queries no backend could answer meaningfully.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.limit == 0 {
            return Err(KnowledgeError::InvalidQuery(
                "limit must be at least 1".to_string(),
            ));
        }
        if !self.min_score.is_finite() {
            return Err(KnowledgeError::InvalidQuery(
                "min_score must be a finite number".to_string(),
            ));
        }
        if let Some(embedding) = &self.query_embedding {
            validate_embedding(embedding)?;
        }
        Ok(())
    }
}

/// One scored hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub item: KnowledgeItem,
    /// Combined relevance in `[.., 1.0]`.
    pub score: f64,
    /// Lexical overlap signal, when the query had text.
    pub text_score: Option<f64>,
    /// Cosine similarity signal, when both query and item had vectors.
    pub vector_score: Option<f64>,
    /// Up to three matching sentences from the content.
    pub highlights: Vec<String>,
    /// 1-based position in the full ranking.
    pub rank: usize,
}

/// A page of hits plus bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResults {
    pub results: Vec<RetrievalResult>,
    /// Matches before pagination.
    pub total_count: usize,
    pub query_time_ms: f64,
}

impl RetrievalResults {
    pub fn count(&self) -> usize {
        self.results.len()
    }

    pub fn has_results(&self) -> bool {
        !self.results.is_empty()
    }
}

/// Scored reference from an answer back to the item that grounds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub item_id: String,
    pub source_id: String,
    pub source_name: String,
    pub content_excerpt: String,
    pub relevance_score: f64,
    pub start_char: Option<usize>,
    pub end_char: Option<usize>,
}

/// An answer with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundedAnswer {
    pub answer_text: String,
    pub query: String,
    pub base_id: String,
    pub citations: Vec<Citation>,
    /// Top result score, clamped to `<= 1.0`; `0.0` when nothing was found.
    pub confidence_score: f64,
    pub generation_time_ms: f64,
    /// Tag identifying the synthesis method.
    pub model_name: String,
    pub retrieval_count: usize,
    pub total_matches: usize,
}

impl GroundedAnswer {
    pub fn citation_count(&self) -> usize {
        self.citations.len()
    }

    pub fn is_grounded(&self) -> bool {
        !self.citations.is_empty()
    }
}

/// Outcome of checking an answer against its citations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerVerification {
    pub verified: bool,
    pub citation_count: usize,
    pub average_citation_score: f64,
    pub method: String,
}

/// Storage counters, global or scoped to one base.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_id: Option<String>,
    pub base_count: usize,
    pub source_count: usize,
    pub item_count: usize,
    pub embedded_item_count: usize,
    pub indexed_token_count: usize,
}
