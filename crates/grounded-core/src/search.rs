//! Scoring, ranking, and pagination for knowledge queries.
//!
//! Storage backends select candidates (see [`crate::store`]) and hand them
//! to [`rank_candidates`], so every backend shares one scoring convention.
//!
//! # Scoring
//!
//! 1. `text = |tokens(content) ∩ tokens(query)| / |tokens(query)|`.
//!    With a title: `text = max(text, title_ratio × 1.2)`.
//! 2. `vector = cosine(item.embedding, query.embedding)` when both exist.
//! 3. Weights are renormalized over the signals present: both signals
//!    give `0.5 × text + 0.5 × vector`, one signal counts at full weight,
//!    no signal means the candidate does not match.
//! 4. The combined score is clamped to at most `1.0`, then filtered by
//!    `min_score`.
//! 5. Sort by score (desc), creation sequence (asc); slice
//!    `[offset, offset + limit)`; ranks start at `offset + 1`.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::embedding::cosine_similarity;
use crate::models::{KnowledgeItem, KnowledgeQuery, RetrievalResult, RetrievalResults};
use crate::text::{highlights, tokenize};

/// Multiplier applied to title matches.
pub const TITLE_BOOST: f64 = 1.2;

/// Upper bound of a combined score.
pub const MAX_SCORE: f64 = 1.0;

/// A query with its text pre-tokenized.
#[derive(Debug, Clone)]
pub struct PreparedQuery<'a> {
    pub query: &'a KnowledgeQuery,
    /// `None` when the query has no text or the text has no tokens.
    pub tokens: Option<BTreeSet<String>>,
}

impl<'a> PreparedQuery<'a> {
    pub fn new(query: &'a KnowledgeQuery) -> Self {
        let tokens = query
            .query_text
            .as_deref()
            .map(tokenize)
            .filter(|t| !t.is_empty());
        Self { query, tokens }
    }

    fn embedding(&self) -> Option<&[f32]> {
        self.query
            .query_embedding
            .as_deref()
            .filter(|v| !v.is_empty())
    }

    /// Source-id and metadata-equality filters.
    pub fn matches_filters(&self, item: &KnowledgeItem) -> bool {
        if let Some(source_ids) = &self.query.source_ids {
            if !source_ids.iter().any(|id| id == &item.source_id) {
                return false;
            }
        }
        self.query
            .filters
            .iter()
            .all(|(key, value)| item.metadata.get(key) == Some(value))
    }
}

/// Fraction of query tokens present in `tokens`.
pub fn overlap_ratio(tokens: &BTreeSet<String>, query_tokens: &BTreeSet<String>) -> f64 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let shared = query_tokens.intersection(tokens).count();
    shared as f64 / query_tokens.len() as f64
}

/// Lexical score of an item, including the title boost.
pub fn text_score(item: &KnowledgeItem, query_tokens: &BTreeSet<String>) -> f64 {
    let content_score = overlap_ratio(&tokenize(&item.content), query_tokens);
    match item.title.as_deref() {
        Some(title) if !title.is_empty() => {
            let title_score = overlap_ratio(&tokenize(title), query_tokens);
            content_score.max(title_score * TITLE_BOOST)
        }
        _ => content_score,
    }
}

/// Fuse the available signals into one score, or `None` if neither fired
/// or the result is not a finite number.
pub fn combine_scores(text: Option<f64>, vector: Option<f64>) -> Option<f64> {
    let combined = match (text, vector) {
        (Some(t), Some(v)) => 0.5 * t + 0.5 * v,
        (Some(t), None) => t,
        (None, Some(v)) => v,
        (None, None) => return None,
    };
    // Checked before clamping: `f64::min(NaN, 1.0)` is 1.0.
    if !combined.is_finite() {
        return None;
    }
    Some(combined.min(MAX_SCORE))
}

/// A candidate that passed scoring and the `min_score` threshold.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub seq: u64,
    pub item: KnowledgeItem,
    pub score: f64,
    pub text_score: Option<f64>,
    pub vector_score: Option<f64>,
}

/// Score one item. Returns `None` if no signal fired, the score is not a
/// finite number, or it is below `min_score`.
pub fn score_item(prepared: &PreparedQuery<'_>, seq: u64, item: &KnowledgeItem) -> Option<ScoredCandidate> {
    let text = prepared.tokens.as_ref().map(|q| text_score(item, q));
    let vector = match (prepared.embedding(), item.embedding.as_deref()) {
        (Some(q), Some(v)) if !v.is_empty() => Some(cosine_similarity(q, v) as f64),
        _ => None,
    };
    let score = combine_scores(text, vector)?;
    if score < prepared.query.min_score {
        return None;
    }
    Some(ScoredCandidate {
        seq,
        item: item.clone(),
        score,
        text_score: text,
        vector_score: vector,
    })
}

/// Score, filter, sort, and paginate candidates.
///
/// `candidates` yields `(creation_sequence, item)` pairs. The filters are
/// applied here too, so a backend may pass a superset.
pub fn rank_candidates<'i, I>(prepared: &PreparedQuery<'_>, candidates: I) -> RetrievalResults
where
    I: IntoIterator<Item = (u64, &'i KnowledgeItem)>,
{
    let mut scored: Vec<ScoredCandidate> = candidates
        .into_iter()
        .filter(|(_, item)| prepared.matches_filters(item))
        .filter_map(|(seq, item)| score_item(prepared, seq, item))
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.seq.cmp(&b.seq))
    });

    let total_count = scored.len();
    let query = prepared.query;

    let results = scored
        .into_iter()
        .skip(query.offset)
        .take(query.limit)
        .enumerate()
        .map(|(i, candidate)| {
            let highlights = match (&prepared.tokens, query.include_content) {
                (Some(tokens), true) => highlights(&candidate.item.content, tokens),
                _ => Vec::new(),
            };
            let mut item = candidate.item;
            if !query.include_metadata {
                item.metadata.clear();
            }
            RetrievalResult {
                item,
                score: candidate.score,
                text_score: candidate.text_score,
                vector_score: candidate.vector_score,
                highlights,
                rank: query.offset + i + 1,
            }
        })
        .collect();

    RetrievalResults {
        results,
        total_count,
        query_time_ms: 0.0,
    }
}
