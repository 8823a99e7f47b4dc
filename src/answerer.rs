//! Cited answers built from hybrid retrieval.
//!
//! [`KnowledgeAnswerer::get_answer`] runs a hybrid search, asks an
//! [`AnswerSynthesizer`] for the answer text, and attaches one
//! [`Citation`] per retrieved result. The caller's `limit` bounds the
//! results; `max_citations` from the config is only its default. The
//! confidence is the top result's score, clamped to `1.0`.
//!
//! The default synthesizer is extractive: it quotes the top result's
//! highlights, or a sentence-bounded prefix of its content. A generative
//! synthesizer can replace it without changing the citation contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use grounded_core::error::{KnowledgeError, Result};
use grounded_core::models::{
    AnswerVerification, Citation, GroundedAnswer, Metadata, RetrievalResult, RetrievalResults,
};
use grounded_core::search::MAX_SCORE;
use grounded_core::text::truncate_chars;

use crate::config::AnswerConfig;
use crate::repository::KnowledgeRepository;
use crate::retriever::{KnowledgeRetriever, SearchOptions};

/// Answer text when retrieval comes back empty.
pub const NO_ANSWER_TEXT: &str = "I couldn't find any relevant information to answer your question.";

/// Citation label for a source that no longer resolves.
pub const UNKNOWN_SOURCE: &str = "Unknown Source";

/// A sentence boundary earlier than this many characters is not used as a
/// cut point; the content is hard-cut instead.
const SENTENCE_CUT_FLOOR: usize = 200;

/// Produces answer text from ranked results.
#[async_trait]
pub trait AnswerSynthesizer: Send + Sync {
    /// Tag stored in [`GroundedAnswer::model_name`].
    fn model_name(&self) -> &str;

    async fn synthesize(&self, question: &str, results: &RetrievalResults) -> anyhow::Result<String>;
}

/// Quotes the top result instead of generating new text.
pub struct ExtractiveSynthesizer {
    max_answer_chars: usize,
}

impl ExtractiveSynthesizer {
    pub fn new(max_answer_chars: usize) -> Self {
        Self { max_answer_chars }
    }

    fn excerpt_content(&self, content: &str) -> String {
        let max = self.max_answer_chars;
        let prefix = match content.char_indices().nth(max) {
            Some((byte_idx, _)) => &content[..byte_idx],
            None => return content.to_string(),
        };
        match prefix.rfind('.') {
            Some(dot) if prefix[..dot].chars().count() > SENTENCE_CUT_FLOOR => {
                prefix[..=dot].to_string()
            }
            _ => format!("{prefix}..."),
        }
    }
}

impl Default for ExtractiveSynthesizer {
    fn default() -> Self {
        Self::new(AnswerConfig::default().max_answer_chars)
    }
}

#[async_trait]
impl AnswerSynthesizer for ExtractiveSynthesizer {
    fn model_name(&self) -> &str {
        "extractive"
    }

    async fn synthesize(&self, _question: &str, results: &RetrievalResults) -> anyhow::Result<String> {
        let Some(top) = results.results.first() else {
            return Ok(NO_ANSWER_TEXT.to_string());
        };
        if !top.highlights.is_empty() {
            return Ok(top.highlights.join(" "));
        }
        Ok(self.excerpt_content(&top.item.content))
    }
}

/// Per-call answer knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerOptions {
    /// Results retrieved, and therefore the most citations produced.
    pub limit: usize,
    pub source_ids: Option<Vec<String>>,
    pub filters: Metadata,
    pub min_score: f64,
}

impl Default for AnswerOptions {
    fn default() -> Self {
        Self {
            limit: AnswerConfig::default().max_citations,
            source_ids: None,
            filters: Metadata::new(),
            min_score: 0.0,
        }
    }
}

impl AnswerOptions {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }
}

pub struct KnowledgeAnswerer {
    repository: Arc<KnowledgeRepository>,
    retriever: Arc<KnowledgeRetriever>,
    synthesizer: Arc<dyn AnswerSynthesizer>,
    config: AnswerConfig,
}

impl KnowledgeAnswerer {
    pub fn new(
        repository: Arc<KnowledgeRepository>,
        retriever: Arc<KnowledgeRetriever>,
        config: AnswerConfig,
    ) -> Self {
        Self {
            repository,
            retriever,
            synthesizer: Arc::new(ExtractiveSynthesizer::new(config.max_answer_chars)),
            config,
        }
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn AnswerSynthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    /// Answer `question` from the contents of `base_id`.
    pub async fn get_answer(
        &self,
        base_id: &str,
        question: &str,
        opts: &AnswerOptions,
    ) -> Result<GroundedAnswer> {
        if opts.limit == 0 {
            return Err(KnowledgeError::InvalidQuery(
                "limit must be at least 1".to_string(),
            ));
        }
        let started = Instant::now();
        let search_opts = SearchOptions {
            limit: opts.limit,
            offset: 0,
            source_ids: opts.source_ids.clone(),
            filters: opts.filters.clone(),
            min_score: opts.min_score,
        };

        let results = self
            .retriever
            .hybrid_search(base_id, question, &search_opts)
            .await
            .map_err(|e| answer_error(e, question))?;

        let answer_text = self
            .synthesizer
            .synthesize(question, &results)
            .await
            .map_err(|e| KnowledgeError::AnswerGeneration {
                message: "failed to synthesize answer".to_string(),
                query: question.to_string(),
                source: e,
            })?;

        let citations = self
            .build_citations(base_id, &results.results)
            .await
            .map_err(|e| answer_error(e, question))?;

        let confidence_score = results
            .results
            .first()
            .map(|r| r.score.min(MAX_SCORE))
            .unwrap_or(0.0);

        debug!(base_id, citations = citations.len(), confidence_score, "answered question");
        Ok(GroundedAnswer {
            answer_text,
            query: question.to_string(),
            base_id: base_id.to_string(),
            citations,
            confidence_score,
            generation_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            model_name: self.synthesizer.model_name().to_string(),
            retrieval_count: results.results.len(),
            total_matches: results.total_count,
        })
    }

    /// Like [`get_answer`](Self::get_answer), with `context` prepended to the
    /// search text.
    pub async fn get_answer_with_context(
        &self,
        base_id: &str,
        question: &str,
        context: &str,
        opts: &AnswerOptions,
    ) -> Result<GroundedAnswer> {
        if context.trim().is_empty() {
            return self.get_answer(base_id, question, opts).await;
        }
        let combined = format!("{context}\n\n{question}");
        self.get_answer(base_id, &combined, opts).await
    }

    /// Citation statistics only: an answer counts as verified when it cites
    /// at least one item. No entailment check is done.
    pub fn verify_answer(&self, answer: &GroundedAnswer) -> AnswerVerification {
        let citation_count = answer.citation_count();
        let average_citation_score = if citation_count == 0 {
            0.0
        } else {
            answer.citations.iter().map(|c| c.relevance_score).sum::<f64>() / citation_count as f64
        };
        AnswerVerification {
            verified: answer.is_grounded(),
            citation_count,
            average_citation_score,
            method: "citation_stats".to_string(),
        }
    }

    async fn build_citations(&self, base_id: &str, results: &[RetrievalResult]) -> Result<Vec<Citation>> {
        let mut names: HashMap<String, String> = HashMap::new();
        let mut citations = Vec::with_capacity(results.len());

        for result in results {
            let item = &result.item;
            if !names.contains_key(&item.source_id) {
                let name = self
                    .repository
                    .get_source_or_none(&item.source_id, base_id)
                    .await?
                    .map(|s| s.name)
                    .unwrap_or_else(|| UNKNOWN_SOURCE.to_string());
                names.insert(item.source_id.clone(), name);
            }

            let content_excerpt = match result.highlights.first() {
                Some(highlight) => highlight.clone(),
                None => truncate_chars(&item.content, self.config.excerpt_chars),
            };

            citations.push(Citation {
                item_id: item.id.clone(),
                source_id: item.source_id.clone(),
                source_name: names[&item.source_id].clone(),
                content_excerpt,
                relevance_score: result.score,
                start_char: Some(item.start_char),
                end_char: Some(item.end_char),
            });
        }
        Ok(citations)
    }
}

fn answer_error(err: KnowledgeError, question: &str) -> KnowledgeError {
    match err {
        KnowledgeError::BaseNotFound { .. }
        | KnowledgeError::SourceNotFound { .. }
        | KnowledgeError::ItemNotFound { .. }
        | KnowledgeError::TenantIsolation { .. }
        | KnowledgeError::Embedding { .. }
        | KnowledgeError::Retrieval { .. } => err,
        other => KnowledgeError::AnswerGeneration {
            message: format!("failed to generate answer: {other}"),
            query: question.to_string(),
            source: anyhow::Error::new(other),
        },
    }
}
