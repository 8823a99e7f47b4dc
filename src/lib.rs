//! # Grounded Knowledge
//!
//! Tenant-isolated knowledge storage with hybrid retrieval and cited
//! answers.
//!
//! Content lives in knowledge bases (one per tenant), grouped into sources
//! and split into items. Every item is indexed by its tokens and, when an
//! embedding provider is configured, by a vector. Questions are answered
//! from the best-matching items, each answer carrying scored citations
//! back to the items it quotes.
//!
//! ## Architecture
//!
//! ```text
//! Answerer ──▶ Retriever ──▶ Repository ──▶ KnowledgeStore
//! (citations)  (text/vector/  (CRUD,         (token index,
//!               hybrid)        tenancy)       vectors)
//!                  │
//!                  ▼
//!          EmbeddingProvider
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! gk ask --corpus handbook.json "How many vacation days?"
//! gk search --corpus handbook.json "vacation" --mode text
//! gk stats --corpus handbook.json
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`embedding`] | Embedding providers (hash, OpenAI) |
//! | [`repository`] | Tenant-aware CRUD over a storage backend |
//! | [`retriever`] | Text, semantic and hybrid search; similar items |
//! | [`answerer`] | Answers with citations and confidence |
//! | [`service`] | The wired-up pipeline |
//! | [`corpus`] | JSON corpus files for the CLI |
//!
//! Data models, errors, scoring and the in-memory store live in
//! `grounded-core`.

pub mod answerer;
pub mod config;
pub mod corpus;
pub mod embedding;
pub mod repository;
pub mod retriever;
pub mod service;

pub use grounded_core::{KnowledgeError, Result};
pub use service::KnowledgeService;
