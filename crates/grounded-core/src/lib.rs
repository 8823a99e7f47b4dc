//! # Grounded Core
//!
//! Shared logic for Grounded Knowledge: data models, the error taxonomy,
//! tokenization and highlighting, the scoring convention, the embedding
//! provider trait, and the storage abstraction with its in-memory backend.
//!
//! This crate contains no tokio, network, or filesystem dependencies.
//! Embedding providers, configuration, and the repository/retriever/answerer
//! pipeline live in the `grounded-knowledge` app crate.

pub mod embedding;
pub mod error;
pub mod models;
pub mod search;
pub mod store;
pub mod text;

pub use embedding::EmbeddingProvider;
pub use error::{KnowledgeError, Result};
pub use store::memory::InMemoryStore;
pub use store::KnowledgeStore;
