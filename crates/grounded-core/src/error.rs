//! Error taxonomy for knowledge operations.
//!
//! Every failure the engine reports is a [`KnowledgeError`]. Each variant
//! carries a stable machine-readable [`code`](KnowledgeError::code) and
//! structured [`details`](KnowledgeError::details) so that an upstream
//! layer (HTTP, CLI) can map errors without parsing messages.
//!
//! The storage layer only ever produces [`KnowledgeError::Storage`]; the
//! `*NotFound` and `Duplicate*` variants are raised by the repository after
//! it has checked the tenant scope.

use serde_json::{json, Value};
use thiserror::Error;

/// Result type used across the knowledge engine.
pub type Result<T> = std::result::Result<T, KnowledgeError>;

/// Top-level error type for knowledge operations.
#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("knowledge base '{base_id}' not found")]
    BaseNotFound { base_id: String },

    #[error("knowledge source '{source_id}' not found in base '{base_id}'")]
    SourceNotFound { source_id: String, base_id: String },

    #[error("knowledge item '{item_id}' not found in base '{base_id}'")]
    ItemNotFound { item_id: String, base_id: String },

    #[error("knowledge base '{base_id}' already exists")]
    DuplicateBase { base_id: String },

    #[error("knowledge source '{source_id}' already exists in base '{base_id}'")]
    DuplicateSource { source_id: String, base_id: String },

    #[error("knowledge item '{item_id}' already exists in base '{base_id}'")]
    DuplicateItem { item_id: String, base_id: String },

    #[error("tenant isolation violation: {message}")]
    TenantIsolation {
        message: String,
        base_id: String,
        requested_resource: Option<String>,
    },

    #[error("embedding provider '{provider}' failed: {message}")]
    Embedding {
        message: String,
        provider: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("retrieval failed: {message}")]
    Retrieval {
        message: String,
        query: Option<String>,
        #[source]
        source: anyhow::Error,
    },

    #[error("answer generation failed: {message}")]
    AnswerGeneration {
        message: String,
        query: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("storage error during {operation}: {message}")]
    Storage { operation: String, message: String },

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl KnowledgeError {
    /// Stable error code, suitable for API responses and log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BaseNotFound { .. } => "KNOWLEDGE_BASE_NOT_FOUND",
            Self::SourceNotFound { .. } => "KNOWLEDGE_SOURCE_NOT_FOUND",
            Self::ItemNotFound { .. } => "KNOWLEDGE_ITEM_NOT_FOUND",
            Self::DuplicateBase { .. } => "DUPLICATE_KNOWLEDGE_BASE",
            Self::DuplicateSource { .. } => "DUPLICATE_KNOWLEDGE_SOURCE",
            Self::DuplicateItem { .. } => "DUPLICATE_KNOWLEDGE_ITEM",
            Self::TenantIsolation { .. } => "TENANT_ISOLATION_VIOLATION",
            Self::Embedding { .. } => "EMBEDDING_ERROR",
            Self::Retrieval { .. } => "RETRIEVAL_ERROR",
            Self::AnswerGeneration { .. } => "ANSWER_GENERATION_ERROR",
            Self::Storage { .. } => "KNOWLEDGE_STORAGE_ERROR",
            Self::InvalidQuery(_) => "INVALID_QUERY",
        }
    }

    /// Structured details describing the failing entity or operation.
    pub fn details(&self) -> Value {
        match self {
            Self::BaseNotFound { base_id } | Self::DuplicateBase { base_id } => {
                json!({ "base_id": base_id })
            }
            Self::SourceNotFound { source_id, base_id }
            | Self::DuplicateSource { source_id, base_id } => {
                json!({ "source_id": source_id, "base_id": base_id })
            }
            Self::ItemNotFound { item_id, base_id } | Self::DuplicateItem { item_id, base_id } => {
                json!({ "item_id": item_id, "base_id": base_id })
            }
            Self::TenantIsolation {
                base_id,
                requested_resource,
                ..
            } => json!({ "base_id": base_id, "requested_resource": requested_resource }),
            Self::Embedding {
                provider, source, ..
            } => json!({ "provider": provider, "original_error": source.to_string() }),
            Self::Retrieval { query, source, .. } => {
                json!({ "query": query, "original_error": source.to_string() })
            }
            Self::AnswerGeneration { query, source, .. } => {
                json!({ "query": query, "original_error": source.to_string() })
            }
            Self::Storage { operation, .. } => json!({ "operation": operation }),
            Self::InvalidQuery(reason) => json!({ "reason": reason }),
        }
    }

    /// True for the `*NotFound` family.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BaseNotFound { .. } | Self::SourceNotFound { .. } | Self::ItemNotFound { .. }
        )
    }

    pub(crate) fn storage(operation: &str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.to_string(),
            message: message.into(),
        }
    }
}
