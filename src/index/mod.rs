//! Index adapters
//!
//! Both retrieval backends sit behind [`IndexAdapter`]: a keyword index scored
//! with BM25 ([`SparseIndex`]) and an embedding index searched by cosine
//! similarity ([`DenseIndex`]). Raw scores of the two methods live in different
//! spaces and are only ever compared through rank fusion.

mod dense;
mod sparse;

pub use dense::{DenseIndex, DenseIndexOptions};
pub use sparse::SparseIndex;

use crate::chunking::Chunk;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Retrieval method that produced a score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMethod {
    Sparse,
    Dense,
}

impl fmt::Display for RetrievalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrievalMethod::Sparse => write!(f, "sparse"),
            RetrievalMethod::Dense => write!(f, "dense"),
        }
    }
}

/// One hit from a single adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredResult {
    pub chunk: Chunk,
    /// Backend-native score, comparable only within the same method
    pub score: f32,
    pub method: RetrievalMethod,
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("{method} backend unavailable: {reason}")]
    BackendUnavailable {
        method: RetrievalMethod,
        reason: String,
    },

    #[error("{method} index is empty")]
    IndexEmpty { method: RetrievalMethod },

    #[error("Embedding version mismatch: index built with '{indexed}', provider is '{current}'")]
    EmbeddingVersionMismatch { indexed: String, current: String },

    #[error("Index storage error at {path}: {message}")]
    Storage { path: PathBuf, message: String },
}

impl IndexError {
    pub(crate) fn unavailable(method: RetrievalMethod, reason: impl ToString) -> Self {
        IndexError::BackendUnavailable {
            method,
            reason: reason.to_string(),
        }
    }

    /// Empty indexes answer with zero results rather than failing the query
    pub fn is_empty_index(&self) -> bool {
        matches!(self, IndexError::IndexEmpty { .. })
    }
}

/// Capability shared by every retrieval backend
///
/// Writes are serialized inside the adapter, reads may run concurrently.
#[async_trait]
pub trait IndexAdapter: Send + Sync {
    fn method(&self) -> RetrievalMethod;

    /// Store chunks, overwriting any chunk with the same id
    async fn index(&self, chunks: &[Chunk]) -> Result<usize, IndexError>;

    /// Delete the chunks of one source document whose ordinal is `keep` or higher
    async fn trim_source(&self, source_id: &str, keep: usize) -> Result<usize, IndexError>;

    /// Delete every chunk of one source document
    async fn remove_source(&self, source_id: &str) -> Result<usize, IndexError> {
        self.trim_source(source_id, 0).await
    }

    /// Up to `top_k` results, best first, ties broken by chunk id
    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<ScoredResult>, IndexError>;

    async fn count(&self) -> Result<usize, IndexError>;

    /// Persist buffered state, if the backend has any
    async fn flush(&self) -> Result<(), IndexError> {
        Ok(())
    }
}

/// Order results by score descending, then chunk id ascending
pub(crate) fn sort_scored(results: &mut [ScoredResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
}

/// Map a failed blocking task onto the adapter's error space
pub(crate) fn join_error(method: RetrievalMethod, err: tokio::task::JoinError) -> IndexError {
    IndexError::unavailable(method, format!("index task failed: {}", err))
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::chunking::{chunk_id, Chunk};

    pub fn chunk(source: &str, ordinal: usize, section: &str, text: &str) -> Chunk {
        Chunk {
            id: chunk_id(source, ordinal),
            text: text.to_string(),
            token_count: text.split_whitespace().count(),
            source_id: source.to_string(),
            doc_type: "General Policy".to_string(),
            section: section.to_string(),
            ordinal,
            overlap: false,
        }
    }
}
