//! Hybrid retrieval, rank fusion and reranking
//!
//! Sparse and dense adapters are queried concurrently, their rankings merged
//! with weighted Reciprocal Rank Fusion, and the shortlist reranked by a
//! relevance judge or a term-overlap heuristic.

mod answer;
mod fusion;
mod hybrid;
mod reranker;

pub use answer::{
    Degradation, FusedResult, MethodHit, RankedAnswer, RankedResult, RerankMode, ScoreSource,
};
pub use fusion::{fuse, FusionConfig, FusionError};
pub use hybrid::{HybridRetriever, Retrieval};
pub use reranker::{
    term_overlap, CrossEncoderJudge, JudgeError, JudgeLimits, Judgement, RelevanceJudge, Reranker,
};

use crate::index::IndexError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("No retrieval backend available ({0})")]
    RetrievalUnavailable(String),

    #[error("Query cancelled")]
    Cancelled,

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Fusion(#[from] FusionError),
}

#[cfg(test)]
pub(crate) use hybrid::tests::MockAdapter;
