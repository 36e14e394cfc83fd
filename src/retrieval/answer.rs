//! Result structures shared by fusion, reranking and the pipeline

use crate::chunking::Chunk;
use crate::index::RetrievalMethod;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position and raw score of a chunk in one method's result list
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MethodHit {
    /// 1-based rank
    pub rank: usize,
    pub raw_score: f32,
}

/// A chunk after rank fusion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedResult {
    pub chunk: Chunk,
    /// In [0, 1], comparable only within one query's result set
    pub fused_score: f32,
    pub sparse: Option<MethodHit>,
    pub dense: Option<MethodHit>,
}

impl FusedResult {
    /// Methods that returned this chunk
    pub fn methods(&self) -> Vec<RetrievalMethod> {
        let mut methods = Vec::with_capacity(2);
        if self.sparse.is_some() {
            methods.push(RetrievalMethod::Sparse);
        }
        if self.dense.is_some() {
            methods.push(RetrievalMethod::Dense);
        }
        methods
    }

    pub fn hit(&self, method: RetrievalMethod) -> Option<&MethodHit> {
        match method {
            RetrievalMethod::Sparse => self.sparse.as_ref(),
            RetrievalMethod::Dense => self.dense.as_ref(),
        }
    }

    pub fn in_both(&self) -> bool {
        self.sparse.is_some() && self.dense.is_some()
    }

    /// Best rank across methods
    pub fn min_rank(&self) -> usize {
        self.sparse
            .iter()
            .chain(self.dense.iter())
            .map(|h| h.rank)
            .min()
            .unwrap_or(usize::MAX)
    }
}

/// Where a ranked result's rerank score came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreSource {
    Judge,
    Heuristic,
    /// Pre-rerank fused score, kept when reranking was skipped or a judge call failed
    Fused,
}

/// Reranking strategy that produced the final order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RerankMode {
    Judge,
    Heuristic,
    None,
}

impl fmt::Display for RerankMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RerankMode::Judge => write!(f, "judge"),
            RerankMode::Heuristic => write!(f, "heuristic"),
            RerankMode::None => write!(f, "none"),
        }
    }
}

/// Something that went wrong while answering, without failing the query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    SparseUnavailable { reason: String },
    DenseUnavailable { reason: String },
    SparseTimedOut,
    DenseTimedOut,
    JudgeUnavailable { reason: String },
    /// Every judge call failed, heuristic order used instead
    JudgeFailed,
    /// Some candidates kept their fused score
    PartialJudgeFallback { failed: usize },
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Degradation::SparseUnavailable { reason } => {
                write!(f, "keyword retrieval unavailable: {}", reason)
            }
            Degradation::DenseUnavailable { reason } => {
                write!(f, "vector retrieval unavailable: {}", reason)
            }
            Degradation::SparseTimedOut => write!(f, "keyword retrieval timed out"),
            Degradation::DenseTimedOut => write!(f, "vector retrieval timed out"),
            Degradation::JudgeUnavailable { reason } => {
                write!(f, "relevance judge unavailable ({}), heuristic reranking used", reason)
            }
            Degradation::JudgeFailed => {
                write!(f, "all relevance judge calls failed, heuristic reranking used")
            }
            Degradation::PartialJudgeFallback { failed } => {
                write!(f, "{} judge call(s) failed, fused scores kept", failed)
            }
        }
    }
}

/// One entry of the final answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    #[serde(flatten)]
    pub fused: FusedResult,
    pub rerank_score: f32,
    pub score_source: ScoreSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl RankedResult {
    /// Carry a fused result through unchanged
    pub fn from_fused(fused: FusedResult) -> Self {
        Self {
            rerank_score: fused.fused_score,
            fused,
            score_source: ScoreSource::Fused,
            rationale: None,
        }
    }

    pub fn chunk(&self) -> &Chunk {
        &self.fused.chunk
    }
}

/// Final ranked output of one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedAnswer {
    pub query: String,
    pub results: Vec<RankedResult>,
    pub rerank_mode: RerankMode,
    pub degradations: Vec<Degradation>,
}

impl RankedAnswer {
    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }
}
