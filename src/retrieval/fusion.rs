//! Weighted Reciprocal Rank Fusion for combining sparse and dense results

use super::answer::{FusedResult, MethodHit};
use crate::index::{RetrievalMethod, ScoredResult};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FusionError {
    #[error("Invalid weight configuration: weights must be finite, non-negative and not both zero")]
    InvalidWeights,

    #[error("Invalid RRF constant {0}: must be finite and non-negative")]
    InvalidK(f32),
}

/// Configuration for fusion algorithm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Weight for keyword results
    pub sparse_weight: f32,

    /// Weight for embedding results
    pub dense_weight: f32,

    /// RRF K constant (typically 60)
    pub k_const: f32,

    /// Cap on fused candidates handed to the reranker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_candidates: Option<usize>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            sparse_weight: 0.5,
            dense_weight: 0.5,
            k_const: 60.0,
            max_candidates: Some(50),
        }
    }
}

impl FusionConfig {
    pub fn new(sparse_weight: f32, dense_weight: f32, k_const: f32) -> Result<Self, FusionError> {
        let config = Self {
            sparse_weight,
            dense_weight,
            k_const,
            max_candidates: None,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_candidates(mut self, max_candidates: usize) -> Self {
        self.max_candidates = Some(max_candidates);
        self
    }

    pub fn validate(&self) -> Result<(), FusionError> {
        let valid = |w: f32| w.is_finite() && w >= 0.0;
        if !valid(self.sparse_weight)
            || !valid(self.dense_weight)
            || self.sparse_weight + self.dense_weight == 0.0
        {
            return Err(FusionError::InvalidWeights);
        }
        if !self.k_const.is_finite() || self.k_const < 0.0 {
            return Err(FusionError::InvalidK(self.k_const));
        }
        Ok(())
    }

    fn weight(&self, method: RetrievalMethod) -> f32 {
        match method {
            RetrievalMethod::Sparse => self.sparse_weight,
            RetrievalMethod::Dense => self.dense_weight,
        }
    }
}

/// Normalized RRF contribution per chunk id, best rank kept for duplicates
fn normalized_rrf(
    results: &[ScoredResult],
    k_const: f32,
) -> Vec<(&ScoredResult, MethodHit, f32)> {
    let mut seen = ahash::AHashSet::new();
    let mut entries = Vec::with_capacity(results.len());

    for (idx, result) in results.iter().enumerate() {
        // Lists arrive best-first, so the first occurrence holds the best rank
        if !seen.insert(result.chunk.id.as_str()) {
            continue;
        }
        let rank = idx + 1;
        let hit = MethodHit {
            rank,
            raw_score: result.score,
        };
        entries.push((result, hit, 1.0 / (k_const + rank as f32)));
    }

    let max = entries.iter().map(|(_, _, rrf)| *rrf).fold(0.0f32, f32::max);
    if max > 0.0 {
        for entry in &mut entries {
            entry.2 /= max;
        }
    }
    entries
}

/// Total order of fused results
///
/// Fused score descending, then chunks found by both methods, then the lower
/// best rank, then chunk id.
pub(crate) fn compare_fused(a: &FusedResult, b: &FusedResult) -> Ordering {
    b.fused_score
        .partial_cmp(&a.fused_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.in_both().cmp(&a.in_both()))
        .then_with(|| a.min_rank().cmp(&b.min_rank()))
        .then_with(|| a.chunk.id.cmp(&b.chunk.id))
}

/// Merge sparse and dense rankings into one list
///
/// Each method's RRF values `1 / (k_const + rank)` are divided by that
/// method's best value, weighted, and summed. When the weights add up to more
/// than one the sum is divided by the weight total so scores stay in [0, 1].
/// A method with zero weight contributes nothing, not even candidates.
pub fn fuse(
    sparse: &[ScoredResult],
    dense: &[ScoredResult],
    config: &FusionConfig,
) -> Result<Vec<FusedResult>, FusionError> {
    config.validate()?;

    let scale = (config.sparse_weight + config.dense_weight).max(1.0);
    let mut merged: AHashMap<String, FusedResult> = AHashMap::new();

    for (method, results) in [
        (RetrievalMethod::Sparse, sparse),
        (RetrievalMethod::Dense, dense),
    ] {
        let weight = config.weight(method);
        // A zero-weight method contributes no candidates
        if weight == 0.0 {
            continue;
        }

        for (result, hit, normalized) in normalized_rrf(results, config.k_const) {
            let entry = merged
                .entry(result.chunk.id.clone())
                .or_insert_with(|| FusedResult {
                    chunk: result.chunk.clone(),
                    fused_score: 0.0,
                    sparse: None,
                    dense: None,
                });

            entry.fused_score += weight * normalized / scale;
            match method {
                RetrievalMethod::Sparse => entry.sparse = Some(hit),
                RetrievalMethod::Dense => entry.dense = Some(hit),
            }
        }
    }

    let mut fused: Vec<FusedResult> = merged.into_values().collect();
    for result in &mut fused {
        result.fused_score = result.fused_score.clamp(0.0, 1.0);
    }
    fused.sort_by(compare_fused);

    if let Some(max) = config.max_candidates {
        fused.truncate(max);
    }

    tracing::debug!(
        "Fused {} sparse + {} dense results into {} candidates",
        sparse.len(),
        dense.len(),
        fused.len()
    );

    Ok(fused)
}
