//! Concurrent sparse + dense retrieval followed by fusion

use super::answer::{Degradation, FusedResult};
use super::fusion::{fuse, FusionConfig};
use super::RetrievalError;
use crate::index::{IndexAdapter, IndexError, RetrievalMethod, ScoredResult};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Fused candidates plus whatever degraded along the way
#[derive(Debug, Clone, Default)]
pub struct Retrieval {
    pub candidates: Vec<FusedResult>,
    pub degradations: Vec<Degradation>,
}

/// What one adapter call produced
enum MethodOutcome {
    Results(Vec<ScoredResult>),
    Unavailable(String),
    TimedOut,
}

/// Hybrid retriever fanning out to both adapters
pub struct HybridRetriever {
    sparse: Arc<dyn IndexAdapter>,
    dense: Arc<dyn IndexAdapter>,
    fusion: FusionConfig,
    adapter_timeout: Duration,
}

impl HybridRetriever {
    pub fn new(
        sparse: Arc<dyn IndexAdapter>,
        dense: Arc<dyn IndexAdapter>,
        fusion: FusionConfig,
        adapter_timeout: Duration,
    ) -> Result<Self, RetrievalError> {
        fusion.validate()?;
        Ok(Self {
            sparse,
            dense,
            fusion,
            adapter_timeout,
        })
    }

    pub fn fusion_config(&self) -> &FusionConfig {
        &self.fusion
    }

    /// Query both adapters for `per_method_k` results each and fuse them
    pub async fn retrieve(
        &self,
        query: &str,
        per_method_k: usize,
        cancel: &CancellationToken,
    ) -> Result<Retrieval, RetrievalError> {
        if query.trim().is_empty() {
            return Err(RetrievalError::InvalidQuery(
                "Query text cannot be empty".to_string(),
            ));
        }

        let (sparse, dense) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetrievalError::Cancelled),
            outcomes = async {
                tokio::join!(
                    self.query_adapter(self.sparse.as_ref(), query, per_method_k),
                    self.query_adapter(self.dense.as_ref(), query, per_method_k)
                )
            } => outcomes,
        };

        let (sparse, dense) = (sparse?, dense?);

        let mut degradations = Vec::new();
        let mut unavailable = Vec::new();
        let mut lists = Vec::with_capacity(2);

        for (method, outcome) in [
            (RetrievalMethod::Sparse, sparse),
            (RetrievalMethod::Dense, dense),
        ] {
            match outcome {
                MethodOutcome::Results(results) => lists.push(results),
                MethodOutcome::Unavailable(reason) => {
                    tracing::warn!("{} retrieval unavailable: {}", method, reason);
                    unavailable.push(format!("{}: {}", method, reason));
                    degradations.push(match method {
                        RetrievalMethod::Sparse => Degradation::SparseUnavailable { reason },
                        RetrievalMethod::Dense => Degradation::DenseUnavailable { reason },
                    });
                    lists.push(Vec::new());
                }
                MethodOutcome::TimedOut => {
                    tracing::warn!(
                        "{} retrieval timed out after {:?}",
                        method,
                        self.adapter_timeout
                    );
                    unavailable.push(format!("{}: timed out", method));
                    degradations.push(match method {
                        RetrievalMethod::Sparse => Degradation::SparseTimedOut,
                        RetrievalMethod::Dense => Degradation::DenseTimedOut,
                    });
                    lists.push(Vec::new());
                }
            }
        }

        if unavailable.len() == 2 {
            return Err(RetrievalError::RetrievalUnavailable(unavailable.join("; ")));
        }

        let candidates = fuse(&lists[0], &lists[1], &self.fusion)?;
        tracing::debug!(
            "Retrieved {} sparse, {} dense, {} fused",
            lists[0].len(),
            lists[1].len(),
            candidates.len()
        );

        Ok(Retrieval {
            candidates,
            degradations,
        })
    }

    /// One timeout-bounded adapter call; only fatal index errors escape
    async fn query_adapter(
        &self,
        adapter: &dyn IndexAdapter,
        query: &str,
        top_k: usize,
    ) -> Result<MethodOutcome, RetrievalError> {
        match tokio::time::timeout(self.adapter_timeout, adapter.query(query, top_k)).await {
            Err(_) => Ok(MethodOutcome::TimedOut),
            Ok(Ok(results)) => Ok(MethodOutcome::Results(results)),
            Ok(Err(IndexError::IndexEmpty { method })) => {
                tracing::debug!("{} index is empty", method);
                Ok(MethodOutcome::Results(Vec::new()))
            }
            Ok(Err(IndexError::BackendUnavailable { reason, .. })) => {
                Ok(MethodOutcome::Unavailable(reason))
            }
            Ok(Err(IndexError::Storage { path, message })) => Ok(MethodOutcome::Unavailable(
                format!("{}: {}", path.display(), message),
            )),
            Ok(Err(fatal @ IndexError::EmbeddingVersionMismatch { .. })) => Err(fatal.into()),
        }
    }
}
