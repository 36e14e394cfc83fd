//! Pipeline facade
//!
//! Build: documents → chunks → both indexes. Query: concurrent retrieval →
//! fusion → optional rerank. All tuning comes from the [`Config`] value the
//! pipeline was built with.

use crate::chunking::{Chunk, Chunker};
use crate::config::Config;
use crate::embedding::build_provider;
use crate::error::Result;
use crate::index::{DenseIndex, DenseIndexOptions, IndexAdapter, SparseIndex};
use crate::ingest::{DocumentFailure, DocumentSource};
use crate::retrieval::{
    CrossEncoderJudge, FusionConfig, HybridRetriever, JudgeLimits, RankedAnswer, RankedResult,
    RerankMode, Reranker, RetrievalError,
};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one index build
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildReport {
    pub documents_seen: usize,
    pub documents_indexed: usize,
    pub chunks_produced: usize,
    pub sparse_indexed: usize,
    pub dense_indexed: usize,
    /// Previously stored chunks replaced during this build
    pub chunks_replaced: usize,
    pub failures: Vec<DocumentFailure>,
}

impl BuildReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Chunk counts per adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub sparse_chunks: usize,
    pub dense_chunks: usize,
}

/// Hybrid retrieval pipeline over a sparse and a dense index
pub struct Pipeline {
    chunker: Chunker,
    sparse: Arc<dyn IndexAdapter>,
    dense: Arc<dyn IndexAdapter>,
    retriever: HybridRetriever,
    reranker: Reranker,
    candidate_multiplier: usize,
}

impl Pipeline {
    /// Assemble a pipeline from already constructed parts
    pub fn new(
        chunker: Chunker,
        sparse: Arc<dyn IndexAdapter>,
        dense: Arc<dyn IndexAdapter>,
        reranker: Reranker,
        fusion: FusionConfig,
        candidate_multiplier: usize,
        adapter_timeout: Duration,
    ) -> Result<Self> {
        let retriever = HybridRetriever::new(
            Arc::clone(&sparse),
            Arc::clone(&dense),
            fusion,
            adapter_timeout,
        )?;

        Ok(Self {
            chunker,
            sparse,
            dense,
            retriever,
            reranker,
            candidate_multiplier: candidate_multiplier.max(1),
        })
    }

    /// Open on-disk indexes under `storage.data_dir` and load models per `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let chunker = Chunker::new(config.chunking)?;

        let sparse = SparseIndex::open(
            config.storage.sparse_dir(),
            config.indexing.writer_memory_bytes,
        )?;

        let provider = build_provider(&config.embedding)?;
        info!("Embedding function: {}", provider.version());
        let dense = DenseIndex::open(
            provider,
            DenseIndexOptions {
                hnsw_m: config.indexing.hnsw_m,
                ef_construction: config.indexing.hnsw_ef_construction,
                ef_search: config.indexing.hnsw_ef_search,
                batch_size: config.embedding.batch_size,
                snapshot_path: Some(config.storage.dense_snapshot()),
                ..Default::default()
            },
        )?;

        let reranker = if config.reranking.use_llm {
            match CrossEncoderJudge::new(&config.reranking.judge_model) {
                Ok(judge) => Reranker::with_judge(
                    Arc::new(judge),
                    JudgeLimits {
                        timeout: config.reranking.judge_timeout(),
                        concurrency: config.reranking.judge_concurrency,
                    },
                ),
                Err(e) => {
                    warn!("Relevance judge failed to load: {}", e);
                    Reranker::judge_unavailable(e.to_string())
                }
            }
        } else {
            Reranker::heuristic()
        };

        Self::new(
            chunker,
            Arc::new(sparse),
            Arc::new(dense),
            reranker,
            config.fusion.clone(),
            config.retrieval.candidate_multiplier,
            config.retrieval.adapter_timeout(),
        )
    }

    /// Chunk every document of `source` and (re)index it in both adapters
    ///
    /// A document's new chunks replace its previous ones, so rebuilding an
    /// unchanged set is a no-op in content and count.
    /// Unreadable or unchunkable documents are reported, not fatal. Adapter
    /// failures abort the build.
    pub async fn build_index(&self, source: &dyn DocumentSource) -> Result<BuildReport> {
        let batch = source.list_documents()?;
        let mut report = BuildReport {
            documents_seen: batch.documents.len() + batch.failures.len(),
            failures: batch.failures,
            ..Default::default()
        };

        info!("Indexing {} documents", batch.documents.len());

        for document in &batch.documents {
            let chunks = match self.chunker.chunk(document) {
                Ok(chunks) => chunks,
                Err(e) => {
                    warn!("Skipping {}: {}", document.source_id, e);
                    report
                        .failures
                        .push(DocumentFailure::new(&document.source_id, e.to_string()));
                    continue;
                }
            };

            report.chunks_replaced += self.replace(&document.source_id, &chunks).await?;
            report.chunks_produced += chunks.len();
            report.documents_indexed += 1;

            debug!(
                "Indexed {} ({} chunks)",
                document.source_id,
                chunks.len()
            );
        }

        tokio::try_join!(self.sparse.flush(), self.dense.flush())?;

        let (sparse_total, dense_total) = tokio::try_join!(self.sparse.count(), self.dense.count())?;
        report.sparse_indexed = sparse_total;
        report.dense_indexed = dense_total;

        info!(
            "Build finished: {} documents, {} chunks, {} failures",
            report.documents_indexed,
            report.chunks_produced,
            report.failures.len()
        );

        Ok(report)
    }

    /// Swap one document's chunks in both adapters, returning how many old chunks it had
    ///
    /// New chunks overwrite old ones by id before the leftover tail is
    /// trimmed, so a failed write never leaves the document missing.
    async fn replace(&self, source_id: &str, chunks: &[Chunk]) -> Result<usize> {
        let (sparse_before, dense_before) =
            tokio::try_join!(self.sparse.count(), self.dense.count())?;
        tokio::try_join!(self.sparse.index(chunks), self.dense.index(chunks))?;
        tokio::try_join!(
            self.sparse.trim_source(source_id, chunks.len()),
            self.dense.trim_source(source_id, chunks.len())
        )?;
        let (sparse_after, dense_after) =
            tokio::try_join!(self.sparse.count(), self.dense.count())?;

        let previous = |before: usize, after: usize| (before + chunks.len()).saturating_sub(after);
        Ok(previous(sparse_before, sparse_after).max(previous(dense_before, dense_after)))
    }

    /// Search both indexes, fuse, and optionally rerank
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        use_reranking: bool,
    ) -> std::result::Result<RankedAnswer, RetrievalError> {
        self.search_with_cancel(query, top_k, use_reranking, &CancellationToken::new())
            .await
    }

    /// [`Pipeline::search`] that stops as soon as `cancel` fires
    pub async fn search_with_cancel(
        &self,
        query: &str,
        top_k: usize,
        use_reranking: bool,
        cancel: &CancellationToken,
    ) -> std::result::Result<RankedAnswer, RetrievalError> {
        if top_k == 0 {
            return Err(RetrievalError::InvalidQuery(
                "top_k must be greater than 0".to_string(),
            ));
        }

        let per_method_k = top_k.saturating_mul(self.candidate_multiplier);
        let retrieval = self.retriever.retrieve(query, per_method_k, cancel).await?;

        let mut answer = if use_reranking {
            self.reranker
                .rerank_with_cancel(query, retrieval.candidates, top_k, cancel)
                .await?
        } else {
            RankedAnswer {
                query: query.to_string(),
                results: retrieval
                    .candidates
                    .into_iter()
                    .take(top_k)
                    .map(RankedResult::from_fused)
                    .collect(),
                rerank_mode: RerankMode::None,
                degradations: Vec::new(),
            }
        };

        // Retrieval degradations come first, they happened first
        let mut degradations = retrieval.degradations;
        degradations.append(&mut answer.degradations);
        answer.degradations = degradations;

        info!(
            "Answered query with {} results (rerank: {}, degraded: {})",
            answer.len(),
            answer.rerank_mode,
            answer.is_degraded()
        );

        Ok(answer)
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        let (sparse_chunks, dense_chunks) =
            tokio::try_join!(self.sparse.count(), self.dense.count())?;
        Ok(IndexStats {
            sparse_chunks,
            dense_chunks,
        })
    }

    pub fn rerank_mode(&self) -> RerankMode {
        self.reranker.mode()
    }
}

/// Human-readable report of an answer
pub fn format_answer(answer: &RankedAnswer) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Query: {}", answer.query);
    let _ = writeln!(out, "Rerank: {}", answer.rerank_mode);
    for degradation in &answer.degradations {
        let _ = writeln!(out, "Warning: {}", degradation);
    }

    if answer.is_empty() {
        let _ = writeln!(out, "\nNo results found.");
        return out;
    }

    for (i, result) in answer.results.iter().enumerate() {
        let chunk = result.chunk();
        let methods: Vec<String> = result
            .fused
            .methods()
            .iter()
            .map(|m| m.to_string())
            .collect();

        let _ = writeln!(out);
        let _ = write!(out, "{}. {}", i + 1, chunk.source_id);
        if !chunk.section.is_empty() && chunk.section != chunk.source_id {
            let _ = write!(out, " > {}", chunk.section);
        }
        let _ = writeln!(out, "  [{}]  ({})", methods.join("+"), chunk.doc_type);

        let _ = writeln!(
            out,
            "   Rerank Score: {:.4} ({:?})  Fused Score: {:.4}",
            result.rerank_score, result.score_source, result.fused.fused_score
        );

        let mut per_method = Vec::new();
        if let Some(hit) = &result.fused.sparse {
            per_method.push(format!("Sparse: #{} ({:.4})", hit.rank, hit.raw_score));
        }
        if let Some(hit) = &result.fused.dense {
            per_method.push(format!("Dense: #{} ({:.4})", hit.rank, hit.raw_score));
        }
        let _ = writeln!(out, "   {}", per_method.join("  "));

        if let Some(rationale) = &result.rationale {
            let _ = writeln!(out, "   Rationale: {}", rationale);
        }
        let _ = writeln!(
            out,
            "   Content: {}",
            chunk.preview(200).replace('\n', " ")
        );
    }

    out
}
