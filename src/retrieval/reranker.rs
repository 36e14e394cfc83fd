//! Second-pass reranking of fused candidates
//!
//! A relevance judge scores every candidate; when it cannot, candidates keep
//! their fused score or the whole set falls back to term-overlap scoring.

use super::answer::{Degradation, FusedResult, RankedAnswer, RankedResult, RerankMode, ScoreSource};
use super::RetrievalError;
use crate::embedding::terms;
use ahash::AHashSet;
use async_trait::async_trait;
use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum JudgeError {
    #[error("Relevance judge unavailable: {0}")]
    Unavailable(String),

    #[error("Relevance judge timed out after {0:?}")]
    Timeout(Duration),

    #[error("Relevance judge returned invalid score: {0}")]
    InvalidScore(f32),

    #[error("Relevance judge failed: {0}")]
    Failed(String),
}

/// Relevance of one text to a query
#[derive(Debug, Clone, PartialEq)]
pub struct Judgement {
    /// In [0, 1]
    pub score: f32,
    pub rationale: Option<String>,
}

/// External scorer of query/text relevance
#[async_trait]
pub trait RelevanceJudge: Send + Sync {
    fn name(&self) -> &str;

    async fn judge(&self, query: &str, text: &str) -> Result<Judgement, JudgeError>;
}

/// Cross-encoder judge running locally through FastEmbed
///
/// Raw logits are mapped to [0, 1] with the logistic function.
pub struct CrossEncoderJudge {
    model: Arc<TextRerank>,
    model_name: String,
}

impl CrossEncoderJudge {
    /// Load the cross-encoder
    ///
    /// **Important**: the model (~280MB) is downloaded on first use.
    pub fn new(model_name: &str) -> Result<Self, JudgeError> {
        let model = match model_name {
            "bge-reranker-base" | "BAAI/bge-reranker-base" => RerankerModel::BGERerankerBase,
            other => {
                return Err(JudgeError::Unavailable(format!(
                    "Unsupported reranker model: {}. Supported: bge-reranker-base",
                    other
                )))
            }
        };

        tracing::info!("Initializing reranker model: {}", model_name);

        let init_options = RerankInitOptions::new(model).with_show_download_progress(true);
        let model = TextRerank::try_new(init_options)
            .map_err(|e| JudgeError::Unavailable(e.to_string()))?;

        Ok(Self {
            model: Arc::new(model),
            model_name: model_name.to_string(),
        })
    }

    /// Create judge with default model
    pub fn with_default_model() -> Result<Self, JudgeError> {
        Self::new("bge-reranker-base")
    }
}

fn sigmoid(logit: f32) -> f32 {
    1.0 / (1.0 + (-logit).exp())
}

#[async_trait]
impl RelevanceJudge for CrossEncoderJudge {
    fn name(&self) -> &str {
        &self.model_name
    }

    async fn judge(&self, query: &str, text: &str) -> Result<Judgement, JudgeError> {
        let model = Arc::clone(&self.model);
        let query = query.to_string();
        let text = text.to_string();

        let logit = tokio::task::spawn_blocking(move || {
            model
                .rerank(query.as_str(), vec![text.as_str()], false, None)
                .map_err(|e| JudgeError::Failed(e.to_string()))?
                .into_iter()
                .next()
                .map(|r| r.score)
                .ok_or_else(|| JudgeError::Failed("No rerank score returned".to_string()))
        })
        .await
        .map_err(|e| JudgeError::Failed(e.to_string()))??;

        Ok(Judgement {
            score: sigmoid(logit),
            rationale: None,
        })
    }
}

/// Limits applied to judge calls
#[derive(Debug, Clone, Copy)]
pub struct JudgeLimits {
    pub timeout: Duration,
    pub concurrency: usize,
}

impl Default for JudgeLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5_000),
            concurrency: 4,
        }
    }
}

enum Strategy {
    Judge(Arc<dyn RelevanceJudge>),
    /// A judge was requested but could not be constructed
    JudgeUnavailable(String),
    Heuristic,
}

/// Reranker over fused candidates
pub struct Reranker {
    strategy: Strategy,
    limits: JudgeLimits,
}

impl Reranker {
    pub fn with_judge(judge: Arc<dyn RelevanceJudge>, limits: JudgeLimits) -> Self {
        Self {
            strategy: Strategy::Judge(judge),
            limits,
        }
    }

    /// Term-overlap reranking chosen by configuration
    pub fn heuristic() -> Self {
        Self {
            strategy: Strategy::Heuristic,
            limits: JudgeLimits::default(),
        }
    }

    /// A judge was configured but failed to load; answers are flagged degraded
    pub fn judge_unavailable(reason: impl Into<String>) -> Self {
        Self {
            strategy: Strategy::JudgeUnavailable(reason.into()),
            limits: JudgeLimits::default(),
        }
    }

    pub fn mode(&self) -> RerankMode {
        match self.strategy {
            Strategy::Judge(_) => RerankMode::Judge,
            Strategy::JudgeUnavailable(_) | Strategy::Heuristic => RerankMode::Heuristic,
        }
    }

    /// Rerank `candidates` and keep the best `top_k`
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<FusedResult>,
        top_k: usize,
    ) -> RankedAnswer {
        let (results, rerank_mode, degradations) = self.rank(query, candidates, top_k).await;
        RankedAnswer {
            query: query.to_string(),
            results,
            rerank_mode,
            degradations,
        }
    }

    /// Same as [`Reranker::rerank`], abandoning judge calls once `cancel` fires
    pub async fn rerank_with_cancel(
        &self,
        query: &str,
        candidates: Vec<FusedResult>,
        top_k: usize,
        cancel: &CancellationToken,
    ) -> Result<RankedAnswer, RetrievalError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RetrievalError::Cancelled),
            answer = self.rerank(query, candidates, top_k) => Ok(answer),
        }
    }

    async fn rank(
        &self,
        query: &str,
        candidates: Vec<FusedResult>,
        top_k: usize,
    ) -> (Vec<RankedResult>, RerankMode, Vec<Degradation>) {
        match &self.strategy {
            Strategy::Heuristic => (
                heuristic_rank(query, candidates, top_k),
                RerankMode::Heuristic,
                Vec::new(),
            ),
            Strategy::JudgeUnavailable(reason) => {
                tracing::warn!("Relevance judge unavailable, using heuristic reranking");
                (
                    heuristic_rank(query, candidates, top_k),
                    RerankMode::Heuristic,
                    vec![Degradation::JudgeUnavailable {
                        reason: reason.clone(),
                    }],
                )
            }
            Strategy::Judge(judge) => self.judge_rank(judge, query, candidates, top_k).await,
        }
    }

    async fn judge_rank(
        &self,
        judge: &Arc<dyn RelevanceJudge>,
        query: &str,
        candidates: Vec<FusedResult>,
        top_k: usize,
    ) -> (Vec<RankedResult>, RerankMode, Vec<Degradation>) {
        if candidates.is_empty() {
            return (Vec::new(), RerankMode::Judge, Vec::new());
        }

        let semaphore = Arc::new(Semaphore::new(self.limits.concurrency.max(1)));
        let timeout = self.limits.timeout;

        let calls = candidates.iter().map(|candidate| {
            let semaphore = Arc::clone(&semaphore);
            let judge = Arc::clone(judge);
            let text = candidate.chunk.text.as_str();
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| JudgeError::Unavailable("judge semaphore closed".to_string()))?;
                let judgement = tokio::time::timeout(timeout, judge.judge(query, text))
                    .await
                    .map_err(|_| JudgeError::Timeout(timeout))??;
                if !judgement.score.is_finite() {
                    return Err(JudgeError::InvalidScore(judgement.score));
                }
                Ok(Judgement {
                    score: judgement.score.clamp(0.0, 1.0),
                    rationale: judgement.rationale,
                })
            }
        });
        let outcomes = futures::future::join_all(calls).await;

        let failed = outcomes.iter().filter(|o| o.is_err()).count();
        if failed == outcomes.len() {
            let all_unavailable = outcomes
                .iter()
                .all(|o| matches!(o, Err(JudgeError::Unavailable(_))));
            let degradation = match outcomes.iter().find_map(|o| o.as_ref().err()) {
                Some(JudgeError::Unavailable(reason)) if all_unavailable => {
                    Degradation::JudgeUnavailable {
                        reason: reason.clone(),
                    }
                }
                _ => Degradation::JudgeFailed,
            };
            tracing::warn!(
                "All {} judge calls failed via {}, using heuristic reranking",
                failed,
                judge.name()
            );
            return (
                heuristic_rank(query, candidates, top_k),
                RerankMode::Heuristic,
                vec![degradation],
            );
        }

        let mut degradations = Vec::new();
        if failed > 0 {
            tracing::warn!(
                "{} of {} judge calls failed, keeping fused scores",
                failed,
                outcomes.len()
            );
            degradations.push(Degradation::PartialJudgeFallback { failed });
        }

        let results = candidates
            .into_iter()
            .zip(outcomes)
            .map(|(fused, outcome)| match outcome {
                Ok(judgement) => RankedResult {
                    fused,
                    rerank_score: judgement.score,
                    score_source: ScoreSource::Judge,
                    rationale: judgement.rationale,
                },
                Err(err) => {
                    tracing::debug!("Judge call for {} failed: {}", fused.chunk.id, err);
                    RankedResult::from_fused(fused)
                }
            })
            .collect();

        (order(results, top_k), RerankMode::Judge, degradations)
    }
}

/// Fraction of distinct query terms present in `text`, with the match count
pub fn term_overlap(query: &str, text: &str) -> (f32, usize, usize) {
    let query_terms: AHashSet<String> = terms(query).collect();
    if query_terms.is_empty() {
        return (0.0, 0, 0);
    }
    let text_terms: AHashSet<String> = terms(text).collect();
    let matched = query_terms
        .iter()
        .filter(|t| text_terms.contains(*t))
        .count();
    (
        matched as f32 / query_terms.len() as f32,
        matched,
        query_terms.len(),
    )
}

fn heuristic_rank(query: &str, candidates: Vec<FusedResult>, top_k: usize) -> Vec<RankedResult> {
    let results = candidates
        .into_iter()
        .map(|fused| {
            let (score, matched, total) = term_overlap(query, &fused.chunk.text);
            RankedResult {
                fused,
                rerank_score: score,
                score_source: ScoreSource::Heuristic,
                rationale: Some(format!("matched {} of {} query terms", matched, total)),
            }
        })
        .collect();
    order(results, top_k)
}

/// Rerank score desc, fused score desc, chunk id asc
pub(crate) fn compare_ranked(a: &RankedResult, b: &RankedResult) -> Ordering {
    b.rerank_score
        .partial_cmp(&a.rerank_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            b.fused
                .fused_score
                .partial_cmp(&a.fused.fused_score)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.fused.chunk.id.cmp(&b.fused.chunk.id))
}

fn order(mut results: Vec<RankedResult>, top_k: usize) -> Vec<RankedResult> {
    results.sort_by(compare_ranked);
    results.truncate(top_k);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::test_support::chunk;
    use crate::retrieval::answer::MethodHit;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn candidate(source: &str, text: &str, fused_score: f32) -> FusedResult {
        FusedResult {
            chunk: chunk(source, 0, "", text),
            fused_score,
            sparse: Some(MethodHit {
                rank: 1,
                raw_score: 1.0,
            }),
            dense: None,
        }
    }

    fn candidates() -> Vec<FusedResult> {
        vec![
            candidate("leave.md", "Sick leave requires a doctor's note.", 0.9),
            candidate("remote.md", "Remote work up to 3 days/week with manager approval.", 0.5),
            candidate("security.md", "Passwords rotate every ninety days.", 0.7),
        ]
    }

    fn sources(answer: &RankedAnswer) -> Vec<&str> {
        answer
            .results
            .iter()
            .map(|r| r.chunk().source_id.as_str())
            .collect()
    }

    /// Scores by keyword, fails on texts containing "fail"
    struct KeywordJudge;

    #[async_trait]
    impl RelevanceJudge for KeywordJudge {
        fn name(&self) -> &str {
            "keyword"
        }

        async fn judge(&self, _query: &str, text: &str) -> Result<Judgement, JudgeError> {
            if text.contains("Passwords") {
                return Err(JudgeError::Failed("boom".to_string()));
            }
            let score = if text.contains("Remote") { 0.95 } else { 0.1 };
            Ok(Judgement {
                score,
                rationale: Some("keyword".to_string()),
            })
        }
    }

    struct FailingJudge {
        error: JudgeError,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RelevanceJudge for FailingJudge {
        fn name(&self) -> &str {
            "failing"
        }

        async fn judge(&self, _query: &str, _text: &str) -> Result<Judgement, JudgeError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            Err(self.error.clone())
        }
    }

    struct SlowJudge;

    #[async_trait]
    impl RelevanceJudge for SlowJudge {
        fn name(&self) -> &str {
            "slow"
        }

        async fn judge(&self, _query: &str, _text: &str) -> Result<Judgement, JudgeError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Judgement {
                score: 1.0,
                rationale: None,
            })
        }
    }

    /// Records how many calls overlap
    #[derive(Default)]
    struct CountingJudge {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl RelevanceJudge for CountingJudge {
        fn name(&self) -> &str {
            "counting"
        }

        async fn judge(&self, _query: &str, _text: &str) -> Result<Judgement, JudgeError> {
            let now = self.in_flight.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            self.peak.fetch_max(now, AtomicOrdering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, AtomicOrdering::SeqCst);
            Ok(Judgement {
                score: 0.5,
                rationale: None,
            })
        }
    }

    #[test]
    fn test_term_overlap() {
        let (score, matched, total) = term_overlap("Remote work policy", "remote WORK, 3 days");
        assert_eq!((matched, total), (2, 3));
        assert!((score - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(term_overlap("?!", "anything").0, 0.0);
    }

    #[test]
    fn test_sigmoid() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(8.0) > 0.99);
        assert!(sigmoid(-8.0) < 0.01);
    }

    #[tokio::test]
    async fn test_heuristic_order() {
        let reranker = Reranker::heuristic();
        let answer = reranker.rerank("remote work policy", candidates(), 10).await;

        assert_eq!(answer.rerank_mode, RerankMode::Heuristic);
        assert!(!answer.is_degraded());
        assert_eq!(sources(&answer), vec!["remote.md", "leave.md", "security.md"]);
        assert_eq!(answer.results[0].score_source, ScoreSource::Heuristic);
        assert_eq!(
            answer.results[0].rationale.as_deref(),
            Some("matched 2 of 3 query terms")
        );
    }

    #[tokio::test]
    async fn test_partial_judge_failure_keeps_fused_score() {
        let reranker = Reranker::with_judge(Arc::new(KeywordJudge), JudgeLimits::default());
        let answer = reranker.rerank("remote work", candidates(), 10).await;

        assert_eq!(answer.rerank_mode, RerankMode::Judge);
        assert_eq!(answer.len(), 3);
        assert_eq!(
            answer.degradations,
            vec![Degradation::PartialJudgeFallback { failed: 1 }]
        );
        // remote 0.95 (judge), security 0.7 (fused fallback), leave 0.1 (judge)
        assert_eq!(sources(&answer), vec!["remote.md", "security.md", "leave.md"]);
        assert_eq!(answer.results[1].score_source, ScoreSource::Fused);
        assert_eq!(answer.results[1].rerank_score, 0.7);
    }

    #[tokio::test]
    async fn test_total_judge_failure_falls_back_to_heuristic() {
        let judge = Arc::new(FailingJudge {
            error: JudgeError::Failed("malformed".to_string()),
            calls: AtomicUsize::new(0),
        });
        let reranker = Reranker::with_judge(judge.clone(), JudgeLimits::default());
        let answer = reranker.rerank("remote work policy", candidates(), 2).await;

        let heuristic = Reranker::heuristic()
            .rerank("remote work policy", candidates(), 2)
            .await;

        assert_eq!(judge.calls.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(answer.rerank_mode, RerankMode::Heuristic);
        assert_eq!(answer.degradations, vec![Degradation::JudgeFailed]);
        assert_eq!(answer.results, heuristic.results);
        assert_eq!(answer.len(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_judge_is_flagged() {
        let judge = Arc::new(FailingJudge {
            error: JudgeError::Unavailable("offline".to_string()),
            calls: AtomicUsize::new(0),
        });
        let answer = Reranker::with_judge(judge, JudgeLimits::default())
            .rerank("remote", candidates(), 10)
            .await;
        assert_eq!(
            answer.degradations,
            vec![Degradation::JudgeUnavailable {
                reason: "offline".to_string()
            }]
        );

        let answer = Reranker::judge_unavailable("model missing")
            .rerank("remote", candidates(), 10)
            .await;
        assert!(answer.is_degraded());
        assert_eq!(answer.rerank_mode, RerankMode::Heuristic);
        assert_eq!(answer.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_judge_timeout() {
        let limits = JudgeLimits {
            timeout: Duration::from_millis(100),
            concurrency: 2,
        };
        let answer = Reranker::with_judge(Arc::new(SlowJudge), limits)
            .rerank("remote work", candidates(), 10)
            .await;

        assert_eq!(answer.degradations, vec![Degradation::JudgeFailed]);
        assert_eq!(answer.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_judge_calls_respect_concurrency() {
        let judge = Arc::new(CountingJudge::default());
        let limits = JudgeLimits {
            timeout: Duration::from_secs(5),
            concurrency: 3,
        };
        let many: Vec<FusedResult> = (0..10)
            .map(|i| candidate(&format!("policy_{}.md", i), "leave policy", 0.5))
            .collect();

        let start = tokio::time::Instant::now();
        let answer = Reranker::with_judge(judge.clone(), limits)
            .rerank("leave", many, 10)
            .await;

        assert_eq!(answer.len(), 10);
        assert!(!answer.is_degraded());
        assert_eq!(judge.peak.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(judge.in_flight.load(AtomicOrdering::SeqCst), 0);
        // Four waves of 50ms: 3 + 3 + 3 + 1
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_cancelled_rerank() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = Reranker::with_judge(Arc::new(SlowJudge), JudgeLimits::default())
            .rerank_with_cancel("remote", candidates(), 10, &cancel)
            .await;
        assert!(matches!(result, Err(RetrievalError::Cancelled)));
    }

    #[tokio::test]
    async fn test_empty_candidates() {
        let answer = Reranker::with_judge(Arc::new(KeywordJudge), JudgeLimits::default())
            .rerank("remote", Vec::new(), 5)
            .await;
        assert!(answer.is_empty());
        assert!(!answer.is_degraded());
    }

    #[test]
    #[ignore] // Requires model download
    fn test_cross_encoder_judge() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let judge = CrossEncoderJudge::with_default_model().unwrap();
        let relevant = rt
            .block_on(judge.judge("capital of France", "Paris is the capital of France."))
            .unwrap();
        let irrelevant = rt
            .block_on(judge.judge("capital of France", "The weather is nice today."))
            .unwrap();
        assert!(relevant.score > irrelevant.score);
    }
}
