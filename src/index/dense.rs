/// HNSW vector index for similarity search
use super::{join_error, sort_scored, IndexAdapter, IndexError, RetrievalMethod, ScoredResult};
use crate::chunking::Chunk;
use crate::embedding::{EmbeddingError, EmbeddingProvider};
use ahash::AHashMap;
use async_trait::async_trait;
use hnsw_rs::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

const METHOD: RetrievalMethod = RetrievalMethod::Dense;
const SNAPSHOT_FORMAT: u32 = 1;

/// HNSW and storage parameters
#[derive(Debug, Clone)]
pub struct DenseIndexOptions {
    /// Number of connections per layer
    pub hnsw_m: usize,
    /// Construction parameter (higher = better recall, slower build)
    pub ef_construction: usize,
    /// Search parameter (higher = better recall, slower search)
    pub ef_search: usize,
    /// Capacity hint for the graph
    pub max_elements: usize,
    /// Chunks embedded per provider call
    pub batch_size: usize,
    /// JSON snapshot written on flush and read on open
    pub snapshot_path: Option<PathBuf>,
}

impl Default for DenseIndexOptions {
    fn default() -> Self {
        Self {
            hnsw_m: 16,
            ef_construction: 200,
            ef_search: 64,
            max_elements: 100_000,
            batch_size: 32,
            snapshot_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredVector {
    chunk: Chunk,
    vector: Vec<f32>,
    version: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    format: u32,
    version: Option<String>,
    dimension: usize,
    vectors: Vec<StoredVector>,
}

struct Record {
    stored: StoredVector,
    /// Graph slot, None for zero vectors that cannot be ranked by cosine
    slot: Option<usize>,
}

struct State {
    /// Embedding version the index was built with
    version: Option<String>,
    records: AHashMap<String, Record>,
    /// Graph slot -> live chunk id; overwritten or removed ids leave None behind
    slots: Vec<Option<String>>,
    stale: usize,
    graph: Hnsw<'static, f32, DistCosine>,
}

impl State {
    fn new(options: &DenseIndexOptions) -> Self {
        Self {
            version: None,
            records: AHashMap::new(),
            slots: Vec::new(),
            stale: 0,
            graph: new_graph(options),
        }
    }

    fn insert(&mut self, stored: StoredVector) {
        if let Some(old) = self.records.remove(&stored.chunk.id) {
            self.retire(old.slot);
        }

        let slot = if is_zero(&stored.vector) {
            None
        } else {
            let slot = self.slots.len();
            self.graph.insert((stored.vector.as_slice(), slot));
            self.slots.push(Some(stored.chunk.id.clone()));
            Some(slot)
        };

        self.records.insert(stored.chunk.id.clone(), Record { stored, slot });
    }

    fn retire(&mut self, slot: Option<usize>) {
        if let Some(slot) = slot {
            self.slots[slot] = None;
            self.stale += 1;
        }
    }

    /// Rebuild the graph from live records once stale slots outnumber them
    fn compact_if_needed(&mut self, options: &DenseIndexOptions) {
        if self.stale == 0 || self.stale <= self.records.len() {
            return;
        }

        tracing::debug!(
            "Compacting vector graph: {} live, {} stale slots",
            self.records.len(),
            self.stale
        );

        let mut stored: Vec<StoredVector> =
            self.records.drain().map(|(_, record)| record.stored).collect();
        stored.sort_by(|a, b| a.chunk.id.cmp(&b.chunk.id));

        self.slots.clear();
        self.stale = 0;
        self.graph = new_graph(options);
        for item in stored {
            self.insert(item);
        }
    }

    fn snapshot(&self, dimension: usize) -> Snapshot {
        let mut vectors: Vec<StoredVector> =
            self.records.values().map(|r| r.stored.clone()).collect();
        vectors.sort_by(|a, b| a.chunk.id.cmp(&b.chunk.id));
        Snapshot {
            format: SNAPSHOT_FORMAT,
            version: self.version.clone(),
            dimension,
            vectors,
        }
    }
}

fn new_graph(options: &DenseIndexOptions) -> Hnsw<'static, f32, DistCosine> {
    Hnsw::<f32, DistCosine>::new(
        options.hnsw_m,
        options.max_elements,
        16, // max layers
        options.ef_construction,
        DistCosine,
    )
}

fn is_zero(vector: &[f32]) -> bool {
    vector.iter().all(|v| *v == 0.0)
}

struct Inner {
    provider: Arc<dyn EmbeddingProvider>,
    options: DenseIndexOptions,
    state: RwLock<State>,
}

impl Inner {
    fn read(&self) -> Result<RwLockReadGuard<'_, State>, IndexError> {
        self.state
            .read()
            .map_err(|_| IndexError::unavailable(METHOD, "vector index lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, IndexError> {
        self.state
            .write()
            .map_err(|_| IndexError::unavailable(METHOD, "vector index lock poisoned"))
    }

    fn check_version(&self, indexed: Option<&str>) -> Result<(), IndexError> {
        let current = self.provider.version();
        match indexed {
            Some(indexed) if indexed != current => Err(IndexError::EmbeddingVersionMismatch {
                indexed: indexed.to_string(),
                current,
            }),
            _ => Ok(()),
        }
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), IndexError> {
        let expected = self.provider.dimension();
        if vector.len() != expected {
            return Err(dimension_mismatch(&self.provider.version(), expected, vector.len()));
        }
        Ok(())
    }

    fn embedding_error(&self, err: EmbeddingError) -> IndexError {
        match err {
            EmbeddingError::DimensionMismatch { expected, actual } => {
                dimension_mismatch(&self.provider.version(), expected, actual)
            }
            other => IndexError::unavailable(METHOD, other),
        }
    }

    fn upsert(&self, chunks: &[Chunk]) -> Result<usize, IndexError> {
        {
            let state = self.read()?;
            if !state.records.is_empty() {
                self.check_version(state.version.as_deref())?;
            }
        }

        let version = self.provider.version();
        let mut embedded = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.options.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self
                .provider
                .embed_batch(&texts)
                .map_err(|e| self.embedding_error(e))?;
            if vectors.len() != batch.len() {
                return Err(IndexError::unavailable(
                    METHOD,
                    format!("expected {} embeddings, got {}", batch.len(), vectors.len()),
                ));
            }

            for (chunk, vector) in batch.iter().zip(vectors) {
                self.check_dimension(&vector)?;
                embedded.push(StoredVector {
                    chunk: chunk.clone(),
                    vector,
                    version: version.clone(),
                });
            }
            tracing::debug!("Embedded batch of {} chunks", batch.len());
        }

        let mut state = self.write()?;
        // Another writer may have populated the index while we were embedding
        if state.records.is_empty() {
            state.version = Some(version);
        } else {
            self.check_version(state.version.as_deref())?;
        }

        let count = embedded.len();
        for stored in embedded {
            state.insert(stored);
        }
        state.compact_if_needed(&self.options);
        Ok(count)
    }

    fn trim_source(&self, source_id: &str, keep: usize) -> Result<usize, IndexError> {
        let mut state = self.write()?;
        let ids: Vec<String> = state
            .records
            .iter()
            .filter(|(_, r)| r.stored.chunk.source_id == source_id && r.stored.chunk.ordinal >= keep)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &ids {
            if let Some(record) = state.records.remove(id) {
                state.retire(record.slot);
            }
        }
        state.compact_if_needed(&self.options);
        Ok(ids.len())
    }

    fn search(&self, text: &str, top_k: usize) -> Result<Vec<ScoredResult>, IndexError> {
        {
            let state = self.read()?;
            if state.records.is_empty() {
                return Err(IndexError::IndexEmpty { method: METHOD });
            }
            self.check_version(state.version.as_deref())?;
        }
        if top_k == 0 || text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let query = self.provider.embed(text).map_err(|e| self.embedding_error(e))?;
        self.check_dimension(&query)?;
        if is_zero(&query) {
            return Ok(Vec::new());
        }

        let state = self.read()?;
        let live_slots = state.slots.len() - state.stale;
        if live_slots == 0 {
            return Ok(Vec::new());
        }

        // Ask for enough neighbours that stale slots cannot crowd out live ones
        let k = top_k.saturating_add(state.stale).min(state.slots.len());
        let ef = self.options.ef_search.max(k);

        let mut results: Vec<ScoredResult> = state
            .graph
            .search(&query, k, ef)
            .into_iter()
            .filter_map(|neighbour| {
                let id = state.slots.get(neighbour.d_id)?.as_ref()?;
                let record = state.records.get(id)?;
                Some(ScoredResult {
                    chunk: record.stored.chunk.clone(),
                    score: 1.0 - neighbour.distance,
                    method: METHOD,
                })
            })
            .filter(|r| r.score.is_finite())
            .collect();

        sort_scored(&mut results);
        results.truncate(top_k);
        Ok(results)
    }

    fn save(&self) -> Result<(), IndexError> {
        let Some(path) = &self.options.snapshot_path else {
            return Ok(());
        };
        let storage_err = |message: String| IndexError::Storage {
            path: path.clone(),
            message,
        };

        let snapshot = self.read()?.snapshot(self.provider.dimension());
        let json = serde_json::to_vec(&snapshot).map_err(|e| storage_err(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| storage_err(e.to_string()))?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| storage_err(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| storage_err(e.to_string()))?;

        tracing::debug!(
            "Saved {} vectors to {}",
            snapshot.vectors.len(),
            path.display()
        );
        Ok(())
    }
}

fn dimension_mismatch(version: &str, expected: usize, actual: usize) -> IndexError {
    IndexError::EmbeddingVersionMismatch {
        indexed: format!("{} ({} dims)", version, expected),
        current: format!("vector of {} dims", actual),
    }
}

/// Embedding index over chunk text
///
/// Each stored vector carries the embedding version that produced it, and the
/// index refuses to mix versions. Overwriting an id leaves its old graph slot
/// behind; stale slots are skipped at query time and reclaimed by compaction.
#[derive(Clone)]
pub struct DenseIndex {
    inner: Arc<Inner>,
}

impl DenseIndex {
    /// Create an index, loading `options.snapshot_path` when it exists
    pub fn open(
        provider: Arc<dyn EmbeddingProvider>,
        options: DenseIndexOptions,
    ) -> Result<Self, IndexError> {
        let mut state = State::new(&options);

        if let Some(path) = options.snapshot_path.as_ref().filter(|p| p.exists()) {
            let storage_err = |message: String| IndexError::Storage {
                path: path.clone(),
                message,
            };
            let bytes = std::fs::read(path).map_err(|e| storage_err(e.to_string()))?;
            let snapshot: Snapshot =
                serde_json::from_slice(&bytes).map_err(|e| storage_err(e.to_string()))?;
            if snapshot.format != SNAPSHOT_FORMAT {
                return Err(storage_err(format!(
                    "unsupported snapshot format {}",
                    snapshot.format
                )));
            }

            tracing::info!(
                "Loading {} vectors ({} dims) from {}",
                snapshot.vectors.len(),
                snapshot.dimension,
                path.display()
            );
            state.version = snapshot.version;
            for stored in snapshot.vectors {
                state.insert(stored);
            }
        }

        Ok(Self {
            inner: Arc::new(Inner {
                provider,
                options,
                state: RwLock::new(state),
            }),
        })
    }

    /// In-memory index with default HNSW parameters
    pub fn in_memory(provider: Arc<dyn EmbeddingProvider>) -> Result<Self, IndexError> {
        Self::open(provider, DenseIndexOptions::default())
    }

    /// Embedding version recorded by the index, if anything was indexed
    pub fn indexed_version(&self) -> Option<String> {
        self.inner.read().ok().and_then(|s| s.version.clone())
    }
}

#[async_trait]
impl IndexAdapter for DenseIndex {
    fn method(&self) -> RetrievalMethod {
        METHOD
    }

    async fn index(&self, chunks: &[Chunk]) -> Result<usize, IndexError> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let inner = Arc::clone(&self.inner);
        let chunks = chunks.to_vec();
        tokio::task::spawn_blocking(move || inner.upsert(&chunks))
            .await
            .map_err(|e| join_error(METHOD, e))?
    }

    async fn trim_source(&self, source_id: &str, keep: usize) -> Result<usize, IndexError> {
        let inner = Arc::clone(&self.inner);
        let source_id = source_id.to_string();
        tokio::task::spawn_blocking(move || inner.trim_source(&source_id, keep))
            .await
            .map_err(|e| join_error(METHOD, e))?
    }

    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<ScoredResult>, IndexError> {
        let inner = Arc::clone(&self.inner);
        let text = text.to_string();
        tokio::task::spawn_blocking(move || inner.search(&text, top_k))
            .await
            .map_err(|e| join_error(METHOD, e))?
    }

    async fn count(&self) -> Result<usize, IndexError> {
        Ok(self.inner.read()?.records.len())
    }

    async fn flush(&self) -> Result<(), IndexError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.save())
            .await
            .map_err(|e| join_error(METHOD, e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedProvider;
    use crate::index::test_support::chunk;
    use tempfile::TempDir;

    fn provider(dimension: usize) -> Arc<dyn EmbeddingProvider> {
        Arc::new(HashEmbedProvider::new(dimension).unwrap())
    }

    fn options() -> DenseIndexOptions {
        DenseIndexOptions {
            max_elements: 1_000,
            batch_size: 2,
            ..Default::default()
        }
    }

    fn corpus() -> Vec<Chunk> {
        vec![
            chunk("handbook.md", 0, "Working Hours", "Remote work up to 3 days per week with manager approval."),
            chunk("handbook.md", 1, "Leave", "Sick leave requires a note after three consecutive days."),
            chunk("security.md", 0, "Passwords", "Passwords rotate every ninety days."),
        ]
    }

    #[tokio::test]
    async fn test_empty_index() {
        let index = DenseIndex::open(provider(128), options()).unwrap();
        assert_eq!(index.count().await.unwrap(), 0);
        assert!(index.query("remote", 3).await.unwrap_err().is_empty_index());
        assert!(index.indexed_version().is_none());
    }

    #[tokio::test]
    async fn test_insert_and_search() {
        let index = DenseIndex::open(provider(256), options()).unwrap();
        assert_eq!(index.index(&corpus()).await.unwrap(), 3);
        assert_eq!(index.indexed_version().as_deref(), Some("hash-v1@256"));

        let results = index.query("remote work policy", 3).await.unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].chunk.section, "Working Hours");
        assert_eq!(results[0].method, RetrievalMethod::Dense);
        assert!(results[0].score > 0.0);
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn test_overwrite_skips_stale_slots() {
        let index = DenseIndex::open(provider(256), options()).unwrap();
        index.index(&corpus()).await.unwrap();
        index.index(&corpus()).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 3);

        let results = index.query("remote work", 10).await.unwrap();
        assert_eq!(results.len(), 3);
        let mut ids: Vec<&str> = results.iter().map(|r| r.chunk.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn test_huge_top_k_with_stale_slots() {
        let index = DenseIndex::open(provider(256), options()).unwrap();
        index.index(&corpus()).await.unwrap();
        index.index(&corpus()[..1]).await.unwrap();

        let results = index.query("remote work", usize::MAX).await.unwrap();
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn test_remove_source() {
        let index = DenseIndex::open(provider(128), options()).unwrap();
        index.index(&corpus()).await.unwrap();

        assert_eq!(index.remove_source("handbook.md").await.unwrap(), 2);
        assert_eq!(index.count().await.unwrap(), 1);

        let results = index.query("remote work", 10).await.unwrap();
        assert!(results.iter().all(|r| r.chunk.source_id == "security.md"));
    }

    #[tokio::test]
    async fn test_trim_source_keeps_leading_chunks() {
        let index = DenseIndex::open(provider(128), options()).unwrap();
        index.index(&corpus()).await.unwrap();

        assert_eq!(index.trim_source("handbook.md", 1).await.unwrap(), 1);
        assert_eq!(index.count().await.unwrap(), 2);
        assert_eq!(index.trim_source("handbook.md", 1).await.unwrap(), 0);

        let results = index.query("sick leave", 10).await.unwrap();
        assert!(results.iter().all(|r| r.chunk.ordinal == 0));
    }

    #[tokio::test]
    async fn test_version_mismatch_is_fatal() {
        let temp = TempDir::new().unwrap();
        let snapshot = temp.path().join("dense.json");
        let opts = DenseIndexOptions {
            snapshot_path: Some(snapshot.clone()),
            ..options()
        };

        let index = DenseIndex::open(provider(128), opts.clone()).unwrap();
        index.index(&corpus()).await.unwrap();
        index.flush().await.unwrap();

        let reopened = DenseIndex::open(provider(64), opts).unwrap();
        let err = reopened.query("remote", 3).await.unwrap_err();
        assert!(matches!(err, IndexError::EmbeddingVersionMismatch { .. }));
        let err = reopened.index(&corpus()).await.unwrap_err();
        assert!(matches!(err, IndexError::EmbeddingVersionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let temp = TempDir::new().unwrap();
        let opts = DenseIndexOptions {
            snapshot_path: Some(temp.path().join("vectors").join("dense.json")),
            ..options()
        };

        {
            let index = DenseIndex::open(provider(128), opts.clone()).unwrap();
            index.index(&corpus()).await.unwrap();
            index.flush().await.unwrap();
        }

        let index = DenseIndex::open(provider(128), opts).unwrap();
        assert_eq!(index.count().await.unwrap(), 3);
        let results = index.query("passwords rotate", 1).await.unwrap();
        assert_eq!(results[0].chunk, corpus()[2]);
    }

    #[tokio::test]
    async fn test_compaction_keeps_live_records() {
        let index = DenseIndex::open(provider(128), options()).unwrap();
        for _ in 0..4 {
            index.index(&corpus()).await.unwrap();
        }
        let state = index.inner.read().unwrap();
        assert!(state.stale <= state.records.len());
        assert_eq!(state.records.len(), 3);
    }
}
