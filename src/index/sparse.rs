/// Tantivy keyword index with BM25 scoring
use super::{join_error, sort_scored, IndexAdapter, IndexError, RetrievalMethod, ScoredResult};
use crate::chunking::Chunk;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tantivy::collector::{Count, DocSetCollector, TopDocs};
use tantivy::query::{QueryParser, TermQuery};
use tantivy::schema::{
    Field, IndexRecordOption, Schema, Value, INDEXED, STORED, STRING, TEXT,
};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

const METHOD: RetrievalMethod = RetrievalMethod::Sparse;

#[derive(Debug, Clone, Copy)]
struct Fields {
    id: Field,
    text: Field,
    section: Field,
    source: Field,
    doc_type: Field,
    ordinal: Field,
    token_count: Field,
    overlap: Field,
}

impl Fields {
    fn schema() -> (Schema, Fields) {
        let mut builder = Schema::builder();
        let fields = Fields {
            id: builder.add_text_field("id", STRING | STORED),
            text: builder.add_text_field("text", TEXT | STORED),
            section: builder.add_text_field("section", TEXT | STORED),
            source: builder.add_text_field("source", STRING | STORED),
            doc_type: builder.add_text_field("doc_type", STRING | STORED),
            ordinal: builder.add_u64_field("ordinal", INDEXED | STORED),
            token_count: builder.add_u64_field("token_count", STORED),
            overlap: builder.add_bool_field("overlap", STORED),
        };
        (builder.build(), fields)
    }

    fn from_schema(schema: &Schema, path: &Path) -> Result<Fields, IndexError> {
        let get = |name: &str| {
            schema.get_field(name).map_err(|_| IndexError::Storage {
                path: path.to_path_buf(),
                message: format!("Missing '{}' field in schema", name),
            })
        };

        Ok(Fields {
            id: get("id")?,
            text: get("text")?,
            section: get("section")?,
            source: get("source")?,
            doc_type: get("doc_type")?,
            ordinal: get("ordinal")?,
            token_count: get("token_count")?,
            overlap: get("overlap")?,
        })
    }

    fn to_document(&self, chunk: &Chunk) -> TantivyDocument {
        doc!(
            self.id => chunk.id.as_str(),
            self.text => chunk.text.as_str(),
            self.section => chunk.section.as_str(),
            self.source => chunk.source_id.as_str(),
            self.doc_type => chunk.doc_type.as_str(),
            self.ordinal => chunk.ordinal as u64,
            self.token_count => chunk.token_count as u64,
            self.overlap => chunk.overlap,
        )
    }

    fn to_chunk(&self, doc: &TantivyDocument) -> Result<Chunk, IndexError> {
        let text = |field: Field| {
            doc.get_first(field)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let number = |field: Field| doc.get_first(field).and_then(|v| v.as_u64()).unwrap_or(0);

        let id = text(self.id);
        if id.is_empty() {
            return Err(IndexError::unavailable(METHOD, "stored document without id"));
        }

        Ok(Chunk {
            id,
            text: text(self.text),
            token_count: number(self.token_count) as usize,
            source_id: text(self.source),
            doc_type: text(self.doc_type),
            section: text(self.section),
            ordinal: number(self.ordinal) as usize,
            overlap: doc
                .get_first(self.overlap)
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        })
    }
}

struct Inner {
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    fields: Fields,
}

impl Inner {
    fn commit(&self, writer: &mut IndexWriter) -> Result<(), IndexError> {
        writer
            .commit()
            .map_err(|e| IndexError::unavailable(METHOD, format!("commit failed: {}", e)))?;
        self.reader
            .reload()
            .map_err(|e| IndexError::unavailable(METHOD, format!("reader reload failed: {}", e)))
    }

    fn lock_writer(&self) -> Result<std::sync::MutexGuard<'_, IndexWriter>, IndexError> {
        self.writer
            .lock()
            .map_err(|_| IndexError::unavailable(METHOD, "index writer lock poisoned"))
    }

    fn upsert(&self, chunks: &[Chunk]) -> Result<usize, IndexError> {
        let mut writer = self.lock_writer()?;
        for chunk in chunks {
            // A delete only affects documents added before it
            writer.delete_term(Term::from_field_text(self.fields.id, &chunk.id));
            writer
                .add_document(self.fields.to_document(chunk))
                .map_err(|e| IndexError::unavailable(METHOD, format!("insert failed: {}", e)))?;
        }
        self.commit(&mut writer)?;
        Ok(chunks.len())
    }

    fn trim_source(&self, source_id: &str, keep: usize) -> Result<usize, IndexError> {
        let term = Term::from_field_text(self.fields.source, source_id);
        let query = TermQuery::new(term.clone(), IndexRecordOption::Basic);
        let mut writer = self.lock_writer()?;
        let searcher = self.reader.searcher();

        if keep == 0 {
            let existing = searcher
                .search(&query, &Count)
                .map_err(|e| IndexError::unavailable(METHOD, e))?;
            if existing > 0 {
                writer.delete_term(term);
                self.commit(&mut writer)?;
            }
            return Ok(existing);
        }

        let addresses = searcher
            .search(&query, &DocSetCollector)
            .map_err(|e| IndexError::unavailable(METHOD, e))?;

        let mut removed = 0;
        for address in addresses {
            let doc: TantivyDocument = searcher
                .doc(address)
                .map_err(|e| IndexError::unavailable(METHOD, e))?;
            let chunk = self.fields.to_chunk(&doc)?;
            if chunk.ordinal >= keep {
                writer.delete_term(Term::from_field_text(self.fields.id, &chunk.id));
                removed += 1;
            }
        }

        if removed > 0 {
            self.commit(&mut writer)?;
        }
        Ok(removed)
    }

    fn search(&self, text: &str, top_k: usize) -> Result<Vec<ScoredResult>, IndexError> {
        let searcher = self.reader.searcher();
        if searcher.num_docs() == 0 {
            return Err(IndexError::IndexEmpty { method: METHOD });
        }
        if top_k == 0 || text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let parser =
            QueryParser::for_index(&self.index, vec![self.fields.text, self.fields.section]);
        // Lenient parsing drops syntax it cannot handle instead of failing on user punctuation
        let (query, parse_errors) = parser.parse_query_lenient(text);
        if !parse_errors.is_empty() {
            tracing::debug!("Ignored {} query syntax error(s)", parse_errors.len());
        }

        // tantivy preallocates for the limit, so never ask for more than exists
        let num_docs = searcher.num_docs() as usize;
        let top_k = top_k.min(num_docs);

        // Widen the page until the score at the cut drops, so ties at the
        // boundary are decided by chunk id rather than doc address
        let mut limit = top_k.saturating_add(1).min(num_docs);
        let top_docs = loop {
            let mut page = searcher
                .search(&query, &TopDocs::with_limit(limit))
                .map_err(|e| IndexError::unavailable(METHOD, format!("search failed: {}", e)))?;
            if page.len() <= top_k {
                break page;
            }
            let cut = page[top_k - 1].0;
            let tied_at_end = page.last().map(|(score, _)| *score >= cut).unwrap_or(false);
            if !tied_at_end || page.len() < limit || limit == num_docs {
                page.retain(|(score, _)| *score >= cut);
                break page;
            }
            limit = limit.saturating_mul(2).min(num_docs);
        };

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(address)
                .map_err(|e| IndexError::unavailable(METHOD, e))?;
            results.push(ScoredResult {
                chunk: self.fields.to_chunk(&doc)?,
                score,
                method: METHOD,
            });
        }

        sort_scored(&mut results);
        results.truncate(top_k);
        Ok(results)
    }
}

/// Keyword index over chunk text and section labels
///
/// Every `index` and `trim_source` call commits, so the next query sees it.
#[derive(Clone)]
pub struct SparseIndex {
    inner: Arc<Inner>,
}

impl SparseIndex {
    /// Open the index stored in `index_path`, creating it if absent
    pub fn open(index_path: impl Into<PathBuf>, writer_memory_bytes: usize) -> Result<Self, IndexError> {
        let index_path = index_path.into();
        let storage_err = |e: &dyn std::fmt::Display| IndexError::Storage {
            path: index_path.clone(),
            message: e.to_string(),
        };

        let (index, fields) = if index_path.join("meta.json").exists() {
            let index = Index::open_in_dir(&index_path).map_err(|e| storage_err(&e))?;
            let fields = Fields::from_schema(&index.schema(), &index_path)?;
            (index, fields)
        } else {
            std::fs::create_dir_all(&index_path).map_err(|e| storage_err(&e))?;
            let (schema, fields) = Fields::schema();
            let index = Index::create_in_dir(&index_path, schema).map_err(|e| storage_err(&e))?;
            (index, fields)
        };

        tracing::debug!("Opened keyword index at {}", index_path.display());
        Self::from_index(index, fields, writer_memory_bytes)
    }

    /// Index held entirely in memory
    pub fn in_memory(writer_memory_bytes: usize) -> Result<Self, IndexError> {
        let (schema, fields) = Fields::schema();
        Self::from_index(Index::create_in_ram(schema), fields, writer_memory_bytes)
    }

    fn from_index(index: Index, fields: Fields, writer_memory_bytes: usize) -> Result<Self, IndexError> {
        let writer = index
            .writer_with_num_threads(1, writer_memory_bytes)
            .map_err(|e| IndexError::unavailable(METHOD, format!("writer init failed: {}", e)))?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(|e| IndexError::unavailable(METHOD, format!("reader init failed: {}", e)))?;

        Ok(Self {
            inner: Arc::new(Inner {
                index,
                reader,
                writer: Mutex::new(writer),
                fields,
            }),
        })
    }
}

#[async_trait]
impl IndexAdapter for SparseIndex {
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
        Ok(self.inner.reader.searcher().num_docs() as usize)
    }
}
