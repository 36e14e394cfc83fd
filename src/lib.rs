//! kbsearch - hybrid retrieval over policy documents
//!
//! Documents are chunked along their heading structure, indexed in a BM25
//! keyword index and an HNSW embedding index, and queried through both at
//! once. The two rankings are merged with weighted Reciprocal Rank Fusion and
//! the shortlist is reranked by a relevance judge or a term-overlap heuristic.

pub mod chunking;
pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod index;
pub mod ingest;
pub mod pipeline;
pub mod retrieval;

pub use error::{KbError, Result};
