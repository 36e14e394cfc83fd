/// Embedding functions
///
/// The dense index embeds chunk text and query text through one
/// `EmbeddingProvider`. Two providers ship with the crate:
/// - FastEmbedProvider for local ONNX models (all-MiniLM-L6-v2, 384-dim)
/// - HashEmbedProvider, a deterministic feature-hashing embedder for offline use
mod hash;
mod provider;

pub use hash::{HashEmbedProvider, HASH_MODEL_NAME};
pub use provider::{EmbeddingError, EmbeddingProvider, FastEmbedProvider};

pub(crate) use hash::terms;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which embedding function to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Fastembed,
    Hash,
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fastembed" => Ok(Self::Fastembed),
            "hash" => Ok(Self::Hash),
            other => Err(format!(
                "Unknown embedding provider '{}'. Supported: fastembed, hash",
                other
            )),
        }
    }
}

/// Configuration for embedding generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub provider: ProviderKind,
    /// Model name (e.g., "all-MiniLM-L6-v2"), ignored by the hash provider
    pub model: String,
    /// Embedding dimension (384 for MiniLM)
    pub dimension: usize,
    /// Chunks embedded per provider call during indexing
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Fastembed,
            model: "all-MiniLM-L6-v2".to_string(),
            dimension: 384,
            batch_size: 32,
        }
    }
}

/// Construct the provider described by `config`
pub fn build_provider(
    config: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    match config.provider {
        ProviderKind::Fastembed => {
            let provider = FastEmbedProvider::new(&config.model)?;
            if provider.dimension() != config.dimension {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: config.dimension,
                    actual: provider.dimension(),
                });
            }
            Ok(Arc::new(provider))
        }
        ProviderKind::Hash => Ok(Arc::new(HashEmbedProvider::new(config.dimension)?)),
    }
}
