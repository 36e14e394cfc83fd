//! Deterministic feature-hashing embedder
//!
//! Every lowercase alphanumeric term is hashed with BLAKE3 into a bucket of
//! the output vector with a sign taken from the same digest, then the vector is
//! L2-normalized. No model download, identical output on every platform.

use super::provider::{EmbeddingError, EmbeddingProvider};

pub const HASH_MODEL_NAME: &str = "hash-v1";

pub struct HashEmbedProvider {
    dimension: usize,
}

impl HashEmbedProvider {
    pub fn new(dimension: usize) -> Result<Self, EmbeddingError> {
        if dimension == 0 {
            return Err(EmbeddingError::InitializationError(
                "Hash embedding dimension must be greater than 0".to_string(),
            ));
        }
        Ok(Self { dimension })
    }

    fn embed_terms(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for term in terms(text) {
            let digest = blake3::hash(term.as_bytes());
            let bytes = digest.as_bytes();
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&bytes[..8]);
            let idx = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[idx] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

/// Lowercase alphanumeric terms of `text`
pub(crate) fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

impl EmbeddingProvider for HashEmbedProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("Empty text".to_string()));
        }
        Ok(self.embed_terms(text))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        HASH_MODEL_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_deterministic_and_normalized() {
        let provider = HashEmbedProvider::new(64).unwrap();
        let a = provider.embed("Remote work policy").unwrap();
        let b = provider.embed("remote WORK policy!").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!((cosine(&a, &a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_terms_are_closer() {
        let provider = HashEmbedProvider::new(256).unwrap();
        let query = provider.embed("remote work policy").unwrap();
        let related = provider
            .embed("Remote work up to 3 days per week with manager approval")
            .unwrap();
        let unrelated = provider
            .embed("Sick leave requires a note from a doctor")
            .unwrap();
        assert!(cosine(&query, &related) > cosine(&query, &unrelated));
    }

    #[test]
    fn test_version_and_errors() {
        let provider = HashEmbedProvider::new(32).unwrap();
        assert_eq!(provider.version(), "hash-v1@32");
        assert!(provider.embed("   ").is_err());
        assert!(HashEmbedProvider::new(0).is_err());
    }

    #[test]
    fn test_punctuation_only_is_zero_vector() {
        let provider = HashEmbedProvider::new(16).unwrap();
        let v = provider.embed("?!").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }
}
