use crate::config::{Config, SCHEMA_VERSION};
use crate::embedding::ProviderKind;
use crate::error::{KbError, Result, ValidationError};

/// Smallest writer heap the keyword index accepts
pub const MIN_WRITER_MEMORY_BYTES: usize = 15_000_000;

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_storage(config, &mut errors);
        Self::validate_chunking(config, &mut errors);
        Self::validate_embedding(config, &mut errors);
        Self::validate_indexing(config, &mut errors);
        Self::validate_retrieval(config, &mut errors);
        Self::validate_fusion(config, &mut errors);
        Self::validate_reranking(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(KbError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != SCHEMA_VERSION {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_storage(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.storage.data_dir.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.data_dir",
                "Data directory cannot be empty",
            ));
        }
    }

    fn validate_chunking(config: &Config, errors: &mut Vec<ValidationError>) {
        if let Err(e) = config.chunking.validate() {
            errors.push(ValidationError::new("chunking", e.to_string()));
        }
    }

    fn validate_embedding(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.embedding.batch_size == 0 {
            errors.push(ValidationError::new(
                "embedding.batch_size",
                "Batch size must be greater than 0",
            ));
        }

        if config.embedding.dimension == 0 {
            errors.push(ValidationError::new(
                "embedding.dimension",
                "Embedding dimension must be greater than 0",
            ));
        }

        if config.embedding.provider == ProviderKind::Fastembed && config.embedding.model.is_empty()
        {
            errors.push(ValidationError::new(
                "embedding.model",
                "Model name cannot be empty",
            ));
        }
    }

    fn validate_indexing(config: &Config, errors: &mut Vec<ValidationError>) {
        let indexing = &config.indexing;

        if indexing.hnsw_ef_construction == 0 {
            errors.push(ValidationError::new(
                "indexing.hnsw_ef_construction",
                "HNSW ef_construction must be greater than 0",
            ));
        }

        if indexing.hnsw_ef_search == 0 {
            errors.push(ValidationError::new(
                "indexing.hnsw_ef_search",
                "HNSW ef_search must be greater than 0",
            ));
        }

        if indexing.hnsw_m == 0 {
            errors.push(ValidationError::new(
                "indexing.hnsw_m",
                "HNSW M must be greater than 0",
            ));
        }

        if indexing.writer_memory_bytes < MIN_WRITER_MEMORY_BYTES {
            errors.push(ValidationError::new(
                "indexing.writer_memory_bytes",
                format!(
                    "Writer memory must be at least {} bytes, got {}",
                    MIN_WRITER_MEMORY_BYTES, indexing.writer_memory_bytes
                ),
            ));
        }
    }

    fn validate_retrieval(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.retrieval.candidate_multiplier == 0 {
            errors.push(ValidationError::new(
                "retrieval.candidate_multiplier",
                "Candidate multiplier must be at least 1",
            ));
        }

        if config.retrieval.adapter_timeout_ms == 0 {
            errors.push(ValidationError::new(
                "retrieval.adapter_timeout_ms",
                "Adapter timeout must be greater than 0",
            ));
        }
    }

    fn validate_fusion(config: &Config, errors: &mut Vec<ValidationError>) {
        if let Err(e) = config.fusion.validate() {
            errors.push(ValidationError::new("fusion", e.to_string()));
        }

        if config.fusion.max_candidates == Some(0) {
            errors.push(ValidationError::new(
                "fusion.max_candidates",
                "Max candidates must be greater than 0 when set",
            ));
        }
    }

    fn validate_reranking(config: &Config, errors: &mut Vec<ValidationError>) {
        let reranking = &config.reranking;

        if reranking.judge_timeout_ms == 0 {
            errors.push(ValidationError::new(
                "reranking.judge_timeout_ms",
                "Judge timeout must be greater than 0",
            ));
        }

        if reranking.judge_concurrency == 0 {
            errors.push(ValidationError::new(
                "reranking.judge_concurrency",
                "Judge concurrency must be at least 1",
            ));
        }

        if reranking.use_llm && reranking.judge_model.is_empty() {
            errors.push(ValidationError::new(
                "reranking.judge_model",
                "Judge model cannot be empty when use_llm is enabled",
            ));
        }
    }
}
