//! Configuration management for kbsearch
//!
//! One TOML file holds every tunable of the engine. The pipeline receives a
//! `Config` value at construction and never reads configuration on its own.

use crate::chunking::ChunkingConfig;
use crate::embedding::EmbeddingConfig;
use crate::error::{KbError, Result};
use crate::retrieval::FusionConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

mod validator;

pub use validator::ConfigValidator;

pub const SCHEMA_VERSION: &str = "1.0.0";
const ENV_PREFIX: &str = "KBSEARCH_";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    pub storage: StorageConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub indexing: IndexingConfig,
    pub retrieval: RetrievalConfig,
    pub fusion: FusionConfig,
    pub reranking: RerankingConfig,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileOverrides>,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the keyword index directory and the vector snapshot
    pub data_dir: PathBuf,
}

impl StorageConfig {
    /// `data_dir` with a leading `~/` expanded to the home directory
    pub fn resolved_data_dir(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }

    pub fn sparse_dir(&self) -> PathBuf {
        self.resolved_data_dir().join("sparse")
    }

    pub fn dense_snapshot(&self) -> PathBuf {
        self.resolved_data_dir().join("dense").join("vectors.json")
    }
}

/// Index backend parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    pub hnsw_m: usize,
    pub hnsw_ef_construction: usize,
    pub hnsw_ef_search: usize,
    /// Heap handed to the keyword index writer
    pub writer_memory_bytes: usize,
}

/// Query fan-out settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Each adapter is asked for `top_k * candidate_multiplier` results
    pub candidate_multiplier: usize,
    pub adapter_timeout_ms: u64,
}

impl RetrievalConfig {
    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }
}

/// Reranking settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankingConfig {
    /// Use the cross-encoder judge; term-overlap scoring otherwise
    pub use_llm: bool,
    pub judge_model: String,
    pub judge_timeout_ms: u64,
    pub judge_concurrency: usize,
}

impl RerankingConfig {
    pub fn judge_timeout(&self) -> Duration {
        Duration::from_millis(self.judge_timeout_ms)
    }
}

/// Profile-specific configuration overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_llm: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sparse_weight: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dense_weight: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_multiplier: Option<usize>,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(KbError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| KbError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        // Apply environment variable overrides
        config.apply_env_overrides();

        // Validate configuration
        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| KbError::Io {
                source: e,
                context: format!("Failed to create config directory: {:?}", parent),
            })?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| KbError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Load configuration with a specific profile applied
    pub fn load_with_profile(path: &Path, profile: &str) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_profile(profile)?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Apply a profile's overrides to the configuration
    pub fn apply_profile(&mut self, profile: &str) -> Result<()> {
        let overrides = self
            .profiles
            .get(profile)
            .cloned()
            .ok_or_else(|| KbError::ProfileNotFound {
                name: profile.to_string(),
            })?;

        if let Some(provider) = &overrides.embedding_provider {
            self.embedding.provider = parse_value("embedding_provider", provider)?;
        }
        if let Some(model) = &overrides.embedding_model {
            self.embedding.model = model.clone();
        }
        if let Some(use_llm) = overrides.use_llm {
            self.reranking.use_llm = use_llm;
        }
        if let Some(weight) = overrides.sparse_weight {
            self.fusion.sparse_weight = weight;
        }
        if let Some(weight) = overrides.dense_weight {
            self.fusion.dense_weight = weight;
        }
        if let Some(multiplier) = overrides.candidate_multiplier {
            self.retrieval.candidate_multiplier = multiplier;
        }

        tracing::debug!("Applied configuration profile '{}'", profile);
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: KBSEARCH_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(std::env::vars());
    }

    /// Apply `SECTION__KEY` overrides from `(name, value)` pairs carrying the env prefix
    pub fn apply_overrides(&mut self, vars: impl IntoIterator<Item = (String, String)>) {
        for (key, value) in vars {
            if let Some(config_key) = key.strip_prefix(ENV_PREFIX) {
                if let Err(e) = self.set_value(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "STORAGE__DATA_DIR" => self.storage.data_dir = PathBuf::from(value),
            "CHUNKING__TARGET_TOKENS" => self.chunking.target_tokens = parse_value(path, value)?,
            "CHUNKING__MAX_TOKENS" => self.chunking.max_tokens = parse_value(path, value)?,
            "CHUNKING__OVERLAP_TOKENS" => self.chunking.overlap_tokens = parse_value(path, value)?,
            "CHUNKING__MIN_TOKENS" => self.chunking.min_tokens = parse_value(path, value)?,
            "EMBEDDING__PROVIDER" => self.embedding.provider = parse_value(path, value)?,
            "EMBEDDING__MODEL" => self.embedding.model = value.to_string(),
            "EMBEDDING__DIMENSION" => self.embedding.dimension = parse_value(path, value)?,
            "EMBEDDING__BATCH_SIZE" => self.embedding.batch_size = parse_value(path, value)?,
            "INDEXING__HNSW_EF_SEARCH" => self.indexing.hnsw_ef_search = parse_value(path, value)?,
            "RETRIEVAL__CANDIDATE_MULTIPLIER" => {
                self.retrieval.candidate_multiplier = parse_value(path, value)?
            }
            "RETRIEVAL__ADAPTER_TIMEOUT_MS" => {
                self.retrieval.adapter_timeout_ms = parse_value(path, value)?
            }
            "FUSION__SPARSE_WEIGHT" => self.fusion.sparse_weight = parse_value(path, value)?,
            "FUSION__DENSE_WEIGHT" => self.fusion.dense_weight = parse_value(path, value)?,
            "FUSION__K_CONST" => self.fusion.k_const = parse_value(path, value)?,
            "FUSION__MAX_CANDIDATES" => {
                self.fusion.max_candidates = Some(parse_value(path, value)?)
            }
            "RERANKING__USE_LLM" => self.reranking.use_llm = parse_value(path, value)?,
            "RERANKING__JUDGE_MODEL" => self.reranking.judge_model = value.to_string(),
            "RERANKING__JUDGE_TIMEOUT_MS" => {
                self.reranking.judge_timeout_ms = parse_value(path, value)?
            }
            "RERANKING__JUDGE_CONCURRENCY" => {
                self.reranking.judge_concurrency = parse_value(path, value)?
            }
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| KbError::Config("Cannot determine config directory".to_string()))?;

        Ok(config_dir.join("kbsearch").join("config.toml"))
    }

    /// Refresh the modification timestamp before saving
    pub fn touch(&mut self) {
        self.meta.last_modified = current_timestamp();
    }
}

fn parse_value<T>(path: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| KbError::InvalidConfigValue {
        path: path.to_string(),
        message: format!("Cannot parse '{}': {}", value, e),
    })
}

/// Expand a leading `~/` to the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            meta: MetaConfig {
                schema_version: SCHEMA_VERSION.to_string(),
                created_at: current_timestamp(),
                last_modified: current_timestamp(),
            },
            storage: StorageConfig {
                data_dir: PathBuf::from("~/.kbsearch"),
            },
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            indexing: IndexingConfig {
                hnsw_m: 16,
                hnsw_ef_construction: 200,
                hnsw_ef_search: 64,
                writer_memory_bytes: 50_000_000,
            },
            retrieval: RetrievalConfig {
                candidate_multiplier: 4,
                adapter_timeout_ms: 10_000,
            },
            fusion: FusionConfig::default(),
            reranking: RerankingConfig {
                use_llm: false,
                judge_model: "bge-reranker-base".to_string(),
                judge_timeout_ms: 5_000,
                judge_concurrency: 4,
            },
            profiles: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::ProviderKind;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.fusion.sparse_weight = 0.7;
        config.profiles.insert(
            "offline".to_string(),
            ProfileOverrides {
                embedding_provider: Some("hash".to_string()),
                ..Default::default()
            },
        );
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.fusion.sparse_weight, 0.7);
        assert_eq!(loaded.chunking, ChunkingConfig::default());
        assert!(loaded.profiles.contains_key("offline"));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load(Path::new("/nonexistent/kbsearch.toml")).unwrap_err();
        assert!(matches!(err, KbError::ConfigNotFound { .. }));
    }

    #[test]
    fn test_apply_profile() {
        let mut config = Config::default();
        config.profiles.insert(
            "fast".to_string(),
            ProfileOverrides {
                embedding_provider: Some("hash".to_string()),
                use_llm: Some(false),
                sparse_weight: Some(0.8),
                dense_weight: Some(0.2),
                ..Default::default()
            },
        );

        config.apply_profile("fast").unwrap();
        assert_eq!(config.embedding.provider, ProviderKind::Hash);
        assert_eq!(config.fusion.sparse_weight, 0.8);

        let err = config.apply_profile("missing").unwrap_err();
        assert!(matches!(err, KbError::ProfileNotFound { .. }));
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config.apply_overrides(vec![
            ("KBSEARCH_FUSION__K_CONST".to_string(), "30".to_string()),
            ("KBSEARCH_RERANKING__USE_LLM".to_string(), "true".to_string()),
            ("KBSEARCH_EMBEDDING__PROVIDER".to_string(), "hash".to_string()),
            ("KBSEARCH_CHUNKING__MAX_TOKENS".to_string(), "not-a-number".to_string()),
            ("OTHER_FUSION__K_CONST".to_string(), "1".to_string()),
        ]);

        assert_eq!(config.fusion.k_const, 30.0);
        assert!(config.reranking.use_llm);
        assert_eq!(config.embedding.provider, ProviderKind::Hash);
        // Unparseable values are skipped
        assert_eq!(config.chunking.max_tokens, 450);
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home(Path::new("/tmp/kb")), PathBuf::from("/tmp/kb"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/kb")), home.join("kb"));
        }
    }
}
