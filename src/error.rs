use crate::chunking::ChunkError;
use crate::embedding::EmbeddingError;
use crate::index::IndexError;
use crate::ingest::IngestError;
use crate::retrieval::{FusionError, RetrievalError};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for kbsearch
#[derive(Error, Debug)]
pub enum KbError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<ValidationError> },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Invalid configuration value
    #[error("Invalid configuration value at {path}: {message}")]
    InvalidConfigValue { path: String, message: String },

    /// Unknown configuration profile
    #[error("Profile not found: {name}")]
    ProfileNotFound { name: String },

    /// IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// JSON errors
    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },

    /// Document ingestion errors
    #[error(transparent)]
    Ingest(#[from] IngestError),

    /// Chunking errors
    #[error(transparent)]
    Chunking(#[from] ChunkError),

    /// Embedding errors
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    /// Index backend errors
    #[error(transparent)]
    Index(#[from] IndexError),

    /// Fusion configuration errors
    #[error(transparent)]
    Fusion(#[from] FusionError),

    /// Query-time retrieval errors
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the configuration key that failed validation
    pub path: String,
    /// Error message describing the validation failure
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result type for kbsearch operations
pub type Result<T> = std::result::Result<T, KbError>;
