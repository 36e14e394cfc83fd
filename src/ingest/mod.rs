//! Document ingestion
//!
//! Documents reach the pipeline through the [`DocumentSource`] trait. The
//! bundled [`DirectorySource`] walks a directory of plain-text and Markdown
//! policy files; format extraction for PDF/DOCX lives outside this crate.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// File extensions read by [`DirectorySource`]
const SUPPORTED_EXTENSIONS: &[&str] = &["md", "markdown", "txt"];

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Document directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Failed to walk {path}: {message}")]
    Walk { path: PathBuf, message: String },
}

/// A plain-text document with its source identifier and category tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// File path (relative to the ingested root) or URI
    pub source_id: String,
    /// Document-level category, e.g. "HR Policy"
    pub doc_type: String,
    /// Full plain text
    pub text: String,
}

impl Document {
    pub fn new(
        source_id: impl Into<String>,
        doc_type: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            doc_type: doc_type.into(),
            text: text.into(),
        }
    }

    /// Build a document, deriving its category from the source name
    pub fn classified(source_id: impl Into<String>, text: impl Into<String>) -> Self {
        let source_id = source_id.into();
        let doc_type = classify_policy(&source_id).to_string();
        Self::new(source_id, doc_type, text)
    }
}

/// A document that could not be ingested or chunked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFailure {
    pub source_id: String,
    pub reason: String,
}

impl DocumentFailure {
    pub fn new(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }
}

/// Documents read from a source plus the ones that failed to read
#[derive(Debug, Default)]
pub struct IngestBatch {
    pub documents: Vec<Document>,
    pub failures: Vec<DocumentFailure>,
}

/// Supplier of documents for index builds
pub trait DocumentSource: Send + Sync {
    fn list_documents(&self) -> Result<IngestBatch, IngestError>;
}

/// In-memory documents, mostly useful for tests and embedding callers
impl DocumentSource for Vec<Document> {
    fn list_documents(&self) -> Result<IngestBatch, IngestError> {
        Ok(IngestBatch {
            documents: self.clone(),
            failures: Vec::new(),
        })
    }
}

/// Recursively reads `.md`, `.markdown` and `.txt` files under a directory
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn source_id(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

impl DocumentSource for DirectorySource {
    fn list_documents(&self) -> Result<IngestBatch, IngestError> {
        if !self.root.is_dir() {
            return Err(IngestError::DirectoryNotFound(self.root.clone()));
        }

        let mut batch = IngestBatch::default();

        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(|e| IngestError::Walk {
                path: self.root.clone(),
                message: e.to_string(),
            })?;

            if !entry.file_type().is_file() || !is_supported(entry.path()) {
                continue;
            }

            let source_id = self.source_id(entry.path());
            match std::fs::read_to_string(entry.path()) {
                Ok(text) if text.trim().is_empty() => {
                    warn!("Skipping empty document: {}", source_id);
                }
                Ok(text) => {
                    debug!("Ingested {} ({} bytes)", source_id, text.len());
                    batch.documents.push(Document::classified(source_id, text));
                }
                Err(e) => {
                    warn!("Failed to read {}: {}", source_id, e);
                    batch.failures.push(DocumentFailure::new(source_id, e.to_string()));
                }
            }
        }

        info!(
            "Ingested {} documents from {} ({} failed)",
            batch.documents.len(),
            self.root.display(),
            batch.failures.len()
        );

        Ok(batch)
    }
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Derive a policy category from a file name
pub fn classify_policy(source_id: &str) -> &'static str {
    let name = Path::new(source_id)
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| source_id.to_lowercase());

    if name.contains("hr") || name.contains("employee") {
        "HR Policy"
    } else if name.contains("security") || name.contains("data") {
        "Security Policy"
    } else if name.contains("handbook") || name.contains("company") {
        "Company Policy"
    } else {
        "General Policy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_classify_policy() {
        assert_eq!(classify_policy("docs/hr_leave.md"), "HR Policy");
        assert_eq!(classify_policy("Employee-Guide.txt"), "HR Policy");
        assert_eq!(classify_policy("data_retention.md"), "Security Policy");
        assert_eq!(classify_policy("company_handbook.md"), "Company Policy");
        assert_eq!(classify_policy("travel.md"), "General Policy");
    }

    #[test]
    fn test_directory_source_reads_supported_files() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("policies");
        std::fs::create_dir_all(&nested).unwrap();

        std::fs::write(nested.join("hr_policy.md"), "## Leave\nTwenty days.").unwrap();
        std::fs::write(temp.path().join("travel.txt"), "Book economy.").unwrap();
        std::fs::write(temp.path().join("logo.png"), [0u8, 1, 2]).unwrap();
        std::fs::write(temp.path().join("blank.md"), "   \n").unwrap();

        let batch = DirectorySource::new(temp.path()).list_documents().unwrap();

        let ids: Vec<&str> = batch.documents.iter().map(|d| d.source_id.as_str()).collect();
        assert_eq!(ids, vec!["policies/hr_policy.md", "travel.txt"]);
        assert_eq!(batch.documents[0].doc_type, "HR Policy");
        assert!(batch.failures.is_empty());
    }

    #[test]
    fn test_non_utf8_file_is_reported() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("broken.txt"), [0xff, 0xfe, 0xfd]).unwrap();
        std::fs::write(temp.path().join("ok.txt"), "Fine.").unwrap();

        let batch = DirectorySource::new(temp.path()).list_documents().unwrap();

        assert_eq!(batch.documents.len(), 1);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].source_id, "broken.txt");
    }

    #[test]
    fn test_missing_directory() {
        let temp = TempDir::new().unwrap();
        let source = DirectorySource::new(temp.path().join("nope"));
        assert!(matches!(
            source.list_documents(),
            Err(IngestError::DirectoryNotFound(_))
        ));
    }
}
