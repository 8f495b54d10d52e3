//! Core retrieval data model: `Document`, `SearchResult`, `KnowledgeInfo`.
//!
//! Grounded in `rag/types.rs` (`BaseRecord`, `SearchResult`) from the teacher
//! crate, generalized to the richer `Document` shape spec'd in §3 (chunking
//! triple, embeddings, open-ended metadata).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A scalar or list value in a document's metadata map.
///
/// `string -> (scalar | list)`, persisted as JSON in SQL-backed stores and as
/// payload maps in vector-store backends.
pub type Metadata = HashMap<String, Value>;

/// A single document record, the unit of storage and retrieval.
///
/// Invariant: `embeddings`, when present, has length equal to the owning
/// Knowledge's embedder dimension (enforced by `VectorStore::insert`/`upsert`
/// and by `Knowledge::load`, not by this struct itself).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub name: String,
    pub content: String,
    pub content_type: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<Vec<f32>>,
    pub chunk_index: usize,
    pub chunk_total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Document {
    /// Create a new single-chunk document with a content-derived id.
    pub fn new(name: impl Into<String>, content: impl Into<String>, source: impl Into<String>) -> Self {
        let content = content.into();
        let now = Utc::now();
        let id = content_hash_id(&content);
        Self {
            id,
            name: name.into(),
            content,
            content_type: "text/plain".to_string(),
            source: source.into(),
            created_at: now,
            updated_at: now,
            embeddings: None,
            chunk_index: 0,
            chunk_total: 1,
            parent_id: None,
            metadata: HashMap::new(),
        }
    }

    /// Builder: attach metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Builder: attach an explicit id (overrides the content-hash default).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Builder: set the embedding vector.
    pub fn with_embeddings(mut self, embeddings: Vec<f32>) -> Self {
        self.embeddings = Some(embeddings);
        self
    }

    /// Touch `updated_at` to the current time. Called on any mutation.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Read a string metadata value, if present.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Read an i64 metadata value, if present.
    pub fn meta_i64(&self, key: &str) -> Option<i64> {
        self.metadata.get(key).and_then(|v| v.as_i64())
    }

    /// Read an f64 metadata value, if present.
    pub fn meta_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(|v| v.as_f64())
    }
}

/// Derive a stable, content-addressed id. Re-ingesting identical content
/// yields the same id, which is how chunk ingestion stays idempotent (§4.3).
pub fn content_hash_id(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())[..32].to_string()
}

/// `(document, score, distance)` — the uniform result of a similarity search.
///
/// Contract: a result list is sorted by `score` descending; `distance` moves
/// opposite to similarity. `score` is normalized to `[0, 1]` where feasible,
/// with `1.0` most relevant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub document: Document,
    pub score: f64,
    pub distance: f64,
}

impl SearchResult {
    pub fn new(document: Document, score: f64, distance: f64) -> Self {
        Self {
            document,
            score,
            distance,
        }
    }
}

/// Immutable descriptive snapshot of a Knowledge instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeInfo {
    pub name: String,
    pub kind: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable() {
        let a = content_hash_id("hello world");
        let b = content_hash_id("hello world");
        assert_eq!(a, b);
        assert_ne!(a, content_hash_id("hello world!"));
    }

    #[test]
    fn document_clone_deep_copies_metadata() {
        let mut meta = HashMap::new();
        meta.insert("k".to_string(), Value::String("v".to_string()));
        let doc = Document::new("n", "c", "s").with_metadata(meta);
        let mut cloned = doc.clone();
        cloned
            .metadata
            .insert("k2".to_string(), Value::String("v2".to_string()));
        assert!(!doc.metadata.contains_key("k2"));
    }

    #[test]
    fn touch_advances_updated_at() {
        let mut doc = Document::new("n", "c", "s");
        let before = doc.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        doc.touch();
        assert!(doc.updated_at >= before);
    }
}
