//! Concrete `VectorStore` backends.
//!
//! `InMemoryVectorStore` is a fully working reference implementation used by
//! tests and by callers with no external store configured. The remaining
//! backends are thin dispatch stubs grounded in `rag/factory.rs` and
//! `rag/chromadb`/`rag/qdrant` from the teacher crate, which themselves only
//! ever got as far as a `SupportedProvider` registry plus a
//! "needs native integration" error — real network calls are out of scope
//! here the same way they were left unintegrated there.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::document::{Document, SearchResult};
use crate::embeddings::Embedder;
use crate::error::CoreError;

use super::{cosine_distance, dot_score, l2_distance, normalize_score, DefaultFilters, Distance, FilterExpr, VectorStore};

/// An in-process, non-persistent vector store backed by a `Vec<Document>`
/// guarded by a `parking_lot::RwLock`. Supports both dense and keyword
/// search natively, so it exercises the full `VectorStore` contract
/// including hybrid combination.
pub struct InMemoryVectorStore {
    name: String,
    metric: Distance,
    embedder: Arc<dyn Embedder>,
    docs: RwLock<Vec<Document>>,
    created: RwLock<bool>,
}

impl InMemoryVectorStore {
    pub fn new(name: impl Into<String>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            name: name.into(),
            metric: Distance::Cosine,
            embedder,
            docs: RwLock::new(Vec::new()),
            created: RwLock::new(false),
        }
    }

    pub fn with_metric(mut self, metric: Distance) -> Self {
        self.metric = metric;
        self
    }

    fn merge_default_filters(doc: &mut Document, default_filters: &DefaultFilters) {
        for (k, v) in default_filters {
            doc.metadata.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    async fn embed_missing(&self, docs: &mut [Document]) -> Result<(), CoreError> {
        for doc in docs.iter_mut() {
            if doc.embeddings.is_none() {
                let v = self.embedder.embed(&doc.content).await?;
                doc.embeddings = Some(v);
            }
        }
        Ok(())
    }

    fn score(&self, query_vec: &[f32], doc_vec: &[f32]) -> (f64, f64) {
        match self.metric {
            Distance::Cosine => {
                let d = cosine_distance(query_vec, doc_vec);
                (normalize_score(d, Distance::Cosine), d)
            }
            Distance::L2 | Distance::Euclidean => {
                let d = l2_distance(query_vec, doc_vec);
                (normalize_score(d, Distance::L2), d)
            }
            Distance::MaxInnerProduct | Distance::Dot => {
                let s = dot_score(query_vec, doc_vec);
                (normalize_score(s, self.metric), -s)
            }
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn create(&self) -> Result<(), CoreError> {
        *self.created.write() = true;
        Ok(())
    }

    async fn exists(&self) -> Result<bool, CoreError> {
        Ok(*self.created.read())
    }

    async fn drop(&self) -> Result<(), CoreError> {
        self.docs.write().clear();
        *self.created.write() = false;
        Ok(())
    }

    async fn optimize(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn insert(&self, mut docs: Vec<Document>, default_filters: &DefaultFilters) -> Result<(), CoreError> {
        self.embed_missing(&mut docs).await?;
        for mut doc in docs {
            Self::merge_default_filters(&mut doc, default_filters);
            self.docs.write().push(doc);
        }
        Ok(())
    }

    async fn upsert(&self, mut docs: Vec<Document>, default_filters: &DefaultFilters) -> Result<(), CoreError> {
        self.embed_missing(&mut docs).await?;
        let mut store = self.docs.write();
        for mut doc in docs {
            Self::merge_default_filters(&mut doc, default_filters);
            if let Some(existing) = store.iter_mut().find(|d| d.id == doc.id) {
                *existing = doc;
            } else {
                store.push(doc);
            }
        }
        Ok(())
    }

    fn supports_keyword_search(&self) -> bool {
        true
    }

    async fn vector_search(
        &self,
        query: &str,
        k: usize,
        filters: Option<&FilterExpr>,
    ) -> Result<Vec<SearchResult>, CoreError> {
        let query_vec = self.embedder.embed(query).await?;
        let store = self.docs.read();
        let mut scored: Vec<SearchResult> = store
            .iter()
            .filter(|d| filters.map(|f| f.matches(d)).unwrap_or(true))
            .filter_map(|d| {
                let doc_vec = d.embeddings.as_ref()?;
                let (score, distance) = self.score(&query_vec, doc_vec);
                Some(SearchResult::new(d.clone(), score, distance))
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn keyword_search(
        &self,
        query: &str,
        k: usize,
        filters: Option<&FilterExpr>,
    ) -> Result<Vec<SearchResult>, CoreError> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let store = self.docs.read();
        let mut scored: Vec<SearchResult> = store
            .iter()
            .filter(|d| filters.map(|f| f.matches(d)).unwrap_or(true))
            .filter_map(|d| {
                let content_lower = d.content.to_lowercase();
                let hits = terms.iter().filter(|t| content_lower.contains(t.as_str())).count();
                if hits == 0 {
                    return None;
                }
                let score = hits as f64 / terms.len() as f64;
                Some(SearchResult::new(d.clone(), score, 1.0 - score))
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn get_count(&self) -> Result<usize, CoreError> {
        Ok(self.docs.read().len())
    }

    async fn id_exists(&self, id: &str) -> Result<bool, CoreError> {
        Ok(self.docs.read().iter().any(|d| d.id == id))
    }

    async fn name_exists(&self, name: &str) -> Result<bool, CoreError> {
        Ok(self.docs.read().iter().any(|d| d.name == name))
    }
}

/// Shared connection-style config for the remote backend stubs below.
#[derive(Debug, Clone)]
pub struct RemoteStoreConfig {
    pub url: String,
    pub collection: String,
    pub api_key: Option<String>,
    pub extra: HashMap<String, Value>,
}

macro_rules! remote_store_stub {
    ($name:ident, $label:literal) => {
        /// Thin dispatch stub. Grounded in the teacher crate's
        #[doc = concat!("`rag/factory.rs` dispatch for the \"", $label, "\" provider, which")]
        /// itself never grew past a placeholder `Unsupported`-style error;
        /// wiring real network calls is out of scope for this core (§6).
        pub struct $name {
            config: RemoteStoreConfig,
        }

        impl $name {
            pub fn new(config: RemoteStoreConfig) -> Self {
                Self { config }
            }

            fn unsupported(&self, op: &str) -> CoreError {
                CoreError::Unsupported(format!(
                    "{} backend '{}' ({}): {op} requires a live connection, not available in this build",
                    $label, self.config.collection, self.config.url
                ))
            }
        }

        #[async_trait]
        impl VectorStore for $name {
            async fn create(&self) -> Result<(), CoreError> {
                Err(self.unsupported("create"))
            }

            async fn exists(&self) -> Result<bool, CoreError> {
                Err(self.unsupported("exists"))
            }

            async fn drop(&self) -> Result<(), CoreError> {
                Err(self.unsupported("drop"))
            }

            async fn optimize(&self) -> Result<(), CoreError> {
                Err(self.unsupported("optimize"))
            }

            async fn insert(&self, _docs: Vec<Document>, _default_filters: &DefaultFilters) -> Result<(), CoreError> {
                Err(self.unsupported("insert"))
            }

            async fn upsert(&self, _docs: Vec<Document>, _default_filters: &DefaultFilters) -> Result<(), CoreError> {
                Err(self.unsupported("upsert"))
            }

            async fn vector_search(
                &self,
                _query: &str,
                _k: usize,
                _filters: Option<&FilterExpr>,
            ) -> Result<Vec<SearchResult>, CoreError> {
                Err(self.unsupported("vector_search"))
            }

            async fn keyword_search(
                &self,
                _query: &str,
                _k: usize,
                _filters: Option<&FilterExpr>,
            ) -> Result<Vec<SearchResult>, CoreError> {
                Err(self.unsupported("keyword_search"))
            }

            async fn get_count(&self) -> Result<usize, CoreError> {
                Err(self.unsupported("get_count"))
            }

            async fn id_exists(&self, _id: &str) -> Result<bool, CoreError> {
                Err(self.unsupported("id_exists"))
            }

            async fn name_exists(&self, _name: &str) -> Result<bool, CoreError> {
                Err(self.unsupported("name_exists"))
            }
        }
    };
}

remote_store_stub!(PgVectorStore, "pgvector");
remote_store_stub!(QdrantStore, "qdrant");
remote_store_stub!(ChromaStore, "chroma");
remote_store_stub!(PineconeStore, "pinecone");
