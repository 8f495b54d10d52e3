//! Knowledge (C3): the ingestion and retrieval façade over a `VectorStore`.
//!
//! Grounded in `knowledge/knowledge.rs` from the teacher crate (`Knowledge`
//! struct wrapping a storage handle plus `sources`/`embedder_config`), which
//! this generalizes to own real chunking and a pluggable `VectorStore` rather
//! than delegating to an unintegrated `KnowledgeStorage` stub.

pub mod catalog;
pub mod chunking;

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::document::{Document, KnowledgeInfo, Metadata, SearchResult};
use crate::error::CoreError;
use crate::vectorstore::{DefaultFilters, FilterExpr, VectorStore};

use catalog::{ContentCatalog, ContentRow, ContentStatus, ListParams};
use chunking::{chunk_document, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};

/// Progress notification emitted during a parallel ingest fan-out.
#[derive(Debug, Clone)]
pub struct IngestProgress {
    pub completed_batches: usize,
    pub total_batches: usize,
    pub chunks_written: usize,
}

/// Configuration knobs for one `Knowledge` instance (§6).
#[derive(Debug, Clone)]
pub struct KnowledgeConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Chunk count above which ingestion fans out across workers.
    pub parallel_threshold: usize,
    /// Worker count for parallel ingest, capped at 15.
    pub parallel_workers: usize,
    /// Batch size per worker call.
    pub batch_size: usize,
    /// Filters always applied at query time in addition to caller filters.
    pub default_filters: DefaultFilters,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            parallel_threshold: 500,
            parallel_workers: 10,
            batch_size: 125,
            default_filters: DefaultFilters::new(),
        }
    }
}

/// Ingestion and retrieval façade over one named collection.
pub struct Knowledge {
    name: String,
    description: String,
    store: Arc<dyn VectorStore>,
    config: KnowledgeConfig,
    created_at: chrono::DateTime<Utc>,
    catalog: ContentCatalog,
}

impl Knowledge {
    pub fn new(name: impl Into<String>, store: Arc<dyn VectorStore>, config: KnowledgeConfig) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            store,
            config,
            created_at: Utc::now(),
            catalog: ContentCatalog::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Ensure the backing store exists before use.
    pub async fn init(&self) -> Result<(), CoreError> {
        self.store.create().await
    }

    /// Chunk and load one document's worth of content (§4.3: "chunking a
    /// single source").
    pub async fn load_document(
        &self,
        name: &str,
        content: &str,
        source: &str,
        content_type: &str,
        metadata: Metadata,
    ) -> Result<usize, CoreError> {
        let row = ContentRow::new(source, name, content_type, content.len()).with_metadata(metadata.clone());
        self.catalog.put(row);

        let result = self
            .load_many(&[(name.to_string(), content.to_string(), source.to_string(), content_type.to_string(), metadata)], None)
            .await;

        if let Some(mut row) = self.catalog.get(source) {
            match &result {
                Ok(_) => row.mark(ContentStatus::Completed, None),
                Err(e) => row.mark(ContentStatus::Failed, Some(e.to_string())),
            }
            self.catalog.put(row);
        }
        result
    }

    /// Chunk and load multiple sources, fanning out across parallel workers
    /// once the total chunk count crosses `parallel_threshold` (§4.3, §5).
    pub async fn load_many(
        &self,
        sources: &[(String, String, String, String, Metadata)],
        progress: Option<&(dyn Fn(IngestProgress) + Send + Sync)>,
    ) -> Result<usize, CoreError> {
        let mut all_chunks: Vec<Document> = Vec::new();
        for (name, content, source, content_type, metadata) in sources {
            let mut chunks = chunk_document(
                name,
                content,
                source,
                content_type,
                metadata.clone(),
                self.config.chunk_size,
                self.config.chunk_overlap,
            );
            all_chunks.append(&mut chunks);
        }

        let total = all_chunks.len();
        if total == 0 {
            return Ok(0);
        }

        if total <= self.config.parallel_threshold {
            self.store.upsert(all_chunks, &self.config.default_filters).await?;
            if let Some(cb) = progress {
                cb(IngestProgress {
                    completed_batches: 1,
                    total_batches: 1,
                    chunks_written: total,
                });
            }
            return Ok(total);
        }

        let workers = self.config.parallel_workers.min(15).max(1);
        let batch_size = self.config.batch_size.max(1);
        let batches: Vec<Vec<Document>> = all_chunks
            .chunks(batch_size)
            .map(|c| c.to_vec())
            .collect();
        let total_batches = batches.len();

        let semaphore = Arc::new(tokio::sync::Semaphore::new(workers));
        let mut handles = Vec::new();
        for batch in batches {
            let store = Arc::clone(&self.store);
            let defaults = self.config.default_filters.clone();
            let sem = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore not closed");
                let len = batch.len();
                store.upsert(batch, &defaults).await.map(|_| len)
            }));
        }

        let mut written = 0usize;
        let mut completed = 0usize;
        let mut first_error: Option<CoreError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(n)) => {
                    written += n;
                    completed += 1;
                    if let Some(cb) = progress {
                        cb(IngestProgress {
                            completed_batches: completed,
                            total_batches,
                            chunks_written: written,
                        });
                    }
                }
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        first_error = Some(CoreError::TransientStore(join_err.to_string()));
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        Ok(written)
    }

    /// Search with the instance's default filters merged under any
    /// caller-supplied filters (caller filters take precedence, §4.3).
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchResult>, CoreError> {
        self.search_with_filters(query, k, None).await
    }

    pub async fn search_with_filters(
        &self,
        query: &str,
        k: usize,
        filters: Option<&FilterExpr>,
    ) -> Result<Vec<SearchResult>, CoreError> {
        let merged = self.merge_default_filters(filters);
        self.store.search(query, k, merged.as_ref()).await
    }

    /// Merge the instance's `default_filters` under a caller-supplied filter,
    /// caller keys winning on conflict (§4.3). Only the `Equality` shape is
    /// merged into; a caller-supplied `Group` filter is passed through
    /// untouched since there is no single map to merge defaults into.
    fn merge_default_filters(&self, filters: Option<&FilterExpr>) -> Option<FilterExpr> {
        if self.config.default_filters.is_empty() {
            return filters.cloned();
        }
        match filters {
            None => Some(FilterExpr::Equality(self.config.default_filters.clone())),
            Some(FilterExpr::Equality(caller)) => {
                let mut merged = self.config.default_filters.clone();
                merged.extend(caller.clone());
                if merged.is_empty() {
                    None
                } else {
                    Some(FilterExpr::Equality(merged))
                }
            }
            Some(group @ FilterExpr::Group(_)) => Some(group.clone()),
        }
    }

    pub async fn drop(&self) -> Result<(), CoreError> {
        self.catalog.clear();
        self.store.drop().await
    }

    pub async fn exists(&self) -> Result<bool, CoreError> {
        self.store.exists().await
    }

    pub async fn get_count(&self) -> Result<usize, CoreError> {
        self.store.get_count().await
    }

    pub fn info(&self) -> KnowledgeInfo {
        KnowledgeInfo {
            name: self.name.clone(),
            kind: "knowledge".to_string(),
            description: self.description.clone(),
            created_at: self.created_at,
            updated_at: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    /// Record or overwrite an adjunct catalog entry, independent of the
    /// vector store itself (§4.3, §6, SPEC_FULL B.3). Core retrieval
    /// correctness never depends on this table.
    pub fn catalog_put(&self, row: ContentRow) {
        self.catalog.put(row);
    }

    pub fn catalog_get(&self, id: &str) -> Option<ContentRow> {
        self.catalog.get(id)
    }

    pub fn catalog_remove(&self, id: &str) -> Option<ContentRow> {
        self.catalog.remove(id)
    }

    /// List catalog rows with `limit`/`page`/`sort_by`/`sort_order`,
    /// defaulting to `updated_at desc` (§6).
    pub fn catalog_list(&self, params: ListParams) -> Vec<ContentRow> {
        self.catalog.list(params)
    }
}

/// Convenience: build an equality-only default-filters map from JSON values.
pub fn filters(pairs: &[(&str, Value)]) -> DefaultFilters {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::MockEmbedder;
    use crate::vectorstore::backends::InMemoryVectorStore;

    fn knowledge() -> Knowledge {
        let store = Arc::new(InMemoryVectorStore::new("kb", Arc::new(MockEmbedder::new(16))));
        Knowledge::new("kb", store, KnowledgeConfig::default())
    }

    #[tokio::test]
    async fn load_document_then_search_finds_content() {
        let kb = knowledge();
        kb.init().await.unwrap();
        kb.load_document("doc1", "rust is a systems programming language", "s1", "text/plain", Metadata::new())
            .await
            .unwrap();
        let results = kb.search("rust systems programming", 3).await.unwrap();
        assert!(!results.is_empty());
    }

    #[tokio::test]
    async fn large_source_fans_out_in_parallel() {
        let mut config = KnowledgeConfig::default();
        config.parallel_threshold = 5;
        config.batch_size = 2;
        let store = Arc::new(InMemoryVectorStore::new("kb", Arc::new(MockEmbedder::new(16))));
        let kb = Knowledge::new("kb", store, config);
        kb.init().await.unwrap();
        let content: String = (0..300).map(|i| format!("paragraph {i} about testing ")).collect();
        let count = kb
            .load_document("big", &content, "s1", "text/plain", Metadata::new())
            .await
            .unwrap();
        assert!(count > 5);
        assert_eq!(kb.get_count().await.unwrap(), count);
    }

    #[tokio::test]
    async fn catalog_put_get_remove_roundtrip() {
        let kb = knowledge();
        kb.catalog_put(ContentRow::new("source-a", "Source A", "text/plain", 0));
        assert!(kb.catalog_get("source-a").is_some());
        kb.catalog_remove("source-a");
        assert!(kb.catalog_get("source-a").is_none());
    }

    #[tokio::test]
    async fn search_with_filters_merges_default_filters() {
        let store = Arc::new(InMemoryVectorStore::new("kb", Arc::new(MockEmbedder::new(16))));
        let mut config = KnowledgeConfig::default();
        config
            .default_filters
            .insert("tenant".to_string(), serde_json::json!("acme"));
        config
            .default_filters
            .insert("lang".to_string(), serde_json::json!("en"));
        let kb = Knowledge::new("kb", store, config);
        kb.init().await.unwrap();

        let mut meta = Metadata::new();
        meta.insert("tenant".to_string(), serde_json::json!("acme"));
        meta.insert("lang".to_string(), serde_json::json!("fr"));
        kb.load_document("doc1", "rust is a systems programming language", "s1", "text/plain", meta)
            .await
            .unwrap();

        // caller overrides `lang`, inherits `tenant` from default_filters.
        let caller_filter = FilterExpr::eq("lang", serde_json::json!("fr"));
        let results = kb
            .search_with_filters("rust systems programming", 3, Some(&caller_filter))
            .await
            .unwrap();
        assert!(!results.is_empty());

        let no_match = FilterExpr::eq("lang", serde_json::json!("en"));
        let results = kb
            .search_with_filters("rust systems programming", 3, Some(&no_match))
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn load_document_records_a_completed_catalog_row() {
        let kb = knowledge();
        kb.init().await.unwrap();
        kb.load_document("doc1", "rust is a systems programming language", "s1", "text/plain", Metadata::new())
            .await
            .unwrap();
        let row = kb.catalog_get("s1").unwrap();
        assert_eq!(row.status, ContentStatus::Completed);
        assert_eq!(row.name, "doc1");
    }
}
