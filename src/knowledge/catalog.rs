//! The optional "contents" metadata adjunct (§4.3, §6, SPEC_FULL B.3): a
//! listing table an external UI can page/sort over, independent of the
//! vector store itself. Core retrieval correctness never depends on it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::document::Metadata;

/// Lifecycle status of one catalog row, independent of learning-item status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentStatus {
    Processing,
    Completed,
    Failed,
}

impl ContentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentStatus::Processing => "processing",
            ContentStatus::Completed => "completed",
            ContentStatus::Failed => "failed",
        }
    }
}

/// One row of the `{id, name, description, type, size, status,
/// status_message, metadata_json, created_at, updated_at}` table §6 names.
#[derive(Debug, Clone)]
pub struct ContentRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub content_type: String,
    pub size: usize,
    pub status: ContentStatus,
    pub status_message: Option<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContentRow {
    pub fn new(id: impl Into<String>, name: impl Into<String>, content_type: impl Into<String>, size: usize) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            content_type: content_type.into(),
            size,
            status: ContentStatus::Processing,
            status_message: None,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn mark(&mut self, status: ContentStatus, message: Option<String>) {
        self.status = status;
        self.status_message = message;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    UpdatedAt,
    CreatedAt,
    Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Listing params; defaults match §6 exactly (`updated_at desc`).
#[derive(Debug, Clone, Copy)]
pub struct ListParams {
    pub limit: usize,
    pub page: usize,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            limit: 20,
            page: 1,
            sort_by: SortBy::UpdatedAt,
            sort_order: SortOrder::Desc,
        }
    }
}

/// In-memory listing table. A SQLite-backed variant would share this shape
/// behind the same interface; §4.3 treats this as an adjunct, not a core
/// correctness dependency, so only the in-memory form is provided here.
#[derive(Default)]
pub struct ContentCatalog {
    rows: parking_lot::RwLock<HashMap<String, ContentRow>>,
}

impl ContentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, row: ContentRow) {
        self.rows.write().insert(row.id.clone(), row);
    }

    pub fn get(&self, id: &str) -> Option<ContentRow> {
        self.rows.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<ContentRow> {
        self.rows.write().remove(id)
    }

    pub fn clear(&self) {
        self.rows.write().clear();
    }

    /// List rows with `limit`/`page`/`sort_by`/`sort_order` (1-indexed pages,
    /// §6). An out-of-range page returns an empty slice, never an error.
    pub fn list(&self, params: ListParams) -> Vec<ContentRow> {
        let mut rows: Vec<ContentRow> = self.rows.read().values().cloned().collect();
        rows.sort_by(|a, b| {
            let ordering = match params.sort_by {
                SortBy::UpdatedAt => a.updated_at.cmp(&b.updated_at),
                SortBy::CreatedAt => a.created_at.cmp(&b.created_at),
                SortBy::Name => a.name.cmp(&b.name),
            };
            match params.sort_order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let page = params.page.max(1);
        let limit = params.limit.max(1);
        let start = (page - 1) * limit;
        if start >= rows.len() {
            return Vec::new();
        }
        let end = (start + limit).min(rows.len());
        rows[start..end].to_vec()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_remove_roundtrip() {
        let catalog = ContentCatalog::new();
        catalog.put(ContentRow::new("a", "Doc A", "text/plain", 100));
        assert!(catalog.get("a").is_some());
        assert_eq!(catalog.remove("a").unwrap().name, "Doc A");
        assert!(catalog.get("a").is_none());
    }

    #[test]
    fn list_defaults_to_updated_at_desc() {
        let catalog = ContentCatalog::new();
        let mut first = ContentRow::new("a", "A", "text/plain", 10);
        first.updated_at = Utc::now() - chrono::Duration::seconds(10);
        let mut second = ContentRow::new("b", "B", "text/plain", 10);
        second.updated_at = Utc::now();
        catalog.put(first);
        catalog.put(second);

        let rows = catalog.list(ListParams::default());
        assert_eq!(rows[0].id, "b");
        assert_eq!(rows[1].id, "a");
    }

    #[test]
    fn list_paginates() {
        let catalog = ContentCatalog::new();
        for i in 0..5 {
            catalog.put(ContentRow::new(format!("id{i}"), format!("name{i}"), "text/plain", 1));
        }
        let page1 = catalog.list(ListParams {
            limit: 2,
            page: 1,
            sort_by: SortBy::Name,
            sort_order: SortOrder::Asc,
        });
        let page2 = catalog.list(ListParams {
            limit: 2,
            page: 2,
            sort_by: SortBy::Name,
            sort_order: SortOrder::Asc,
        });
        assert_eq!(page1.iter().map(|r| r.id.clone()).collect::<Vec<_>>(), vec!["id0", "id1"]);
        assert_eq!(page2.iter().map(|r| r.id.clone()).collect::<Vec<_>>(), vec!["id2", "id3"]);
    }

    #[test]
    fn list_out_of_range_page_is_empty() {
        let catalog = ContentCatalog::new();
        catalog.put(ContentRow::new("a", "A", "text/plain", 1));
        let rows = catalog.list(ListParams {
            limit: 10,
            page: 5,
            ..Default::default()
        });
        assert!(rows.is_empty());
    }

    #[test]
    fn mark_updates_status_and_touches_updated_at() {
        let mut row = ContentRow::new("a", "A", "text/plain", 1);
        let before = row.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        row.mark(ContentStatus::Completed, None);
        assert_eq!(row.status, ContentStatus::Completed);
        assert!(row.updated_at >= before);
    }

    #[test]
    fn status_as_str_matches_spec_names() {
        assert_eq!(ContentStatus::Processing.as_str(), "processing");
        assert_eq!(ContentStatus::Completed.as_str(), "completed");
        assert_eq!(ContentStatus::Failed.as_str(), "failed");
    }
}
