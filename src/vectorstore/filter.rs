//! Metadata filter DSL (§4.2): conjunctive equality plus an advanced
//! `{must, should, must_not}` expression tree.
//!
//! Grounded in `rag/storage/mod.rs`'s `CollectionSearchParams` (a bare
//! `HashMap<String, Value>` equality filter in the teacher crate), extended
//! here to the richer boolean/operator tree the spec calls for.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::Document;

/// A single field-level predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FilterOp {
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    Gt { field: String, value: Value },
    Gte { field: String, value: Value },
    Lt { field: String, value: Value },
    Lte { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    Nin { field: String, values: Vec<Value> },
    Contains { field: String, value: String },
    Range { field: String, min: Option<Value>, max: Option<Value> },
}

impl FilterOp {
    fn matches(&self, doc: &Document) -> bool {
        match self {
            FilterOp::Eq { field, value } => doc.metadata.get(field) == Some(value),
            FilterOp::Ne { field, value } => doc.metadata.get(field) != Some(value),
            FilterOp::Gt { field, value } => compare(doc, field, value) == Some(std::cmp::Ordering::Greater),
            FilterOp::Gte { field, value } => {
                matches!(compare(doc, field, value), Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal))
            }
            FilterOp::Lt { field, value } => compare(doc, field, value) == Some(std::cmp::Ordering::Less),
            FilterOp::Lte { field, value } => {
                matches!(compare(doc, field, value), Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal))
            }
            FilterOp::In { field, values } => doc
                .metadata
                .get(field)
                .map(|v| values.contains(v))
                .unwrap_or(false),
            FilterOp::Nin { field, values } => !doc
                .metadata
                .get(field)
                .map(|v| values.contains(v))
                .unwrap_or(false),
            FilterOp::Contains { field, value } => doc
                .metadata
                .get(field)
                .and_then(|v| v.as_str())
                .map(|s| s.contains(value.as_str()))
                .unwrap_or(false),
            FilterOp::Range { field, min, max } => {
                let ge_min = min.as_ref().map(|m| {
                    matches!(compare(doc, field, m), Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal))
                }).unwrap_or(true);
                let le_max = max.as_ref().map(|m| {
                    matches!(compare(doc, field, m), Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal))
                }).unwrap_or(true);
                ge_min && le_max
            }
        }
    }
}

fn compare(doc: &Document, field: &str, value: &Value) -> Option<std::cmp::Ordering> {
    let actual = doc.metadata.get(field)?;
    match (actual.as_f64(), value.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (actual.as_str(), value.as_str()) {
            (Some(a), Some(b)) => Some(a.cmp(b)),
            _ => None,
        },
    }
}

/// A group of predicates combined as `must` (AND), `should` (OR, at least
/// one if non-empty), and `must_not` (AND NOT).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterGroup {
    #[serde(default)]
    pub must: Vec<FilterOp>,
    #[serde(default)]
    pub should: Vec<FilterOp>,
    #[serde(default)]
    pub must_not: Vec<FilterOp>,
}

impl FilterGroup {
    fn matches(&self, doc: &Document) -> bool {
        if !self.must.iter().all(|f| f.matches(doc)) {
            return false;
        }
        if !self.should.is_empty() && !self.should.iter().any(|f| f.matches(doc)) {
            return false;
        }
        if self.must_not.iter().any(|f| f.matches(doc)) {
            return false;
        }
        true
    }
}

/// Top-level filter expression: either plain equality pairs (the common,
/// conjunctive case) or an explicit `FilterGroup` tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterExpr {
    Equality(std::collections::HashMap<String, Value>),
    Group(FilterGroup),
}

impl FilterExpr {
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            FilterExpr::Equality(pairs) => pairs.iter().all(|(k, v)| doc.metadata.get(k) == Some(v)),
            FilterExpr::Group(group) => group.matches(doc),
        }
    }

    pub fn eq(field: impl Into<String>, value: Value) -> FilterExpr {
        let mut m = std::collections::HashMap::new();
        m.insert(field.into(), value);
        FilterExpr::Equality(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn doc_with(key: &str, value: Value) -> Document {
        let mut meta = HashMap::new();
        meta.insert(key.to_string(), value);
        Document::new("n", "c", "s").with_metadata(meta)
    }

    #[test]
    fn equality_filter_matches_exact_value() {
        let doc = doc_with("topic", json!("rust"));
        let filter = FilterExpr::eq("topic", json!("rust"));
        assert!(filter.matches(&doc));
        let filter2 = FilterExpr::eq("topic", json!("python"));
        assert!(!filter2.matches(&doc));
    }

    #[test]
    fn group_must_not_excludes() {
        let doc = doc_with("status", json!("deprecated"));
        let group = FilterGroup {
            must: vec![],
            should: vec![],
            must_not: vec![FilterOp::Eq {
                field: "status".to_string(),
                value: json!("deprecated"),
            }],
        };
        assert!(!FilterExpr::Group(group).matches(&doc));
    }

    #[test]
    fn range_filter_bounds_numeric_field() {
        let doc = doc_with("confidence", json!(0.6));
        let group = FilterGroup {
            must: vec![FilterOp::Range {
                field: "confidence".to_string(),
                min: Some(json!(0.5)),
                max: Some(json!(0.9)),
            }],
            should: vec![],
            must_not: vec![],
        };
        assert!(FilterExpr::Group(group).matches(&doc));
    }

    #[test]
    fn in_operator_checks_membership() {
        let doc = doc_with("tag", json!("faq"));
        let group = FilterGroup {
            must: vec![FilterOp::In {
                field: "tag".to_string(),
                values: vec![json!("faq"), json!("howto")],
            }],
            should: vec![],
            must_not: vec![],
        };
        assert!(FilterExpr::Group(group).matches(&doc));
    }
}
