//! LearningManager (C4): the deduplicating long-term learning loop.
//!
//! Grounded in `memory/long_term/mod.rs`'s `LongTermMemory` façade from the
//! teacher crate (save/search over a single storage handle), generalized
//! here to the full canonicalize -> write-gate -> dedupe -> decide ->
//! auto-promote pipeline the spec calls for (§4.4). Persistence for a
//! learning item is just a `Document` in a `VectorStore` under the
//! `namespace = "learning"` metadata convention, not a bespoke table.

pub mod canonical;
pub mod simhash;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use crate::config::LearningConfig;
use crate::document::{Document, Metadata};
use crate::error::CoreError;
use crate::vectorstore::{FilterExpr, FilterGroup, FilterOp, VectorStore};

use canonical::{canonicalize, write_gate, Canonical};
use simhash::{hamming_distance, simhash64};

pub const NAMESPACE_KEY: &str = "namespace";
pub const NAMESPACE_LEARNING: &str = "learning";
pub const KEY_USER_ID: &str = "user_id";
pub const KEY_TYPE: &str = "type";
pub const KEY_TOPIC: &str = "topic";
pub const KEY_TAGS: &str = "tags";
pub const KEY_VERSION: &str = "version";
pub const KEY_STATUS: &str = "status";
pub const KEY_CONFIDENCE: &str = "confidence";
pub const KEY_HITS: &str = "hits";
pub const KEY_STREAK: &str = "streak";
pub const KEY_SIMHASH: &str = "simhash64";
pub const KEY_LINEAGE_PARENT: &str = "lineage_parent";
/// Carries the originating conversation's session id, when known, purely
/// for lineage/debugging traceability (§4.4's metadata convention).
pub const KEY_SESSION_ID: &str = "session_id";

/// Lifecycle status of a learning item (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearningStatus {
    Candidate,
    Verified,
    Deprecated,
}

impl LearningStatus {
    fn as_str(self) -> &'static str {
        match self {
            LearningStatus::Candidate => "candidate",
            LearningStatus::Verified => "verified",
            LearningStatus::Deprecated => "deprecated",
        }
    }

    fn from_str(s: &str) -> LearningStatus {
        match s {
            "verified" => LearningStatus::Verified,
            "deprecated" => LearningStatus::Deprecated,
            _ => LearningStatus::Candidate,
        }
    }

    /// Ranking weight used when formatting `retrieve_context` (§4.4.8):
    /// verified items outrank candidates.
    fn weight(self) -> u8 {
        match self {
            LearningStatus::Verified => 2,
            LearningStatus::Candidate => 1,
            LearningStatus::Deprecated => 0,
        }
    }
}

/// Thin, typed view over a `Document` carrying the reserved learning
/// metadata keys. Holds no state of its own; all reads/writes go through the
/// wrapped document's metadata map.
#[derive(Debug, Clone)]
pub struct LearningItem {
    pub document: Document,
}

impl LearningItem {
    pub fn user_id(&self) -> Option<&str> {
        self.document.meta_str(KEY_USER_ID)
    }

    pub fn status(&self) -> LearningStatus {
        self.document
            .meta_str(KEY_STATUS)
            .map(LearningStatus::from_str)
            .unwrap_or(LearningStatus::Candidate)
    }

    pub fn version(&self) -> i64 {
        self.document.meta_i64(KEY_VERSION).unwrap_or(1)
    }

    pub fn confidence(&self) -> f64 {
        self.document.meta_f64(KEY_CONFIDENCE).unwrap_or(0.5)
    }

    pub fn hits(&self) -> i64 {
        self.document.meta_i64(KEY_HITS).unwrap_or(0)
    }

    pub fn streak(&self) -> i64 {
        self.document.meta_i64(KEY_STREAK).unwrap_or(0)
    }

    pub fn simhash(&self) -> u64 {
        self.document
            .meta_str(KEY_SIMHASH)
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0)
    }

    fn set(&mut self, key: &str, value: Value) {
        self.document.metadata.insert(key.to_string(), value);
    }
}

/// Outcome of one `observe` call, surfaced to the caller so it can log or
/// test on exactly what happened (§4.4.4's decision tree).
#[derive(Debug)]
pub enum ObserveOutcome {
    Created(LearningItem),
    Merged(LearningItem),
    Deprecated { old_id: String, new_item: LearningItem },
    /// The best-matching document surfaced for the prior query was promoted
    /// straight to `verified` on an explicit user confirmation (§4.4.4's
    /// "user-confirmation heuristic", testable property 9).
    PromotedByConfirmation(LearningItem),
    /// The best-matching document surfaced for the prior query was
    /// deprecated on an explicit user rejection (§4.4.4's "user-rejection
    /// heuristic", testable property 10).
    DeprecatedByRejection { old_id: String },
    Skipped { reason: String },
}

/// Explicit override of the near-match branch of the decision tree
/// (§4.4.4's `dedupe_action` knob). `Merge` and `Skip` are caller overrides;
/// absent (`None` on `ObserveMeta`) falls through to the default heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupeAction {
    Merge,
    NewVersion,
    Skip,
}

/// Context threaded through one `observe` call (§4.4's `meta` parameter):
/// the immediately preceding turn's messages (fallback signal for the
/// confirm/reject heuristic), the document ids the most recent
/// `retrieve_context` call surfaced for this user (so credit/promote/
/// deprecate only ever touches docs the caller actually saw), the
/// originating session id, and a caller-settable override of the near-match
/// decision.
#[derive(Debug, Clone, Default)]
pub struct ObserveMeta {
    pub previous_user_msg: Option<String>,
    pub previous_assistant_msg: Option<String>,
    pub retrieved_doc_ids: Vec<String>,
    pub session_id: Option<String>,
    pub dedupe_action: Option<DedupeAction>,
}

/// How the current (and, as a fallback, the previous) turn should influence
/// the decision tree (§4.4.4): an explicit confirmation forces a merge even
/// on a borderline match; an explicit rejection forces a new version instead
/// of a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnSignal {
    Confirmation,
    Rejection,
    Neutral,
}

static CONFIRM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(yes|yep|exactly|correct|that's right|confirmed|agreed)\b").unwrap()
});
static REJECT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(no|nope|incorrect|that's wrong|not quite|actually no)\b").unwrap()
});

/// Classify the turn signal from the current user message, falling back to
/// the previous turn's user message when the current one is silent on it
/// (§4.4.4; `meta.previous_user_msg` is a real fallback input, not a
/// decorative field).
fn classify_turn_signal(user_msg: &str, previous_user_msg: Option<&str>) -> TurnSignal {
    if REJECT_RE.is_match(user_msg) || previous_user_msg.map(|p| REJECT_RE.is_match(p)).unwrap_or(false) {
        TurnSignal::Rejection
    } else if CONFIRM_RE.is_match(user_msg) || previous_user_msg.map(|p| CONFIRM_RE.is_match(p)).unwrap_or(false) {
        TurnSignal::Confirmation
    } else {
        TurnSignal::Neutral
    }
}

fn normalize_for_exact_match(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Per-item char cap and total-block char cap for `retrieve_context`
/// (§4.4.8): keeps injected memory from dominating the prompt budget.
pub const CONTEXT_ITEM_CHAR_CAP: usize = 300;
pub const CONTEXT_TOTAL_CHAR_CAP: usize = 2000;

/// Confidence assigned when a user explicitly confirms a candidate worked
/// (§4.4.4's user-confirmation heuristic).
const CONFIRMATION_CONFIDENCE: f64 = 0.80;

/// Build the mandatory per-user/namespace/non-deprecated scoping filter,
/// optionally AND-ing in a caller-supplied `extra` filter (§4.3's "caller
/// overrides on conflict" merge rule applied to the learning store's own
/// scoping): an `Equality` extra becomes additional `must` predicates; a
/// `Group` extra has its `must`/`should`/`must_not` folded straight in.
/// Scoping predicates are never removed by `extra` — only added to.
fn user_filter(user_id: &str, extra: Option<&FilterExpr>) -> FilterExpr {
    let mut must = vec![
        FilterOp::Eq {
            field: NAMESPACE_KEY.to_string(),
            value: json!(NAMESPACE_LEARNING),
        },
        FilterOp::Eq {
            field: KEY_USER_ID.to_string(),
            value: json!(user_id),
        },
    ];
    let mut should = Vec::new();
    let mut must_not = vec![FilterOp::Eq {
        field: KEY_STATUS.to_string(),
        value: json!("deprecated"),
    }];

    match extra {
        None => {}
        Some(FilterExpr::Equality(pairs)) => {
            for (field, value) in pairs {
                must.push(FilterOp::Eq {
                    field: field.clone(),
                    value: value.clone(),
                });
            }
        }
        Some(FilterExpr::Group(group)) => {
            must.extend(group.must.clone());
            should.extend(group.should.clone());
            must_not.extend(group.must_not.clone());
        }
    }

    FilterExpr::Group(FilterGroup { must, should, must_not })
}

/// The deduplicating long-term learning loop, backed by any `VectorStore`.
///
/// `last_retrieved` is the mutex-guarded (via `DashMap`'s internal sharded
/// locking) per-user map §4.4.5 and §5 describe: the documents
/// `retrieve_context` most recently surfaced for a user, consulted by the
/// *next* `observe` call to credit implicit evidence (streak) and to locate
/// "the best matching candidate of the prior query" for the explicit
/// confirm/reject heuristics (§4.4.4's last two rows, properties 9-10).
/// `observe`'s `meta.retrieved_doc_ids`, when non-empty, filters this cache
/// down to the ids the public `retrieve_context` call actually returned to
/// the caller, so crediting never acts on a document the caller never saw.
pub struct LearningManager {
    store: Arc<dyn VectorStore>,
    config: LearningConfig,
    last_retrieved: DashMap<String, Vec<Document>>,
}

impl LearningManager {
    pub fn new(store: Arc<dyn VectorStore>, config: LearningConfig) -> Self {
        Self {
            store,
            config,
            last_retrieved: DashMap::new(),
        }
    }

    /// Write learning documents via the store's `upsert`. Fails explicitly
    /// with `upsert_required` rather than silently re-inserting duplicates
    /// when the backing store has no real upsert capability (§9 Open
    /// Question; SPEC_FULL.md §C).
    async fn store_upsert(&self, docs: Vec<Document>) -> Result<(), CoreError> {
        if !self.store.supports_upsert() {
            return Err(CoreError::Unsupported("upsert_required".to_string()));
        }
        self.store.upsert(docs, &Default::default()).await
    }

    /// Build a brand-new v1 candidate `LearningItem` from a canonicalized
    /// turn.
    fn new_candidate(&self, user_id: &str, canonical: &Canonical, meta: &ObserveMeta) -> LearningItem {
        let hash = simhash64(&canonical.content);
        let mut metadata: Metadata = HashMap::new();
        metadata.insert(NAMESPACE_KEY.to_string(), json!(NAMESPACE_LEARNING));
        metadata.insert(KEY_USER_ID.to_string(), json!(user_id));
        metadata.insert(KEY_TYPE.to_string(), json!(canonical.item_type.as_str()));
        metadata.insert(KEY_TOPIC.to_string(), json!(canonical.topic));
        metadata.insert(KEY_TAGS.to_string(), json!(canonical.tags));
        metadata.insert(KEY_VERSION.to_string(), json!(1));
        metadata.insert(KEY_STATUS.to_string(), json!(LearningStatus::Candidate.as_str()));
        metadata.insert(KEY_CONFIDENCE.to_string(), json!(0.55));
        metadata.insert(KEY_HITS.to_string(), json!(0));
        metadata.insert(KEY_STREAK.to_string(), json!(0));
        metadata.insert(KEY_SIMHASH.to_string(), json!(hash.to_string()));
        if let Some(session_id) = &meta.session_id {
            metadata.insert(KEY_SESSION_ID.to_string(), json!(session_id));
        }
        let doc = Document::new(canonical.title.clone(), canonical.content.clone(), "learning").with_metadata(metadata);
        LearningItem { document: doc }
    }

    fn apply_auto_promotion(&self, item: &mut LearningItem) {
        if item.status() == LearningStatus::Deprecated {
            return;
        }
        if item.streak() >= self.config.auto_promote_streak {
            let conf = item.confidence().max(self.config.auto_promote_confidence_streak);
            item.set(KEY_STATUS, json!(LearningStatus::Verified.as_str()));
            item.set(KEY_CONFIDENCE, json!(conf));
        } else if item.hits() >= self.config.auto_promote_hits {
            let conf = item.confidence().max(self.config.auto_promote_confidence_hits);
            item.set(KEY_STATUS, json!(LearningStatus::Verified.as_str()));
            item.set(KEY_CONFIDENCE, json!(conf));
        }
    }

    /// Observe one conversational turn and fold it into learning memory
    /// following the decision tree in §4.4.4. `meta` carries the previous
    /// turn's context, the doc ids the last `retrieve_context` call
    /// surfaced, the session id, and an optional explicit `dedupe_action`
    /// override of the near-match branch.
    pub async fn observe(
        &self,
        user_id: &str,
        user_msg: &str,
        assistant_msg: &str,
        meta: ObserveMeta,
    ) -> Result<ObserveOutcome, CoreError> {
        let signal = classify_turn_signal(user_msg, meta.previous_user_msg.as_deref());
        let retrieved = self.last_retrieved.remove(user_id).map(|(_, docs)| docs);

        if let Some(mut docs) = retrieved {
            if !meta.retrieved_doc_ids.is_empty() {
                docs.retain(|d| meta.retrieved_doc_ids.contains(&d.id));
            }
            match signal {
                TurnSignal::Confirmation => {
                    if let Some(best) = docs.into_iter().next() {
                        return self.promote_by_confirmation(best).await;
                    }
                }
                TurnSignal::Rejection => {
                    if let Some(best) = docs.into_iter().next() {
                        return self.deprecate_by_rejection(best).await;
                    }
                }
                TurnSignal::Neutral => {
                    // Implicit evidence: credit every doc surfaced last time
                    // with one streak point, best-effort (§4.4.5, §5).
                    for doc in docs {
                        if let Err(e) = self.credit_streak(doc).await {
                            log::warn!("learning streak credit failed (best-effort): {e}");
                        }
                    }
                }
            }
        }

        let canonical = canonicalize(user_msg, assistant_msg, &self.config);
        write_gate(&canonical.content, self.config.max_canonical_chars)?;

        let candidate_hash = simhash64(&canonical.content);
        let filter = user_filter(user_id, None);
        let neighbors = self.store.search(&canonical.content, self.config.dedupe_top_k, Some(&filter)).await?;

        let best = neighbors
            .into_iter()
            .map(|r| {
                let item_hash = r
                    .document
                    .meta_str(KEY_SIMHASH)
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(0);
                let distance = hamming_distance(candidate_hash, item_hash);
                (distance, r)
            })
            .min_by_key(|(d, _)| *d);

        let Some((distance, existing)) = best else {
            let item = self.new_candidate(user_id, &canonical, &meta);
            self.store_upsert(vec![item.document.clone()]).await?;
            return Ok(ObserveOutcome::Created(item));
        };

        let is_exact = normalize_for_exact_match(&existing.document.content) == normalize_for_exact_match(&canonical.content);
        if is_exact {
            return Ok(ObserveOutcome::Skipped {
                reason: "exact_match".to_string(),
            });
        }

        if distance > self.config.dedupe_max_hamming {
            let item = self.new_candidate(user_id, &canonical, &meta);
            self.store_upsert(vec![item.document.clone()]).await?;
            return Ok(ObserveOutcome::Created(item));
        }

        // Near-match: an explicit `dedupe_action` overrides the default
        // heuristic (§4.4.4's decision-table row: "explicit dedupe_action =
        // skip -> Skip (duplicate_forced_skip)").
        if meta.dedupe_action == Some(DedupeAction::Skip) {
            return Ok(ObserveOutcome::Skipped {
                reason: "duplicate_forced_skip".to_string(),
            });
        }
        if meta.dedupe_action == Some(DedupeAction::NewVersion) || signal == TurnSignal::Rejection {
            return self.deprecate_and_version(existing.document, user_id, &canonical, &meta).await;
        }

        // Default (and explicit confirmation or forced merge): merge into
        // the existing item.
        let mut item = LearningItem { document: existing.document };
        item.document.content = canonical.content.clone();
        item.document.touch();
        let new_version = item.version() + 1;
        let new_streak = item.streak() + 1;
        item.set(KEY_VERSION, json!(new_version));
        item.set(KEY_STREAK, json!(new_streak));
        item.set(KEY_SIMHASH, json!(simhash64(&canonical.content).to_string()));
        self.apply_auto_promotion(&mut item);
        self.store_upsert(vec![item.document.clone()]).await?;
        Ok(ObserveOutcome::Merged(item))
    }

    async fn deprecate_and_version(
        &self,
        mut old: Document,
        user_id: &str,
        canonical: &Canonical,
        meta: &ObserveMeta,
    ) -> Result<ObserveOutcome, CoreError> {
        let old_id = old.id.clone();
        let old_version = old.meta_i64(KEY_VERSION).unwrap_or(1);
        old.metadata.insert(KEY_STATUS.to_string(), json!(LearningStatus::Deprecated.as_str()));
        old.touch();

        let mut new_item = self.new_candidate(user_id, canonical, meta);
        new_item.set(KEY_VERSION, json!(old_version + 1));
        new_item.set(KEY_LINEAGE_PARENT, json!(old_id));

        self.store_upsert(vec![old, new_item.document.clone()]).await?;
        Ok(ObserveOutcome::Deprecated { old_id, new_item })
    }

    /// Promote the prior query's best-matching candidate straight to
    /// `verified` on an explicit "that worked"-style confirmation (§4.4.4,
    /// property 9).
    async fn promote_by_confirmation(&self, doc: Document) -> Result<ObserveOutcome, CoreError> {
        let mut item = LearningItem { document: doc };
        let new_version = item.version() + 1;
        item.set(KEY_STATUS, json!(LearningStatus::Verified.as_str()));
        item.set(KEY_CONFIDENCE, json!(CONFIRMATION_CONFIDENCE));
        item.set(KEY_VERSION, json!(new_version));
        item.document.touch();
        self.store_upsert(vec![item.document.clone()]).await?;
        Ok(ObserveOutcome::PromotedByConfirmation(item))
    }

    /// Deprecate the prior query's best-matching candidate on an explicit
    /// "that didn't work"-style rejection (§4.4.4, property 10).
    async fn deprecate_by_rejection(&self, mut doc: Document) -> Result<ObserveOutcome, CoreError> {
        let old_id = doc.id.clone();
        doc.metadata.insert(KEY_STATUS.to_string(), json!(LearningStatus::Deprecated.as_str()));
        doc.touch();
        self.store_upsert(vec![doc]).await?;
        Ok(ObserveOutcome::DeprecatedByRejection { old_id })
    }

    /// Credit one document surfaced by the prior `retrieve_context` call
    /// with a streak point and re-check auto-promotion (§4.4.5, property
    /// 11). Never called for a doc that has since been deprecated.
    async fn credit_streak(&self, doc: Document) -> Result<(), CoreError> {
        let mut item = LearningItem { document: doc };
        if item.status() == LearningStatus::Deprecated {
            return Ok(());
        }
        let new_streak = item.streak() + 1;
        item.set(KEY_STREAK, json!(new_streak));
        self.apply_auto_promotion(&mut item);
        self.store_upsert(vec![item.document.clone()]).await?;
        Ok(())
    }

    /// Retrieve the top learning items for a user's query, increment their
    /// `hits` counter (retrieval-driven evidence, §4.4.6), re-check
    /// auto-promotion, and format as a `<learning_memories>` prompt block
    /// (§4.4.8, §4.8.1's prompt assembly step 4). `filters` is AND-ed with
    /// the mandatory user/namespace/non-deprecated scoping, never replacing
    /// it. Returns the formatted block alongside the surfaced document ids,
    /// which the caller must thread back into the next `observe` call's
    /// `ObserveMeta.retrieved_doc_ids` for streak/confirmation crediting to
    /// work (§4.4.5).
    pub async fn retrieve_context(
        &self,
        user_id: &str,
        query: &str,
        filters: Option<&FilterExpr>,
    ) -> Result<(String, Vec<String>), CoreError> {
        let filter = user_filter(user_id, filters);
        let results = self.store.search(query, self.config.top_k, Some(&filter)).await?;
        if results.is_empty() {
            return Ok((String::new(), Vec::new()));
        }

        let mut items: Vec<LearningItem> = Vec::new();
        for r in results {
            let mut item = LearningItem { document: r.document };
            if item.status() == LearningStatus::Deprecated {
                continue;
            }
            let hits = item.hits() + 1;
            item.set(KEY_HITS, json!(hits));
            self.apply_auto_promotion(&mut item);
            items.push(item);
        }

        if items.is_empty() {
            return Ok((String::new(), Vec::new()));
        }

        let to_write: Vec<Document> = items.iter().map(|i| i.document.clone()).collect();
        self.store_upsert(to_write).await?;

        items.sort_by(|a, b| {
            b.status()
                .weight()
                .cmp(&a.status().weight())
                .then_with(|| b.document.updated_at.cmp(&a.document.updated_at))
                .then_with(|| b.hits().cmp(&a.hits()))
        });

        let surfaced: Vec<Document> = items.iter().map(|i| i.document.clone()).collect();
        let doc_ids: Vec<String> = surfaced.iter().map(|d| d.id.clone()).collect();
        self.last_retrieved.insert(user_id.to_string(), surfaced);

        Ok((format_context_block(&items), doc_ids))
    }
}

/// Render learning items into the `<learning_memories>` block injected into
/// the agent prompt, respecting per-item and total character caps.
fn format_context_block(items: &[LearningItem]) -> String {
    let mut body = String::new();
    let mut total = 0usize;
    for item in items {
        let mut line = item.document.content.clone();
        if line.chars().count() > CONTEXT_ITEM_CHAR_CAP {
            line = line.chars().take(CONTEXT_ITEM_CHAR_CAP).collect::<String>() + "...";
        }
        let entry = format!("- {line}\n");
        if total + entry.len() > CONTEXT_TOTAL_CHAR_CAP {
            break;
        }
        total += entry.len();
        body.push_str(&entry);
    }
    format!("<learning_memories>\n{body}</learning_memories>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::SearchResult;
    use crate::embeddings::MockEmbedder;
    use crate::vectorstore::backends::InMemoryVectorStore;
    use crate::vectorstore::DefaultFilters;
    use async_trait::async_trait;

    fn manager() -> LearningManager {
        let store = Arc::new(InMemoryVectorStore::new("learning", Arc::new(MockEmbedder::new(16))));
        LearningManager::new(store, LearningConfig::default())
    }

    fn meta() -> ObserveMeta {
        ObserveMeta::default()
    }

    fn meta_with_turn(previous_user_msg: &str) -> ObserveMeta {
        ObserveMeta {
            previous_user_msg: Some(previous_user_msg.to_string()),
            ..Default::default()
        }
    }

    /// Insert-only store wrapper used to exercise the `upsert_required`
    /// failure path (§9 Open Question; SPEC_FULL.md §C).
    struct InsertOnlyStore(InMemoryVectorStore);

    #[async_trait]
    impl VectorStore for InsertOnlyStore {
        async fn create(&self) -> Result<(), CoreError> {
            self.0.create().await
        }
        async fn exists(&self) -> Result<bool, CoreError> {
            self.0.exists().await
        }
        async fn drop(&self) -> Result<(), CoreError> {
            self.0.drop().await
        }
        async fn optimize(&self) -> Result<(), CoreError> {
            self.0.optimize().await
        }
        async fn insert(&self, docs: Vec<Document>, default_filters: &DefaultFilters) -> Result<(), CoreError> {
            self.0.insert(docs, default_filters).await
        }
        async fn upsert(&self, _docs: Vec<Document>, _default_filters: &DefaultFilters) -> Result<(), CoreError> {
            panic!("upsert must never be called once supports_upsert() is false");
        }
        fn supports_upsert(&self) -> bool {
            false
        }
        async fn vector_search(&self, query: &str, k: usize, filters: Option<&FilterExpr>) -> Result<Vec<SearchResult>, CoreError> {
            self.0.vector_search(query, k, filters).await
        }
        async fn keyword_search(&self, query: &str, k: usize, filters: Option<&FilterExpr>) -> Result<Vec<SearchResult>, CoreError> {
            self.0.keyword_search(query, k, filters).await
        }
        async fn get_count(&self) -> Result<usize, CoreError> {
            self.0.get_count().await
        }
        async fn id_exists(&self, id: &str) -> Result<bool, CoreError> {
            self.0.id_exists(id).await
        }
        async fn name_exists(&self, name: &str) -> Result<bool, CoreError> {
            self.0.name_exists(name).await
        }
    }

    #[tokio::test]
    async fn observe_fails_explicitly_when_store_lacks_upsert() {
        let inner = InMemoryVectorStore::new("learning", Arc::new(MockEmbedder::new(16)));
        let mgr = LearningManager::new(Arc::new(InsertOnlyStore(inner)), LearningConfig::default());
        let err = mgr
            .observe(
                "u1",
                "How should we handle this?",
                "Always prefer composition over inheritance for handlers.",
                meta(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unsupported(reason) if reason == "upsert_required"));
    }

    #[tokio::test]
    async fn novel_observation_creates_candidate() {
        let mgr = manager();
        let outcome = mgr
            .observe(
                "u1",
                "How should we handle this?",
                "Always prefer composition over inheritance for handlers.",
                meta(),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, ObserveOutcome::Created(_)));
    }

    #[tokio::test]
    async fn sensitive_content_is_rejected_by_write_gate() {
        let mgr = manager();
        let err = mgr
            .observe(
                "u1",
                "Where should secrets live?",
                "The api_key for prod should always be stored in vault.",
                meta(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Guardrail { .. }));
    }

    #[tokio::test]
    async fn repeated_observation_merges_and_bumps_streak() {
        let mgr = manager();
        let user_msg = "How should we handle this?";
        let assistant_msg = "Always prefer composition over inheritance for handlers.";
        mgr.observe("u1", user_msg, assistant_msg, meta()).await.unwrap();
        let second = mgr.observe("u1", "yes exactly", assistant_msg, meta()).await.unwrap();
        match second {
            ObserveOutcome::Merged(item) => assert_eq!(item.streak(), 1),
            other => panic!("expected merge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn explicit_dedupe_action_skip_forces_skip() {
        let mgr = manager();
        let user_msg = "How should we handle this?";
        let assistant_msg = "Always prefer composition over inheritance for handlers.";
        mgr.observe("u1", user_msg, assistant_msg, meta()).await.unwrap();

        let forced_meta = ObserveMeta {
            dedupe_action: Some(DedupeAction::Skip),
            ..Default::default()
        };
        let outcome = mgr.observe("u1", "one more time", assistant_msg, forced_meta).await.unwrap();
        assert!(matches!(outcome, ObserveOutcome::Skipped { reason } if reason == "duplicate_forced_skip"));
    }

    #[tokio::test]
    async fn retrieve_context_formats_block_and_increments_hits() {
        let mgr = manager();
        mgr.observe(
            "u1",
            "How do I keep api boundaries safe?",
            "Always validate input at api boundaries before use.",
            meta(),
        )
        .await
        .unwrap();
        let (ctx, ids) = mgr.retrieve_context("u1", "validate input at boundaries", None).await.unwrap();
        assert!(ctx.starts_with("<learning_memories>"));
        assert!(ctx.contains("validate input"));
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn retrieve_context_filters_are_anded_with_user_scope() {
        let mgr = manager();
        mgr.observe(
            "u1",
            "How do I keep api boundaries safe?",
            "Always validate input at api boundaries before use.",
            meta(),
        )
        .await
        .unwrap();

        let no_match = FilterExpr::eq(KEY_TYPE, json!("snippet"));
        let (ctx, ids) = mgr
            .retrieve_context("u1", "validate input at boundaries", Some(&no_match))
            .await
            .unwrap();
        assert!(ctx.is_empty());
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn explicit_confirmation_after_retrieval_promotes_to_verified() {
        let mgr = manager();
        mgr.observe(
            "u1",
            "How do I keep api boundaries safe?",
            "Always validate input at api boundaries before use.",
            meta(),
        )
        .await
        .unwrap();
        let (_, doc_ids) = mgr.retrieve_context("u1", "validate input at boundaries", None).await.unwrap();

        let confirm_meta = ObserveMeta {
            retrieved_doc_ids: doc_ids,
            ..Default::default()
        };
        let outcome = mgr
            .observe("u1", "yes exactly, did that work?", "glad it helped", confirm_meta)
            .await
            .unwrap();
        match outcome {
            ObserveOutcome::PromotedByConfirmation(item) => {
                assert_eq!(item.status(), LearningStatus::Verified);
                assert_eq!(item.confidence(), CONFIRMATION_CONFIDENCE);
            }
            other => panic!("expected promotion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn confirmation_signal_falls_back_to_previous_turn() {
        let mgr = manager();
        mgr.observe(
            "u1",
            "How do I keep api boundaries safe?",
            "Always validate input at api boundaries before use.",
            meta(),
        )
        .await
        .unwrap();
        let (_, doc_ids) = mgr.retrieve_context("u1", "validate input at boundaries", None).await.unwrap();

        let mut confirm_meta = meta_with_turn("yes exactly");
        confirm_meta.retrieved_doc_ids = doc_ids;
        let outcome = mgr.observe("u1", "ok thanks", "glad it helped", confirm_meta).await.unwrap();
        assert!(matches!(outcome, ObserveOutcome::PromotedByConfirmation(_)));
    }

    #[tokio::test]
    async fn explicit_rejection_after_retrieval_deprecates_candidate() {
        let mgr = manager();
        mgr.observe(
            "u1",
            "How do I keep api boundaries safe?",
            "Always validate input at api boundaries before use.",
            meta(),
        )
        .await
        .unwrap();
        let (_, doc_ids) = mgr.retrieve_context("u1", "validate input at boundaries", None).await.unwrap();

        let reject_meta = ObserveMeta {
            retrieved_doc_ids: doc_ids,
            ..Default::default()
        };
        let outcome = mgr
            .observe("u1", "no that's wrong, did that work?", "sorry about that", reject_meta)
            .await
            .unwrap();
        assert!(matches!(outcome, ObserveOutcome::DeprecatedByRejection { .. }));

        // A subsequent retrieval must no longer surface the deprecated item.
        let (ctx, _) = mgr.retrieve_context("u1", "validate input at boundaries", None).await.unwrap();
        assert!(ctx.is_empty());
    }

    #[tokio::test]
    async fn implicit_streak_credit_drives_auto_promotion() {
        let mgr = manager();
        mgr.observe(
            "u1",
            "How do I keep api boundaries safe?",
            "Always validate input at api boundaries before use.",
            meta(),
        )
        .await
        .unwrap();

        // Three neutral retrieve/observe cycles should accumulate a streak of
        // three and trigger auto-promotion (§4.4.6, property 11).
        for _ in 0..3 {
            let (_, doc_ids) = mgr.retrieve_context("u1", "validate input at boundaries", None).await.unwrap();
            mgr.observe(
                "u1",
                "something unrelated",
                "something unrelated and neutral as a reply",
                ObserveMeta {
                    retrieved_doc_ids: doc_ids,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }

        let (ctx, _) = mgr.retrieve_context("u1", "validate input at boundaries", None).await.unwrap();
        assert!(ctx.contains("validate input"));
    }
}
