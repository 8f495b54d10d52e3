//! `agentic-core`: the core runtime for LLM agent orchestration.
//!
//! Four tightly-coupled subsystems, as laid out in the spec this crate
//! implements:
//!
//! - [`agent`] — the run loop: prompt assembly, the model call, tool-call
//!   parsing and execution, structured-output repair, reasoning-step
//!   capture, and the observe-and-learn hook.
//! - [`knowledge`] and [`vectorstore`] — the retrieval layer: a uniform
//!   abstraction over dense/keyword/hybrid vector search with metadata
//!   filters, and the chunk/embed/store ingestion pipeline in front of it.
//! - [`learning`] — the deduplicating long-term learning loop: canonicalise,
//!   gate, dedupe via SimHash, merge/version, auto-promote.
//! - [`workflow`] — a linear composition of steps over agents (or nested
//!   workflows) with streamed event propagation.
//!
//! Supporting modules: [`document`] (the shared retrieval data model),
//! [`conversation`] (message/model-provider surface), [`embeddings`],
//! [`memory`] (per-user freeform memory, distinct from [`learning`]),
//! [`tools`], [`guardrails`], [`reasoning`] (structured-step parsing and
//! trace persistence), [`schema`] (tool-argument coercion and structured-
//! output matching), [`retry`] and [`metrics`] (the centralised backoff
//! helper and its process-wide operation counters), [`config`] and
//! [`error`].

pub mod agent;
pub mod config;
pub mod conversation;
pub mod document;
pub mod embeddings;
pub mod error;
pub mod guardrails;
pub mod knowledge;
pub mod learning;
pub mod memory;
pub mod metrics;
pub mod reasoning;
pub mod retry;
pub mod schema;
pub mod tools;
pub mod vectorstore;
pub mod workflow;

pub use error::{CoreError, CoreResult};
