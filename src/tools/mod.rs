//! ToolRegistry (C6): tool schema exposure and guarded execution.
//!
//! Grounded directly in `tools/base_tool.rs` from the teacher crate
//! (`EnvVar`, `BaseTool` async trait, usage-count capping, `should_cache`),
//! generalized here with the timeout/retry/caching policy the spec adds on
//! top (§4.6, §5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::CoreError;
use crate::metrics::{self, MetricsCollector};
use crate::retry::{retry_with_backoff, RetryConfig};

/// Declares an environment variable a tool expects to be configured
/// out-of-band (credentials, endpoints). Informational only; this core does
/// not read the process environment on the tool's behalf.
#[derive(Debug, Clone)]
pub struct EnvVar {
    pub name: String,
    pub description: String,
    pub required: bool,
    pub default: Option<String>,
}

/// One callable capability exposed to an `AgentRunner`.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the tool's arguments, surfaced to the model as part
    /// of the tool-calling contract.
    fn parameters_schema(&self) -> Value;

    fn env_vars(&self) -> Vec<EnvVar> {
        Vec::new()
    }

    /// Whether successful results should be cached by (name, arguments).
    fn should_cache(&self) -> bool {
        false
    }

    /// Usage cap across a run's lifetime; `None` means unlimited.
    fn max_usage_count(&self) -> Option<u32> {
        None
    }

    /// Per-call timeout; falls back to the registry default if `None`.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn call(&self, arguments: Value) -> Result<Value, CoreError>;
}

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    usage_count: AtomicU32,
}

/// Registers tools, exposes their schemas, and executes calls under a
/// timeout/retry/caching/usage-cap policy.
pub struct ToolRegistry {
    tools: DashMap<String, RegisteredTool>,
    cache: DashMap<(String, String), Value>,
    default_timeout: Duration,
    retry_config: RetryConfig,
    metrics: Arc<MetricsCollector>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: DashMap::new(),
            cache: DashMap::new(),
            default_timeout: DEFAULT_TOOL_TIMEOUT,
            retry_config: RetryConfig::default(),
            metrics: metrics::global(),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    /// Inject a non-default metrics collector (e.g. an isolated instance in
    /// tests) instead of the process-wide default (§9).
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(
            name,
            RegisteredTool {
                tool,
                usage_count: AtomicU32::new(0),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|entry| Arc::clone(&entry.tool))
    }

    /// JSON-Schema-shaped tool definitions, in the shape most
    /// OpenAI-compatible `tools` arrays expect (§6).
    pub fn schemas(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": entry.tool.name(),
                        "description": entry.tool.description(),
                        "parameters": entry.tool.parameters_schema(),
                    }
                })
            })
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Reset per-run usage counters. Called once at the start of each
    /// `AgentRunner` run so caps are per-run, not cross-run (§4.6).
    pub fn reset_usage(&self) {
        for entry in self.tools.iter() {
            entry.usage_count.store(0, Ordering::SeqCst);
        }
    }

    /// Execute a named tool call with retry, timeout, caching, and usage-cap
    /// enforcement. `arguments` is the raw JSON-decoded argument object.
    pub async fn execute(&self, name: &str, arguments: Value) -> Result<Value, CoreError> {
        let registered = self
            .tools
            .get(name)
            .ok_or_else(|| CoreError::Schema(format!("unknown tool '{name}'")))?;
        let tool = Arc::clone(&registered.tool);
        drop(registered);

        if let Some(max) = tool.max_usage_count() {
            let entry = self.tools.get(name).expect("tool present");
            let used = entry.usage_count.load(Ordering::SeqCst);
            if used >= max {
                return Err(CoreError::Guardrail {
                    guard: "tool_usage_limit".to_string(),
                    reason: format!("tool '{name}' reached its usage cap of {max}"),
                });
            }
        }

        let cache_key = (name.to_string(), arguments.to_string());
        if tool.should_cache() {
            if let Some(cached) = self.cache.get(&cache_key) {
                return Ok(cached.clone());
            }
        }

        let timeout = tool.timeout().unwrap_or(self.default_timeout);
        let operation = format!("tool.{name}");

        let outcome = retry_with_backoff(&self.retry_config, &self.metrics, &operation, || {
            let tool = Arc::clone(&tool);
            let arguments = arguments.clone();
            async move {
                match tokio::time::timeout(timeout, tool.call(arguments)).await {
                    Ok(result) => result,
                    Err(_) => Err(CoreError::DeadlineExceeded),
                }
            }
        })
        .await;

        match outcome.output {
            Some(value) => {
                if let Some(entry) = self.tools.get(name) {
                    entry.usage_count.fetch_add(1, Ordering::SeqCst);
                }
                if tool.should_cache() {
                    self.cache.insert(cache_key, value.clone());
                }
                Ok(value)
            }
            None => Err(outcome
                .error
                .unwrap_or_else(|| CoreError::TransientModel("tool execution exhausted retries".to_string()))),
        }
    }
}

/// Accumulates streamed tool-call argument deltas by call id, since a
/// streaming `ModelProvider` may deliver a call's JSON arguments across
/// several chunks before it is complete (§4.8.2).
#[derive(Default)]
pub struct ToolCallAccumulator {
    pending: HashMap<String, (Option<String>, String)>,
    order: Vec<String>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_delta(&mut self, call_id: &str, name: Option<&str>, arguments_delta: &str) {
        let entry = self.pending.entry(call_id.to_string()).or_insert_with(|| {
            self.order.push(call_id.to_string());
            (None, String::new())
        });
        if let Some(n) = name {
            entry.0 = Some(n.to_string());
        }
        entry.1.push_str(arguments_delta);
    }

    /// Finalize accumulated calls in the order their ids were first seen.
    pub fn finish(self) -> Vec<(String, String, String)> {
        let mut out = Vec::new();
        for id in self.order {
            if let Some((name, args)) = self.pending.get(&id) {
                out.push((id.clone(), name.clone().unwrap_or_default(), args.clone()));
            }
        }
        out
    }
}
