//! ReasoningTrace (C10): structured `## Step N` parsing plus write-mostly,
//! failure-tolerant persistence.
//!
//! The parser is grounded in the teacher crate's `agents/parser.rs`
//! (regex-over-labeled-fields ReAct parsing: `Thought:` / `Action:` /
//! `Action Input:` / `Final Answer:`), generalized here to the step-numbered
//! `## Step N` block format the spec calls for (§4.8.5) with its own field
//! set (`Reasoning:`, `Action:`, `Result:`, `Confidence:`, `Next:`).
//! Persistence mirrors `memory/storage/ltm_sqlite_storage.rs`'s
//! create-parent-dir-then-open-then-create-table-if-not-exists shape, applied
//! to the two tables §6 specifies.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// What the model declared it will do after this step (`Next:` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    Continue,
    Finish,
}

/// One parsed `## Step N` block (§4.8.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub run_id: String,
    pub agent_id: String,
    pub step_number: u32,
    pub title: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub next_action: Option<NextAction>,
    pub reasoning_tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Status of a run's overall reasoning trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningStatus {
    Running,
    Completed,
    Failed,
}

/// Run-level aggregate written once the run finalises (`reasoning_history`
/// table, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningHistory {
    pub run_id: String,
    pub agent_id: String,
    pub total_tokens: u64,
    pub reasoning_tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_duration_ms: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: ReasoningStatus,
    pub error: Option<String>,
    pub steps: Vec<ReasoningStep>,
}

impl ReasoningHistory {
    pub fn new(run_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            agent_id: agent_id.into(),
            total_tokens: 0,
            reasoning_tokens: 0,
            input_tokens: 0,
            output_tokens: 0,
            total_duration_ms: 0,
            start_time: Utc::now(),
            end_time: None,
            status: ReasoningStatus::Running,
            error: None,
            steps: Vec::new(),
        }
    }

    pub fn push(&mut self, step: ReasoningStep) {
        self.reasoning_tokens += step.reasoning_tokens;
        self.input_tokens += step.input_tokens;
        self.output_tokens += step.output_tokens;
        self.total_tokens = self.reasoning_tokens + self.input_tokens + self.output_tokens;
        self.total_duration_ms += step.duration_ms;
        self.steps.push(step);
    }

    pub fn finish(&mut self, status: ReasoningStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.end_time = Some(Utc::now());
    }
}

static STEP_HEADER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^##\s*(Step\s*\d+)\s*$").unwrap());
static FIELD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(Reasoning|Action|Result|Confidence|Next)\s*:\s*(.*)$").unwrap());

/// Split `text` into raw `## Step N` blocks along with their titles.
fn split_step_blocks(text: &str) -> Vec<(String, String)> {
    let headers: Vec<_> = STEP_HEADER_RE.find_iter(text).collect();
    let mut blocks = Vec::new();
    for (i, m) in headers.iter().enumerate() {
        let title = text[m.start()..m.end()].trim_start_matches('#').trim().to_string();
        let body_start = m.end();
        let body_end = headers.get(i + 1).map(|next| next.start()).unwrap_or(text.len());
        let body = text[body_start..body_end].trim().to_string();
        blocks.push((title, body));
    }
    blocks
}

/// Parse the labeled fields out of one step body. Everything up to the
/// first recognised label line is treated as free-form `reasoning` text,
/// matching the teacher parser's convention of treating the text before
/// the first labeled line as the "thought".
fn parse_step_body(body: &str) -> (String, String, String, Option<f64>, Option<NextAction>) {
    let first_field_start = FIELD_RE.find(body).map(|m| m.start());
    let mut reasoning = match first_field_start {
        Some(idx) => body[..idx].trim().to_string(),
        None => body.trim().to_string(),
    };

    let mut action = String::new();
    let mut result = String::new();
    let mut confidence = None;
    let mut next_action = None;

    for caps in FIELD_RE.captures_iter(body) {
        let label = &caps[1];
        let value = caps[2].trim().to_string();
        match label {
            "Reasoning" => reasoning = value,
            "Action" => action = value,
            "Result" => result = value,
            "Confidence" => confidence = value.parse::<f64>().ok(),
            "Next" => {
                next_action = match value.to_ascii_lowercase().as_str() {
                    "finish" | "done" | "stop" => Some(NextAction::Finish),
                    _ => Some(NextAction::Continue),
                }
            }
            _ => {}
        }
    }

    (reasoning, action, result, confidence, next_action)
}

/// Parse all `## Step N` blocks out of one assistant message (§4.8.5,
/// testable property 15). `run_id`/`agent_id` are stamped onto every step;
/// token/duration fields are left at zero for the caller to fill in from
/// the LLM call's `Usage`.
pub fn parse_steps(text: &str, run_id: &str, agent_id: &str) -> Vec<ReasoningStep> {
    split_step_blocks(text)
        .into_iter()
        .enumerate()
        .map(|(i, (title, body))| {
            let (reasoning, action, result, confidence, next_action) = parse_step_body(&body);
            ReasoningStep {
                run_id: run_id.to_string(),
                agent_id: agent_id.to_string(),
                step_number: (i + 1) as u32,
                title,
                reasoning,
                action,
                result,
                confidence,
                next_action,
                reasoning_tokens: 0,
                input_tokens: 0,
                output_tokens: 0,
                duration_ms: 0,
                timestamp: Utc::now(),
                metadata: HashMap::new(),
            }
        })
        .collect()
}

/// Write-mostly, failure-tolerant persistence for reasoning traces (§4.10).
/// Callers must never let a `ReasoningPersistence` error abort a run; log it
/// and continue (§5, §7: "Reasoning persistence failures never affect run
/// outcomes").
#[async_trait]
pub trait ReasoningPersistence: Send + Sync {
    async fn save_step(&self, step: &ReasoningStep) -> Result<(), CoreError>;
    async fn save_history(&self, history: &ReasoningHistory) -> Result<(), CoreError>;
    async fn list_steps(&self, run_id: &str) -> Result<Vec<ReasoningStep>, CoreError>;
    async fn get_stats(&self, run_id: &str) -> Result<Option<ReasoningHistory>, CoreError>;
}

/// Non-persistent reference implementation, sufficient for tests and for
/// embedding consumers that don't need durable traces.
#[derive(Default)]
pub struct InMemoryReasoningPersistence {
    steps: parking_lot::RwLock<Vec<ReasoningStep>>,
    histories: parking_lot::RwLock<HashMap<String, ReasoningHistory>>,
}

impl InMemoryReasoningPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReasoningPersistence for InMemoryReasoningPersistence {
    async fn save_step(&self, step: &ReasoningStep) -> Result<(), CoreError> {
        self.steps.write().push(step.clone());
        Ok(())
    }

    async fn save_history(&self, history: &ReasoningHistory) -> Result<(), CoreError> {
        self.histories.write().insert(history.run_id.clone(), history.clone());
        Ok(())
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<ReasoningStep>, CoreError> {
        Ok(self.steps.read().iter().filter(|s| s.run_id == run_id).cloned().collect())
    }

    async fn get_stats(&self, run_id: &str) -> Result<Option<ReasoningHistory>, CoreError> {
        Ok(self.histories.read().get(run_id).cloned())
    }
}

/// SQLite-backed `ReasoningPersistence`, matching the table shapes in §6.
/// Other backends (`postgresql|mysql|mariadb|oracle|sqlserver`) are
/// constructed via `ReasoningPersistenceConfig` and currently return
/// `Unsupported`; only SQLite has a driver in this core's dependency stack.
pub struct SqliteReasoningPersistence {
    conn: std::sync::Mutex<Connection>,
}

impl SqliteReasoningPersistence {
    pub fn open(path: &std::path::Path) -> Result<Self, CoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| CoreError::Config(format!("failed to create reasoning store directory: {e}")))?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| CoreError::Config(format!("failed to open sqlite reasoning store: {e}")))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CoreError::Config(format!("failed to open in-memory sqlite reasoning store: {e}")))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), CoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS reasoning_steps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                step_number INTEGER NOT NULL,
                title TEXT NOT NULL,
                reasoning TEXT NOT NULL,
                action TEXT NOT NULL,
                result TEXT NOT NULL,
                confidence REAL,
                next_action TEXT,
                reasoning_tokens INTEGER NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                duration INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                metadata_json TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| CoreError::TransientStore(format!("failed to initialize reasoning_steps table: {e}")))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS reasoning_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL UNIQUE,
                agent_id TEXT NOT NULL,
                total_tokens INTEGER NOT NULL,
                reasoning_tokens INTEGER NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                total_duration INTEGER NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                status TEXT NOT NULL,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| CoreError::TransientStore(format!("failed to initialize reasoning_history table: {e}")))?;
        Ok(())
    }
}

fn status_str(status: ReasoningStatus) -> &'static str {
    match status {
        ReasoningStatus::Running => "running",
        ReasoningStatus::Completed => "completed",
        ReasoningStatus::Failed => "failed",
    }
}

fn status_from_str(s: &str) -> ReasoningStatus {
    match s {
        "completed" => ReasoningStatus::Completed,
        "failed" => ReasoningStatus::Failed,
        _ => ReasoningStatus::Running,
    }
}

fn next_action_str(next: Option<NextAction>) -> Option<&'static str> {
    match next {
        Some(NextAction::Continue) => Some("continue"),
        Some(NextAction::Finish) => Some("finish"),
        None => None,
    }
}

#[async_trait]
impl ReasoningPersistence for SqliteReasoningPersistence {
    async fn save_step(&self, step: &ReasoningStep) -> Result<(), CoreError> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        let metadata_json = serde_json::to_string(&step.metadata).unwrap_or_else(|_| "{}".to_string());
        conn.execute(
            "INSERT INTO reasoning_steps (
                run_id, agent_id, step_number, title, reasoning, action, result,
                confidence, next_action, reasoning_tokens, input_tokens, output_tokens,
                duration, timestamp, metadata_json
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            rusqlite::params![
                step.run_id,
                step.agent_id,
                step.step_number,
                step.title,
                step.reasoning,
                step.action,
                step.result,
                step.confidence,
                next_action_str(step.next_action),
                step.reasoning_tokens,
                step.input_tokens,
                step.output_tokens,
                step.duration_ms,
                step.timestamp.to_rfc3339(),
                metadata_json,
            ],
        )
        .map_err(|e| CoreError::TransientStore(format!("failed to insert reasoning step: {e}")))?;
        Ok(())
    }

    async fn save_history(&self, history: &ReasoningHistory) -> Result<(), CoreError> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO reasoning_history (
                run_id, agent_id, total_tokens, reasoning_tokens, input_tokens, output_tokens,
                total_duration, start_time, end_time, status, error, created_at, updated_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
            ON CONFLICT(run_id) DO UPDATE SET
                total_tokens=excluded.total_tokens,
                reasoning_tokens=excluded.reasoning_tokens,
                input_tokens=excluded.input_tokens,
                output_tokens=excluded.output_tokens,
                total_duration=excluded.total_duration,
                end_time=excluded.end_time,
                status=excluded.status,
                error=excluded.error,
                updated_at=excluded.updated_at",
            rusqlite::params![
                history.run_id,
                history.agent_id,
                history.total_tokens,
                history.reasoning_tokens,
                history.input_tokens,
                history.output_tokens,
                history.total_duration_ms,
                history.start_time.to_rfc3339(),
                history.end_time.map(|t| t.to_rfc3339()),
                status_str(history.status),
                history.error,
                now,
                now,
            ],
        )
        .map_err(|e| CoreError::TransientStore(format!("failed to upsert reasoning history: {e}")))?;
        Ok(())
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<ReasoningStep>, CoreError> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT run_id, agent_id, step_number, title, reasoning, action, result,
                        confidence, next_action, reasoning_tokens, input_tokens, output_tokens,
                        duration, timestamp, metadata_json
                 FROM reasoning_steps WHERE run_id = ?1 ORDER BY step_number ASC",
            )
            .map_err(|e| CoreError::TransientStore(format!("failed to prepare query: {e}")))?;
        let rows = stmt
            .query_map(rusqlite::params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<f64>>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, i64>(9)?,
                    row.get::<_, i64>(10)?,
                    row.get::<_, i64>(11)?,
                    row.get::<_, i64>(12)?,
                    row.get::<_, String>(13)?,
                    row.get::<_, String>(14)?,
                ))
            })
            .map_err(|e| CoreError::TransientStore(format!("failed to query reasoning steps: {e}")))?;

        let mut out = Vec::new();
        for row in rows {
            let (run_id, agent_id, step_number, title, reasoning, action, result, confidence, next_action, reasoning_tokens, input_tokens, output_tokens, duration, timestamp, metadata_json) =
                row.map_err(|e| CoreError::Data(format!("failed to read reasoning step row: {e}")))?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|e| CoreError::Data(format!("invalid timestamp in reasoning_steps: {e}")))?
                .with_timezone(&Utc);
            let metadata = serde_json::from_str(&metadata_json).unwrap_or_default();
            let next_action = next_action.map(|s| match s.as_str() {
                "finish" => NextAction::Finish,
                _ => NextAction::Continue,
            });
            out.push(ReasoningStep {
                run_id,
                agent_id,
                step_number: step_number as u32,
                title,
                reasoning,
                action,
                result,
                confidence,
                next_action,
                reasoning_tokens: reasoning_tokens as u64,
                input_tokens: input_tokens as u64,
                output_tokens: output_tokens as u64,
                duration_ms: duration as u64,
                timestamp,
                metadata,
            });
        }
        Ok(out)
    }

    async fn get_stats(&self, run_id: &str) -> Result<Option<ReasoningHistory>, CoreError> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT run_id, agent_id, total_tokens, reasoning_tokens, input_tokens, output_tokens,
                        total_duration, start_time, end_time, status, error
                 FROM reasoning_history WHERE run_id = ?1",
            )
            .map_err(|e| CoreError::TransientStore(format!("failed to prepare query: {e}")))?;
        let mut rows = stmt
            .query(rusqlite::params![run_id])
            .map_err(|e| CoreError::TransientStore(format!("failed to query reasoning history: {e}")))?;
        let Some(row) = rows.next().map_err(|e| CoreError::Data(format!("failed to read reasoning history row: {e}")))? else {
            return Ok(None);
        };
        let run_id: String = row.get(0).map_err(|e| CoreError::Data(e.to_string()))?;
        let agent_id: String = row.get(1).map_err(|e| CoreError::Data(e.to_string()))?;
        let total_tokens: i64 = row.get(2).map_err(|e| CoreError::Data(e.to_string()))?;
        let reasoning_tokens: i64 = row.get(3).map_err(|e| CoreError::Data(e.to_string()))?;
        let input_tokens: i64 = row.get(4).map_err(|e| CoreError::Data(e.to_string()))?;
        let output_tokens: i64 = row.get(5).map_err(|e| CoreError::Data(e.to_string()))?;
        let total_duration: i64 = row.get(6).map_err(|e| CoreError::Data(e.to_string()))?;
        let start_time: String = row.get(7).map_err(|e| CoreError::Data(e.to_string()))?;
        let end_time: Option<String> = row.get(8).map_err(|e| CoreError::Data(e.to_string()))?;
        let status: String = row.get(9).map_err(|e| CoreError::Data(e.to_string()))?;
        let error: Option<String> = row.get(10).map_err(|e| CoreError::Data(e.to_string()))?;

        let start_time = DateTime::parse_from_rfc3339(&start_time)
            .map_err(|e| CoreError::Data(format!("invalid start_time: {e}")))?
            .with_timezone(&Utc);
        let end_time = end_time
            .map(|t| DateTime::parse_from_rfc3339(&t).map(|d| d.with_timezone(&Utc)))
            .transpose()
            .map_err(|e| CoreError::Data(format!("invalid end_time: {e}")))?;

        Ok(Some(ReasoningHistory {
            run_id: run_id.clone(),
            agent_id,
            total_tokens: total_tokens as u64,
            reasoning_tokens: reasoning_tokens as u64,
            input_tokens: input_tokens as u64,
            output_tokens: output_tokens as u64,
            total_duration_ms: total_duration as u64,
            start_time,
            end_time,
            status: status_from_str(&status),
            error,
            steps: Vec::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_step_with_all_fields() {
        let text = "## Step 1\nTry A\nAction: do-a\nConfidence: 0.9\nNext: continue";
        let steps = parse_steps(text, "run-1", "agent-1");
        assert_eq!(steps.len(), 1);
        let step = &steps[0];
        assert_eq!(step.title, "Step 1");
        assert_eq!(step.reasoning, "Try A");
        assert_eq!(step.action, "do-a");
        assert_eq!(step.confidence, Some(0.9));
        assert_eq!(step.next_action, Some(NextAction::Continue));
    }

    #[test]
    fn parses_multiple_sequential_steps() {
        let text = "## Step 1\nReasoning: first\nNext: continue\n\n## Step 2\nReasoning: second\nNext: finish";
        let steps = parse_steps(text, "run-1", "agent-1");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].step_number, 1);
        assert_eq!(steps[1].step_number, 2);
        assert_eq!(steps[1].next_action, Some(NextAction::Finish));
    }

    #[test]
    fn no_step_headers_returns_empty() {
        let steps = parse_steps("plain text with no headers", "run-1", "agent-1");
        assert!(steps.is_empty());
    }

    #[tokio::test]
    async fn in_memory_persistence_round_trips_steps_and_history() {
        let persistence = InMemoryReasoningPersistence::new();
        let mut history = ReasoningHistory::new("run-1", "agent-1");
        let step = ReasoningStep {
            run_id: "run-1".to_string(),
            agent_id: "agent-1".to_string(),
            step_number: 1,
            title: "Step 1".to_string(),
            reasoning: "r".to_string(),
            action: String::new(),
            result: String::new(),
            confidence: Some(0.5),
            next_action: Some(NextAction::Finish),
            reasoning_tokens: 10,
            input_tokens: 5,
            output_tokens: 5,
            duration_ms: 100,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        };
        history.push(step.clone());
        history.finish(ReasoningStatus::Completed, None);
        persistence.save_step(&step).await.unwrap();
        persistence.save_history(&history).await.unwrap();

        let steps = persistence.list_steps("run-1").await.unwrap();
        assert_eq!(steps.len(), 1);
        let stats = persistence.get_stats("run-1").await.unwrap().unwrap();
        assert_eq!(stats.status, ReasoningStatus::Completed);
    }

    #[tokio::test]
    async fn sqlite_persistence_round_trips_steps_and_history() {
        let persistence = SqliteReasoningPersistence::open_in_memory().unwrap();
        let step = ReasoningStep {
            run_id: "run-2".to_string(),
            agent_id: "agent-1".to_string(),
            step_number: 1,
            title: "Step 1".to_string(),
            reasoning: "r".to_string(),
            action: "a".to_string(),
            result: "done".to_string(),
            confidence: Some(0.8),
            next_action: Some(NextAction::Continue),
            reasoning_tokens: 3,
            input_tokens: 2,
            output_tokens: 1,
            duration_ms: 50,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        };
        persistence.save_step(&step).await.unwrap();
        let mut history = ReasoningHistory::new("run-2", "agent-1");
        history.push(step);
        history.finish(ReasoningStatus::Completed, None);
        persistence.save_history(&history).await.unwrap();

        let steps = persistence.list_steps("run-2").await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].action, "a");
        let stats = persistence.get_stats("run-2").await.unwrap().unwrap();
        assert_eq!(stats.status, ReasoningStatus::Completed);
        assert_eq!(stats.reasoning_tokens, 3);
    }
}
