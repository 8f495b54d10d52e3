//! Conversation / message data model (§3) and the LLM provider adapter
//! surface (§6, §4.8.2).
//!
//! Grounded in the teacher crate's `llms::base_llm::LLMMessage` (a loosely
//! typed `HashMap<String, Value>`), generalized to a concrete struct since
//! this core owns the full run loop rather than delegating message shape to
//! a Python-style dict.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// Conversation participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments string as streamed/returned by the model.
    pub arguments: String,
}

/// A single message in a conversation.
///
/// Immutable after append within a run (callers replace the conversation's
/// `Vec`, never mutate an appended message in place).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant_with_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            tool_calls,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }
}

/// An ordered, append-only sequence of messages for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Re-order pending tool results to match the order their calls were
    /// requested in (§5: "Tool results return out-of-order to the runner but
    /// are re-ordered by `tool_call_id` before being appended").
    pub fn append_tool_results_ordered(
        &mut self,
        call_order: &[String],
        mut results: HashMap<String, Message>,
    ) {
        for call_id in call_order {
            if let Some(msg) = results.remove(call_id) {
                self.messages.push(msg);
            }
        }
    }
}

/// Options accompanying an LLM invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelOptions {
    #[serde(default)]
    pub tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
}

/// Token usage reported by a single LLM call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
}

/// Sink for streamed deltas during `invoke_stream`. One sink per call; the
/// runner pushes, the attached sink owns back-pressure.
#[async_trait]
pub trait StreamSink: Send + Sync {
    async fn on_token(&self, delta: &str);
    async fn on_tool_call_delta(&self, index: usize, id: Option<&str>, name: Option<&str>, arguments_delta: &str);
}

/// The LLM provider adapter contract (§6, §4.8.2).
///
/// Adapters for OpenAI-compatible endpoints share this wire shape; streaming
/// tool-call deltas carry either an `index` or an `id`, and normalise by
/// concatenating consecutive deltas with the same index/id into one call's
/// arguments before handing it to the `ToolRegistry`.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Model identifier this adapter targets.
    fn model(&self) -> &str;

    /// Non-streaming call: returns one assistant `Message`.
    async fn invoke(&self, messages: &[Message], options: &ModelOptions) -> Result<(Message, Usage), CoreError>;

    /// Streaming call: tokens and tool-call deltas are pushed to `sink` as
    /// they arrive; the final assembled message is returned once the stream
    /// ends.
    async fn invoke_stream(
        &self,
        messages: &[Message],
        options: &ModelOptions,
        sink: &dyn StreamSink,
    ) -> Result<(Message, Usage), CoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_results_reordered_by_call_order() {
        let mut convo = Conversation::new();
        let mut results = HashMap::new();
        results.insert("b".to_string(), Message::tool_result("b", "f", "second"));
        results.insert("a".to_string(), Message::tool_result("a", "f", "first"));
        convo.append_tool_results_ordered(&["a".to_string(), "b".to_string()], results);
        assert_eq!(convo.messages[0].content, "first");
        assert_eq!(convo.messages[1].content, "second");
    }
}
