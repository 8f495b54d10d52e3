//! WorkflowEngine (C9): a linear ordered sequence of steps, each targeting
//! an `AgentRunner` or a nested `Workflow` (§4.9).
//!
//! Grounded in the teacher crate's `flow/flow.rs` (`Flow`/`FlowState`: a
//! named, stateful sequence of methods run in order, streaming lifecycle
//! events as it goes) and `flow/flow_events.rs` (`MethodExecutionStartedEvent`
//! / `MethodExecutionFinishedEvent` naming convention), simplified from the
//! teacher's full `@start`/`@listen`/`@router` trigger-condition graph down
//! to the spec's linear ordered-steps model — there is no branching here,
//! just step `i` receiving the accumulated outputs of steps `0..i`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::agent::{AgentEvent, AgentRunner, EventSink, RunOptions};
use crate::error::CoreError;

/// The accumulated context handed to one step: the original user message
/// plus every prior step's output keyed by step name, in execution order
/// (§4.9: "step `i` receives ... the outputs of steps `0…i−1`").
#[derive(Debug, Clone, Default)]
pub struct StepInput {
    pub user_message: String,
    pub order: Vec<String>,
    pub prior_outputs: HashMap<String, StepOutput>,
}

impl StepInput {
    /// Render prior outputs as a single block appended after the user
    /// message, in step order, for steps whose target has no native notion
    /// of "prior structured outputs" (i.e. plain agent steps).
    fn render_for_agent(&self) -> String {
        if self.prior_outputs.is_empty() {
            return self.user_message.clone();
        }
        let mut body = String::new();
        body.push_str(&self.user_message);
        body.push_str("\n\n<workflow_context>\n");
        for name in &self.order {
            if let Some(out) = self.prior_outputs.get(name) {
                body.push_str(&format!("- {name}: {}\n", out.text));
            }
        }
        body.push_str("</workflow_context>");
        body
    }
}

/// One step's result: text, optional structured data, and events it chose
/// to propagate upward into the workflow sink (§4.9).
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub text: String,
    pub structured: Option<Value>,
}

/// Streamed events a workflow sink receives: step-scoped tokens and
/// lifecycle markers prefixed with the step's name (§4.9: "a workflow-level
/// sink receives step events prefixed with the step's name").
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    StepStarted { step: String },
    StepToken { step: String, delta: String },
    StepComplete { step: String, output: StepOutput },
    StepFailed { step: String, error: String },
}

#[async_trait]
pub trait WorkflowSink: Send + Sync {
    async fn emit(&self, event: WorkflowEvent);
}

/// Bridges an `AgentRunner`'s per-run `EventSink` into a workflow's
/// step-prefixed `WorkflowEvent` stream for the duration of one step.
struct StepSinkBridge<'a> {
    step: String,
    sink: &'a dyn WorkflowSink,
}

#[async_trait]
impl<'a> EventSink for StepSinkBridge<'a> {
    async fn emit(&self, event: AgentEvent) {
        if let AgentEvent::Token(delta) = event {
            self.sink
                .emit(WorkflowEvent::StepToken {
                    step: self.step.clone(),
                    delta,
                })
                .await;
        }
    }
}

/// What a step targets: a single agent turn, or a nested workflow that
/// inherits this run's cancellation and `user_id` (§4.9: "Nested workflows
/// inherit the outer context").
pub enum StepTarget {
    Agent(Arc<AgentRunner>),
    Workflow(Arc<Workflow>),
}

/// One named step in a workflow's linear sequence.
pub struct Step {
    pub name: String,
    pub target: StepTarget,
    /// If true, a failure in this step is recorded as a failed `StepOutput`
    /// (propagated as `WorkflowEvent::StepFailed`) but does not abort the
    /// remaining steps (§4.9: "unless the step declares
    /// `continue_on_error=true`").
    pub continue_on_error: bool,
}

impl Step {
    pub fn agent(name: impl Into<String>, runner: Arc<AgentRunner>) -> Self {
        Self {
            name: name.into(),
            target: StepTarget::Agent(runner),
            continue_on_error: false,
        }
    }

    pub fn workflow(name: impl Into<String>, workflow: Arc<Workflow>) -> Self {
        Self {
            name: name.into(),
            target: StepTarget::Workflow(workflow),
            continue_on_error: false,
        }
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }
}

/// The outcome of one full workflow run: every step's output keyed by name,
/// in execution order, plus the final step's text as a convenience.
#[derive(Debug, Clone, Default)]
pub struct WorkflowOutput {
    pub step_order: Vec<String>,
    pub step_outputs: HashMap<String, StepOutput>,
}

impl WorkflowOutput {
    pub fn final_text(&self) -> &str {
        self.step_order
            .last()
            .and_then(|name| self.step_outputs.get(name))
            .map(|out| out.text.as_str())
            .unwrap_or("")
    }
}

/// A linear, named sequence of steps (§4.9).
pub struct Workflow {
    pub name: String,
    pub steps: Vec<Step>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn add_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Run every step in order, feeding step `i` the user message plus all
    /// prior steps' outputs. A step failure aborts the remaining steps and
    /// surfaces the error tagged by step name, unless that step declared
    /// `continue_on_error=true` (§4.9).
    pub async fn run(
        &self,
        user_message: &str,
        base_options: RunOptions,
        sink: Option<&dyn WorkflowSink>,
    ) -> Result<WorkflowOutput, CoreError> {
        let mut output = WorkflowOutput::default();
        let mut context = StepInput {
            user_message: user_message.to_string(),
            order: Vec::new(),
            prior_outputs: HashMap::new(),
        };

        for step in &self.steps {
            if let Some(sink) = sink {
                sink.emit(WorkflowEvent::StepStarted { step: step.name.clone() }).await;
            }

            let result = self.run_step(step, &context, &base_options, sink).await;

            match result {
                Ok(step_output) => {
                    if let Some(sink) = sink {
                        sink.emit(WorkflowEvent::StepComplete {
                            step: step.name.clone(),
                            output: step_output.clone(),
                        })
                        .await;
                    }
                    context.order.push(step.name.clone());
                    context.prior_outputs.insert(step.name.clone(), step_output.clone());
                    output.step_order.push(step.name.clone());
                    output.step_outputs.insert(step.name.clone(), step_output);
                }
                Err(e) => {
                    if let Some(sink) = sink {
                        sink.emit(WorkflowEvent::StepFailed {
                            step: step.name.clone(),
                            error: e.to_string(),
                        })
                        .await;
                    }
                    if step.continue_on_error {
                        let failed = StepOutput {
                            text: String::new(),
                            structured: None,
                        };
                        context.order.push(step.name.clone());
                        context.prior_outputs.insert(step.name.clone(), failed.clone());
                        output.step_order.push(step.name.clone());
                        output.step_outputs.insert(step.name.clone(), failed);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Ok(output)
    }

    async fn run_step(
        &self,
        step: &Step,
        context: &StepInput,
        base_options: &RunOptions,
        sink: Option<&dyn WorkflowSink>,
    ) -> Result<StepOutput, CoreError> {
        match &step.target {
            StepTarget::Agent(runner) => {
                let message = context.render_for_agent();
                let options = RunOptions {
                    history: Vec::new(),
                    ..base_options.clone()
                };
                let agent_event_sink = sink.map(|s| StepSinkBridge {
                    step: step.name.clone(),
                    sink: s,
                });
                let run_output = match &agent_event_sink {
                    Some(bridge) => runner.run(&message, options, Some(bridge as &dyn EventSink)).await?,
                    None => runner.run(&message, options, None).await?,
                };
                Ok(StepOutput {
                    text: run_output.text,
                    structured: run_output.structured_output,
                })
            }
            StepTarget::Workflow(nested) => {
                // Nested workflows inherit the outer context (cancellation
                // is modeled by `RunOptions`/`CoreError::Cancelled` bubbling
                // through `?`; `user_id` is carried verbatim) and stream into
                // the same sink, step events still prefixed by this step's
                // name via `NestedSinkBridge`.
                let inner_message = context.render_for_agent();
                let nested_options = base_options.clone();
                let bridged = sink.map(|s| NestedSinkBridge {
                    prefix: step.name.clone(),
                    sink: s,
                });
                let nested_output = match &bridged {
                    Some(b) => nested.run(&inner_message, nested_options, Some(b as &dyn WorkflowSink)).await?,
                    None => nested.run(&inner_message, nested_options, None).await?,
                };
                Ok(StepOutput {
                    text: nested_output.final_text().to_string(),
                    structured: None,
                })
            }
        }
    }
}

/// Re-prefixes a nested workflow's step-scoped events with the outer step's
/// name, so `"inner_step"` token events surface as
/// `"outer_step.inner_step"` to the top-level sink (§4.9: nested workflows
/// "stream into the same sink").
struct NestedSinkBridge<'a> {
    prefix: String,
    sink: &'a dyn WorkflowSink,
}

#[async_trait]
impl<'a> WorkflowSink for NestedSinkBridge<'a> {
    async fn emit(&self, event: WorkflowEvent) {
        let rewritten = match event {
            WorkflowEvent::StepStarted { step } => WorkflowEvent::StepStarted {
                step: format!("{}.{}", self.prefix, step),
            },
            WorkflowEvent::StepToken { step, delta } => WorkflowEvent::StepToken {
                step: format!("{}.{}", self.prefix, step),
                delta,
            },
            WorkflowEvent::StepComplete { step, output } => WorkflowEvent::StepComplete {
                step: format!("{}.{}", self.prefix, step),
                output,
            },
            WorkflowEvent::StepFailed { step, error } => WorkflowEvent::StepFailed {
                step: format!("{}.{}", self.prefix, step),
                error,
            },
        };
        self.sink.emit(rewritten).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::conversation::{Message, ModelOptions, ModelProvider, StreamSink, Usage};
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    struct EchoModel;

    #[async_trait]
    impl ModelProvider for EchoModel {
        fn model(&self) -> &str {
            "echo-model"
        }

        async fn invoke(&self, messages: &[Message], _options: &ModelOptions) -> Result<(Message, Usage), CoreError> {
            let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok((Message::assistant(format!("echo:{last}")), Usage::default()))
        }

        async fn invoke_stream(
            &self,
            messages: &[Message],
            options: &ModelOptions,
            _sink: &dyn StreamSink,
        ) -> Result<(Message, Usage), CoreError> {
            self.invoke(messages, options).await
        }
    }

    struct FailingModel;

    #[async_trait]
    impl ModelProvider for FailingModel {
        fn model(&self) -> &str {
            "failing-model"
        }

        async fn invoke(&self, _messages: &[Message], _options: &ModelOptions) -> Result<(Message, Usage), CoreError> {
            Err(CoreError::TransientModel("boom".to_string()))
        }

        async fn invoke_stream(
            &self,
            messages: &[Message],
            options: &ModelOptions,
            _sink: &dyn StreamSink,
        ) -> Result<(Message, Usage), CoreError> {
            self.invoke(messages, options).await
        }
    }

    fn runner(name: &str) -> Arc<AgentRunner> {
        let config = AgentConfig::new(name, "echo-model");
        Arc::new(AgentRunner::new(config, Arc::new(EchoModel)).unwrap())
    }

    fn failing_runner(name: &str) -> Arc<AgentRunner> {
        let config = AgentConfig::new(name, "failing-model");
        Arc::new(AgentRunner::new(config, Arc::new(FailingModel)).unwrap())
    }

    struct RecordingSink {
        events: Mutex<Vec<WorkflowEvent>>,
    }

    #[async_trait]
    impl WorkflowSink for RecordingSink {
        async fn emit(&self, event: WorkflowEvent) {
            self.events.lock().await.push(event);
        }
    }

    #[tokio::test]
    async fn steps_receive_prior_outputs_in_order() {
        let workflow = Workflow::new("pipeline")
            .add_step(Step::agent("draft", runner("drafter")))
            .add_step(Step::agent("polish", runner("polisher")));

        let output = workflow.run("write a haiku", RunOptions::default(), None).await.unwrap();
        assert_eq!(output.step_order, vec!["draft".to_string(), "polish".to_string()]);
        assert!(output.step_outputs["draft"].text.starts_with("echo:"));
        assert!(output.step_outputs["polish"].text.contains("workflow_context"));
    }

    #[tokio::test]
    async fn failing_step_aborts_without_continue_on_error() {
        let workflow = Workflow::new("pipeline").add_step(Step::agent("fails", failing_runner("bad")));

        let err = workflow.run("go", RunOptions::default(), None).await.unwrap_err();
        assert!(matches!(err, CoreError::TransientModel(_)));
    }

    #[tokio::test]
    async fn continue_on_error_step_does_not_abort_workflow() {
        let workflow = Workflow::new("pipeline")
            .add_step(Step::agent("fails", failing_runner("bad")).continue_on_error())
            .add_step(Step::agent("recovers", runner("recoverer")));

        let output = workflow.run("go", RunOptions::default(), None).await.unwrap();
        assert_eq!(output.step_order, vec!["fails".to_string(), "recovers".to_string()]);
        assert!(output.step_outputs["fails"].text.is_empty());
        assert!(output.step_outputs["recovers"].text.starts_with("echo:"));
    }

    #[tokio::test]
    async fn nested_workflow_step_streams_prefixed_events() {
        let inner = Arc::new(Workflow::new("inner").add_step(Step::agent("inner_step", runner("inner_agent"))));
        let outer = Workflow::new("outer").add_step(Step::workflow("nested", inner));

        let sink = RecordingSink { events: Mutex::new(Vec::new()) };
        outer.run("hi", RunOptions::default(), Some(&sink)).await.unwrap();

        let events = sink.events.lock().await;
        let started_outer = events
            .iter()
            .any(|e| matches!(e, WorkflowEvent::StepStarted { step } if step == "nested"));
        assert!(started_outer);
    }
}
