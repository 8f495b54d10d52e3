//! Ambient configuration knobs (§6, SPEC_FULL A.3): plain structs with
//! `Default` impls matching the documented defaults, validated at
//! construction rather than at use.
//!
//! Grounded in the teacher crate's convention of small `*Config` structs with
//! `Default` (e.g. `knowledge::EmbedderConfig`), generalized here to cover
//! every config surface spec §6 enumerates.

use crate::error::CoreError;

/// Reasoning-loop configuration (`reasoning{enabled,min_steps,max_steps,persistence}`).
#[derive(Debug, Clone)]
pub struct ReasoningConfig {
    pub enabled: bool,
    pub min_steps: u32,
    pub max_steps: u32,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_steps: 1,
            max_steps: 3,
        }
    }
}

impl ReasoningConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.min_steps == 0 {
            return Err(CoreError::Config("reasoning.min_steps must be at least 1".to_string()));
        }
        if self.max_steps < self.min_steps {
            return Err(CoreError::Config("reasoning.max_steps must be >= min_steps".to_string()));
        }
        Ok(())
    }
}

/// LearningManager configuration (§6's `LearningManager {...}` knob set).
#[derive(Debug, Clone)]
pub struct LearningConfig {
    pub enabled: bool,
    pub top_k: usize,
    pub dedupe_top_k: usize,
    pub dedupe_max_hamming: u32,
    pub auto_promote_streak: i64,
    pub auto_promote_hits: i64,
    pub auto_promote_confidence_streak: f64,
    pub auto_promote_confidence_hits: f64,
    /// Write-gate ceiling on a canonicalized item's content length (§4.4.2).
    pub max_canonical_chars: usize,
    /// Max bullets extracted by the procedure/faq/pattern canonicalization
    /// rules (§4.4.1).
    pub max_bullets: usize,
    /// Max characters kept per extracted bullet before truncation.
    pub max_bullet_chars: usize,
    /// Max lines kept from a fenced code block in the snippet rule.
    pub max_code_block_lines: usize,
    /// Final content cap applied after rule-specific extraction (§4.4.1).
    pub max_total_chars: usize,
    /// Final line-count cap applied after rule-specific extraction.
    pub max_lines: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: 6,
            dedupe_top_k: 5,
            dedupe_max_hamming: 5,
            auto_promote_streak: 3,
            auto_promote_hits: 5,
            auto_promote_confidence_streak: 0.75,
            auto_promote_confidence_hits: 0.68,
            max_canonical_chars: 900,
            max_bullets: 8,
            max_bullet_chars: 220,
            max_code_block_lines: 10,
            max_total_chars: 900,
            max_lines: 12,
        }
    }
}

impl LearningConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.top_k == 0 {
            return Err(CoreError::Config("learning.top_k must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.auto_promote_confidence_streak)
            || !(0.0..=1.0).contains(&self.auto_promote_confidence_hits)
        {
            return Err(CoreError::Config("learning confidence thresholds must be in [0,1]".to_string()));
        }
        if self.max_canonical_chars == 0
            || self.max_bullets == 0
            || self.max_bullet_chars == 0
            || self.max_code_block_lines == 0
            || self.max_total_chars == 0
            || self.max_lines == 0
        {
            return Err(CoreError::Config("learning canonicalization limits must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Per-request culture/user-profile context configuration
/// (`culture{enabled,add_to_context,update}`).
#[derive(Debug, Clone, Default)]
pub struct CultureConfig {
    pub enabled: bool,
    pub add_to_context: bool,
    pub update: bool,
}

/// Knowledge-level configuration surface referenced by agent config
/// (`knowledge{chunk_size,chunk_overlap,embedder,filters,num_documents}`);
/// chunking defaults live alongside the implementation in
/// `knowledge::chunking` and `knowledge::KnowledgeConfig` — this mirror
/// exists so `AgentConfig` can reference one documented default set without
/// depending on the knowledge module's internal constants.
#[derive(Debug, Clone)]
pub struct KnowledgeRefConfig {
    pub num_documents: usize,
}

impl Default for KnowledgeRefConfig {
    fn default() -> Self {
        Self { num_documents: 5 }
    }
}

/// Agent-level configuration (§6's `{name, model, instructions, ...}` knob
/// set). Tool/guardrail/knowledge/memory objects themselves are injected into
/// the `AgentRunner` builder directly rather than named here; this struct
/// holds the scalar/behavioral knobs.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub model: String,
    pub role: Option<String>,
    pub description: Option<String>,
    pub instructions: Option<String>,
    pub add_history_to_messages: bool,
    pub num_history_runs: usize,
    pub markdown: bool,
    pub show_tools_call: bool,
    pub debug: bool,
    pub agentic_state_enabled: bool,
    pub knowledge_max_documents: usize,
    pub max_iterations: u32,
    pub reasoning: ReasoningConfig,
    pub learning: LearningConfig,
    pub culture: CultureConfig,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            role: None,
            description: None,
            instructions: None,
            add_history_to_messages: true,
            num_history_runs: 5,
            markdown: false,
            show_tools_call: false,
            debug: false,
            agentic_state_enabled: false,
            knowledge_max_documents: 5,
            max_iterations: 10,
            reasoning: ReasoningConfig::default(),
            learning: LearningConfig::default(),
            culture: CultureConfig::default(),
        }
    }

    /// Validate required fields and nested configs. Called once at
    /// `AgentRunner` construction (§7: "fatal to the caller" at
    /// construction time).
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::Config("agent.name must not be empty".to_string()));
        }
        if self.model.trim().is_empty() {
            return Err(CoreError::Config("agent.model must not be empty".to_string()));
        }
        if self.max_iterations == 0 {
            return Err(CoreError::Config("agent.max_iterations must be at least 1".to_string()));
        }
        self.reasoning.validate()?;
        self.learning.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_agent_config_validates() {
        let config = AgentConfig::new("assistant", "gpt-4o-mini");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_name_fails_validation() {
        let config = AgentConfig::new("", "gpt-4o-mini");
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn reasoning_max_below_min_fails() {
        let mut config = AgentConfig::new("assistant", "gpt-4o-mini");
        config.reasoning.min_steps = 3;
        config.reasoning.max_steps = 1;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn learning_confidence_out_of_range_fails() {
        let mut config = AgentConfig::new("assistant", "gpt-4o-mini");
        config.learning.auto_promote_confidence_streak = 1.5;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }
}
