//! Canonicalization and the write gate (§4.4.1, §4.4.2).
//!
//! Grounded in the teacher crate's `Lazy<Regex>` static-pattern convention
//! (`utilities/string_utils.rs`) for compiled regexes and in
//! `tasks/llm_guardrail.rs`'s refusal-reason shape (a guard either passes or
//! returns a reason string), generalized here to the fixed six-reason
//! rejection enum the spec defines.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::LearningConfig;
use crate::error::CoreError;

/// Kind of a canonicalized learning item, assigned by whichever
/// canonicalization rule in `canonicalize` fired (§4.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearningItemType {
    Decision,
    Snippet,
    Procedure,
    Faq,
    Pattern,
}

impl LearningItemType {
    pub fn as_str(self) -> &'static str {
        match self {
            LearningItemType::Decision => "decision",
            LearningItemType::Snippet => "snippet",
            LearningItemType::Procedure => "procedure",
            LearningItemType::Faq => "faq",
            LearningItemType::Pattern => "pattern",
        }
    }
}

/// Output of `canonicalize`: a titled, typed, length-capped memory candidate
/// derived from one (user_msg, assistant_msg) turn (§4.4.1).
#[derive(Debug, Clone)]
pub struct Canonical {
    pub title: String,
    pub topic: String,
    pub content: String,
    pub item_type: LearningItemType,
    pub tags: Vec<String>,
}

static DECISION_PHRASE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(decision:|we decided|we chose)").unwrap());
static CODE_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[a-zA-Z0-9_+-]*\r?\n?(.*?)```").unwrap());
static BULLET_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[-*]|\d+[.)])\s+(.+?)\s*$").unwrap());

/// Rule 1 (§4.4.1): topic is the first line of `user_msg`, with a leading
/// "User:" label stripped, a trailing `?`/`.` stripped, and truncated to 60
/// characters with an ellipsis.
fn extract_topic(user_msg: &str) -> String {
    let first_line = user_msg.lines().next().unwrap_or("").trim();
    let without_label = if first_line.len() >= 5 && first_line[..5].eq_ignore_ascii_case("user:") {
        first_line[5..].trim()
    } else {
        first_line
    };
    let trimmed = without_label.trim_end_matches(['?', '.']).trim();
    cap_chars(trimmed, 60)
}

fn cap_chars(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let truncated: String = s.chars().take(max).collect();
        format!("{truncated}...")
    } else {
        s.to_string()
    }
}

fn split_sentences(text: &str) -> Vec<String> {
    text.split(['.', '!', '?'])
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Rule 2 (§4.4.1): assistant text signals an explicit decision. Emit up to
/// `max_bullets` bullets from sentences at least 20 characters long.
fn decision_bullets(assistant_msg: &str, max_bullets: usize, max_bullet_chars: usize) -> String {
    split_sentences(assistant_msg)
        .into_iter()
        .filter(|s| s.chars().count() >= 20)
        .take(max_bullets)
        .map(|s| format!("- {}", cap_chars(&s, max_bullet_chars)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Rule 3 (§4.4.1): the first fenced code block, truncated to
/// `max_code_block_lines` lines and wrapped as "- Snippet:\n```…```".
fn extract_code_block(assistant_msg: &str, max_lines: usize) -> Option<String> {
    let caps = CODE_BLOCK_RE.captures(assistant_msg)?;
    let inner = caps.get(1)?.as_str();
    let body: Vec<&str> = inner.lines().take(max_lines).collect();
    Some(format!("- Snippet:\n```\n{}\n```", body.join("\n")))
}

/// Rule 4 (§4.4.1): markdown bullets (`- `, `* `, `1.`/`1)`), up to
/// `max_bullets` of them, each capped at `max_bullet_chars`.
fn extract_markdown_bullets(assistant_msg: &str, max_bullets: usize, max_bullet_chars: usize) -> Option<String> {
    let bullets: Vec<String> = assistant_msg
        .lines()
        .filter_map(|line| BULLET_LINE_RE.captures(line))
        .map(|caps| cap_chars(caps.get(1).unwrap().as_str().trim(), max_bullet_chars))
        .filter(|s| !s.is_empty())
        .take(max_bullets)
        .collect();
    if bullets.is_empty() {
        None
    } else {
        Some(bullets.iter().map(|b| format!("- {b}")).collect::<Vec<_>>().join("\n"))
    }
}

/// Rule 5 (§4.4.1): fall back to bullets derived from sentence splits; the
/// item is `faq` when the user message is a question with few bullets,
/// `pattern` otherwise.
fn sentence_fallback(user_msg: &str, assistant_msg: &str, max_bullets: usize, max_bullet_chars: usize) -> (String, LearningItemType) {
    let sentences: Vec<String> = split_sentences(assistant_msg)
        .into_iter()
        .take(max_bullets)
        .map(|s| cap_chars(&s, max_bullet_chars))
        .collect();
    let item_type = if user_msg.trim_end().ends_with('?') && sentences.len() <= 4 {
        LearningItemType::Faq
    } else {
        LearningItemType::Pattern
    };
    let content = sentences.iter().map(|s| format!("- {s}")).collect::<Vec<_>>().join("\n");
    (content, item_type)
}

/// Rule 6 (§4.4.1): cap the assembled content to `max_lines` lines and
/// `max_total_chars` characters.
fn cap_content(content: &str, max_lines: usize, max_total_chars: usize) -> String {
    let capped: Vec<&str> = content.lines().take(max_lines).collect();
    let joined = capped.join("\n");
    cap_chars(&joined, max_total_chars)
}

/// Transform one (user_msg, assistant_msg) turn into a `Canonical`, following
/// the six ordered rules in §4.4.1: topic extraction, decision-bullet
/// extraction, code-fence snippet extraction, markdown-bullet extraction,
/// sentence-split fallback, and a final length/line cap.
pub fn canonicalize(user_msg: &str, assistant_msg: &str, limits: &LearningConfig) -> Canonical {
    let topic = extract_topic(user_msg);

    let (content, item_type) = if DECISION_PHRASE_RE.is_match(assistant_msg) {
        (
            decision_bullets(assistant_msg, limits.max_bullets, limits.max_bullet_chars),
            LearningItemType::Decision,
        )
    } else if let Some(block) = extract_code_block(assistant_msg, limits.max_code_block_lines) {
        (block, LearningItemType::Snippet)
    } else if let Some(bullets) = extract_markdown_bullets(assistant_msg, limits.max_bullets, limits.max_bullet_chars) {
        (bullets, LearningItemType::Procedure)
    } else {
        sentence_fallback(user_msg, assistant_msg, limits.max_bullets, limits.max_bullet_chars)
    };

    let content = cap_content(&content, limits.max_lines, limits.max_total_chars);

    Canonical {
        title: topic.clone(),
        topic,
        content,
        item_type,
        tags: Vec::new(),
    }
}

/// Why a candidate failed the write gate (§4.4.2). Exactly these six
/// reasons; callers surface the reason string verbatim in logs/telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    EmptyCanonical,
    CanonicalTooLong,
    SensitiveContent,
    TooSpecific,
    UnstableInformation,
    NotReusable,
}

impl RejectionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectionReason::EmptyCanonical => "empty_canonical",
            RejectionReason::CanonicalTooLong => "canonical_too_long",
            RejectionReason::SensitiveContent => "sensitive_content",
            RejectionReason::TooSpecific => "too_specific",
            RejectionReason::UnstableInformation => "unstable_information",
            RejectionReason::NotReusable => "not_reusable",
        }
    }
}

static SENSITIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(password|api[_ -]?key|secret|ssn|social security|credit card|private key)\b",
    )
    .unwrap()
});
// Long runs of digits/hex (ids, ports, PII-shaped numbers) or absolute file
// paths mark a candidate as specific to one conversation rather than
// generally reusable.
static TOO_SPECIFIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\b\d{6,}\b)|(/[a-zA-Z0-9_./-]{20,})").unwrap());
static UNSTABLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(today|right now|currently broken|temporarily|as of this moment|for now)\b").unwrap()
});
static REUSABLE_SIGNAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(always|never|should|prefer|instead of|rather than|convention|pattern|rule)\b").unwrap()
});

/// Decide whether a canonicalized candidate is eligible to be written to
/// long-term memory at all (§4.4.2). Runs in this fixed order so the first
/// matching reason is reported, matching the guard-evaluation order used
/// elsewhere in this core (guardrails, §4.7). `max_canonical_chars` is the
/// caller's configured ceiling (`LearningConfig::max_canonical_chars`).
pub fn write_gate(canonical: &str, max_canonical_chars: usize) -> Result<(), CoreError> {
    if canonical.trim().is_empty() {
        return Err(gate_error(RejectionReason::EmptyCanonical));
    }
    if canonical.chars().count() > max_canonical_chars + 3 {
        return Err(gate_error(RejectionReason::CanonicalTooLong));
    }
    if SENSITIVE_RE.is_match(canonical) {
        return Err(gate_error(RejectionReason::SensitiveContent));
    }
    if TOO_SPECIFIC_RE.is_match(canonical) {
        return Err(gate_error(RejectionReason::TooSpecific));
    }
    if UNSTABLE_RE.is_match(canonical) {
        return Err(gate_error(RejectionReason::UnstableInformation));
    }
    if !REUSABLE_SIGNAL_RE.is_match(canonical) && canonical.split_whitespace().count() < 6 {
        return Err(gate_error(RejectionReason::NotReusable));
    }
    Ok(())
}

fn gate_error(reason: RejectionReason) -> CoreError {
    CoreError::Guardrail {
        guard: "learning_write_gate".to_string(),
        reason: reason.as_str().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> LearningConfig {
        LearningConfig::default()
    }

    #[test]
    fn empty_canonical_is_rejected() {
        let err = write_gate("   ", 900).unwrap_err();
        assert!(matches!(err, CoreError::Guardrail { reason, .. } if reason == "empty_canonical"));
    }

    #[test]
    fn sensitive_content_is_rejected() {
        let err = write_gate("the api_key for staging is abc123 and should always be rotated", 900).unwrap_err();
        assert!(matches!(err, CoreError::Guardrail { reason, .. } if reason == "sensitive_content"));
    }

    #[test]
    fn reusable_rule_passes_gate() {
        assert!(write_gate("prefer composition over inheritance when extending handlers", 900).is_ok());
    }

    #[test]
    fn unstable_phrasing_is_rejected() {
        let err = write_gate("the deploy pipeline is currently broken for now, should retry", 900).unwrap_err();
        assert!(matches!(err, CoreError::Guardrail { reason, .. } if reason == "unstable_information"));
    }

    #[test]
    fn canonical_too_long_uses_configured_ceiling() {
        let long = "always prefer this pattern ".repeat(10);
        assert!(write_gate(&long, 900).is_ok());
        let err = write_gate(&long, 20).unwrap_err();
        assert!(matches!(err, CoreError::Guardrail { reason, .. } if reason == "canonical_too_long"));
    }

    #[test]
    fn decision_phrase_extracts_bullets() {
        let canon = canonicalize(
            "Should we use Postgres or Mongo?",
            "We decided to use Postgres for the primary store. It gives us strong consistency guarantees.",
            &limits(),
        );
        assert_eq!(canon.item_type, LearningItemType::Decision);
        assert!(canon.content.starts_with("- "));
        assert!(canon.content.contains("Postgres"));
    }

    #[test]
    fn fenced_code_block_becomes_snippet() {
        let canon = canonicalize(
            "How do I sum two numbers in Rust?",
            "Use this:\n```rust\nfn sum(a: i32, b: i32) -> i32 { a + b }\n```",
            &limits(),
        );
        assert_eq!(canon.item_type, LearningItemType::Snippet);
        assert!(canon.content.starts_with("- Snippet:\n```"));
        assert!(canon.content.contains("fn sum"));
    }

    #[test]
    fn markdown_bullets_become_procedure() {
        let canon = canonicalize(
            "How do I deploy this service?",
            "To deploy:\n- Build the image\n- Push to the registry\n- Roll out the new revision",
            &limits(),
        );
        assert_eq!(canon.item_type, LearningItemType::Procedure);
        assert!(canon.content.contains("Build the image"));
    }

    #[test]
    fn question_with_few_sentences_is_faq() {
        let canon = canonicalize(
            "What is a goroutine?",
            "A goroutine is a lightweight thread managed by the Go runtime.",
            &limits(),
        );
        assert_eq!(canon.item_type, LearningItemType::Faq);
    }

    #[test]
    fn statement_without_structure_is_pattern() {
        let canon = canonicalize(
            "Note this for later.",
            "Prefer composition over inheritance when extending handlers. It keeps coupling low.",
            &limits(),
        );
        assert_eq!(canon.item_type, LearningItemType::Pattern);
    }

    #[test]
    fn topic_strips_user_label_and_trailing_punctuation() {
        assert_eq!(extract_topic("User: How do Go channels work?"), "How do Go channels work");
    }

    #[test]
    fn final_cap_limits_lines_and_chars() {
        let mut cfg = limits();
        cfg.max_lines = 2;
        cfg.max_total_chars = 30;
        let assistant = "- one\n- two\n- three\n- four";
        let content = cap_content(assistant, cfg.max_lines, cfg.max_total_chars);
        assert!(content.lines().count() <= 2);
        assert!(content.chars().count() <= cfg.max_total_chars + 3);
    }
}
