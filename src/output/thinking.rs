//! "Thinking" indicator de-duplication and prompt detection.

use once_cell::sync::Lazy;
use regex::Regex;

static THINKING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*thinking\.{0,4}\s*$").expect("Invalid thinking pattern"));

static PROMPT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*!?>\s*$").expect("Invalid prompt pattern"));

/// Text emitted for the indicator, regardless of how many dots were seen.
pub const THINKING_MESSAGE: &str = "Thinking...";

pub fn is_thinking_indicator(line: &str) -> bool {
    THINKING.is_match(line)
}

/// True for the bare input prompt the CLI prints when it is ready for input.
pub fn is_prompt_ready(line: &str) -> bool {
    PROMPT.is_match(line)
}

/// What to do with an observed indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingDecision {
    Emit,
    Suppress,
}

/// Per-session indicator state: emitted at most once per turn.
#[derive(Debug, Default, Clone)]
pub struct ThinkingDeduplicator {
    active: bool,
    sent: bool,
}

impl ThinkingDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an indicator occurrence.
    pub fn observe(&mut self) -> ThinkingDecision {
        self.active = true;
        if self.sent {
            ThinkingDecision::Suppress
        } else {
            self.sent = true;
            ThinkingDecision::Emit
        }
    }

    /// Regular output arrived; the indicator is no longer showing but stays sent.
    pub fn settle(&mut self) {
        self.active = false;
    }

    /// New user input or prompt-ready: the next indicator is emitted again.
    pub fn reset(&mut self) {
        self.active = false;
        self.sent = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn has_sent(&self) -> bool {
        self.sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indicator_pattern() {
        for line in ["Thinking", "thinking.", "THINKING....", "  Thinking...  "] {
            assert!(is_thinking_indicator(line), "{line:?}");
        }
        for line in ["Thinking.....", "I am thinking...", "Thinking about it"] {
            assert!(!is_thinking_indicator(line), "{line:?}");
        }
    }

    #[test]
    fn test_prompt_pattern() {
        assert!(is_prompt_ready(">"));
        assert!(is_prompt_ready("> "));
        assert!(is_prompt_ready("!>"));
        assert!(!is_prompt_ready("> quoted text"));
    }

    #[test]
    fn test_emitted_once_per_turn() {
        let mut dedup = ThinkingDeduplicator::new();
        assert_eq!(dedup.observe(), ThinkingDecision::Emit);
        assert_eq!(dedup.observe(), ThinkingDecision::Suppress);
        assert!(dedup.is_active());

        dedup.settle();
        assert!(!dedup.is_active());
        assert_eq!(dedup.observe(), ThinkingDecision::Suppress);

        dedup.reset();
        assert!(!dedup.has_sent());
        assert_eq!(dedup.observe(), ThinkingDecision::Emit);
    }
}
