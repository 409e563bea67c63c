//! Stderr line classification.
//!
//! The wrapped CLI is chatty on stderr: banners, spinners, timers and hints
//! arrive there alongside real failures. Lines are classified against a
//! compiled, ordered rule table with fixed precedence
//! skip > info > error > default info. Unknown lines are assumed benign.
//!
//! The info and initialization phrase lists describe the banner format of the
//! wrapped CLI as of `BANNER_FORMAT_VERSION`. If the CLI changes its banner the
//! predicates simply stop matching; nothing here can fail.

use crate::events::InfoType;
use once_cell::sync::Lazy;
use regex::Regex;

/// Version tag of the banner phrase lists below.
pub const BANNER_FORMAT_VERSION: &str = "q-chat-1";

/// Result of classifying one stderr line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Noise that must not reach clients
    Skip,
    /// Benign status output
    Info(InfoType),
    /// A failure reported by the wrapped CLI
    Error,
}

impl MessageClass {
    pub fn is_error(&self) -> bool {
        matches!(self, MessageClass::Error)
    }
}

struct Rule {
    name: &'static str,
    pattern: Regex,
    outcome: MessageClass,
}

fn rule(name: &'static str, pattern: &str, outcome: MessageClass) -> Rule {
    Rule {
        name,
        pattern: Regex::new(pattern).expect("Invalid classifier pattern"),
        outcome,
    }
}

static SKIP_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        rule("blank", r"^\s*$", MessageClass::Skip),
        rule("control-only", r"^[\x00-\x1F\x7F\s]+$", MessageClass::Skip),
        rule(
            "spinner-only",
            r"^[\s\x{2800}-\x{28FF}◐◓◑◒◴◵◶◷|/\\-]+$",
            MessageClass::Skip,
        ),
        rule("digit-fragment", r"^\s*[\d;:,.]+[A-Za-rt-z]?\s*$", MessageClass::Skip),
        rule("bracket-only", r"^[\s\[\](){}<>]+$", MessageClass::Skip),
        rule(
            "escape-residue",
            r"^\s*(?:\[[\d;?]*[A-Za-z]\s*)+$",
            MessageClass::Skip,
        ),
    ]
});

static INFO_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    let general = MessageClass::Info(InfoType::General);
    let init = MessageClass::Info(InfoType::Initialization);
    let progress = MessageClass::Info(InfoType::Progress);
    vec![
        rule("welcome", r"(?i)welcome to", init),
        rule("loaded", r"(?i)\bloaded in\s+[\d.]+\s*s\b", init),
        rule(
            "mcp-init",
            r"(?i)mcp servers?\s+(?:initialized|initializing|loading)",
            init,
        ),
        rule("model-identity", r"(?i)you are chatting with", init),
        rule("shortcut-ctrl", r"(?i)\bctrl\s*\+\s*[a-z]\b", general),
        rule("shortcut-help", r"(?i)(?:^|\s)/help\b", general),
        rule(
            "shortcut-hint",
            r"(?i)^\s*(?:use|press|type)\s+/?\w+\s+to\b",
            general,
        ),
        rule("progress-timer", r"^\s*\d+(?:\.\d+)?\s*s\s*$", progress),
        rule("progress-elapsed", r"^\s*\(\s*\d+(?:\.\d+)?\s*s\s*\)\s*$", progress),
        rule("thinking", r"(?i)^\s*thinking\.{0,4}\s*$", progress),
    ]
});

static ERROR_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    [
        ("error", r"(?i)\berror\b"),
        ("failed", r"(?i)\bfail(?:ed|ure)?\b"),
        ("exception", r"(?i)\bexception\b"),
        ("cannot", r"(?i)\bcannot\b|\bcan't\b|\bunable to\b"),
        ("permission", r"(?i)permission denied|access denied"),
        ("not-found", r"(?i)not found|no such file"),
        ("invalid", r"(?i)\binvalid\b"),
        ("timeout", r"(?i)\btime(?:d)?\s?out\b"),
        (
            "connection",
            r"(?i)connection (?:refused|reset|lost|closed|error)|econnrefused|network error",
        ),
    ]
    .into_iter()
    .map(|(name, pattern)| rule(name, pattern, MessageClass::Error))
    .collect()
});

static LOADED_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bloaded\b").expect("Invalid pattern"));
static ERROR_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\berror").expect("Invalid pattern"));

static INIT_MESSAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)welcome to",
        r"|\bloaded in\s+[\d.]+\s*s\b",
        r"|mcp servers?\s+(?:initialized|initializing|loading)",
        r"|\d+\s+of\s+\d+\s+mcp servers?",
        r"|you are chatting with",
        r"|^\s*/\w+\s{2,}\S",
        r"|\bctrl\s*\+\s*[a-z]\b",
        r"|^\s*!\s*\S",
    ))
    .expect("Invalid initialization pattern")
});

static INIT_COMPLETE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\d+\s+of\s+\d+\s+mcp servers?\s+initialized|you are chatting with")
        .expect("Invalid initialization pattern")
});

/// Classify a stderr line. Total: every input produces a class.
pub fn classify(line: &str) -> MessageClass {
    classify_with_rule(line).0
}

/// Classify and report which rule decided, for logging.
pub fn classify_with_rule(line: &str) -> (MessageClass, &'static str) {
    if let Some(rule) = SKIP_RULES.iter().find(|r| r.pattern.is_match(line)) {
        return (rule.outcome, rule.name);
    }
    if let Some(rule) = INFO_RULES.iter().find(|r| r.pattern.is_match(line)) {
        return (rule.outcome, rule.name);
    }
    if is_loaded_error_carve_out(line) {
        return (MessageClass::Info(InfoType::General), "error-loaded-carve-out");
    }
    if let Some(rule) = ERROR_RULES.iter().find(|r| r.pattern.is_match(line)) {
        return (rule.outcome, rule.name);
    }
    (MessageClass::Info(InfoType::General), "default")
}

/// "error" next to "loaded" on the same line is a load report, not a failure.
fn is_loaded_error_carve_out(line: &str) -> bool {
    ERROR_WORD.is_match(line) && LOADED_WORD.is_match(line)
}

/// True for lines belonging to the startup banner.
pub fn is_initialization_message(line: &str) -> bool {
    INIT_MESSAGE.is_match(line)
}

/// True for the banner line that marks the end of initialization.
pub fn is_initialization_complete(line: &str) -> bool {
    INIT_COMPLETE.is_match(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_skip_patterns() {
        for line in ["", "   ", "\x07\x08", "⠋", "⠙ ⠹", "25h", "1;2", "[ ]", "()", "[0m[2K"] {
            assert_eq!(classify(line), MessageClass::Skip, "line {line:?}");
        }
    }

    #[test]
    fn test_info_patterns() {
        assert_eq!(
            classify("Welcome to Amazon Q!"),
            MessageClass::Info(InfoType::Initialization)
        );
        assert_eq!(
            classify("✓ github loaded in 0.45 s"),
            MessageClass::Info(InfoType::Initialization)
        );
        assert_eq!(
            classify("✓ 2 of 2 mcp servers initialized."),
            MessageClass::Info(InfoType::Initialization)
        );
        assert_eq!(
            classify("ctrl + j    new lines"),
            MessageClass::Info(InfoType::General)
        );
        assert_eq!(classify("Thinking..."), MessageClass::Info(InfoType::Progress));
        assert_eq!(classify("3.2 s"), MessageClass::Info(InfoType::Progress));
        assert_eq!(classify("12s"), MessageClass::Info(InfoType::Progress));
        assert_eq!(classify("(4.5s)"), MessageClass::Info(InfoType::Progress));
        assert_eq!(
            classify("Use /help to list commands"),
            MessageClass::Info(InfoType::General)
        );
        assert_eq!(
            classify("Press ctrl to cancel"),
            MessageClass::Info(InfoType::General)
        );
    }

    #[test]
    fn test_failures_mentioning_timers_or_hints_are_errors() {
        for (line, rule) in [
            ("Error: request timed out (30s)", "error"),
            ("Error: failed to use fs_write to save the file", "error"),
            ("Error: cannot use execute_bash to run commands here", "error"),
            ("upload failed after (12s)", "failed"),
            ("unable to use git to fetch", "cannot"),
        ] {
            assert_eq!(classify_with_rule(line), (MessageClass::Error, rule), "line {line:?}");
        }
    }

    #[test]
    fn test_error_patterns() {
        for line in [
            "Error: something broke",
            "request failed with status 500",
            "Unhandled exception in handler",
            "cannot open file",
            "Permission denied (os error 13)",
            "model not found",
            "invalid argument --foo",
            "request timed out",
            "connection refused by host",
        ] {
            assert_eq!(classify(line), MessageClass::Error, "line {line:?}");
        }
    }

    #[test]
    fn test_skip_beats_info_and_error() {
        // A bare spinner frame would otherwise fall through to the default.
        assert_eq!(classify("⠋⠙"), MessageClass::Skip);
        assert_eq!(classify_with_rule("").1, "blank");
    }

    #[test]
    fn test_info_beats_error() {
        // Contains "failed" but is a load report matched by the info table first.
        assert_eq!(
            classify("✓ failed_tool loaded in 0.1 s"),
            MessageClass::Info(InfoType::Initialization)
        );
    }

    #[test]
    fn test_error_loaded_carve_out() {
        let (class, rule) = classify_with_rule("error handler loaded");
        assert_eq!(class, MessageClass::Info(InfoType::General));
        assert_eq!(rule, "error-loaded-carve-out");
        assert_eq!(
            classify("error: plugin could not be loaded, permission denied"),
            MessageClass::Info(InfoType::General)
        );
        assert_eq!(classify("error: plugin could not start"), MessageClass::Error);
    }

    #[test]
    fn test_unknown_defaults_to_info() {
        assert_eq!(
            classify_with_rule("some unrecognized chatter"),
            (MessageClass::Info(InfoType::General), "default")
        );
    }

    #[test]
    fn test_initialization_predicates() {
        assert!(is_initialization_message("Welcome to Amazon Q!"));
        assert!(is_initialization_message("✓ fetch loaded in 1.02 s"));
        assert!(is_initialization_message("/help         all commands"));
        assert!(is_initialization_message("ctrl + s      fuzzy search"));
        assert!(is_initialization_message("🤖 You are chatting with claude-sonnet-4"));
        assert!(!is_initialization_message("Hello, how can I help?"));

        assert!(is_initialization_complete("✓ 2 of 2 mcp servers initialized."));
        assert!(is_initialization_complete("You are chatting with claude-sonnet-4"));
        assert!(!is_initialization_complete("✓ github loaded in 0.45 s"));
    }

    proptest! {
        #[test]
        fn prop_classify_is_total(line in any::<String>()) {
            let _ = classify(&line);
            let _ = is_initialization_message(&line);
            let _ = is_initialization_complete(&line);
        }

        #[test]
        fn prop_control_only_is_skipped(line in "[\\x00-\\x1f]{1,10}") {
            prop_assert_eq!(classify(&line), MessageClass::Skip);
        }
    }
}
