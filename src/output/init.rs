//! Coalesces the startup banner into a single initialization message.
//!
//! While the phase is active every banner line is buffered and the caller
//! (re)arms a timer with the delay returned by [`InitializationAggregator::push`].
//! When the timer fires the caller calls [`InitializationAggregator::finish`],
//! which ends the phase and returns the combined message exactly once.

use super::classifier::{is_initialization_complete, is_initialization_message};
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

static WELCOME: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)welcome to").expect("Invalid pattern"));

static SERVERS_INITIALIZED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d+)\s+of\s+(\d+)\s+mcp servers?\s+initialized").expect("Invalid pattern")
});

static LOADED_SERVICE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)([A-Za-z0-9_.\-]+)\s+loaded in\s+[\d.]+\s*s\b").expect("Invalid pattern")
});

static MODEL_IDENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)you are chatting with").expect("Invalid pattern"));

static HELP_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*/\w+\s{2,}\S|\bctrl\s*\+\s*[a-z]\b|^\s*!\s*\S|(?:^|\s)/help\b")
        .expect("Invalid pattern")
});

/// Per-session banner buffer.
#[derive(Debug, Clone)]
pub struct InitializationAggregator {
    active: bool,
    lines: Vec<String>,
    complete_delay: Duration,
    idle_delay: Duration,
}

impl InitializationAggregator {
    pub fn new(complete_delay: Duration, idle_delay: Duration) -> Self {
        Self {
            active: true,
            lines: Vec::new(),
            complete_delay,
            idle_delay,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// True when `line` belongs to the banner and the phase is still open.
    pub fn accepts(&self, line: &str) -> bool {
        self.active && is_initialization_message(line)
    }

    /// Buffer a banner line and return the delay to (re)arm the timer with.
    pub fn push(&mut self, line: &str) -> Duration {
        self.lines.push(line.trim().to_string());
        if is_initialization_complete(line) {
            self.complete_delay
        } else {
            self.idle_delay
        }
    }

    pub fn buffered(&self) -> &[String] {
        &self.lines
    }

    /// End the phase. Returns the combined message on the first call only.
    pub fn finish(&mut self) -> Option<String> {
        if !self.active {
            return None;
        }
        self.active = false;
        let lines = std::mem::take(&mut self.lines);
        if lines.is_empty() {
            return None;
        }
        Some(combine_banner(&lines))
    }
}

/// Build the consolidated banner text from buffered lines.
pub fn combine_banner(lines: &[String]) -> String {
    let mut sections: Vec<String> = Vec::new();

    if let Some(welcome) = lines.iter().find(|l| WELCOME.is_match(l)) {
        sections.push(welcome.clone());
    }

    if let Some(caps) = lines.iter().find_map(|l| SERVERS_INITIALIZED.captures(l)) {
        sections.push(format!("✓ {} of {} MCP servers initialized", &caps[1], &caps[2]));
    }

    let mut loaded: Vec<&str> = Vec::new();
    for caps in lines.iter().filter_map(|l| LOADED_SERVICE.captures(l)) {
        let name = caps.get(1).map_or("", |m| m.as_str());
        if !name.is_empty() && !loaded.contains(&name) {
            loaded.push(name);
        }
    }
    if !loaded.is_empty() {
        sections.push(format!("Loaded: {}", loaded.join(", ")));
    }

    let mut help: Vec<&str> = Vec::new();
    for line in lines.iter().filter(|l| HELP_LINE.is_match(l)) {
        if !help.contains(&line.as_str()) {
            help.push(line);
        }
    }
    let model = lines.iter().rev().find(|l| MODEL_IDENTITY.is_match(l));
    if let Some(model) = model {
        help.push(model);
    }
    if !help.is_empty() {
        sections.push(help.join("\n"));
    }

    sections.join("\n\n")
}
