//! Groups cleaned stdout lines into paragraphs and strips tool markers.

use super::tools::{ToolDetection, ToolStreamBuffer};
use once_cell::sync::Lazy;
use regex::Regex;

static NUMERIC_ONLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\d\s.,:;%/+\-]+$").expect("Invalid numeric pattern"));

/// Suffix appended to every emitted paragraph.
pub const PARAGRAPH_SUFFIX: &str = "\n\n";

/// True for text that carries no content: decorative glyphs or bare numbers.
pub fn should_skip(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return true;
    }
    if !trimmed.chars().any(char::is_alphanumeric) {
        return true;
    }
    NUMERIC_ONLY.is_match(trimmed)
}

/// Result of flushing one paragraph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushedParagraph {
    /// Text to emit, markers removed and suffix applied; `None` if nothing remains
    pub data: Option<String>,
    /// Tools detected in the released text
    pub tools: Vec<String>,
}

impl FlushedParagraph {
    pub fn is_empty(&self) -> bool {
        self.data.is_none() && self.tools.is_empty()
    }

    fn from_detection(detection: ToolDetection) -> Self {
        let text = detection.cleaned_text.trim_matches('\n');
        let data = (!should_skip(text)).then(|| format!("{text}{PARAGRAPH_SUFFIX}"));
        if data.is_none() && !text.trim().is_empty() {
            tracing::trace!("Skipping decorative paragraph: {:?}", text);
        }
        Self {
            data,
            tools: detection.tools,
        }
    }
}

/// Accumulates lines until a blank line or a forced flush.
#[derive(Debug, Default, Clone)]
pub struct ParagraphAssembler {
    lines: Vec<String>,
    tools: ToolStreamBuffer,
}

impl ParagraphAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one line. A blank line closes the current paragraph.
    pub fn push_line(&mut self, line: &str) -> Option<FlushedParagraph> {
        if line.trim().is_empty() {
            return self.flush();
        }
        self.lines.push(line.to_string());
        None
    }

    /// Close the current paragraph; every withheld marker is resolved.
    pub fn flush(&mut self) -> Option<FlushedParagraph> {
        if self.lines.is_empty() && !self.tools.has_pending() {
            return None;
        }
        let text = self.take_text();
        let flushed = FlushedParagraph::from_detection(self.tools.push_complete(&text));
        (!flushed.is_empty()).then_some(flushed)
    }

    /// Close the current paragraph after a stale-output timeout.
    ///
    /// The last line may have been cut mid-marker, so an unresolved marker at
    /// the tail stays withheld and is completed by the next paragraph.
    pub fn flush_stale(&mut self) -> Option<FlushedParagraph> {
        if self.lines.is_empty() {
            return None;
        }
        let text = self.take_text();
        let flushed = FlushedParagraph::from_detection(self.tools.push(&text));
        (!flushed.is_empty()).then_some(flushed)
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && !self.tools.has_pending()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.tools.clear();
    }

    fn take_text(&mut self) -> String {
        std::mem::take(&mut self.lines).join("\n")
    }
}
