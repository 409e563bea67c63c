//! Inline tool-usage marker detection.
//!
//! The wrapped CLI announces tool calls inline, e.g.
//! `🛠️  Using tool: fs_read (trusted)`. Markers are recorded and removed
//! from the text that is forwarded to clients.

use once_cell::sync::Lazy;
use regex::Regex;

/// Upper bound (exclusive) on tool identifier length.
pub const MAX_TOOL_NAME_LEN: usize = 100;

const MARKER_GLYPH: char = '🛠';
const MARKER_PHRASE: &str = "Using tool:";

/// Built-in tool names of the wrapped CLI, used to recognize truncated names.
pub const KNOWN_TOOLS: &[&str] = &[
    "fs_read",
    "fs_write",
    "execute_bash",
    "use_aws",
    "report_issue",
    "knowledge",
    "thinking",
    "todo_list",
];

static MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"🛠\x{FE0F}?[ \t]*Using tool:[ \t]*([A-Za-z0-9_.\-]+)(?:[ \t]*\(([^)\n]*)\))?[ \t]*(?:\r?\n)?",
    )
    .expect("Invalid tool marker pattern")
});

static EXCESS_BLANK_LINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)+").expect("Invalid blank line pattern"));

/// Outcome of scanning text for tool markers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolDetection {
    pub has_tools: bool,
    pub tools: Vec<String>,
    pub cleaned_text: String,
}

impl ToolDetection {
    fn merge(mut self, other: ToolDetection) -> Self {
        self.tools.extend(other.tools);
        self.has_tools = !self.tools.is_empty();
        self.cleaned_text.push_str(&other.cleaned_text);
        self
    }
}

/// Find every marker in `text`, record valid identifiers and strip the markers.
pub fn detect_tools(text: &str) -> ToolDetection {
    let mut tools = Vec::new();
    let mut cleaned = String::with_capacity(text.len());
    let mut last = 0;

    for captures in MARKER.captures_iter(text) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let name = name.as_str();
        if name.is_empty() || name.len() >= MAX_TOOL_NAME_LEN {
            tracing::debug!("Ignoring tool marker with invalid name length {}", name.len());
            continue;
        }
        cleaned.push_str(&text[last..whole.start()]);
        last = whole.end();
        tools.push(name.to_string());
    }

    if tools.is_empty() {
        return ToolDetection {
            has_tools: false,
            tools,
            cleaned_text: text.to_string(),
        };
    }

    cleaned.push_str(&text[last..]);
    let cleaned = EXCESS_BLANK_LINES.replace_all(&cleaned, "\n\n");

    ToolDetection {
        has_tools: true,
        tools,
        cleaned_text: cleaned.trim().to_string(),
    }
}

/// Byte offset of a marker at the tail of `text` that cannot be resolved yet.
fn incomplete_marker_start(text: &str) -> Option<usize> {
    let start = text.rfind(MARKER_GLYPH)?;
    let tail = &text[start + MARKER_GLYPH.len_utf8()..];
    let tail = tail.strip_prefix('\u{FE0F}').unwrap_or(tail);
    let tail = tail.trim_start_matches([' ', '\t']);

    let Some(after_phrase) = tail.strip_prefix(MARKER_PHRASE) else {
        // Still a possible marker only while the phrase itself is being typed out.
        return MARKER_PHRASE.starts_with(tail).then_some(start);
    };

    let after_phrase = after_phrase.trim_start_matches([' ', '\t']);
    let name_len = after_phrase
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        .unwrap_or(after_phrase.len());
    let name = &after_phrase[..name_len];
    let rest = &after_phrase[name_len..];

    if name.is_empty() {
        // Identifier missing; a newline means there never will be one.
        return (!rest.starts_with(['\n', '\r'])).then_some(start);
    }

    if rest.is_empty() {
        let too_short = name.len() < 2;
        let ends_with_connector = name.ends_with(['_', '-', '.']);
        let known_truncation = KNOWN_TOOLS
            .iter()
            .any(|known| known.len() > name.len() && known.starts_with(name));
        return (too_short || ends_with_connector || known_truncation).then_some(start);
    }

    let qualifier = rest.trim_start_matches([' ', '\t']);
    if qualifier.starts_with('(') && !qualifier.contains([')', '\n']) {
        return Some(start);
    }

    None
}

/// Streaming marker detection across chunk boundaries.
///
/// Text before an unresolved marker is released immediately; the marker and
/// everything after it are withheld until a later chunk resolves it or the
/// buffer is flushed.
#[derive(Debug, Default, Clone)]
pub struct ToolStreamBuffer {
    held: String,
}

impl ToolStreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk that may end mid-line.
    pub fn push(&mut self, chunk: &str) -> ToolDetection {
        self.held.push_str(chunk);
        let release = match incomplete_marker_start(&self.held) {
            Some(start) => {
                let tail = self.held.split_off(start);
                std::mem::replace(&mut self.held, tail)
            }
            None => std::mem::take(&mut self.held),
        };
        if release.is_empty() {
            return ToolDetection::default();
        }
        detect_tools(&release)
    }

    /// Add a chunk known to end on a line boundary; nothing is withheld.
    pub fn push_complete(&mut self, chunk: &str) -> ToolDetection {
        self.held.push_str(chunk);
        self.flush()
    }

    /// Release everything held, resolved or not.
    pub fn flush(&mut self) -> ToolDetection {
        let release = std::mem::take(&mut self.held);
        if release.is_empty() {
            return ToolDetection::default();
        }
        detect_tools(&release)
    }

    pub fn has_pending(&self) -> bool {
        !self.held.is_empty()
    }

    pub fn pending(&self) -> &str {
        &self.held
    }

    pub fn clear(&mut self) {
        self.held.clear();
    }
}

/// Combine consecutive detections into one.
pub fn merge_detections(detections: impl IntoIterator<Item = ToolDetection>) -> ToolDetection {
    detections
        .into_iter()
        .fold(ToolDetection::default(), ToolDetection::merge)
}
