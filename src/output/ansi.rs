//! Terminal decoration removal.
//!
//! The wrapped CLI writes colors, cursor movement, spinners and box-drawing
//! frames even with color disabled. `strip_ansi` reduces a chunk of that output
//! to plain text. The transform is idempotent: every removal runs before
//! whitespace normalization and no removal can re-form an escape sequence,
//! because every ESC and C1 character is gone after the first passes.

use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;

/// Ordered removal table; each pattern is replaced with the empty string.
static REMOVALS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // OSC terminated by BEL or ST
        r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)",
        // DEC private mode set/reset
        r"\x1b\[\?[0-9;]*[hl]",
        // CSI
        r"\x1b\[[0-?]*[ -/]*[@-~]",
        // Character set selection
        r"\x1b[()*+][A-Za-z0-9]",
        // Named single-character escapes
        r"\x1b[=>78DEHMNOPZc\\]",
        // Any ESC left over from truncated sequences
        r"\x1b",
        // C1 controls
        r"[\x{80}-\x{9F}]",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("Invalid ANSI pattern"))
    .collect()
});

/// Spinner frames, progress blocks and decorative frame glyphs.
static GLYPHS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"[\x{2800}-\x{28FF}◐◓◑◒◴◵◶◷]",
        r"|[\x{2580}-\x{259F}■□▪▫▬]",
        r"|[\x{2500}-\x{257F}⎿⏺]",
    ))
    .expect("Invalid glyph pattern")
});

static C0_CONTROLS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x00-\x09\x0B-\x1F\x7F]").expect("Invalid control pattern"));

static SPACE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r" {2,}").expect("Invalid space pattern"));

static BLANK_LINE_RUNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n *\n(?: *\n)+").expect("Invalid blank line pattern"));

/// Remove escape sequences, control characters and decorative glyphs, then
/// normalize whitespace.
pub fn strip_ansi(input: &str) -> String {
    let mut text: Cow<'_, str> = Cow::Borrowed(input);

    for pattern in REMOVALS.iter() {
        text = replace_owned(text, pattern, "");
    }

    if text.contains('\r') {
        text = Cow::Owned(text.replace("\r\n", "\n").replace('\r', "\n"));
    }
    if text.contains('\t') {
        text = Cow::Owned(text.replace('\t', " "));
    }

    text = replace_owned(text, &C0_CONTROLS, "");
    text = replace_owned(text, &GLYPHS, "");
    text = replace_owned(text, &SPACE_RUNS, " ");
    text = replace_owned(text, &BLANK_LINE_RUNS, "\n\n");

    text.trim().to_string()
}

/// True when the text still contains anything `strip_ansi` would remove.
pub fn has_decoration(input: &str) -> bool {
    strip_ansi(input) != input
}

fn replace_owned<'a>(text: Cow<'a, str>, pattern: &Regex, replacement: &str) -> Cow<'a, str> {
    match pattern.replace_all(&text, replacement) {
        Cow::Borrowed(_) => text,
        Cow::Owned(replaced) => Cow::Owned(replaced),
    }
}
