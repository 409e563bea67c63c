//! Reassembles raw output chunks into lines.
//!
//! Chunk boundaries fall anywhere, including inside a multi-byte UTF-8
//! character, so fragments are held as bytes and only complete lines are
//! decoded. The caller owns the stale-fragment timer: whenever
//! `needs_flush_timer` is true after a push it (re)arms the flush delay, and on
//! expiry calls `flush` to force the fragment out as a line.

/// Byte-level line reassembly for one output stream.
#[derive(Debug, Default, Clone)]
pub struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk; returns every line completed by it, without the newline.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        complete[..complete.len() - 1]
            .split(|b| *b == b'\n')
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }

    /// The held fragment, decoded lossily.
    pub fn pending(&self) -> String {
        String::from_utf8_lossy(&self.pending).into_owned()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// True when the held fragment contains anything but whitespace.
    pub fn needs_flush_timer(&self) -> bool {
        self.pending
            .iter()
            .any(|b| !b.is_ascii_whitespace())
    }

    /// Force out the held fragment as a line if it is not blank.
    ///
    /// A blank fragment is discarded.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let fragment = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&fragment).into_owned();
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// Drop the held fragment.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_complete_lines_emitted_immediately() {
        let mut assembler = LineAssembler::new();
        assert_eq!(assembler.push(b"one\ntwo\nthr"), vec!["one", "two"]);
        assert_eq!(assembler.pending(), "thr");
        assert!(assembler.needs_flush_timer());
        assert_eq!(assembler.push(b"ee\n"), vec!["three"]);
        assert!(!assembler.has_pending());
        assert!(!assembler.needs_flush_timer());
    }

    #[test]
    fn test_empty_lines_are_preserved() {
        let mut assembler = LineAssembler::new();
        assert_eq!(assembler.push(b"a\n\nb\n"), vec!["a", "", "b"]);
    }

    #[test]
    fn test_fragment_without_newline_is_held() {
        let mut assembler = LineAssembler::new();
        assert!(assembler.push(b"partial").is_empty());
        assert!(assembler.push(b" more").is_empty());
        assert_eq!(assembler.flush(), Some("partial more".to_string()));
        assert_eq!(assembler.flush(), None);
    }

    #[test]
    fn test_blank_fragment_does_not_need_timer() {
        let mut assembler = LineAssembler::new();
        assembler.push(b"line\n   ");
        assert!(assembler.has_pending());
        assert!(!assembler.needs_flush_timer());
        assert_eq!(assembler.flush(), None);
        assert!(!assembler.has_pending());
    }

    #[test]
    fn test_split_utf8_character() {
        let bytes = "🛠️ tool\n".as_bytes();
        let mut assembler = LineAssembler::new();
        assert!(assembler.push(&bytes[..2]).is_empty());
        assert_eq!(assembler.push(&bytes[2..]), vec!["🛠️ tool"]);
    }

    fn assemble(pieces: &[&[u8]]) -> Vec<String> {
        let mut assembler = LineAssembler::new();
        pieces.iter().flat_map(|p| assembler.push(p)).collect()
    }

    #[test]
    fn test_every_two_way_split_matches_whole() {
        let stream = "Thinking...\n🛠️ Using tool: fs_read\nHello\n\nWorld\npartial".as_bytes();
        let whole = assemble(&[stream]);
        for cut in 0..=stream.len() {
            assert_eq!(assemble(&[&stream[..cut], &stream[cut..]]), whole, "cut {cut}");
        }
    }

    proptest! {
        #[test]
        fn prop_chunk_boundary_invariant(
            text in "[a-z🛠️ \n]{0,64}",
            cuts in prop::collection::vec(0usize..80, 0..8),
        ) {
            let bytes = text.as_bytes();
            let mut points: Vec<usize> = cuts.into_iter().map(|c| c.min(bytes.len())).collect();
            points.push(0);
            points.push(bytes.len());
            points.sort_unstable();

            let pieces: Vec<&[u8]> = points.windows(2).map(|w| &bytes[w[0]..w[1]]).collect();
            prop_assert_eq!(assemble(&pieces), assemble(&[bytes]));
        }
    }
}
