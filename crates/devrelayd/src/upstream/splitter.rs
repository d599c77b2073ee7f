//! Byte stream to line splitting.

/// Splits a chunked byte stream into text lines.
///
/// A line is emitted only once its `\n` terminator has been seen; the bytes
/// after the last terminator are held back until the next chunk arrives.
/// Trailing whitespace (including `\r`) is stripped and lines that are blank
/// after trimming are skipped. Invalid UTF-8 is replaced, not rejected.
///
/// Whatever is still held back when the stream ends is discarded, never
/// flushed as a final (possibly truncated) line.
#[derive(Debug)]
pub struct LineSplitter {
    partial: Vec<u8>,
    max_line_bytes: usize,
}

impl LineSplitter {
    /// Creates a splitter that force-splits unterminated runs longer than
    /// `max_line_bytes`, bounding the memory held for a partial line.
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            partial: Vec::new(),
            max_line_bytes: max_line_bytes.max(1),
        }
    }

    /// Feeds one chunk and returns the lines it completed, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for segment in chunk.split_inclusive(|b| *b == b'\n') {
            match segment.split_last() {
                Some((&b'\n', body)) => {
                    self.partial.extend_from_slice(body);
                    let raw = std::mem::take(&mut self.partial);
                    push_decoded(&raw, &mut lines);
                }
                _ => {
                    self.partial.extend_from_slice(segment);
                    while self.partial.len() >= self.max_line_bytes {
                        let cut = char_boundary(&self.partial, self.max_line_bytes);
                        let rest = self.partial.split_off(cut);
                        let raw = std::mem::replace(&mut self.partial, rest);
                        push_decoded(&raw, &mut lines);
                    }
                }
            }
        }

        lines
    }

    /// Number of bytes held back waiting for a terminator.
    pub fn pending_len(&self) -> usize {
        self.partial.len()
    }

    /// Ends the stream, returning how many trailing bytes were discarded.
    pub fn finish(self) -> usize {
        self.partial.len()
    }
}

/// Largest cut at or below `max` that keeps a UTF-8 sequence whole.
///
/// Falls back to `max` when the sequence starts the buffer, so every cut
/// makes progress.
fn char_boundary(bytes: &[u8], max: usize) -> usize {
    for start in (max.saturating_sub(3)..max).rev() {
        let width = match bytes[start] {
            b if b & 0xC0 == 0x80 => continue,
            b if b >= 0xF0 => 4,
            b if b >= 0xE0 => 3,
            b if b >= 0xC0 => 2,
            _ => 1,
        };
        return if start > 0 && start + width > max { start } else { max };
    }
    max
}

fn push_decoded(raw: &[u8], lines: &mut Vec<String>) {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end();
    if !line.trim_start().is_empty() {
        lines.push(line.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_lines_in_one_chunk() {
        let mut splitter = LineSplitter::new(1024);
        assert_eq!(splitter.feed(b"A\nB\nC\n"), vec!["A", "B", "C"]);
        assert_eq!(splitter.pending_len(), 0);
    }

    #[test]
    fn test_partial_line_spans_chunks() {
        let mut splitter = LineSplitter::new(1024);
        assert_eq!(splitter.feed(b"first\nsec"), vec!["first"]);
        assert_eq!(splitter.pending_len(), 3);
        assert!(splitter.feed(b"on").is_empty());
        assert_eq!(splitter.feed(b"d\nthird"), vec!["second"]);
        assert_eq!(splitter.finish(), 5);
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let mut splitter = LineSplitter::new(1024);
        let lines = splitter.feed(b"one\r\n\r\n   \n  indented\r\n");
        assert_eq!(lines, vec!["one", "  indented"]);
    }

    #[test]
    fn test_terminator_split_from_cr() {
        let mut splitter = LineSplitter::new(1024);
        assert!(splitter.feed(b"line\r").is_empty());
        assert_eq!(splitter.feed(b"\n"), vec!["line"]);
    }

    #[test]
    fn test_trailing_fragment_is_discarded() {
        let mut splitter = LineSplitter::new(1024);
        assert_eq!(splitter.feed(b"kept\ntrunc"), vec!["kept"]);
        assert_eq!(splitter.finish(), 5);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut splitter = LineSplitter::new(1024);
        let lines = splitter.feed(b"bad \xff byte\n");
        assert_eq!(lines, vec!["bad \u{fffd} byte"]);
    }

    #[test]
    fn test_overlong_line_is_force_split() {
        let mut splitter = LineSplitter::new(4);
        let lines = splitter.feed(b"abcdefghij");
        assert_eq!(lines, vec!["abcd", "efgh"]);
        assert_eq!(splitter.pending_len(), 2);
        assert_eq!(splitter.feed(b"\n"), vec!["ij"]);
    }

    #[test]
    fn test_force_split_keeps_multibyte_chars_whole() {
        let mut splitter = LineSplitter::new(4);
        let lines = splitter.feed("abcéfgh".as_bytes());
        assert_eq!(lines, vec!["abc", "éfg"]);
        assert_eq!(splitter.feed(b"\n"), vec!["h"]);

        // The lead byte arrives alone at the limit and waits for the rest
        assert_eq!(splitter.feed(b"xyz\xc3"), vec!["xyz"]);
        assert_eq!(splitter.feed(b"\xa9\n"), vec!["é"]);
    }
}
