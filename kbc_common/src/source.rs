//! The source buffer shared by every pass: owning text storage, a newline
//! index for fast `offset -> (line, column)` mapping, and an arena for
//! strings synthesized after lexing (escape processing, constant-folded
//! concatenation).

use lasso::Rodeo;
use std::fmt;

/// Bytes of NUL padding appended after the source text so the lexer can
/// always read up to 3 bytes past any position without a bounds check.
pub const LOOKAHEAD: usize = 4;

/// An absolute byte offset into a [`Source`]'s text. `0` is only ever a
/// valid location for an empty source; synthesized nodes reuse the sloc of
/// the construct that produced them.
pub type SrcLoc = u32;

/// A string synthesized by the lexer or by constant folding and interned
/// into the owning [`Source`]'s arena. Backed by `lasso` so that repeated
/// synthesized text (the same escaped string literal, the same folded
/// concatenation result) is deduplicated rather than stored twice.
pub type InternedStr = lasso::Spur;

/// The append-only source buffer. One `Source` per compilation; every
/// derived structure (tokens, AST, IR) stores offsets/indices into it
/// rather than borrowed slices, so nothing needs a lifetime tied to it.
pub struct Source {
    name: String,
    /// Source text followed by [`LOOKAHEAD`] NUL bytes.
    padded: Vec<u8>,
    text_len: usize,
    /// Byte offset of the start of each line. `line_starts[0] == 0`.
    line_starts: Vec<u32>,
    arena: Rodeo,
}

impl Source {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let text_len = text.len();
        let mut padded = text.into_bytes();
        padded.resize(text_len + LOOKAHEAD, 0);

        let mut line_starts = vec![0u32];
        for (i, &b) in padded[..text_len].iter().enumerate() {
            if b == b'\n' {
                line_starts.push((i + 1) as u32);
            }
        }

        Self {
            name: name.into(),
            padded,
            text_len,
            line_starts,
            arena: Rodeo::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The source text, without the lookahead padding.
    pub fn text(&self) -> &str {
        // SAFETY-free: `padded[..text_len]` is exactly the bytes passed to
        // `new`, which came from a valid `String`.
        std::str::from_utf8(&self.padded[..self.text_len]).expect("source text is valid UTF-8")
    }

    pub fn len(&self) -> usize {
        self.text_len
    }

    pub fn is_empty(&self) -> bool {
        self.text_len == 0
    }

    /// The text with its NUL lookahead padding, for the lexer. Reading up to
    /// `LOOKAHEAD - 1` bytes past `len()` is always in bounds.
    pub fn padded_bytes(&self) -> &[u8] {
        &self.padded
    }

    pub fn byte_at(&self, offset: usize) -> u8 {
        self.padded[offset]
    }

    /// Map an absolute byte offset to a 1-based `(line, column)` pair.
    /// `column` counts bytes, not characters, from the start of the line.
    pub fn location(&self, sloc: SrcLoc) -> (u32, u32) {
        let offset = sloc.min(self.text_len as u32);
        let line_index = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        let line_start = self.line_starts[line_index];
        let line = (line_index + 1) as u32;
        let column = offset - line_start + 1;
        (line, column)
    }

    /// Intern a string synthesized after lexing (escape processing or
    /// constant-fold concatenation) and return a handle to it. Equal
    /// strings interned twice return the same handle.
    pub fn intern(&mut self, s: &str) -> InternedStr {
        self.arena.get_or_intern(s)
    }

    pub fn interned(&self, id: InternedStr) -> &str {
        self.arena.resolve(&id)
    }

    /// Byte offset of the start of each line, for the bytecode image's
    /// `debug_newlines` table.
    pub fn line_starts(&self) -> &[u32] {
        &self.line_starts
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.name)
            .field("len", &self.text_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_round_trip_single_line() {
        let src = Source::new("t", "hello world");
        assert_eq!(src.location(0), (1, 1));
        assert_eq!(src.location(6), (1, 7));
    }

    #[test]
    fn location_round_trip_multi_line() {
        let src = Source::new("t", "var x = 1\nvar y = 2\nreturn x + y");
        // offset 10 is 'v' of the second line
        assert_eq!(src.location(10), (2, 1));
        // offset 21 is start of the third line
        assert_eq!(src.location(21), (3, 1));
    }

    #[test]
    fn padding_is_nul_and_readable_past_end() {
        let src = Source::new("t", "ab");
        let bytes = src.padded_bytes();
        assert_eq!(bytes.len(), 2 + LOOKAHEAD);
        assert_eq!(&bytes[2..], &[0, 0, 0, 0]);
    }

    #[test]
    fn intern_round_trips_and_dedupes() {
        let mut src = Source::new("t", "");
        let a = src.intern("synthesized");
        let b = src.intern("synthesized");
        assert_eq!(src.interned(a), "synthesized");
        assert_eq!(a, b);
    }
}
