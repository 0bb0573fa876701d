//! Rope-backed text storage with line/column metrics.
//!
//! [`TextSnapshot`] is the storage of a live [`Document`](crate::Document) and also the frozen
//! copy kept after a document is released, so positions can still be translated to
//! line/column form while it is being closed.

use ropey::Rope;

/// Immutable-by-value text with O(log N) line access.
///
/// Cloning is cheap: the rope shares its nodes.
#[derive(Debug, Clone, Default)]
pub struct TextSnapshot {
    rope: Rope,
}

impl TextSnapshot {
    /// Create an empty text.
    pub fn new() -> Self {
        Self { rope: Rope::new() }
    }

    /// Build from text.
    pub fn from_text(text: &str) -> Self {
        Self {
            rope: Rope::from_str(text),
        }
    }

    /// Get total line count (an empty text has one line).
    pub fn line_count(&self) -> usize {
        self.rope.len_lines()
    }

    /// Get total character count.
    pub fn char_count(&self) -> usize {
        self.rope.len_chars()
    }

    /// Get total byte count.
    pub fn byte_count(&self) -> usize {
        self.rope.len_bytes()
    }

    /// Get line number and column from a character offset (clamped to the end).
    pub fn char_offset_to_position(&self, char_offset: usize) -> (usize, usize) {
        let char_offset = char_offset.min(self.rope.len_chars());

        let line_idx = self.rope.char_to_line(char_offset);
        let line_start_char = self.rope.line_to_char(line_idx);
        (line_idx, char_offset - line_start_char)
    }

    /// Get line number containing a character offset (clamped to the end).
    pub fn char_to_line(&self, char_offset: usize) -> usize {
        self.rope.char_to_line(char_offset.min(self.rope.len_chars()))
    }

    /// Get character offset from line and column.
    ///
    /// Lines past the end map to the end of the text, columns are clamped to the line length.
    pub fn position_to_char_offset(&self, line: usize, column: usize) -> usize {
        if line >= self.rope.len_lines() {
            return self.rope.len_chars();
        }

        let line_start_char = self.rope.line_to_char(line);
        line_start_char + column.min(self.line_len(line))
    }

    /// Character offset where `line` starts, or `None` past the last line.
    pub fn line_start(&self, line: usize) -> Option<usize> {
        (line < self.rope.len_lines()).then(|| self.rope.line_to_char(line))
    }

    /// Length of a line in characters, excluding its newline.
    pub fn line_len(&self, line: usize) -> usize {
        if line >= self.rope.len_lines() {
            return 0;
        }
        let start = self.rope.line_to_char(line);
        if line + 1 < self.rope.len_lines() {
            self.rope.line_to_char(line + 1) - start - 1
        } else {
            self.rope.len_chars() - start
        }
    }

    /// Get text of the specified line (excluding newline).
    pub fn line_text(&self, line_number: usize) -> Option<String> {
        if line_number >= self.rope.len_lines() {
            return None;
        }

        let mut text = self.rope.line(line_number).to_string();
        if text.ends_with('\n') {
            text.pop();
        }
        Some(text)
    }

    /// Text of a character range, clamped to the document.
    pub fn slice(&self, start: usize, end: usize) -> String {
        let len = self.rope.len_chars();
        let start = start.min(len);
        let end = end.clamp(start, len);
        self.rope.slice(start..end).to_string()
    }

    /// Get complete text.
    pub fn text(&self) -> String {
        self.rope.to_string()
    }

    pub(crate) fn insert(&mut self, char_offset: usize, text: &str) {
        let char_offset = char_offset.min(self.rope.len_chars());
        self.rope.insert(char_offset, text);
    }

    pub(crate) fn remove(&mut self, start_char: usize, end_char: usize) {
        if start_char < end_char {
            self.rope.remove(start_char..end_char);
        }
    }
}
