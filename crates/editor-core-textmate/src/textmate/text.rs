use memchr::memchr_iter;
use std::ops::Range;
use std::sync::Arc;

/// An immutable document snapshot with a precomputed line index.
///
/// Offsets are UTF-8 byte offsets. A line range includes its trailing `\n`, so the
/// line ranges of a snapshot tile the whole text. Clones share the same buffers, which
/// lets background tokenize tasks hold a snapshot while the document moves on.
#[derive(Debug, Clone)]
pub struct TextSnapshot {
    text: Arc<str>,
    line_starts: Arc<[usize]>,
}

impl TextSnapshot {
    /// Create a snapshot and index its lines.
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        let text: Arc<str> = text.into();
        let mut line_starts = Vec::with_capacity(text.len() / 32 + 1);
        line_starts.push(0);
        line_starts.extend(memchr_iter(b'\n', text.as_bytes()).map(|i| i + 1));
        Self {
            text,
            line_starts: line_starts.into(),
        }
    }

    /// The full text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// Returns `true` if the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Number of lines. A trailing `\n` starts a final empty line.
    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    /// Byte range of `line`, including its line terminator.
    pub fn line_range(&self, line: usize) -> Range<usize> {
        let start = self.line_starts.get(line).copied().unwrap_or(self.len());
        let end = self
            .line_starts
            .get(line + 1)
            .copied()
            .unwrap_or(self.len());
        start..end
    }

    /// Zero-based line containing `offset`. Offsets past the end map to the last line.
    pub fn line_of(&self, offset: usize) -> usize {
        self.line_starts
            .partition_point(|&start| start <= offset)
            .saturating_sub(1)
    }

    /// Start offset of the line containing `offset`.
    pub fn line_start(&self, offset: usize) -> usize {
        self.line_starts[self.line_of(offset)]
    }

    /// End offset (after the `\n`) of the line containing `offset`.
    pub fn line_end(&self, offset: usize) -> usize {
        self.line_range(self.line_of(offset)).end
    }

    /// Returns `true` if `offset` is the start of a line.
    pub fn is_line_start(&self, offset: usize) -> bool {
        self.line_starts.binary_search(&offset).is_ok()
    }

    /// The next char boundary strictly after `offset` (clamped to the text length).
    pub fn next_char_boundary(&self, offset: usize) -> usize {
        match self.text.get(offset..).and_then(|rest| rest.chars().next()) {
            Some(c) => offset + c.len_utf8(),
            None => self.len(),
        }
    }
}

/// A single text change: bytes `start..old_end` were replaced by bytes
/// `start..new_end` in the new text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextEdit {
    /// Start offset of the change (same in old and new text).
    pub start: usize,
    /// End of the replaced range in the old text.
    pub old_end: usize,
    /// End of the inserted range in the new text.
    pub new_end: usize,
}

impl TextEdit {
    /// Replace `range` with `inserted_len` bytes.
    pub fn replace(range: Range<usize>, inserted_len: usize) -> Self {
        Self {
            start: range.start,
            old_end: range.end,
            new_end: range.start + inserted_len,
        }
    }

    /// Insert `len` bytes at `at`.
    pub fn insert(at: usize, len: usize) -> Self {
        Self::replace(at..at, len)
    }

    /// Delete `range`.
    pub fn delete(range: Range<usize>) -> Self {
        Self::replace(range, 0)
    }

    /// Build an edit from the replaced range and the resulting length change.
    pub fn with_length_delta(range: Range<usize>, length_delta: isize) -> Self {
        let replaced = range.end - range.start;
        Self::replace(range, replaced.saturating_add_signed(length_delta))
    }

    /// Replaced range in the old text.
    pub fn old_range(&self) -> Range<usize> {
        self.start..self.old_end
    }

    /// Inserted range in the new text.
    pub fn new_range(&self) -> Range<usize> {
        self.start..self.new_end
    }

    /// Change in document length.
    pub fn length_delta(&self) -> isize {
        self.new_end as isize - self.old_end as isize
    }

    /// Map an old-text offset to the new text.
    ///
    /// Offsets inside the replaced range collapse to the end of the inserted text.
    pub fn map_position(&self, offset: usize) -> usize {
        if offset < self.start {
            offset
        } else if offset < self.old_end {
            self.new_end
        } else {
            offset - self.old_end + self.new_end
        }
    }
}
