//! Positional text document edited by the legacy stream.
//!
//! Offsets are counted in characters, not bytes, so a clamped position can
//! never land inside a multi-byte sequence.

use std::ops::Range;
use std::time::SystemTime;

/// Room document text plus its last modification time.
#[derive(Debug, Clone)]
pub struct Document {
    content: String,
    last_modified: SystemTime,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Empty document.
    pub fn new() -> Self {
        Self::with_content(String::new())
    }

    pub fn with_content(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            last_modified: SystemTime::now(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.content.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Clamp a client-supplied position into `[0, len]`.
    pub fn clamp(&self, position: i64) -> usize {
        if position <= 0 {
            return 0;
        }
        usize::try_from(position).unwrap_or(usize::MAX).min(self.len())
    }

    /// Insert `text` at the clamped `position`. Returns the offset used.
    pub fn insert(&mut self, position: i64, text: &str) -> usize {
        let at = self.clamp(position);
        let byte = self.byte_offset(at);
        self.content.insert_str(byte, text);
        self.touch();
        at
    }

    /// Remove `count` characters starting at the clamped `position`.
    ///
    /// The end of the span is clamped to the document length. Returns the
    /// character range actually removed.
    pub fn delete(&mut self, position: i64, count: usize) -> Range<usize> {
        let start = self.clamp(position);
        let end = start.saturating_add(count).min(self.len());
        let bytes = self.byte_offset(start)..self.byte_offset(end);
        self.content.replace_range(bytes, "");
        self.touch();
        start..end
    }

    fn touch(&mut self) {
        self.last_modified = SystemTime::now();
    }

    fn byte_offset(&self, chars: usize) -> usize {
        self.content
            .char_indices()
            .nth(chars)
            .map_or(self.content.len(), |(i, _)| i)
    }
}
