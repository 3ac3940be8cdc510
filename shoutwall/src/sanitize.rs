//! Input normalization for submitted post text.
//!
//! The sanitizer is a pure function over the raw `text` field: trim, reject
//! empty, truncate overlong input. Frames whose `text` field is missing or
//! not a string never reach this point (the wire decoder rejects them).

/// Default maximum post length in characters.
pub const DEFAULT_MAX_LEN: usize = 140;

/// Why a post was rejected during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    /// Text was empty (or whitespace only) after trimming.
    Empty,
}

impl std::fmt::Display for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejected::Empty => write!(f, "empty text"),
        }
    }
}

impl std::error::Error for Rejected {}

/// Bounds and normalizes raw post text. No side effects.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    max_len: usize,
}

impl Sanitizer {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Trim surrounding whitespace, reject empty results, and silently
    /// truncate to `max_len` *characters* (not bytes, so multi-byte
    /// UTF-8 input is never split mid-character).
    pub fn sanitize(&self, raw: &str) -> Result<String, Rejected> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Rejected::Empty);
        }

        match trimmed.char_indices().nth(self.max_len) {
            Some((byte_idx, _)) => Ok(trimmed[..byte_idx].to_string()),
            None => Ok(trimmed.to_string()),
        }
    }
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LEN)
    }
}
