//! Heading-boundary markdown chunker.
//!
//! Splits a markdown body into [`Chunk`]s used as the unit of indexing and
//! retrieval. A line starting with `#` opens a new chunk; oversized chunks
//! are split again at the last whitespace before the size cap so no emitted
//! chunk materially exceeds [`MAX_CHUNK_CHARS`].
//!
//! Each chunk carries 1-based start/end line numbers referring to the
//! original input, plus a short SHA-256 hash of its trimmed text used for
//! staleness detection and embedding-cache lookups.

use sha2::{Digest, Sha256};

/// Hard cap on emitted chunk text length, in characters.
pub const MAX_CHUNK_CHARS: usize = 800;

/// A search unit derived from one file's markdown body.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// First line of the chunk in the original input (1-based, inclusive).
    pub start_line: i64,
    /// Last line of the chunk in the original input (1-based, inclusive).
    pub end_line: i64,
    /// Trimmed chunk text.
    pub text: String,
    /// Short hash of the trimmed text.
    pub hash: String,
}

/// Short content hash used for chunk identity and the embedding cache.
pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let full = format!("{:x}", hasher.finalize());
    full[..16].to_string()
}

/// Full content hash of a file body, stored in `files.content_hash`.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Split a markdown string into ordered chunks.
///
/// Rules:
/// - A line beginning with `#` starts a new chunk; accumulated lines are
///   flushed as a chunk ending at the prior line.
/// - The final chunk extends to end of input.
/// - A chunk longer than [`MAX_CHUNK_CHARS`] is split at the last whitespace
///   before the cap; the overflow becomes a following chunk with the same
///   start line.
/// - Chunk text is trimmed; chunks that trim to empty are dropped.
pub fn chunk_markdown(text: &str) -> Vec<Chunk> {
    let mut segments: Vec<(i64, i64, String)> = Vec::new();

    let mut buf = String::new();
    let mut seg_start: i64 = 1;
    let mut line_no: i64 = 0;

    for line in text.lines() {
        line_no += 1;
        if line.starts_with('#') && !buf.is_empty() {
            segments.push((seg_start, line_no - 1, std::mem::take(&mut buf)));
            seg_start = line_no;
        }
        if buf.is_empty() {
            seg_start = line_no;
        } else {
            buf.push('\n');
        }
        buf.push_str(line);
    }
    if !buf.is_empty() {
        segments.push((seg_start, line_no, buf));
    }

    let mut chunks = Vec::new();
    for (start, end, seg_text) in segments {
        for piece in split_oversized(&seg_text) {
            let trimmed = piece.trim();
            if trimmed.is_empty() {
                continue;
            }
            chunks.push(Chunk {
                start_line: start,
                end_line: end,
                text: trimmed.to_string(),
                hash: text_hash(trimmed),
            });
        }
    }

    chunks
}

/// Split a segment into pieces no longer than [`MAX_CHUNK_CHARS`].
///
/// The split point is the last whitespace character before the cap; a
/// whitespace-free run is hard-split at the cap boundary.
fn split_oversized(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut remaining = text;

    while remaining.chars().count() > MAX_CHUNK_CHARS {
        let cap_byte = remaining
            .char_indices()
            .nth(MAX_CHUNK_CHARS)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());

        let split_at = remaining[..cap_byte]
            .rfind(char::is_whitespace)
            .map(|pos| pos + 1)
            .unwrap_or(cap_byte);

        pieces.push(&remaining[..split_at]);
        remaining = &remaining[split_at..];
    }

    pieces.push(remaining);
    pieces
}
