//! Deterministic, language-agnostic content chunking.
//!
//! Splits file or plan content into bounded chunks, preferring paragraph,
//! then line, then sentence boundaries. Fenced code blocks are never split:
//! a chunk extends past the target size rather than cutting a fence in half.
//! Chunks carry byte offsets into the parent content and a SHA-256 hash, so
//! a chunk set doubles as a lossless reconstruction manifest.

use crate::core::error::TidepoolError;
use sha2::{Digest, Sha256};

/// One bounded slice of a parent artifact; the unit of embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub ordinal: usize,
    pub text: String,
    /// Byte offset of the first byte in the parent content.
    pub start: usize,
    /// Byte offset one past the last byte in the parent content.
    pub end: usize,
    pub hash: String,
}

/// Offsets needed to reassemble parent content from its chunk set.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ManifestEntry {
    pub ordinal: usize,
    pub start: usize,
    pub end: usize,
}

/// Character-budgeted splitter. `target` is the preferred chunk size and
/// `overlap` the number of bytes repeated at the head of the next chunk.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    target: usize,
    overlap: usize,
}

/// SHA-256 of `text`, lowercase hex.
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Canonical bytes for content addressing: UTF-8, `\n` line endings, no
/// trailing whitespace on lines. Trailing-newline presence is preserved.
pub fn canonicalize(content: &str) -> String {
    let normalized = content.replace("\r\n", "\n").replace('\r', "\n");
    let had_final_newline = normalized.ends_with('\n');
    let mut lines: Vec<&str> = normalized.split('\n').map(|l| l.trim_end()).collect();
    if had_final_newline {
        // split leaves a trailing empty segment for the final newline.
        lines.pop();
    }
    let mut out = lines.join("\n");
    if had_final_newline {
        out.push('\n');
    }
    out
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(text: &str, mut idx: usize) -> usize {
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// Byte ranges of fenced code blocks (``` ... ```), including the fence
/// lines themselves. An unterminated fence extends to the end of content.
fn fenced_regions(text: &str) -> Vec<(usize, usize)> {
    let mut regions = Vec::new();
    let mut open: Option<usize> = None;
    let mut line_start = 0;
    for line in text.split_inclusive('\n') {
        let line_end = line_start + line.len();
        if line.trim_start().starts_with("```") {
            match open {
                None => open = Some(line_start),
                Some(start) => {
                    regions.push((start, line_end));
                    open = None;
                }
            }
        }
        line_start = line_end;
    }
    if let Some(start) = open {
        regions.push((start, text.len()));
    }
    regions
}

fn fence_containing(regions: &[(usize, usize)], pos: usize) -> Option<usize> {
    regions
        .iter()
        .find(|(start, end)| pos > *start && pos < *end)
        .map(|(_, end)| *end)
}

impl Chunker {
    pub fn new(target: usize, overlap: usize) -> Self {
        let target = target.max(64);
        Chunker {
            target,
            overlap: overlap.min(target / 2),
        }
    }

    /// Best split position within `[pos + target/2, ideal_end]`, preferring
    /// paragraph, then line, then sentence boundaries. Falls back to the
    /// ideal end when no boundary is found.
    fn find_split(&self, text: &str, pos: usize, ideal_end: usize) -> usize {
        let window = &text[pos..ideal_end];
        let min_offset = (self.target / 2).min(window.len());
        for boundary in ["\n\n", "\n", ". "] {
            if let Some(idx) = window.rfind(boundary) {
                let split = idx + boundary.len();
                if split >= min_offset {
                    return pos + split;
                }
            }
        }
        ideal_end
    }

    /// Split `text` into ordered chunks. Deterministic: identical input
    /// yields identical chunk sets.
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        let len = text.len();
        let mut chunks = Vec::new();
        if len == 0 {
            return chunks;
        }
        let fences = fenced_regions(text);
        let mut pos = 0;
        let mut ordinal = 0;
        while pos < len {
            let mut end = floor_char_boundary(text, (pos + self.target).min(len));
            if end < len {
                end = self.find_split(text, pos, end);
                if let Some(fence_end) = fence_containing(&fences, end) {
                    end = fence_end.min(len);
                }
                end = ceil_char_boundary(text, end);
            }
            if end <= pos {
                end = ceil_char_boundary(text, (pos + 1).min(len)).max(pos + 1).min(len);
            }
            let slice = &text[pos..end];
            chunks.push(Chunk {
                ordinal,
                text: slice.to_string(),
                start: pos,
                end,
                hash: sha256_hex(slice),
            });
            ordinal += 1;
            if end >= len {
                break;
            }
            let mut next = floor_char_boundary(text, end.saturating_sub(self.overlap));
            if next <= pos {
                next = end;
            }
            pos = next;
        }
        chunks
    }

    /// Chunk and return the reconstruction manifest alongside.
    pub fn chunk_with_manifest(&self, text: &str) -> (Vec<Chunk>, Vec<ManifestEntry>) {
        let chunks = self.chunk(text);
        let manifest = chunks
            .iter()
            .map(|c| ManifestEntry {
                ordinal: c.ordinal,
                start: c.start,
                end: c.end,
            })
            .collect();
        (chunks, manifest)
    }
}

/// Reassemble parent content from `(manifest entry, chunk text)` pairs.
///
/// Overlapped bytes appear once: each chunk contributes only the portion past
/// the previous chunk's end offset. Entries must be ordinal-ordered and cover
/// the content without gaps.
pub fn reconstruct(parts: &[(ManifestEntry, String)]) -> Result<String, TidepoolError> {
    let mut out = String::new();
    let mut cursor = 0usize;
    for (entry, text) in parts {
        if entry.end.saturating_sub(entry.start) != text.len() {
            return Err(TidepoolError::Integrity(format!(
                "chunk {} length {} does not match manifest span {}..{}",
                entry.ordinal,
                text.len(),
                entry.start,
                entry.end
            )));
        }
        if entry.start > cursor {
            return Err(TidepoolError::Integrity(format!(
                "manifest gap before chunk {}: cursor {} < start {}",
                entry.ordinal, cursor, entry.start
            )));
        }
        if entry.end <= cursor {
            continue;
        }
        let skip = cursor - entry.start;
        out.push_str(&text[skip..]);
        cursor = entry.end;
    }
    Ok(out)
}
