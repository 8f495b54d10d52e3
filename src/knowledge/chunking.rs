//! Word-boundary-aware text chunking (§4.3).
//!
//! Grounded in `knowledge/knowledge.rs::add_sources` from the teacher crate,
//! which splits source content before handing it to storage; this version
//! makes the split boundary and overlap explicit and deterministic so
//! re-ingesting identical content always reproduces the same chunk ids.

use crate::document::{content_hash_id, Document, Metadata};

/// Default target chunk size, in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 500;
/// Default overlap between consecutive chunks, in words.
pub const DEFAULT_CHUNK_OVERLAP: usize = 50;

/// Split `content` into overlapping chunks of roughly `chunk_size`
/// characters, breaking at the nearest preceding whitespace boundary rather
/// than mid-word. The last `overlap` *words* of one chunk are repeated at
/// the start of the next so retrieval doesn't lose context that straddles a
/// cut point (§4.3: overlap is word-count-based, not character-count-based).
///
/// Returns `(chunk_text, start_offset)` pairs in order. A `content` shorter
/// than `chunk_size` yields a single chunk.
pub fn chunk_text(content: &str, chunk_size: usize, overlap: usize) -> Vec<(String, usize)> {
    let chars: Vec<char> = content.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    if chars.len() <= chunk_size {
        return vec![(content.to_string(), 0)];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let mut end = (start + chunk_size).min(chars.len());
        if end < chars.len() {
            if let Some(boundary) = find_whitespace_boundary(&chars, start, end) {
                if boundary > start {
                    end = boundary;
                }
            }
        }
        let piece: String = chars[start..end].iter().collect();
        let trimmed = piece.trim();
        if !trimmed.is_empty() {
            chunks.push((trimmed.to_string(), start));
        }
        if end >= chars.len() {
            break;
        }
        let next_start = back_up_words(&chars, start, end, overlap);
        start = if next_start > start { next_start } else { end };
    }
    chunks
}

/// Search backwards from `end` for the last whitespace character within the
/// `[start, end]` window, so a chunk never splits a word in half.
fn find_whitespace_boundary(chars: &[char], start: usize, end: usize) -> Option<usize> {
    let window_start = start + (end - start) / 2;
    (window_start..end).rev().find(|&i| chars[i].is_whitespace())
}

/// Walk backward `words` whitespace-delimited words from `end`, never
/// crossing `start`. Used to compute the next chunk's start so overlap
/// repeats whole trailing words rather than a fixed character count.
fn back_up_words(chars: &[char], start: usize, end: usize, words: usize) -> usize {
    if words == 0 {
        return end;
    }
    let mut i = end;
    while i > start && chars[i - 1].is_whitespace() {
        i -= 1;
    }
    for _ in 0..words {
        if i <= start {
            break;
        }
        while i > start && !chars[i - 1].is_whitespace() {
            i -= 1;
        }
        while i > start && chars[i - 1].is_whitespace() {
            i -= 1;
        }
    }
    i
}

/// Build the `Document` chunks for one ingested source, with content-hash
/// ids on each chunk (so re-ingesting unchanged content produces identical
/// ids, per §4.3's idempotence requirement) and chunk-position metadata set.
pub fn chunk_document(
    name: &str,
    content: &str,
    source: &str,
    content_type: &str,
    base_metadata: Metadata,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<Document> {
    let pieces = chunk_text(content, chunk_size, chunk_overlap);
    let total = pieces.len().max(1);
    let parent_id = content_hash_id(content);
    pieces
        .into_iter()
        .enumerate()
        .map(|(idx, (piece, _offset))| {
            let id = content_hash_id(&format!("{parent_id}:{idx}"));
            let mut doc = Document::new(name, piece, source)
                .with_id(id)
                .with_metadata(base_metadata.clone());
            doc.content_type = content_type.to_string();
            doc.chunk_index = idx;
            doc.chunk_total = total;
            doc.parent_id = Some(parent_id.clone());
            doc
        })
        .collect()
}
