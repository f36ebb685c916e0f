//! Overlapping README chunker.
//!
//! Splits text into windows of at most `chunk_size` characters. A window
//! prefers to end on a paragraph break (`\n\n`), then on a single newline,
//! if one falls within the last [`BOUNDARY_WINDOW`] characters, and only
//! otherwise cuts mid-line. Consecutive windows overlap by `overlap`
//! characters so a phrase straddling a boundary is retrievable from either
//! chunk.
//!
//! Sizes are measured in characters, not bytes, so multi-byte text is never
//! split inside a code point.

use sha2::{Digest, Sha256};

pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const DEFAULT_OVERLAP: usize = 100;
const BOUNDARY_WINDOW: usize = 100;

/// Split `text` into trimmed, non-empty, overlapping chunks.
///
/// Empty or whitespace-only text yields no chunks.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size - 1);

    // bounds[i] is the byte offset of char i; the last element is text.len().
    let mut bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    bounds.push(text.len());
    let total = bounds.len() - 1;
    let char_at = |byte: usize| bounds.binary_search(&byte).unwrap_or_else(|i| i);

    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let mut end = (start + chunk_size).min(total);

        if end < total {
            let base = bounds[start];
            let window = &text[base..bounds[end]];
            let floor = end.saturating_sub(BOUNDARY_WINDOW).max(start + 1);

            let paragraph = window
                .rfind("\n\n")
                .map(|p| char_at(base + p))
                .filter(|&c| c >= floor);
            let line = window
                .rfind('\n')
                .map(|p| char_at(base + p))
                .filter(|&c| c >= floor);

            if let Some(c) = paragraph {
                end = c + 2;
            } else if let Some(c) = line {
                end = c + 1;
            }
        }

        let piece = text[bounds[start]..bounds[end]].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }

        if end >= total {
            break;
        }
        let next = end.saturating_sub(overlap);
        start = if next <= start { end } else { next };
    }

    chunks
}

/// SHA-256 of the full README content, hex encoded. Gates re-indexing.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_text() -> String {
        (0..40)
            .map(|i| {
                format!(
                    "Paragraph {} talks about topic number {} in some detail.\nIt has a second line.",
                    i, i
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[test]
    fn empty_text_has_no_chunks() {
        assert!(chunk_text("", 500, 100).is_empty());
        assert!(chunk_text("  \n\n \t", 500, 100).is_empty());
    }

    #[test]
    fn small_text_single_chunk() {
        let chunks = chunk_text("  Hello, world!\n", 500, 100);
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn chunks_are_bounded() {
        let text = long_text();
        let chunks = chunk_text(&text, 500, 100);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.chars().count() <= 500 + 100, "chunk too long: {}", c.len());
            assert!(!c.is_empty());
        }
    }

    #[test]
    fn chunks_cover_all_content() {
        let text = long_text();
        let chunks = chunk_text(&text, 500, 100);
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            assert!(
                chunks.iter().any(|c| c.contains(line.trim())),
                "line not covered: {}",
                line
            );
        }
    }

    #[test]
    fn prefers_paragraph_breaks() {
        let text = long_text();
        let chunks = chunk_text(&text, 500, 100);
        // The first window ends on a paragraph break, so it ends with a
        // complete paragraph.
        assert!(chunks[0].ends_with("It has a second line."), "{:?}", chunks[0]);
    }

    #[test]
    fn early_newline_does_not_shorten_chunk() {
        let text = format!("Intro\n{}", "x".repeat(1000));
        let chunks = chunk_text(&text, 500, 100);
        assert_eq!(chunks[0].chars().count(), 500);
        assert!(chunks[0].starts_with("Intro\nxxx"));
    }

    #[test]
    fn late_newline_is_used_as_boundary() {
        let text = format!("{}\n{}", "a".repeat(450), "b".repeat(300));
        let chunks = chunk_text(&text, 500, 100);
        assert_eq!(chunks[0], "a".repeat(450));
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = "x".repeat(1200);
        let chunks = chunk_text(&text, 500, 100);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 500);
        // Hard cuts at 500 with 100 overlap: [0,500) [400,900) [800,1200)
        assert_eq!(chunks[2].len(), 400);
    }

    #[test]
    fn multibyte_text_is_split_on_char_boundaries() {
        let text = "┌──┐ ünïcödé ".repeat(120);
        let chunks = chunk_text(&text, 50, 10);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.chars().count() <= 50);
        }
    }

    #[test]
    fn hash_is_stable_hex() {
        let h = content_hash("abc");
        assert_eq!(h.len(), 64);
        assert_eq!(h, content_hash("abc"));
        assert_ne!(h, content_hash("abd"));
    }
}
