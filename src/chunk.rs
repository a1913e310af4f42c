//! Token-aware chunker (§4.D), plus the legacy v1 paragraph chunker kept
//! side by side for older-format transcripts.
//!
//! The v2 algorithm is a boundary-seeking sliding window: it advances a
//! window of `WINDOW_CHARS`, and when the window would split mid-sentence
//! it snaps back to the latest separator past the window's midpoint. A
//! `CHUNK_OVERLAP_CHARS` overlap is kept between consecutive chunks so a
//! boundary never fully separates two halves of one thought.

/// ~400 tokens.
pub const WINDOW_CHARS: usize = 1600;
/// ~75 tokens.
pub const OVERLAP_CHARS: usize = 300;

const SEPARATORS: &[&str] = &[". ", ".\n", "! ", "? ", "\n\n", "\n", " "];

/// One chunk of raw text produced by the chunker, before metadata is
/// attached. `was_truncated` is set only for the degenerate one-massive-
/// token case where no separator could be found at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    pub text: String,
    pub index: i64,
    pub was_truncated: bool,
    /// Byte offset of this chunk's start in the original (untrimmed) text;
    /// callers use it to look up which message the chunk starts in.
    pub start: usize,
}

/// Splits `text` into overlap-preserving, boundary-seeking chunks tuned to
/// a ~400 token window. For inputs within the window, emits a single chunk.
pub fn chunk_v2(text: &str) -> Vec<RawChunk> {
    let bytes = text.as_bytes();
    let len = bytes.len();
    if len == 0 {
        return Vec::new();
    }
    if len <= WINDOW_CHARS {
        return vec![RawChunk {
            text: text.trim().to_string(),
            index: 0,
            was_truncated: false,
            start: 0,
        }];
    }

    let mut chunks = Vec::new();
    let mut s = 0usize;
    let mut index = 0i64;

    while s < len {
        let mut e = (s + WINDOW_CHARS).min(len);
        let mut truncated_here = false;

        if e < len {
            match find_boundary(text, s, e) {
                Some(snapped) => e = snapped,
                None => truncated_here = true,
            }
        }

        // Never split inside a UTF-8 code point.
        while e < len && !text.is_char_boundary(e) {
            e += 1;
        }
        while s < len && !text.is_char_boundary(s) {
            s += 1;
        }

        let piece = text[s..e].trim();
        if !piece.is_empty() {
            chunks.push(RawChunk {
                text: piece.to_string(),
                index,
                was_truncated: truncated_here,
                start: s,
            });
            index += 1;
        }

        if e >= len {
            break;
        }
        let next_s = e.saturating_sub(OVERLAP_CHARS);
        s = next_s.max(s + 1);
    }

    chunks
}

/// Searches `text[s..e]` backward for the latest separator whose end lies
/// past the window's midpoint (`s + WINDOW_CHARS/2`). Returns the offset
/// just past the separator, or `None` if no qualifying separator exists
/// (the degenerate single-massive-token case, which callers hard-split).
fn find_boundary(text: &str, s: usize, e: usize) -> Option<usize> {
    let midpoint = s + WINDOW_CHARS / 2;
    let window = &text[s..e];

    let mut best: Option<usize> = None;
    for sep in SEPARATORS {
        if let Some(rel) = window.rfind(sep) {
            let abs_end = s + rel + sep.len();
            if abs_end > midpoint && best.map_or(true, |b| abs_end > b) {
                best = Some(abs_end);
            }
        }
    }
    best
}

/// Legacy v1 chunker: groups whole messages up to the window budget without
/// overlap, for older-format transcripts (or an explicit legacy override).
/// Splits on paragraph boundaries like the original message-grouping
/// scheme, never overlapping and never snapping to sub-paragraph
/// separators.
pub fn chunk_v1(text: &str) -> Vec<RawChunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut buf = String::new();
    let mut buf_start = 0usize;
    let mut index = 0i64;
    let mut offset = 0usize;

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            offset += para.len() + 2;
            continue;
        }
        let para_start = offset + (para.len() - para.trim_start().len());
        let would_be = if buf.is_empty() {
            trimmed.len()
        } else {
            buf.len() + 2 + trimmed.len()
        };
        if would_be > WINDOW_CHARS && !buf.is_empty() {
            chunks.push(RawChunk {
                text: buf.clone(),
                index,
                was_truncated: false,
                start: buf_start,
            });
            index += 1;
            buf.clear();
        }
        if buf.is_empty() {
            buf_start = para_start;
        } else {
            buf.push_str("\n\n");
        }
        buf.push_str(trimmed);
        offset += para.len() + 2;
    }

    if !buf.is_empty() {
        chunks.push(RawChunk {
            text: buf,
            index,
            was_truncated: false,
            start: buf_start,
        });
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_text_is_a_single_chunk() {
        let chunks = chunk_v2("Hello, world!");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].index, 0);
    }

    #[test]
    fn empty_text_produces_no_chunks() {
        assert!(chunk_v2("").is_empty());
    }

    #[test]
    fn long_text_is_split_into_multiple_chunks_with_contiguous_indices() {
        let sentence = "This is one sentence in a long transcript. ";
        let text = sentence.repeat(200);
        let chunks = chunk_v2(&text);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i as i64);
        }
    }

    #[test]
    fn chunks_respect_window_unless_truncated() {
        let sentence = "Word word word word word word word word word word. ";
        let text = sentence.repeat(100);
        let chunks = chunk_v2(&text);
        for c in &chunks {
            if !c.was_truncated {
                assert!(c.text.len() <= WINDOW_CHARS + OVERLAP_CHARS);
            }
        }
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let sentence = "Alpha beta gamma delta epsilon zeta eta theta iota kappa. ";
        let text = sentence.repeat(80);
        let chunks = chunk_v2(&text);
        assert!(chunks.len() >= 2);
        // The tail of chunk i and the head of chunk i+1 should share text
        // drawn from the overlap window (snapped to a boundary, so not
        // necessarily byte-identical, but substantially overlapping).
        let c0_tail: String = chunks[0].text.chars().rev().take(50).collect();
        let c0_tail: String = c0_tail.chars().rev().collect();
        assert!(chunks[1].text.contains(&c0_tail[..20.min(c0_tail.len())]));
    }

    #[test]
    fn degenerate_single_token_is_truncated() {
        let text = "a".repeat(5000);
        let chunks = chunk_v2(&text);
        assert!(chunks.iter().any(|c| c.was_truncated));
    }

    #[test]
    fn v1_groups_paragraphs_without_overlap() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunk_v1(text);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("First paragraph."));
        assert!(chunks[0].text.contains("Third paragraph."));
    }

    #[test]
    fn v1_splits_when_paragraphs_exceed_window() {
        let para = "x".repeat(WINDOW_CHARS);
        let text = format!("{para}\n\n{para}\n\n{para}");
        let chunks = chunk_v1(&text);
        assert!(chunks.len() >= 2);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i as i64);
        }
    }

    #[test]
    fn v1_empty_text_produces_no_chunks() {
        assert!(chunk_v1("").is_empty());
    }
}
