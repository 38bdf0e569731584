//! Sentence-aware sliding-window chunker.
//!
//! Splits paper text into [`Chunk`]s of at most `max_tokens × 4` characters.
//! Paragraphs (`\n\n`) are split into sentences, sentences are packed
//! greedily into windows, and consecutive windows share trailing sentences
//! worth up to `overlap_tokens × 4` characters. A sentence longer than the
//! window is hard-split on whitespace.
//!
//! Chunk IDs are derived from the paper ID and chunk index
//! (`{doc_id}_chunk_{index:04}`), so re-chunking the same text always yields
//! the same IDs, boundaries and SHA-256 hashes.

use sha2::{Digest, Sha256};

use crate::models::Chunk;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Split text into overlapping chunks. Returns chunks with contiguous
/// indices starting at 0; empty text yields no chunks.
pub fn chunk_text(doc_id: &str, text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<Chunk> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let overlap_chars = overlap_tokens * CHARS_PER_TOKEN;

    let units = split_units(text, max_chars);
    let mut chunks = Vec::new();
    let mut window: Vec<(String, usize)> = Vec::new();
    let mut window_len = 0usize;

    for (unit, len) in units {
        let would_be = if window.is_empty() {
            len
        } else {
            window_len + 1 + len
        };

        if would_be > max_chars && !window.is_empty() {
            chunks.push(make_chunk(doc_id, chunks.len() as i64, &join(&window)));
            window = overlap_tail(&window, overlap_chars, len, max_chars);
            window_len = joined_len(&window);
        }

        window_len = if window.is_empty() {
            len
        } else {
            window_len + 1 + len
        };
        window.push((unit, len));
    }

    if !window.is_empty() {
        chunks.push(make_chunk(doc_id, chunks.len() as i64, &join(&window)));
    }

    chunks
}

/// Sentences carried from the end of a flushed window into the next one.
///
/// Never carries the whole window, and never carries so much that the
/// incoming unit would no longer fit.
fn overlap_tail(
    window: &[(String, usize)],
    overlap_chars: usize,
    incoming: usize,
    max_chars: usize,
) -> Vec<(String, usize)> {
    if overlap_chars == 0 {
        return Vec::new();
    }
    let mut taken = 0usize;
    let mut carried = 0usize;
    for (_, len) in window.iter().rev().take(window.len().saturating_sub(1)) {
        let next = if taken == 0 { *len } else { carried + 1 + len };
        if next > overlap_chars || next + 1 + incoming > max_chars {
            break;
        }
        carried = next;
        taken += 1;
    }
    window[window.len() - taken..].to_vec()
}

fn join(window: &[(String, usize)]) -> String {
    window
        .iter()
        .map(|(s, _)| s.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

fn joined_len(window: &[(String, usize)]) -> usize {
    if window.is_empty() {
        return 0;
    }
    window.iter().map(|(_, len)| len).sum::<usize>() + window.len() - 1
}

/// Paragraph → sentence → hard-split units, each at most `max_chars`
/// characters, paired with their character count.
fn split_units(text: &str, max_chars: usize) -> Vec<(String, usize)> {
    let mut units = Vec::new();
    for para in text.split("\n\n") {
        let normalized = para.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized.is_empty() {
            continue;
        }
        for sentence in split_sentences(&normalized) {
            let len = sentence.chars().count();
            if len <= max_chars {
                units.push((sentence.to_string(), len));
            } else {
                units.extend(hard_split(sentence, max_chars));
            }
        }
    }
    units
}

/// Splits after `.`, `!` or `?` when followed by a space. Input must be
/// whitespace-normalized.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut iter = text.char_indices().peekable();
    while let Some((i, c)) = iter.next() {
        if matches!(c, '.' | '!' | '?') {
            if let Some(&(j, ' ')) = iter.peek() {
                out.push(&text[start..i + c.len_utf8()]);
                start = j + 1;
            }
        }
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

fn hard_split(sentence: &str, max_chars: usize) -> Vec<(String, usize)> {
    let mut pieces = Vec::new();
    let mut remaining = sentence;
    while !remaining.is_empty() {
        if remaining.chars().count() <= max_chars {
            pieces.push(remaining.to_string());
            break;
        }
        // Byte offset just past the `max_chars`-th character.
        let limit = remaining
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let split_at = match remaining[..limit].rfind(' ') {
            Some(pos) if pos > 0 => pos,
            _ => limit,
        };
        pieces.push(remaining[..split_at].trim_end().to_string());
        remaining = remaining[split_at..].trim_start();
    }
    pieces
        .into_iter()
        .filter(|p| !p.is_empty())
        .map(|p| {
            let len = p.chars().count();
            (p, len)
        })
        .collect()
}

pub fn chunk_id(doc_id: &str, index: i64) -> String {
    format!("{}_chunk_{:04}", doc_id, index)
}

fn make_chunk(doc_id: &str, index: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        chunk_id: chunk_id(doc_id, index),
        doc_id: doc_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_text() -> String {
        (0..40)
            .map(|i| format!("Sentence number {} talks about attention heads.", i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("2401.00001", "Hello, world!", 100, 10);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].chunk_id, "2401.00001_chunk_0000");
    }

    #[test]
    fn test_empty_text_has_no_chunks() {
        assert!(chunk_text("doc", "", 100, 10).is_empty());
        assert!(chunk_text("doc", " \n\n \n", 100, 10).is_empty());
    }

    #[test]
    fn test_window_bound_respected() {
        let text = long_text();
        let chunks = chunk_text("doc", &text, 30, 8);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.text.chars().count() <= 30 * CHARS_PER_TOKEN, "{}", c.text);
        }
    }

    #[test]
    fn test_indices_contiguous() {
        let chunks = chunk_text("doc", &long_text(), 20, 5);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
            assert_eq!(c.chunk_id, chunk_id("doc", i as i64));
        }
    }

    #[test]
    fn test_consecutive_chunks_overlap() {
        let chunks = chunk_text("doc", &long_text(), 30, 15);
        assert!(chunks.len() > 2);
        for pair in chunks.windows(2) {
            let last_sentence = pair[0].text.rsplit(". ").next().unwrap();
            assert!(
                pair[1].text.starts_with(last_sentence.trim_end_matches('.')),
                "expected {:?} to start with {:?}",
                pair[1].text,
                last_sentence
            );
        }
    }

    #[test]
    fn test_no_overlap_when_disabled() {
        let chunks = chunk_text("doc", &long_text(), 30, 0);
        let total: usize = chunks.iter().map(|c| c.text.len()).sum();
        let joined = chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(joined, long_text());
        assert!(total < long_text().len());
    }

    #[test]
    fn test_deterministic() {
        let text = long_text();
        let c1 = chunk_text("doc", &text, 25, 6);
        let c2 = chunk_text("doc", &text, 25, 6);
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_long_sentence_hard_split_on_char_boundaries() {
        let text = "é".repeat(50) + " " + &"ü".repeat(50);
        let chunks = chunk_text("doc", &text, 5, 0);
        assert!(chunks.len() >= 5);
        for c in &chunks {
            assert!(c.text.chars().count() <= 20);
        }
        let rejoined: String = chunks.iter().map(|c| c.text.replace(' ', "")).collect();
        assert_eq!(rejoined.chars().count(), 100);
    }

    #[test]
    fn test_paragraph_order_preserved() {
        let text = "First paragraph here.\n\nSecond paragraph here.\n\nThird paragraph here.";
        let chunks = chunk_text("doc", text, 6, 0);
        let joined = chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let first = joined.find("First").unwrap();
        let second = joined.find("Second").unwrap();
        let third = joined.find("Third").unwrap();
        assert!(first < second && second < third);
    }
}
