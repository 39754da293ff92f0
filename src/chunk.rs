//! Recursive character text splitter.
//!
//! Splits extracted text into overlapping windows of roughly `chunk_size`
//! characters. The splitter tries separators in order (`"\n\n"`, `"\n"`,
//! `" "`, then single characters) and only falls back to a finer separator
//! for pieces that are still too long, so paragraph and sentence
//! boundaries survive whenever they fit. Adjacent pieces are merged back
//! up to `chunk_size`, carrying up to `chunk_overlap` characters of
//! trailing context into the next window.
//!
//! Each chunk is stamped with its file id and source, gets a random UUID
//! and a SHA-256 hash of its content, and records the line (or page and
//! line) range it came from. Chunks whose trimmed content is shorter than
//! `min_chunk_chars` are dropped here and never reach the embedder.

use std::collections::VecDeque;

use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::extract::Section;
use crate::models::{Chunk, ChunkMetadata, Location};

const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// Window sizes for the splitter, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_chars: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 128,
            min_chunk_chars: 10,
        }
    }
}

impl ChunkOptions {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
            ..Self::default()
        }
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Split `text` into overlapping windows.
pub fn split_text(text: &str, opts: &ChunkOptions) -> Vec<String> {
    split_recursive(text, &SEPARATORS, opts)
}

fn split_recursive(text: &str, separators: &[&str], opts: &ChunkOptions) -> Vec<String> {
    let (idx, separator) = separators
        .iter()
        .enumerate()
        .find(|(_, sep)| sep.is_empty() || text.contains(**sep))
        .map(|(i, sep)| (i, *sep))
        .unwrap_or((separators.len(), ""));
    let finer = separators.get(idx + 1..).unwrap_or(&[]);

    let splits: Vec<&str> = if separator.is_empty() {
        text.char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect()
    } else {
        text.split(separator).filter(|s| !s.is_empty()).collect()
    };

    let mut out = Vec::new();
    let mut good: Vec<&str> = Vec::new();

    for piece in splits {
        if char_len(piece) < opts.chunk_size {
            good.push(piece);
            continue;
        }
        if !good.is_empty() {
            out.extend(merge_splits(&good, separator, opts));
            good.clear();
        }
        if finer.is_empty() {
            out.push(piece.to_string());
        } else {
            out.extend(split_recursive(piece, finer, opts));
        }
    }
    if !good.is_empty() {
        out.extend(merge_splits(&good, separator, opts));
    }
    out
}

fn merge_splits(splits: &[&str], separator: &str, opts: &ChunkOptions) -> Vec<String> {
    let sep_len = char_len(separator);
    let mut docs = Vec::new();
    let mut current: VecDeque<&str> = VecDeque::new();
    let mut total = 0usize;

    let join = |parts: &VecDeque<&str>| -> Option<String> {
        let joined = parts.iter().copied().collect::<Vec<_>>().join(separator);
        let trimmed = joined.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    };

    for &piece in splits {
        let len = char_len(piece);
        let sep_cost = if current.is_empty() { 0 } else { sep_len };

        if total + len + sep_cost > opts.chunk_size {
            if total > opts.chunk_size {
                warn!(size = total, limit = opts.chunk_size, "created a chunk larger than the limit");
            }
            if !current.is_empty() {
                if let Some(doc) = join(&current) {
                    docs.push(doc);
                }
                loop {
                    let sep_cost = if current.is_empty() { 0 } else { sep_len };
                    let overflows = total > 0 && total + len + sep_cost > opts.chunk_size;
                    if total <= opts.chunk_overlap && !overflows {
                        break;
                    }
                    let Some(front) = current.pop_front() else { break };
                    let joined_cost = if current.is_empty() { 0 } else { sep_len };
                    total = total.saturating_sub(char_len(front) + joined_cost);
                }
            }
        }

        let sep_cost = if current.is_empty() { 0 } else { sep_len };
        total += len + sep_cost;
        current.push_back(piece);
    }

    if let Some(doc) = join(&current) {
        docs.push(doc);
    }
    docs
}

/// Collapse line breaks and runs of whitespace into single spaces.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// SHA-256 of `text`, lowercase hex.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Chunk every section of one document.
///
/// `paginated` marks page-derived sections: their chunks have whitespace
/// collapsed and carry a [`Location::Page`].
pub fn chunk_sections(
    sections: &[Section],
    file_id: &str,
    source: &str,
    paginated: bool,
    opts: &ChunkOptions,
) -> Vec<Chunk> {
    let mut chunks = Vec::new();

    for section in sections {
        let mut search_from = 0usize;
        for piece in split_text(&section.text, opts) {
            let (from, to) = locate_lines(&section.text, &piece, &mut search_from);
            let loc = match (paginated, section.page) {
                (true, Some(page)) => Location::Page { page, from, to },
                _ => Location::Lines { from, to },
            };

            let content = if paginated {
                collapse_whitespace(&piece)
            } else {
                piece
            };
            if char_len(content.trim()) < opts.min_chunk_chars {
                continue;
            }

            chunks.push(make_chunk(file_id, source, content, loc));
        }
    }

    chunks
}

/// 1-based inclusive line range of `piece` within `text`, searching
/// forward from the previous match so repeated text maps to later lines.
fn locate_lines(text: &str, piece: &str, search_from: &mut usize) -> (usize, usize) {
    let start = text
        .get(*search_from..)
        .and_then(|rest| rest.find(piece))
        .map(|offset| *search_from + offset)
        .or_else(|| text.find(piece));

    let Some(start) = start else {
        return (1, 1);
    };
    *search_from = start + piece.chars().next().map(char::len_utf8).unwrap_or(1);

    let from = text[..start].matches('\n').count() + 1;
    let to = from + piece.matches('\n').count();
    (from, to)
}

fn make_chunk(file_id: &str, source: &str, content: String, loc: Location) -> Chunk {
    Chunk {
        id: Uuid::new_v4().to_string(),
        file_id: file_id.to_string(),
        hash: content_hash(&content),
        content,
        metadata: ChunkMetadata {
            source: source.to_string(),
            loc: Some(loc),
            ..ChunkMetadata::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(size: usize, overlap: usize) -> ChunkOptions {
        ChunkOptions {
            chunk_size: size,
            chunk_overlap: overlap,
            min_chunk_chars: 10,
        }
    }

    fn text_section(text: &str) -> Vec<Section> {
        vec![Section {
            page: None,
            text: text.to_string(),
        }]
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let pieces = split_text("Hello, world! This is short.", &opts(512, 128));
        assert_eq!(pieces, vec!["Hello, world! This is short.".to_string()]);
    }

    #[test]
    fn windows_respect_size_and_overlap() {
        let text = (0..200).map(|i| format!("word{}", i)).collect::<Vec<_>>().join(" ");
        let pieces = split_text(&text, &opts(50, 20));
        assert!(pieces.len() > 1);
        for p in &pieces {
            assert!(char_len(p) <= 50, "piece too long: {}", p);
        }
        // Consecutive windows share trailing/leading words.
        let first_tail = pieces[0].split(' ').last().unwrap();
        assert!(pieces[1].contains(first_tail));
    }

    #[test]
    fn paragraphs_are_kept_whole_when_they_fit() {
        let text = "Alpha paragraph here.\n\nBeta paragraph here.\n\nGamma paragraph here.";
        let pieces = split_text(text, &opts(30, 0));
        assert_eq!(
            pieces,
            vec![
                "Alpha paragraph here.".to_string(),
                "Beta paragraph here.".to_string(),
                "Gamma paragraph here.".to_string(),
            ]
        );
    }

    #[test]
    fn long_words_fall_back_to_characters() {
        let text = "x".repeat(25);
        let pieces = split_text(&text, &opts(10, 0));
        assert_eq!(pieces.len(), 3);
        assert!(pieces.iter().all(|p| char_len(p) <= 10));
    }

    #[test]
    fn multibyte_text_is_split_on_char_boundaries() {
        let text = "知识库".repeat(20);
        let pieces = split_text(&text, &opts(16, 4));
        assert!(pieces.iter().all(|p| char_len(p) <= 16));
    }

    #[test]
    fn short_chunks_are_dropped() {
        let text = "tiny\n\nThis paragraph is long enough to keep.";
        let chunks = chunk_sections(&text_section(text), "f1", "a.txt", false, &opts(20, 0));
        assert!(chunks.iter().all(|c| c.content.trim().chars().count() >= 10));
        assert!(!chunks.iter().any(|c| c.content == "tiny"));
    }

    #[test]
    fn chunks_carry_file_id_hash_and_lines() {
        let text = "line one is here\nline two is here\n\nline four is here";
        let chunks = chunk_sections(&text_section(text), "file-9", "notes.md", false, &opts(40, 0));
        assert_eq!(chunks.len(), 2);
        for c in &chunks {
            assert_eq!(c.file_id, "file-9");
            assert_eq!(c.metadata.source, "notes.md");
            assert_eq!(c.hash, content_hash(&c.content));
            assert!(c.metadata.dbquery.is_none());
        }
        assert_eq!(chunks[0].metadata.loc, Some(Location::Lines { from: 1, to: 2 }));
        assert_eq!(chunks[1].metadata.loc, Some(Location::Lines { from: 4, to: 4 }));
    }

    #[test]
    fn page_chunks_collapse_whitespace() {
        let sections = vec![
            Section {
                page: Some(1),
                text: "Page one   has\nbroken    lines inside it.".to_string(),
            },
            Section {
                page: Some(2),
                text: "Second page\n\ncontent is here.".to_string(),
            },
        ];
        let chunks = chunk_sections(&sections, "pdf", "doc.pdf", true, &opts(512, 128));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "Page one has broken lines inside it.");
        assert!(matches!(chunks[1].metadata.loc, Some(Location::Page { page: 2, .. })));
        assert!(!chunks[1].content.contains('\n'));
    }

    #[test]
    fn whitespace_only_text_yields_nothing() {
        let chunks = chunk_sections(&text_section("  \n\n \t "), "f", "s.txt", false, &opts(512, 128));
        assert!(chunks.is_empty());
    }
}
