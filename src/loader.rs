//! Document loading: file on disk (or bytes) in, chunks out.
//!
//! [`parse`] is the single entry point the ingestion pipeline uses. It
//! detects the format from the extension, extracts the text sections, and
//! hands them to the splitter in [`chunk`](crate::chunk).

use std::path::Path;

use tracing::debug;

use crate::chunk::{chunk_sections, ChunkOptions};
use crate::error::RagResult;
use crate::extract::{extract_sections, DocumentFormat};
use crate::models::Chunk;

/// Parse the file at `path` into chunks stamped with `file_id`.
///
/// Fails with [`RagError::UnsupportedFormat`](crate::error::RagError::UnsupportedFormat)
/// before touching the file when the extension has no loader.
pub fn parse(path: &Path, file_id: &str, chunk_size: usize, chunk_overlap: usize) -> RagResult<Vec<Chunk>> {
    parse_with(path, file_id, &ChunkOptions::new(chunk_size, chunk_overlap))
}

/// [`parse`] with explicit options, including the minimum chunk length.
pub fn parse_with(path: &Path, file_id: &str, opts: &ChunkOptions) -> RagResult<Vec<Chunk>> {
    let format = DocumentFormat::from_path(path)?;
    let bytes = std::fs::read(path)?;
    parse_document(&bytes, format, &path.to_string_lossy(), file_id, opts)
}

/// Parse in-memory content. `name` supplies the extension and becomes
/// the chunks' `source`.
pub fn parse_bytes(bytes: &[u8], name: &str, file_id: &str, opts: &ChunkOptions) -> RagResult<Vec<Chunk>> {
    let format = DocumentFormat::from_path(Path::new(name))?;
    parse_document(bytes, format, name, file_id, opts)
}

fn parse_document(
    bytes: &[u8],
    format: DocumentFormat,
    source: &str,
    file_id: &str,
    opts: &ChunkOptions,
) -> RagResult<Vec<Chunk>> {
    let sections = extract_sections(bytes, format)?;
    let chunks = chunk_sections(&sections, file_id, source, format.is_paginated(), opts);
    debug!(file_id, source, ?format, sections = sections.len(), chunks = chunks.len(), "parsed document");
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RagError;

    #[test]
    fn parses_markdown_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guide.md");
        std::fs::write(
            &path,
            "# Title\n\nRust ownership moves values between bindings.\n\nBorrowing lends access without moving.",
        )
        .unwrap();

        let chunks = parse(&path, "file-1", 512, 128).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].file_id, "file-1");
        assert!(chunks[0].content.contains("Borrowing"));
        assert_eq!(chunks[0].metadata.source, path.to_string_lossy());
    }

    #[test]
    fn unsupported_extension_fails_without_reading() {
        let err = parse(Path::new("/does/not/exist.xyz"), "f", 512, 128).unwrap_err();
        assert!(matches!(err, RagError::UnsupportedFormat(_)));
    }

    #[test]
    fn parse_bytes_uses_name_for_source() {
        let chunks = parse_bytes(
            b"Plain text content that is long enough.",
            "notes.txt",
            "f2",
            &ChunkOptions::default(),
        )
        .unwrap();
        assert_eq!(chunks[0].metadata.source, "notes.txt");
    }
}
