//! Format detection and plain-text extraction.
//!
//! Dispatches on the file extension. Text and Markdown are read as UTF-8
//! (lossily), PDFs are extracted page by page, and Word documents are read
//! from `word/document.xml` inside the OOXML archive. Anything else is
//! [`RagError::UnsupportedFormat`].

use std::io::Read;
use std::path::Path;

use crate::error::{RagError, RagResult};

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Source document formats with a loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Text,
    Markdown,
    Pdf,
    Docx,
}

impl DocumentFormat {
    /// Detect the format from a file name or path. Case-insensitive.
    pub fn from_path(path: &Path) -> RagResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "txt" => Ok(DocumentFormat::Text),
            "md" | "markdown" => Ok(DocumentFormat::Markdown),
            "pdf" => Ok(DocumentFormat::Pdf),
            "docx" => Ok(DocumentFormat::Docx),
            "" => Err(RagError::UnsupportedFormat(format!(
                "{} has no extension",
                path.display()
            ))),
            other => Err(RagError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Whether sections of this format are pages of a paginated source.
    pub fn is_paginated(self) -> bool {
        matches!(self, DocumentFormat::Pdf)
    }
}

/// A contiguous run of extracted text. Paginated formats yield one section
/// per page, numbered from 1.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub page: Option<usize>,
    pub text: String,
}

/// Extract the sections of a document held in memory.
pub fn extract_sections(bytes: &[u8], format: DocumentFormat) -> RagResult<Vec<Section>> {
    match format {
        DocumentFormat::Text | DocumentFormat::Markdown => Ok(vec![Section {
            page: None,
            text: String::from_utf8_lossy(bytes).into_owned(),
        }]),
        DocumentFormat::Pdf => extract_pdf_pages(bytes),
        DocumentFormat::Docx => Ok(vec![Section {
            page: None,
            text: extract_docx(bytes)?,
        }]),
    }
}

fn extract_pdf_pages(bytes: &[u8]) -> RagResult<Vec<Section>> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| RagError::Extraction(format!("PDF extraction failed: {}", e)))?;

    Ok(pages
        .into_iter()
        .enumerate()
        .map(|(i, text)| Section {
            page: Some(i + 1),
            text,
        })
        .collect())
}

fn extract_docx(bytes: &[u8]) -> RagResult<String> {
    let ooxml = |e: &dyn std::fmt::Display| RagError::Extraction(format!("DOCX extraction failed: {}", e));

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ooxml(&e))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ooxml(&"word/document.xml not found"))?;

    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| ooxml(&e))?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ooxml(&"word/document.xml exceeds size limit"));
    }

    extract_paragraph_text(&doc_xml).map_err(|e| ooxml(&e))
}

/// Collect `w:t` runs, ending each `w:p` paragraph with a newline.
fn extract_paragraph_text(xml: &[u8]) -> Result<String, quick_xml::Error> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == b"t" => in_text = true,
            Event::Text(te) if in_text => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Event::Empty(e) if e.local_name().as_ref() == b"br" => out.push('\n'),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn detects_formats_case_insensitively() {
        assert_eq!(DocumentFormat::from_path(Path::new("a.TXT")).unwrap(), DocumentFormat::Text);
        assert_eq!(DocumentFormat::from_path(Path::new("notes.md")).unwrap(), DocumentFormat::Markdown);
        assert_eq!(DocumentFormat::from_path(Path::new("x/y.Pdf")).unwrap(), DocumentFormat::Pdf);
        assert_eq!(DocumentFormat::from_path(Path::new("w.docx")).unwrap(), DocumentFormat::Docx);
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        let err = DocumentFormat::from_path(Path::new("sheet.xlsx")).unwrap_err();
        assert!(matches!(err, RagError::UnsupportedFormat(ref ext) if ext == "xlsx"));
        assert!(matches!(
            DocumentFormat::from_path(Path::new("Makefile")),
            Err(RagError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn invalid_pdf_returns_extraction_error() {
        let err = extract_sections(b"not a pdf", DocumentFormat::Pdf).unwrap_err();
        assert!(matches!(err, RagError::Extraction(_)));
    }

    #[test]
    fn invalid_zip_returns_extraction_error() {
        let err = extract_sections(b"not a zip", DocumentFormat::Docx).unwrap_err();
        assert!(matches!(err, RagError::Extraction(_)));
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>First paragraph</w:t></w:r><w:r><w:t xml:space="preserve"> continues.</w:t></w:r></w:p>
    <w:p><w:r><w:t>Second &amp; last.</w:t></w:r></w:p>
  </w:body>
</w:document>"#;

        let mut bytes = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut bytes));
            let options = zip::write::SimpleFileOptions::default();
            zip.start_file("word/document.xml", options).unwrap();
            zip.write_all(xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }

        let sections = extract_sections(&bytes, DocumentFormat::Docx).unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].text, "First paragraph continues.\nSecond & last.\n");
    }

    #[test]
    fn text_is_one_unpaginated_section() {
        let sections = extract_sections("héllo".as_bytes(), DocumentFormat::Text).unwrap();
        assert_eq!(sections, vec![Section { page: None, text: "héllo".to_string() }]);
    }
}
