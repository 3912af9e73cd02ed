use crate::core::error::{Error, Result};
use crate::indexing::discovery::SourceFile;
use crate::indexing::fingerprint::{hash_reader, DocumentFingerprint};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::Path;

/// Where a chunk starts in its source document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// 1-based page number
    pub page: u32,
    /// Character offset within the page text
    pub offset: usize,
}

/// A chunk of document text, before embedding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    /// Position of the chunk in the whole document
    pub index: usize,
    pub text: String,
    pub location: SourceLocation,
}

/// Chunk id for one content version of a document.
///
/// Re-chunking unchanged content yields the same ids; new content gets a new
/// hash prefix, so ids are never reused across versions.
pub fn chunk_id(fingerprint: &DocumentFingerprint, index: usize) -> String {
    format!("{}@{}#{:05}", fingerprint.document_id, fingerprint.short_hash(), index)
}

/// Converts a source document into an ordered sequence of chunks
pub trait Extractor: Send + Sync {
    fn extract(&self, file: &SourceFile, fingerprint: &DocumentFingerprint) -> Result<Vec<Chunk>>;
}

const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", "! ", "? ", "; ", ", ", " ", ""];

/// Recursive character splitter with a fixed target size and bounded overlap
#[derive(Debug, Clone, Copy)]
pub struct TextSplitter {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

/// A split of some text: character offset and trimmed content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    pub offset: usize,
    pub text: String,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size - 1),
        }
    }

    /// Split `text` into spans of at most `chunk_size` characters
    pub fn split(&self, text: &str) -> Vec<TextSpan> {
        let mut pieces = Vec::new();
        self.split_range(text, 0..text.len(), SEPARATORS, &mut pieces);

        let mut spans = Vec::new();
        for window in self.merge(text, &pieces) {
            let raw = &text[window.clone()];
            let trimmed = raw.trim_start();
            let start = window.start + (raw.len() - trimmed.len());
            let trimmed = trimmed.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            spans.push(TextSpan {
                offset: text[..start].chars().count(),
                text: trimmed.to_string(),
            });
        }
        spans
    }

    fn split_range(
        &self,
        text: &str,
        range: Range<usize>,
        separators: &[&str],
        out: &mut Vec<Range<usize>>,
    ) {
        let slice = &text[range.clone()];
        if slice.chars().count() <= self.chunk_size {
            out.push(range);
            return;
        }

        let position = separators
            .iter()
            .position(|sep| sep.is_empty() || slice.contains(sep))
            .unwrap_or(separators.len() - 1);
        let separator = separators[position];
        let rest = &separators[position + 1..];

        if separator.is_empty() {
            // No separator left: fixed-width windows of characters
            let mut start = range.start;
            let mut count = 0;
            for (i, _) in slice.char_indices() {
                if count == self.chunk_size {
                    out.push(start..range.start + i);
                    start = range.start + i;
                    count = 0;
                }
                count += 1;
            }
            out.push(start..range.end);
            return;
        }

        // Separators stay attached to the preceding piece
        let mut start = range.start;
        for (i, _) in slice.match_indices(separator) {
            let end = range.start + i + separator.len();
            self.push_piece(text, start..end, rest, out);
            start = end;
        }
        if start < range.end {
            self.push_piece(text, start..range.end, rest, out);
        }
    }

    fn push_piece(
        &self,
        text: &str,
        piece: Range<usize>,
        rest: &[&str],
        out: &mut Vec<Range<usize>>,
    ) {
        if text[piece.clone()].chars().count() <= self.chunk_size || rest.is_empty() {
            out.push(piece);
        } else {
            self.split_range(text, piece, rest, out);
        }
    }

    /// Greedily merge contiguous pieces into windows, carrying overlap forward
    fn merge(&self, text: &str, pieces: &[Range<usize>]) -> Vec<Range<usize>> {
        let mut windows = Vec::new();
        let mut current: std::collections::VecDeque<(Range<usize>, usize)> = Default::default();
        let mut total = 0usize;

        for piece in pieces {
            let len = text[piece.clone()].chars().count();
            if total + len > self.chunk_size && !current.is_empty() {
                windows.push(window_of(&current));
                while total > self.chunk_overlap || (total + len > self.chunk_size && total > 0) {
                    match current.pop_front() {
                        Some((_, front_len)) => total -= front_len,
                        None => break,
                    }
                }
            }
            current.push_back((piece.clone(), len));
            total += len;
        }
        if !current.is_empty() {
            windows.push(window_of(&current));
        }
        windows
    }
}

fn window_of(current: &std::collections::VecDeque<(Range<usize>, usize)>) -> Range<usize> {
    let start = current.front().map(|(r, _)| r.start).unwrap_or(0);
    let end = current.back().map(|(r, _)| r.end).unwrap_or(start);
    start..end
}

/// Page-aware extractor for PDF and plain-text documents
#[derive(Debug, Clone, Copy)]
pub struct DocumentExtractor {
    splitter: TextSplitter,
}

impl DocumentExtractor {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            splitter: TextSplitter::new(chunk_size, chunk_overlap),
        }
    }

    /// Split already-extracted pages into chunks for one document version
    pub fn chunk_pages(&self, pages: &[String], fingerprint: &DocumentFingerprint) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for (page_index, page) in pages.iter().enumerate() {
            for span in self.splitter.split(page) {
                let index = chunks.len();
                chunks.push(Chunk {
                    chunk_id: chunk_id(fingerprint, index),
                    document_id: fingerprint.document_id.clone(),
                    index,
                    text: span.text,
                    location: SourceLocation {
                        page: page_index as u32 + 1,
                        offset: span.offset,
                    },
                });
            }
        }
        chunks
    }
}

impl Extractor for DocumentExtractor {
    fn extract(&self, file: &SourceFile, fingerprint: &DocumentFingerprint) -> Result<Vec<Chunk>> {
        let bytes = std::fs::read(&file.path).map_err(|e| Error::UnreadableSource {
            document_id: file.document_id.clone(),
            reason: e.to_string(),
        })?;

        let (hash, _) = hash_reader(bytes.as_slice())?;
        if hash != fingerprint.content_hash {
            return Err(Error::UnreadableSource {
                document_id: file.document_id.clone(),
                reason: "content changed while syncing".to_string(),
            });
        }

        let pages = read_pages(&file.document_id, &file.path, &bytes)?;
        Ok(self.chunk_pages(&pages, fingerprint))
    }
}

fn read_pages(document_id: &str, path: &Path, bytes: &[u8]) -> Result<Vec<String>> {
    let failed = |reason: String| Error::ExtractionFailed {
        document_id: document_id.to_string(),
        reason,
    };

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "pdf" => {
            // The PDF parser panics on some malformed inputs
            let result = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem_by_pages(bytes))
                .map_err(|_| failed("PDF parser panicked".to_string()))?;
            result.map_err(|e| failed(e.to_string()))
        }
        "txt" => {
            let text = std::str::from_utf8(bytes).map_err(|e| failed(format!("invalid UTF-8: {}", e)))?;
            Ok(text.split('\x0c').map(str::to_string).collect())
        }
        other => Err(failed(format!("unsupported document type '{}'", other))),
    }
}
