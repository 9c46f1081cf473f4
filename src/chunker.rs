use unicode_normalization::UnicodeNormalization;

use crate::config::ChunkingConfig;
use crate::vector_db::Page;

/// A window of text cut from a page, with its character offsets in that page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    pub start: usize,
    pub end: usize,
    pub content: String,
}

/// Chunk content tagged with the page it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageChunk {
    pub page: Page,
    pub content: String,
}

/// Splits text into fixed-size character windows that overlap by `config.overlap()`.
///
/// Offsets count `char`s, not bytes. Windows that are empty after trimming are
/// dropped, but the cursor still advances past them.
pub fn chunk_spans(text: &str, config: &ChunkingConfig) -> Vec<ChunkSpan> {
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(idx, _)| idx)
        .chain(std::iter::once(text.len()))
        .collect();
    let char_count = boundaries.len() - 1;

    let mut spans = Vec::new();
    let mut start = 0;
    while start < char_count {
        let end = (start + config.chunk_size()).min(char_count);
        let window = text[boundaries[start]..boundaries[end]].trim();
        if !window.is_empty() {
            spans.push(ChunkSpan {
                start,
                end,
                content: window.to_string(),
            });
        }
        start += config.stride();
    }
    spans
}

pub fn split_into_chunks(text: &str, config: &ChunkingConfig) -> Vec<String> {
    chunk_spans(text, config)
        .into_iter()
        .map(|span| span.content)
        .collect()
}

/// Chunks extracted PDF pages, numbering pages from 1.
pub fn chunk_pages(pages: &[String], config: &ChunkingConfig) -> Vec<PageChunk> {
    pages
        .iter()
        .enumerate()
        .flat_map(|(idx, page_text)| {
            let page = Page::Number(idx as u32 + 1);
            normalize_page(page_text)
                .map(|text| split_into_chunks(&text, config))
                .unwrap_or_default()
                .into_iter()
                .map(move |content| PageChunk { page, content })
        })
        .collect()
}

/// Chunks a source without pagination, such as a statute fetched from the web.
pub fn chunk_unpaged(text: &str, config: &ChunkingConfig) -> Vec<PageChunk> {
    normalize_page(text)
        .map(|text| split_into_chunks(&text, config))
        .unwrap_or_default()
        .into_iter()
        .map(|content| PageChunk {
            page: Page::NotApplicable,
            content,
        })
        .collect()
}

/// Page text as chunks are cut from it: NFC-composed, then trimmed. Chunk
/// offsets and content refer to this text, not to the raw extraction.
pub fn normalize_page(text: &str) -> Option<String> {
    let text = text.nfc().collect::<String>();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
