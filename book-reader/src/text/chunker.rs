//! Sentence-aware splitting of normalized text into pages.

use super::Page;

/// Default page size in characters.
pub const DEFAULT_MAX_PAGE_CHARS: usize = 2500;

/// Smallest forward overflow window, so tiny page sizes still find a terminator.
const MIN_OVERFLOW_WINDOW: usize = 16;

/// Characters that end a sentence.
const TERMINATORS: &[char] = &['.', '!', '?'];

/// How far past `max_page_chars` a page may run to reach a sentence end.
pub fn overflow_window(max_page_chars: usize) -> usize {
    (max_page_chars / 2).max(MIN_OVERFLOW_WINDOW)
}

/// Split normalized text into ordered pages of at most `max_page_chars`.
///
/// The cut point for each page is chosen in order of preference:
/// 1. after the last sentence terminator inside the page limit
/// 2. after the first terminator within the overflow window past the limit
/// 3. at the last whitespace inside the limit
/// 4. exactly at the limit
///
/// Pages are trimmed and never empty. Page index is position in the text, so
/// the same input always yields the same pages.
pub fn split_into_pages(text: &str, max_page_chars: usize) -> Vec<Page> {
    let max_page_chars = max_page_chars.max(1);
    let chars: Vec<char> = text.chars().collect();
    let window = overflow_window(max_page_chars);

    let mut pages = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let end = find_cut(&chars, start, max_page_chars, window);
        let page_text: String = chars[start..end].iter().collect();
        let page_text = page_text.trim();
        if !page_text.is_empty() {
            pages.push(Page::new(pages.len(), page_text.to_string()));
        }
        start = end;
    }

    pages
}

/// Find the exclusive end of the page starting at `start`.
fn find_cut(chars: &[char], start: usize, max_len: usize, window: usize) -> usize {
    let limit = start + max_len;
    if limit >= chars.len() {
        return chars.len();
    }

    if let Some(pos) = chars[start..limit]
        .iter()
        .rposition(|c| TERMINATORS.contains(c))
    {
        return start + pos + 1;
    }

    let window_end = (limit + window).min(chars.len());
    if let Some(pos) = chars[limit..window_end]
        .iter()
        .position(|c| TERMINATORS.contains(c))
    {
        return limit + pos + 1;
    }

    // Cutting at position `start` would make no progress
    if let Some(pos) = chars[start + 1..limit]
        .iter()
        .rposition(|c| c.is_whitespace())
    {
        return start + 1 + pos;
    }

    limit
}
