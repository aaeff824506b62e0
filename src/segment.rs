//! CJK-aware tokenization for the lexical index.
//!
//! FTS5's unicode61 tokenizer handles Latin scripts fine but cannot segment
//! CJK text, so chunk text is pre-segmented with jieba (search mode, which
//! emits overlapping sub-words for recall) before it enters the index, and
//! queries are segmented the same way.

use std::sync::OnceLock;

fn jieba() -> &'static jieba_rs::Jieba {
    static INSTANCE: OnceLock<jieba_rs::Jieba> = OnceLock::new();
    INSTANCE.get_or_init(jieba_rs::Jieba::new)
}

/// CJK Unified Ideographs plus Extension A.
pub fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}')
}

pub fn has_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

/// Produce the text stored in the FTS index for a chunk.
///
/// Pure Latin text passes through unchanged; CJK text is segmented and
/// rejoined with single spaces so FTS5 sees word boundaries.
pub fn segment_for_index(text: &str) -> String {
    if !has_cjk(text) {
        return text.to_string();
    }
    cut(text).join(" ")
}

/// Produce the query-side token vector.
///
/// Pure Latin queries split into alphanumeric/underscore runs; CJK queries
/// go through the same segmenter as the index side.
pub fn segment_for_query(text: &str) -> Vec<String> {
    if !has_cjk(text) {
        return text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
    }
    cut(text)
}

fn cut(text: &str) -> Vec<String> {
    jieba()
        .cut_for_search(text, true)
        .into_iter()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
