//! Format-aware splitting of file text into line-bounded chunks.
//!
//! The strategy is chosen by lowercased file extension: markdown/plain text
//! uses a sliding character window that breaks at ATX headings and seeds
//! each window with an overlap suffix of the previous one; JSON splits at
//! top-level keys or array elements; JSONL is one chunk per line; YAML
//! splits at document separators or top-level keys. Every chunk carries a
//! 1-based inclusive line range and the exact text of that range.

use sha2::{Digest, Sha256};

/// A contiguous line range of a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
}

impl Chunk {
    /// SHA-256 hex of the chunk text.
    pub fn hash(&self) -> String {
        sha256_hex(&self.text)
    }
}

/// Lowercase SHA-256 hex digest of a string.
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic chunk identity: `SHA256(source ":" path ":" start ":" end ":" chunkHash)`.
pub fn chunk_id(source: &str, path: &str, chunk: &Chunk) -> String {
    sha256_hex(&format!(
        "{source}:{path}:{}:{}:{}",
        chunk.start_line,
        chunk.end_line,
        chunk.hash()
    ))
}

/// Split a file's text into chunks using the strategy for its extension.
pub fn chunk_file(path: &str, text: &str, chunk_size: usize) -> Vec<Chunk> {
    let max_chars = chunk_size * 4;
    match extension(path).as_deref() {
        Some("json") => split_oversize(chunk_json(text), max_chars),
        Some("jsonl") => split_oversize(chunk_jsonl(text), max_chars),
        Some("yaml") | Some("yml") => split_oversize(chunk_yaml(text), max_chars),
        _ => chunk_markdown(text, chunk_size),
    }
}

fn extension(path: &str) -> Option<String> {
    std::path::Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
}

// ── Markdown / plain text ─────────────────────────────────────────────────────

/// Sliding character window with ATX-heading breaks.
///
/// Window budget is `chunk_size * 4` characters (floor 32); each flush seeds
/// the next window with a tail suffix of roughly `chunk_size / 2` characters
/// so seams stay searchable. A heading line always starts a fresh chunk so
/// headings stay attached to their content.
pub fn chunk_markdown(text: &str, chunk_size: usize) -> Vec<Chunk> {
    let max_chars = (chunk_size * 4).max(32);
    let overlap_chars = (chunk_size / 8) * 4;

    let mut chunks = Vec::new();
    let mut buffer: Vec<(usize, &str)> = Vec::new();
    let mut buffer_chars = 0usize;

    for (i, line) in text.lines().enumerate() {
        let line_no = i + 1;
        let cost = line.chars().count() + 1;

        if is_atx_heading(line) && !buffer.is_empty() {
            flush(&mut chunks, &buffer);
            buffer.clear();
            buffer_chars = 0;
        } else if buffer_chars + cost > max_chars && !buffer.is_empty() {
            flush(&mut chunks, &buffer);
            let seed = overlap_suffix(&buffer, overlap_chars);
            buffer = seed;
            buffer_chars = buffer.iter().map(|(_, l)| l.chars().count() + 1).sum();
        }

        buffer.push((line_no, line));
        buffer_chars += cost;
    }

    flush(&mut chunks, &buffer);
    chunks
}

/// `^#{1,6}\s` — an ATX heading line.
fn is_atx_heading(line: &str) -> bool {
    let hashes = line.chars().take_while(|&c| c == '#').count();
    (1..=6).contains(&hashes)
        && line[hashes..]
            .chars()
            .next()
            .is_some_and(|c| c.is_whitespace())
}

/// Tail lines of `buffer` whose combined cost reaches `overlap_chars`.
fn overlap_suffix<'a>(buffer: &[(usize, &'a str)], overlap_chars: usize) -> Vec<(usize, &'a str)> {
    let mut seed = Vec::new();
    let mut chars = 0usize;
    for &(line_no, line) in buffer.iter().rev() {
        if chars >= overlap_chars {
            break;
        }
        chars += line.chars().count() + 1;
        seed.push((line_no, line));
    }
    seed.reverse();
    seed
}

/// Emit a chunk for the buffered lines, unless the text is blank.
fn flush(chunks: &mut Vec<Chunk>, buffer: &[(usize, &str)]) {
    let (Some(&(start, _)), Some(&(end, _))) = (buffer.first(), buffer.last()) else {
        return;
    };
    let text = buffer
        .iter()
        .map(|(_, l)| *l)
        .collect::<Vec<_>>()
        .join("\n");
    push_chunk(chunks, start, end, text);
}

fn push_chunk(chunks: &mut Vec<Chunk>, start_line: usize, end_line: usize, text: String) {
    if text.trim().is_empty() {
        return;
    }
    chunks.push(Chunk {
        start_line,
        end_line,
        text,
    });
}

// ── JSON ──────────────────────────────────────────────────────────────────────

/// Split JSON at top-level keys (object root) or elements (array root).
///
/// Line positions are recovered with a single linear pass over the text
/// using a string-aware brace/bracket depth counter; the parsed value only
/// decides which keys are live.
fn chunk_json(text: &str) -> Vec<Chunk> {
    let root: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return whole_file_chunk(text),
    };

    match root {
        serde_json::Value::Object(map) => chunk_json_object(text, &map),
        serde_json::Value::Array(items) if items.len() > 1 => chunk_json_array(text),
        _ => whole_file_chunk(text),
    }
}

fn whole_file_chunk(text: &str) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let line_count = text.lines().count();
    if line_count > 0 {
        push_chunk(&mut chunks, 1, line_count, text.to_string());
    }
    chunks
}

/// String-aware depth counter for `{}`/`[]`.
#[derive(Default)]
struct DepthScanner {
    depth: i32,
    in_string: bool,
    escaped: bool,
}

impl DepthScanner {
    /// Feed one character; returns the depth after processing it.
    fn step(&mut self, c: char) -> i32 {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if c == '\\' {
                self.escaped = true;
            } else if c == '"' {
                self.in_string = false;
            }
        } else {
            match c {
                '"' => self.in_string = true,
                '{' | '[' => self.depth += 1,
                '}' | ']' => self.depth -= 1,
                _ => {}
            }
        }
        self.depth
    }
}

fn chunk_json_object(
    text: &str,
    map: &serde_json::Map<String, serde_json::Value>,
) -> Vec<Chunk> {
    let lines: Vec<&str> = text.lines().collect();
    let mut scanner = DepthScanner::default();
    let mut starts: Vec<usize> = Vec::new(); // 0-based line indices

    for (i, line) in lines.iter().enumerate() {
        let depth_at_start = scanner.depth;
        if depth_at_start == 1 && !scanner.in_string {
            if let Some(key) = leading_object_key(line) {
                if map.contains_key(key) {
                    starts.push(i);
                }
            }
        }
        for c in line.chars() {
            scanner.step(c);
        }
    }

    if starts.is_empty() {
        return whole_file_chunk(text);
    }

    let mut chunks = Vec::new();
    for (n, &start) in starts.iter().enumerate() {
        let end = match starts.get(n + 1) {
            Some(&next) => next - 1,
            None => lines.len() - 1,
        };
        let body = strip_trailing_comma(lines[start..=end].join("\n"));
        push_chunk(&mut chunks, start + 1, end + 1, body);
    }
    chunks
}

/// `^\s*"([^"]+)"\s*:` — the key at the start of a line.
fn leading_object_key(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix('"')?;
    let end = rest.find('"')?;
    if end == 0 {
        return None;
    }
    rest[end + 1..]
        .trim_start()
        .starts_with(':')
        .then_some(&rest[..end])
}

fn strip_trailing_comma(text: String) -> String {
    let trimmed = text.trim_end();
    match trimmed.strip_suffix(',') {
        Some(stripped) => stripped.trim_end().to_string(),
        None => text,
    }
}

/// One chunk per root-array element, from its opening bracket/brace to the
/// matching close.
fn chunk_json_array(text: &str) -> Vec<Chunk> {
    let mut scanner = DepthScanner::default();
    let mut chunks = Vec::new();
    let mut element_start: Option<usize> = None;
    let lines: Vec<&str> = text.lines().collect();

    for (i, line) in lines.iter().enumerate() {
        for c in line.chars() {
            let before = scanner.depth;
            let after = scanner.step(c);
            if before == 1 && after == 2 && (c == '{' || c == '[') && element_start.is_none() {
                element_start = Some(i);
            } else if before == 2 && after == 1 {
                if let Some(start) = element_start.take() {
                    let body = lines[start..=i].join("\n");
                    push_chunk(&mut chunks, start + 1, i + 1, body);
                }
            }
        }
    }

    if chunks.is_empty() {
        return whole_file_chunk(text);
    }
    chunks
}

// ── JSONL ─────────────────────────────────────────────────────────────────────

/// One chunk per non-empty trimmed line.
fn chunk_jsonl(text: &str) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            push_chunk(&mut chunks, i + 1, i + 1, trimmed.to_string());
        }
    }
    chunks
}

// ── YAML ──────────────────────────────────────────────────────────────────────

/// Split multi-document YAML at `---` separators, otherwise at top-level keys.
fn chunk_yaml(text: &str) -> Vec<Chunk> {
    let lines: Vec<&str> = text.lines().collect();
    let separator_count = lines.iter().filter(|l| is_doc_separator(l)).count();

    if separator_count >= 2 {
        return chunk_yaml_documents(&lines);
    }

    let key_lines: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| is_top_level_yaml_key(l))
        .map(|(i, _)| i)
        .collect();

    if key_lines.len() <= 1 {
        return whole_file_chunk(&lines.join("\n"));
    }

    let mut chunks = Vec::new();
    for (n, &start) in key_lines.iter().enumerate() {
        let end = match key_lines.get(n + 1) {
            Some(&next) => next - 1,
            None => lines.len() - 1,
        };
        push_chunk(&mut chunks, start + 1, end + 1, lines[start..=end].join("\n"));
    }
    chunks
}

/// `^---\s*$`
fn is_doc_separator(line: &str) -> bool {
    line.strip_prefix("---")
        .is_some_and(|rest| rest.trim().is_empty())
}

/// `^[A-Za-z_][A-Za-z0-9_.\-]*\s*:`
fn is_top_level_yaml_key(line: &str) -> bool {
    let mut chars = line.char_indices();
    let Some((_, first)) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    for (i, c) in chars {
        if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
            continue;
        }
        return line[i..].trim_start().starts_with(':');
    }
    false
}

/// One chunk per document; a separator line starts the next chunk. Chunks
/// whose non-separator body is blank are skipped.
fn chunk_yaml_documents(lines: &[&str]) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut seg_start = 0usize;

    let mut close = |chunks: &mut Vec<Chunk>, start: usize, end_excl: usize| {
        if start >= end_excl {
            return;
        }
        let body_blank = lines[start..end_excl]
            .iter()
            .filter(|l| !is_doc_separator(l))
            .all(|l| l.trim().is_empty());
        if !body_blank {
            push_chunk(
                chunks,
                start + 1,
                end_excl,
                lines[start..end_excl].join("\n"),
            );
        }
    };

    for (i, line) in lines.iter().enumerate() {
        if is_doc_separator(line) && i > seg_start {
            close(&mut chunks, seg_start, i);
            seg_start = i;
        }
    }
    close(&mut chunks, seg_start, lines.len());
    chunks
}

// ── Oversize splitting ────────────────────────────────────────────────────────

/// Split any chunk larger than `max_chars` into consecutive line-wise slices,
/// preserving line numbers. Applied to the non-markdown strategies, whose
/// format-driven chunks have no size bound of their own.
fn split_oversize(chunks: Vec<Chunk>, max_chars: usize) -> Vec<Chunk> {
    let mut out = Vec::new();
    for chunk in chunks {
        if chunk.text.chars().count() <= max_chars {
            out.push(chunk);
            continue;
        }

        let mut buffer: Vec<&str> = Vec::new();
        let mut buffer_chars = 0usize;
        let mut slice_start = chunk.start_line;
        for (i, line) in chunk.text.lines().enumerate() {
            let cost = line.chars().count() + 1;
            if !buffer.is_empty() && buffer_chars + cost > max_chars {
                push_chunk(
                    &mut out,
                    slice_start,
                    chunk.start_line + i - 1,
                    buffer.join("\n"),
                );
                buffer.clear();
                buffer_chars = 0;
                slice_start = chunk.start_line + i;
            }
            buffer.push(line);
            buffer_chars += cost;
        }
        if !buffer.is_empty() {
            push_chunk(&mut out, slice_start, chunk.end_line, buffer.join("\n"));
        }
    }
    out
}
