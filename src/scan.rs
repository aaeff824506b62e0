//! Enumeration of indexable files: memory notes and session transcripts.
//!
//! The memory source covers the well-known top-level note files plus a
//! recursive walk of `memory/`; symbolic links are never followed. The
//! session source covers the host CLIs' transcript directories, newest
//! first, bounded by a day window and an optional count cap. Session
//! transcripts are reduced to their user/assistant text before indexing.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::chunk::sha256_hex;

/// Top-level note files accepted directly under the workspace root.
pub const MEMORY_FILE_NAMES: [&str; 4] = ["MEMORY.md", "memory.md", "MEMORY.txt", "memory.txt"];

/// Extensions indexed under `memory/` (and accepted by `memory_get`).
pub const INDEXED_EXTENSIONS: [&str; 6] = ["md", "txt", "json", "jsonl", "yaml", "yml"];

/// Source partitions of the index.
pub const SOURCE_MEMORY: &str = "memory";
pub const SOURCE_SESSIONS: &str = "sessions";

/// One readable file yielded by a scan.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path relative to the workspace root, `/`-separated on every OS.
    pub path: String,
    /// Decoded UTF-8 content (for sessions: the extracted transcript).
    pub content: String,
    /// SHA-256 hex fingerprint of `content`.
    pub hash: String,
    /// Modification time, milliseconds since the epoch.
    pub mtime_ms: i64,
    /// Size of the on-disk file in bytes.
    pub size: u64,
}

/// A transcript root directory and its layout convention.
#[derive(Debug, Clone)]
pub struct SessionRoot {
    pub dir: PathBuf,
    pub style: SessionStyle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStyle {
    /// `<root>/<session-uuid>/events.jsonl`
    Copilot,
    /// `<root>/<project>/<session>.jsonl`
    Claude,
}

/// Limits applied to the session scan.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Only accept transcripts modified within this many days; 0 disables the window.
    pub days: u64,
    /// Maximum transcript count; -1 = unbounded, 0 = session indexing off.
    pub max: i64,
}

/// Whether `ext` (lowercased, no dot) is in the indexed set.
pub fn is_indexed_extension(ext: &str) -> bool {
    INDEXED_EXTENSIONS.contains(&ext)
}

// ── Memory source ─────────────────────────────────────────────────────────────

/// Enumerate the memory source below `workspace`.
///
/// Unreadable or non-UTF-8 files are logged and skipped; other files
/// proceed. Results are deduplicated by resolved real path so case-variant
/// hardlinks index once, in first-seen order.
pub fn scan_memory(workspace: &Path) -> Vec<FileEntry> {
    let mut paths: Vec<PathBuf> = Vec::new();

    for name in MEMORY_FILE_NAMES {
        let path = workspace.join(name);
        if is_plain_file(&path) {
            paths.push(path);
        }
    }

    walk_memory_dir(&workspace.join("memory"), &mut paths);

    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for path in paths {
        let real = path.canonicalize().unwrap_or_else(|_| path.clone());
        if !seen.insert(real) {
            continue;
        }
        if let Some(entry) = read_entry(workspace, &path) {
            entries.push(entry);
        }
    }
    entries
}

/// A regular file that is not itself a symlink.
fn is_plain_file(path: &Path) -> bool {
    path.symlink_metadata()
        .map(|m| m.file_type().is_file())
        .unwrap_or(false)
}

fn walk_memory_dir(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return;
    };

    let mut children: Vec<_> = read_dir.filter_map(|e| e.ok()).collect();
    children.sort_by_key(|e| e.file_name());

    for child in children {
        let path = child.path();
        let Ok(file_type) = child.file_type() else {
            continue;
        };
        if file_type.is_symlink() {
            tracing::debug!(path = %path.display(), "skipping symlink");
            continue;
        }
        if file_type.is_dir() {
            walk_memory_dir(&path, out);
        } else if file_type.is_file() && has_indexed_extension(&path) {
            out.push(path);
        }
    }
}

fn has_indexed_extension(path: &Path) -> bool {
    path.extension()
        .map(|e| is_indexed_extension(&e.to_string_lossy().to_lowercase()))
        .unwrap_or(false)
}

fn read_entry(workspace: &Path, path: &Path) -> Option<FileEntry> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "skipping unreadable file");
            return None;
        }
    };
    let meta = std::fs::metadata(path).ok()?;
    let rel = relative_slash_path(workspace, path)?;

    Some(FileEntry {
        hash: sha256_hex(&content),
        path: rel,
        mtime_ms: mtime_millis(&meta),
        size: meta.len(),
        content,
    })
}

/// Relative path with `/` separators regardless of host OS.
fn relative_slash_path(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

fn mtime_millis(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ── Session source ────────────────────────────────────────────────────────────

struct SessionCandidate {
    id: String,
    path: PathBuf,
    mtime_ms: i64,
    size: u64,
}

/// Enumerate session transcripts under the given roots, newest first.
pub fn scan_sessions(roots: &[SessionRoot], limits: &SessionLimits) -> Vec<FileEntry> {
    if limits.max == 0 {
        return Vec::new();
    }

    let mut candidates = Vec::new();
    for root in roots {
        collect_candidates(root, &mut candidates);
    }

    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    candidates.retain(|c| {
        if c.size == 0 {
            return false;
        }
        if limits.days > 0 {
            let window_ms = (limits.days as i64).saturating_mul(86_400_000);
            if c.mtime_ms < now_ms.saturating_sub(window_ms) {
                return false;
            }
        }
        true
    });

    candidates.sort_by(|a, b| b.mtime_ms.cmp(&a.mtime_ms));
    if limits.max > 0 {
        candidates.truncate(limits.max as usize);
    }

    let mut entries = Vec::new();
    for candidate in candidates {
        let raw = match std::fs::read_to_string(&candidate.path) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(path = %candidate.path.display(), error = %e, "skipping unreadable transcript");
                continue;
            }
        };
        let Some(text) = extract_transcript(&raw) else {
            continue;
        };
        entries.push(FileEntry {
            path: format!("sessions/{}.jsonl", candidate.id),
            hash: sha256_hex(&text),
            content: text,
            mtime_ms: candidate.mtime_ms,
            size: candidate.size,
        });
    }
    entries
}

fn collect_candidates(root: &SessionRoot, out: &mut Vec<SessionCandidate>) {
    let Ok(read_dir) = std::fs::read_dir(&root.dir) else {
        return;
    };

    for entry in read_dir.filter_map(|e| e.ok()) {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        match root.style {
            SessionStyle::Copilot => {
                let file = dir.join("events.jsonl");
                if let Ok(meta) = file.metadata() {
                    if meta.is_file() {
                        out.push(SessionCandidate {
                            id: entry.file_name().to_string_lossy().into_owned(),
                            mtime_ms: mtime_millis(&meta),
                            size: meta.len(),
                            path: file,
                        });
                    }
                }
            }
            SessionStyle::Claude => {
                let Ok(project_dir) = std::fs::read_dir(&dir) else {
                    continue;
                };
                for file_entry in project_dir.filter_map(|e| e.ok()) {
                    let file = file_entry.path();
                    let is_jsonl = file
                        .extension()
                        .map(|e| e.to_string_lossy().to_lowercase() == "jsonl")
                        .unwrap_or(false);
                    if !is_jsonl {
                        continue;
                    }
                    let Ok(meta) = file.metadata() else {
                        continue;
                    };
                    if !meta.is_file() {
                        continue;
                    }
                    let Some(stem) = file.file_stem() else {
                        continue;
                    };
                    out.push(SessionCandidate {
                        id: stem.to_string_lossy().into_owned(),
                        mtime_ms: mtime_millis(&meta),
                        size: meta.len(),
                        path: file,
                    });
                }
            }
        }
    }
}

// ── Transcript extraction ─────────────────────────────────────────────────────

/// Reduce a transcript JSONL to `User:`/`Assistant:` lines.
///
/// Malformed lines are ignored. Slash commands and host command wrappers
/// (`<command-…>`, `<local-command-…>`) are filtered from user turns.
/// Returns None when nothing was extracted.
pub fn extract_transcript(raw: &str) -> Option<String> {
    let mut messages = Vec::new();

    for line in raw.lines() {
        let Ok(record) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        match record.get("type").and_then(|t| t.as_str()) {
            Some("user.message") => {
                if let Some(content) = record
                    .get("data")
                    .and_then(|d| d.get("content"))
                    .and_then(|c| c.as_str())
                {
                    if !content.is_empty() && !content.starts_with('/') {
                        messages.push(format!("User: {content}"));
                    }
                }
            }
            Some("assistant.message") => {
                if let Some(content) = record
                    .get("data")
                    .and_then(|d| d.get("content"))
                    .and_then(|c| c.as_str())
                {
                    if !content.is_empty() {
                        messages.push(format!("Assistant: {content}"));
                    }
                }
            }
            Some("user") => {
                let text = message_text(&record);
                if !text.is_empty() && !is_command_input(&text) {
                    messages.push(format!("User: {text}"));
                }
            }
            Some("assistant") => {
                let text = message_text(&record);
                if !text.is_empty() {
                    messages.push(format!("Assistant: {text}"));
                }
            }
            _ => {}
        }
    }

    if messages.is_empty() {
        None
    } else {
        Some(messages.join("\n"))
    }
}

/// `message.content` as text: a plain string, or the `text` fields of
/// `type == "text"` blocks concatenated.
fn message_text(record: &serde_json::Value) -> String {
    let Some(content) = record.get("message").and_then(|m| m.get("content")) else {
        return String::new();
    };
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn is_command_input(text: &str) -> bool {
    text.starts_with('/') || text.starts_with("<command-") || text.starts_with("<local-command-")
}
