//! Chunk extraction from curated markdown (C2).
//!
//! Recognizes two line patterns: an H2 heading sets the current section
//! (`source_key`), and a bullet emits one [`Chunk`]. Daily files have no
//! headings and use the filename stem as `source_key` instead.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static H2_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^##\s+(.+?)\s*$").unwrap());
static BULLET_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*-\s*(.+?)\s*$").unwrap());

pub const ROOT_HEADING: &str = "(root)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub doc_id: String,
    pub source: String,
    pub source_key: String,
    pub chunk_ix: i64,
    pub text: String,
}

/// Extract chunks from curated markdown text (H2 headings + bullets).
///
/// `doc_id` identifies the originating file; `source` is the coarse bucket
/// (`"memory"` for `MEMORY.md`, `"staging"` for pending items, etc).
pub fn extract_curated_chunks(doc_id: &str, source: &str, text: &str) -> Vec<Chunk> {
    let mut heading = ROOT_HEADING.to_string();
    let mut ix_by_heading: HashMap<String, i64> = HashMap::new();
    let mut out = Vec::new();

    for line in text.lines() {
        if let Some(caps) = H2_RE.captures(line) {
            heading = caps[1].trim().to_string();
            continue;
        }
        let Some(caps) = BULLET_RE.captures(line) else { continue };
        let body = caps[1].trim();
        if body.is_empty() {
            continue;
        }
        let ix = ix_by_heading.entry(heading.clone()).or_insert(0);
        out.push(Chunk {
            doc_id: doc_id.to_string(),
            source: source.to_string(),
            source_key: heading.clone(),
            chunk_ix: *ix,
            text: body.to_string(),
        });
        *ix += 1;
    }

    out
}

/// Extract chunks from a daily log file: no headings, `source_key` is the
/// filename stem, `chunk_ix` counts bullets in file order.
pub fn extract_daily_chunks(doc_id: &str, day: &str, text: &str) -> Vec<Chunk> {
    let mut out = Vec::new();
    let mut ix = 0i64;
    for line in text.lines() {
        let Some(caps) = BULLET_RE.captures(line) else { continue };
        let body = caps[1].trim();
        if body.is_empty() {
            continue;
        }
        out.push(Chunk {
            doc_id: doc_id.to_string(),
            source: "daily".to_string(),
            source_key: day.to_string(),
            chunk_ix: ix,
            text: body.to_string(),
        });
        ix += 1;
    }
    out
}

/// Read `MEMORY.md` from the workspace root and extract its curated chunks.
/// Returns an empty vector when the file is missing.
pub fn iter_memory_md(workspace: &Path) -> Vec<Chunk> {
    let path = workspace.join("MEMORY.md");
    let Ok(text) = fs::read_to_string(&path) else { return Vec::new() };
    extract_curated_chunks("MEMORY.md", "memory", &text)
}

/// Read `memory/staging/MEMORY.pending.md` and extract its staged chunks
/// (no headings — every bullet is `source_key = "pending"`, counted from 0).
pub fn iter_pending_curated(workspace: &Path) -> Vec<Chunk> {
    let path = workspace.join("memory").join("staging").join("MEMORY.pending.md");
    let Ok(text) = fs::read_to_string(&path) else { return Vec::new() };
    let doc_id = "memory/staging/MEMORY.pending.md";
    let mut out = Vec::new();
    let mut ix = 0i64;
    for line in text.lines() {
        let Some(caps) = BULLET_RE.captures(line) else { continue };
        let body = caps[1].trim();
        if body.is_empty() {
            continue;
        }
        out.push(Chunk {
            doc_id: doc_id.to_string(),
            source: "staging".to_string(),
            source_key: "pending".to_string(),
            chunk_ix: ix,
            text: body.to_string(),
        });
        ix += 1;
    }
    out
}

/// `MEMORY.md` chunks, optionally combined with pending-staging chunks.
/// This is the exact feed the dense-vector (C7) and entity (C5) rebuilds
/// draw curated+distilled content from.
pub fn iter_semantic_chunks(workspace: &Path, include_pending: bool) -> Vec<Chunk> {
    let mut chunks = iter_memory_md(workspace);
    if include_pending {
        chunks.extend(iter_pending_curated(workspace));
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headings_reset_chunk_ix_per_section() {
        let text = "## Services\n- foo.service runs on :9000\n- bar notes\n## Ops\n- restart daily\n";
        let chunks = extract_curated_chunks("MEMORY.md", "memory", text);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].source_key, "Services");
        assert_eq!(chunks[0].chunk_ix, 0);
        assert_eq!(chunks[1].source_key, "Services");
        assert_eq!(chunks[1].chunk_ix, 1);
        assert_eq!(chunks[2].source_key, "Ops");
        assert_eq!(chunks[2].chunk_ix, 0);
    }

    #[test]
    fn no_heading_defaults_to_root() {
        let chunks = extract_curated_chunks("MEMORY.md", "memory", "- a note\n- another\n");
        assert_eq!(chunks[0].source_key, ROOT_HEADING);
        assert_eq!(chunks[1].chunk_ix, 1);
    }

    #[test]
    fn blank_bullet_text_is_skipped() {
        let chunks = extract_curated_chunks("MEMORY.md", "memory", "-    \n- real\n");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "real");
    }

    #[test]
    fn daily_chunks_use_stem_as_source_key_no_headings() {
        let text = "## not a heading here\n- [user@cli] hello\n- [agent@cli] world\n";
        let chunks = extract_daily_chunks("memory/2024-01-02.md", "2024-01-02", text);
        // The "## ..." line does not match the bullet pattern, so it contributes no chunk.
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].source_key, "2024-01-02");
        assert_eq!(chunks[0].source, "daily");
        assert_eq!(chunks[1].chunk_ix, 1);
    }

    #[test]
    fn missing_file_yields_zero_chunks() {
        let dir = tempfile::tempdir().unwrap();
        assert!(iter_memory_md(dir.path()).is_empty());
        assert!(iter_pending_curated(dir.path()).is_empty());
    }

    #[test]
    fn round_trip_chunks_through_bullets() {
        let original = extract_curated_chunks("MEMORY.md", "memory", "## X\n- one\n- two\n");
        let serialized: String = original
            .iter()
            .map(|c| format!("- {}\n", c.text))
            .collect();
        let reparsed = extract_curated_chunks("MEMORY.md", "memory", &format!("## X\n{serialized}"));
        let texts: Vec<_> = original.iter().map(|c| c.text.as_str()).collect();
        let texts2: Vec<_> = reparsed.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, texts2);
    }
}
