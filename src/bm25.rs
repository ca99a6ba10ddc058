//! In-memory BM25 over `MEMORY.md` and all daily files (C6).
//!
//! Pure function of (query, corpus, k1, b): no persisted state, so it is
//! trivially re-derivable and safe to call on every query without an
//! index-build step.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

use crate::workspace::Workspace;

static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z0-9_:./-]{2,}").unwrap());

const K1: f64 = 1.2;
const B: f64 = 0.75;
const SNIPPET_FALLBACK_LEN: usize = 180;
const SNIPPET_MAX_LEN: usize = 220;

pub fn tokenize(text: &str) -> Vec<String> {
    WORD_RE.find_iter(text).map(|m| m.as_str().to_lowercase()).collect()
}

fn iter_docs(ws: &Workspace) -> Vec<(String, String)> {
    let mut docs = Vec::new();

    if let Ok(text) = fs::read_to_string(ws.memory_md()) {
        docs.push(("MEMORY.md".to_string(), text));
    }

    let mdir = ws.memory_dir();
    if mdir.is_dir() {
        let daily_re = Regex::new(r"^\d{4}-\d{2}-\d{2}\.md$").unwrap();
        let mut paths: Vec<PathBuf> = fs::read_dir(&mdir)
            .into_iter()
            .flatten()
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| daily_re.is_match(n))
            })
            .collect();
        paths.sort();
        for p in paths {
            if let Ok(text) = fs::read_to_string(&p) {
                let rel = format!("memory/{}", p.file_name().unwrap().to_string_lossy());
                docs.push((rel, text));
            }
        }
    }

    docs
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bm25Hit {
    pub score: f64,
    pub path: String,
    pub snippet: String,
}

fn snippet_for(text: &str, q_terms: &[String]) -> String {
    for line in text.lines() {
        let low = line.to_lowercase();
        if q_terms.iter().any(|t| low.contains(t.as_str())) {
            let trimmed = line.trim();
            return trimmed.chars().take(SNIPPET_MAX_LEN).collect();
        }
    }
    let collapsed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(SNIPPET_FALLBACK_LEN).collect()
}

/// Score `MEMORY.md` + all daily files against `query`, returning the
/// top-`limit` documents by descending BM25 score.
pub fn search(ws: &Workspace, query: &str, limit: usize) -> Vec<Bm25Hit> {
    search_with_params(ws, query, limit, K1, B)
}

pub fn search_with_params(ws: &Workspace, query: &str, limit: usize, k1: f64, b: f64) -> Vec<Bm25Hit> {
    let q_terms = tokenize(query);
    if q_terms.is_empty() {
        return Vec::new();
    }

    let docs = iter_docs(ws);
    if docs.is_empty() {
        return Vec::new();
    }

    let mut doc_tf: Vec<HashMap<String, usize>> = Vec::with_capacity(docs.len());
    let mut df: HashMap<String, usize> = HashMap::new();
    let mut lengths: Vec<usize> = Vec::with_capacity(docs.len());

    for (_path, text) in &docs {
        let toks = tokenize(text);
        let mut tf = HashMap::new();
        for t in &toks {
            *tf.entry(t.clone()).or_insert(0) += 1;
        }
        lengths.push(toks.len());
        let uniq: HashSet<&String> = tf.keys().collect();
        for t in uniq {
            *df.entry(t.clone()).or_insert(0) += 1;
        }
        doc_tf.push(tf);
    }

    let n = docs.len() as f64;
    let avgdl = lengths.iter().sum::<usize>() as f64 / n.max(1.0);

    let idf = |t: &str| -> f64 {
        let df_t = *df.get(t).unwrap_or(&0) as f64;
        ((n - df_t + 0.5) / (df_t + 0.5) + 1.0).ln()
    };

    let mut scored: Vec<Bm25Hit> = Vec::new();
    for (i, (path, text)) in docs.iter().enumerate() {
        let dl = lengths[i] as f64;
        let mut score = 0.0;
        for t in &q_terms {
            let f = *doc_tf[i].get(t).unwrap_or(&0) as f64;
            if f == 0.0 {
                continue;
            }
            let denom = f + k1 * (1.0 - b + b * (dl / avgdl));
            score += idf(t) * (f * (k1 + 1.0) / denom);
        }
        if score <= 0.0 {
            continue;
        }
        scored.push(Bm25Hit { score, path: path.clone(), snippet: snippet_for(text, &q_terms) });
    }

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ws() -> (TempDir, Workspace) {
        let dir = TempDir::new().unwrap();
        (dir, Workspace::new(dir.path()))
    }

    #[test]
    fn empty_query_yields_no_hits() {
        let (_t, ws) = ws();
        assert!(search(&ws, "", 10).is_empty());
    }

    #[test]
    fn missing_workspace_files_yield_no_hits() {
        let (_t, ws) = ws();
        assert!(search(&ws, "anything", 10).is_empty());
    }

    #[test]
    fn finds_memory_md_with_snippet() {
        let (_t, ws) = ws();
        fs::write(ws.memory_md(), "## Services\n- foo.service runs on :9000\n").unwrap();
        let hits = search(&ws, ":9000", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "MEMORY.md");
        assert!(hits[0].snippet.contains(":9000"));
    }

    #[test]
    fn scoring_is_deterministic_pure_function() {
        let (_t, ws) = ws();
        fs::write(ws.memory_md(), "- alpha beta gamma\n- alpha only\n").unwrap();
        let a = search(&ws, "alpha", 10);
        let b = search(&ws, "alpha", 10);
        assert_eq!(a, b);
    }

    #[test]
    fn documents_without_matching_terms_are_excluded() {
        let (_t, ws) = ws();
        ws.ensure_memory_dir().unwrap();
        fs::write(ws.daily_md("2024-01-01"), "- totally unrelated content\n").unwrap();
        fs::write(ws.memory_md(), "- query-term-here present\n").unwrap();
        let hits = search(&ws, "query-term-here", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "MEMORY.md");
    }
}
