//! Retrieval fusion across every layer (C9).
//!
//! Each layer runs independently and is isolated from the others' failures:
//! a layer that errors or isn't configured contributes nothing rather than
//! failing the whole query. Results are combined with reciprocal-rank
//! fusion (`k = 60`), collapsing hits that resolve to the same chunk and
//! keeping the longest snippet on a collision.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::workspace::Workspace;
use crate::{bm25, cloud, entity, fts, vector};

const RRF_K: f64 = 60.0;
const FTS_LIMIT: usize = 20;
const BM25_LIMIT: usize = 10;
const ENTITY_LIMIT: usize = 8;
const VECTOR_LIMIT: usize = 8;
const CLOUD_LIMIT: usize = 8;

static TARGETED_RX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(gid|id\s+for|what\s+is\s+the|where\s+is|port|:\d{2,5}|config|token|key|password|path)\b").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Targeted,
    Broad,
}

/// Short queries or queries containing a targeting keyword (`gid`,
/// `id for`, `what is the`, `where is`, `port`, a `:PORT` token, `config`,
/// `token`, `key`, `password`, `path`) are treated as targeted (entity
/// layer joins in); everything else is broad.
pub fn detect_mode(query: &str) -> Mode {
    if query.chars().count() < 40 || TARGETED_RX.is_match(query) {
        Mode::Targeted
    } else {
        Mode::Broad
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalHit {
    pub key: String,
    pub snippet: String,
    pub rrf_score: f64,
    pub why: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub mode_was_targeted: bool,
    pub hits: Vec<RetrievalHit>,
    pub advisories: Vec<String>,
}

struct LayerRanking {
    name: &'static str,
    ranked: Vec<(String, String)>, // (key, snippet), already in descending-relevance order
}

/// Within one layer's ranked list, keep only the best (lowest-index) rank
/// per key — a layer returning the same key twice must not contribute RRF
/// mass twice.
fn dedupe_best_rank(ranked: &[(String, String)]) -> Vec<(String, String)> {
    let mut seen = HashMap::new();
    for (i, (key, _)) in ranked.iter().enumerate() {
        seen.entry(key.clone()).or_insert(i);
    }
    let mut best_indices: Vec<usize> = seen.into_values().collect();
    best_indices.sort_unstable();
    best_indices.into_iter().map(|i| ranked[i].clone()).collect()
}

fn fold_rrf(layers: &[LayerRanking]) -> Vec<RetrievalHit> {
    let mut acc: HashMap<String, (f64, String, Vec<&'static str>)> = HashMap::new();

    for layer in layers {
        let deduped = dedupe_best_rank(&layer.ranked);
        for (rank, (key, snippet)) in deduped.iter().enumerate() {
            let contribution = 1.0 / (RRF_K + (rank + 1) as f64);
            let entry = acc.entry(key.clone()).or_insert_with(|| (0.0, snippet.clone(), Vec::new()));
            entry.0 += contribution;
            if snippet.len() > entry.1.len() {
                entry.1 = snippet.clone();
            }
            if !entry.2.contains(&layer.name) {
                entry.2.push(layer.name);
            }
        }
    }

    let mut hits: Vec<RetrievalHit> = acc
        .into_iter()
        .map(|(key, (score, snippet, mut why))| {
            why.sort_unstable();
            RetrievalHit { key, snippet, rrf_score: score, why: why.into_iter().map(str::to_string).collect() }
        })
        .collect();

    hits.sort_by(|a, b| b.rrf_score.partial_cmp(&a.rrf_score).unwrap_or(std::cmp::Ordering::Equal));
    hits
}

/// Run every applicable layer and fuse the results. Never fails outright
/// for a missing backend — a layer that can't run is simply absent, with
/// an advisory recorded when that absence is itself informative (e.g. the
/// entity store hasn't been built yet in targeted mode).
pub fn retrieve(
    ws: &Workspace,
    config: &Config,
    local_client: Option<&EmbeddingClient>,
    cloud_client: Option<&EmbeddingClient>,
    query: &str,
    limit: usize,
) -> Result<RetrievalResult> {
    let mode = detect_mode(query);
    let mut layers: Vec<LayerRanking> = Vec::new();
    let mut advisories = Vec::new();

    match fts::fts_search(ws, query, FTS_LIMIT) {
        Ok(rows) => layers.push(LayerRanking {
            name: "fts",
            ranked: rows
                .into_iter()
                .map(|h| (format!("{}#{}", h.source_key, h.chunk_ix), h.text))
                .collect(),
        }),
        Err(e) => warn!(error = %e, "retrieval: fts layer failed"),
    }

    layers.push(LayerRanking {
        name: "bm25",
        ranked: bm25::search(ws, query, BM25_LIMIT)
            .into_iter()
            .map(|h| (format!("bm25:{}", h.path), h.snippet))
            .collect(),
    });

    if mode == Mode::Targeted {
        if ws.entity_sqlite().is_file() {
            match entity::search(ws, query, ENTITY_LIMIT) {
                Ok(rows) => layers.push(LayerRanking {
                    name: "entity",
                    ranked: rows
                        .into_iter()
                        .map(|h| {
                            let key = format!("entity:{}:{}:{}", h.entity, h.attr, h.value);
                            let snippet = format!("{} {} {}", h.entity, h.attr, h.value);
                            (key, snippet)
                        })
                        .collect(),
                }),
                Err(e) => warn!(error = %e, "retrieval: entity layer failed"),
            }
        } else {
            advisories.push("entity:missing".to_string());
        }
    }

    if let (Some(url), Some(client)) = (&config.local_vector_db, local_client) {
        match vector::search(std::path::Path::new(url), client, query, VECTOR_LIMIT) {
            Ok(rows) => layers.push(LayerRanking {
                name: "vector",
                ranked: rows
                    .into_iter()
                    .map(|h| (format!("{}#{}", h.source_key, h.chunk_ix), h.content))
                    .collect(),
            }),
            Err(e) => warn!(error = %e, "retrieval: vector layer failed"),
        }
    }

    if config.cloud_fallback {
        if let (Some(url), Some(client)) = (&config.cloud_database_url, cloud_client) {
            match cloud::search_curated(std::path::Path::new(url), client, query, &config.cloud_namespace, CLOUD_LIMIT) {
                Ok(rows) => layers.push(LayerRanking {
                    name: "cloud",
                    ranked: rows.into_iter().map(|h| (format!("cloud:{}", h.content), h.content)).collect(),
                }),
                Err(e) => warn!(error = %e, "retrieval: cloud layer failed"),
            }
        }
    }

    let mut hits = fold_rrf(&layers);
    hits.truncate(limit);

    Ok(RetrievalResult { mode_was_targeted: mode == Mode::Targeted, hits, advisories })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn ws() -> (TempDir, Workspace) {
        let dir = TempDir::new().unwrap();
        (dir, Workspace::new(dir.path()))
    }

    #[test]
    fn short_query_is_targeted() {
        assert_eq!(detect_mode("node-a1"), Mode::Targeted);
    }

    #[test]
    fn long_freeform_query_is_broad() {
        let q = "what were the general conclusions from last week's retrospective discussion";
        assert!(q.chars().count() >= 40);
        assert_eq!(detect_mode(q), Mode::Broad);
    }

    #[test]
    fn port_mention_forces_targeted_even_if_long() {
        let q = "could you remind me what port the authentication gateway service listens on :8443 again";
        assert_eq!(detect_mode(q), Mode::Targeted);
    }

    #[test]
    fn rrf_fold_combines_layers_and_sorts_descending() {
        let layers = vec![
            LayerRanking { name: "fts", ranked: vec![("a".into(), "alpha".into()), ("b".into(), "beta".into())] },
            LayerRanking { name: "bm25", ranked: vec![("a".into(), "alpha longer snippet".into())] },
        ];
        let hits = fold_rrf(&layers);
        assert_eq!(hits[0].key, "a");
        assert_eq!(hits[0].snippet, "alpha longer snippet");
        assert_eq!(hits[0].why, vec!["bm25", "fts"]);
    }

    #[test]
    fn rrf_fold_is_idempotent_under_duplicate_keys_within_a_layer() {
        let single = vec![LayerRanking { name: "fts", ranked: vec![("a".into(), "alpha".into())] }];
        let duplicated = vec![LayerRanking {
            name: "fts",
            ranked: vec![("a".into(), "alpha".into()), ("a".into(), "alpha".into()), ("b".into(), "beta".into())],
        }];
        let single_hits = fold_rrf(&single);
        let dup_hits = fold_rrf(&duplicated);
        let a_single = single_hits.iter().find(|h| h.key == "a").unwrap();
        let a_dup = dup_hits.iter().find(|h| h.key == "a").unwrap();
        assert_eq!(a_single.rrf_score, a_dup.rrf_score);
    }

    #[test]
    fn missing_entity_store_in_targeted_mode_yields_advisory() {
        let (_t, ws) = ws();
        let config = Config::test_default(ws.root());
        let result = retrieve(&ws, &config, None, None, "node-a1", 10).unwrap();
        assert!(result.mode_was_targeted);
        assert!(result.advisories.contains(&"entity:missing".to_string()));
    }

    #[test]
    fn fts_and_bm25_layers_surface_a_curated_bullet_without_vector_or_cloud_configured() {
        let (_t, ws) = ws();
        fs::write(ws.memory_md(), "## Services\n- auth.service listens on :8443\n").unwrap();
        fts::build_index(&ws, false).unwrap();

        let config = Config::test_default(ws.root());
        let result = retrieve(&ws, &config, None, None, ":8443", 10).unwrap();
        assert!(!result.hits.is_empty());
        assert!(result.hits.iter().any(|h| h.why.contains(&"fts".to_string())));
    }
}
