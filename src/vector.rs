//! Local dense-vector semantic layer (C7).
//!
//! Embeds curated chunks with an external embedding service and stores the
//! resulting vectors as BLOBs in a SQLite-backed keyed index, keyed by
//! `(doc_id, source_key, chunk_ix, model_id)`. Search is a brute-force
//! cosine scan — fine at the scale of a single developer's curated memory.

use std::fs;
use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::chunks::{iter_semantic_chunks, Chunk};
use crate::embedding::EmbeddingClient;
use crate::error::Result;

const BATCH_SIZE: usize = 64;

fn open_conn(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(Duration::from_millis(5_000))?;
    Ok(conn)
}

pub fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS hm_local_embedding (
            id INTEGER PRIMARY KEY,
            doc_id TEXT NOT NULL,
            source TEXT NOT NULL,
            source_key TEXT NOT NULL,
            chunk_ix INTEGER NOT NULL,
            content TEXT NOT NULL,
            content_sha TEXT NOT NULL,
            model_id TEXT NOT NULL,
            dims INTEGER NOT NULL,
            vector BLOB NOT NULL,
            updated_at INTEGER NOT NULL DEFAULT 0,
            UNIQUE(doc_id, source_key, chunk_ix, model_id)
        );",
    )?;
    Ok(())
}

fn content_sha(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

fn blob_to_vec(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    pub considered: usize,
    pub embedded: usize,
    pub unchanged: usize,
}

/// Embed and upsert every curated chunk not already stored with a matching
/// `content_sha` under `model_id`. Batches embedding calls `BATCH_SIZE` at a
/// time with the `"passage: "` prefix.
pub fn build_index(
    db_path: &Path,
    workspace_root: &Path,
    client: &EmbeddingClient,
    model_id: &str,
    include_pending: bool,
) -> Result<IndexStats> {
    let conn = open_conn(db_path)?;
    ensure_schema(&conn)?;

    let chunks = iter_semantic_chunks(workspace_root, include_pending);
    let mut stats = IndexStats { considered: chunks.len(), ..Default::default() };

    for batch in chunks.chunks(BATCH_SIZE) {
        let pending: Vec<&Chunk> = batch
            .iter()
            .filter(|c| !already_current(&conn, c, model_id).unwrap_or(false))
            .collect();
        if pending.is_empty() {
            stats.unchanged += batch.len();
            continue;
        }
        stats.unchanged += batch.len() - pending.len();

        let texts: Vec<String> = pending.iter().map(|c| c.text.clone()).collect();
        let vectors = client.embed_passages(&texts)?;

        for (chunk, vector) in pending.iter().zip(vectors.iter()) {
            upsert(&conn, chunk, model_id, vector)?;
            stats.embedded += 1;
        }
    }

    Ok(stats)
}

fn already_current(conn: &Connection, chunk: &Chunk, model_id: &str) -> Result<bool> {
    let sha = content_sha(&chunk.text);
    let existing: Option<String> = conn
        .query_row(
            "SELECT content_sha FROM hm_local_embedding
             WHERE doc_id = ?1 AND source_key = ?2 AND chunk_ix = ?3 AND model_id = ?4",
            (&chunk.doc_id, &chunk.source_key, chunk.chunk_ix, model_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(existing.as_deref() == Some(sha.as_str()))
}

fn upsert(conn: &Connection, chunk: &Chunk, model_id: &str, vector: &[f32]) -> Result<()> {
    conn.execute(
        "INSERT INTO hm_local_embedding
            (doc_id, source, source_key, chunk_ix, content, content_sha, model_id, dims, vector, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9, strftime('%s','now'))
         ON CONFLICT(doc_id, source_key, chunk_ix, model_id) DO UPDATE SET
            content = excluded.content,
            content_sha = excluded.content_sha,
            dims = excluded.dims,
            vector = excluded.vector,
            updated_at = excluded.updated_at
         WHERE hm_local_embedding.content_sha <> excluded.content_sha",
        (
            &chunk.doc_id,
            &chunk.source,
            &chunk.source_key,
            chunk.chunk_ix,
            &chunk.text,
            content_sha(&chunk.text),
            model_id,
            vector.len() as i64,
            vec_to_blob(vector),
        ),
    )?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub doc_id: String,
    pub source_key: String,
    pub chunk_ix: i64,
    pub content: String,
    pub similarity: f64,
}

/// Embed `query` with the `"query: "` prefix and rank every stored vector
/// by cosine similarity, descending.
pub fn search(db_path: &Path, client: &EmbeddingClient, query: &str, limit: usize) -> Result<Vec<VectorHit>> {
    if !db_path.is_file() {
        return Ok(Vec::new());
    }
    let conn = open_conn(db_path)?;
    ensure_schema(&conn)?;

    let q_vec = client.embed_query(query)?;

    let mut stmt = conn.prepare("SELECT doc_id, source_key, chunk_ix, content, vector FROM hm_local_embedding")?;
    let rows = stmt.query_map([], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, i64>(2)?,
            r.get::<_, String>(3)?,
            r.get::<_, Vec<u8>>(4)?,
        ))
    })?;

    let mut hits = Vec::new();
    for row in rows {
        let (doc_id, source_key, chunk_ix, content, blob) = row?;
        let v = blob_to_vec(&blob);
        let similarity = cosine_similarity(&q_vec, &v);
        hits.push(VectorHit { doc_id, source_key, chunk_ix, content, similarity });
    }

    hits.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(limit);
    Ok(hits)
}
