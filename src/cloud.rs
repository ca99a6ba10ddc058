//! Remote curated memory sync (C8).
//!
//! Pending items (`- [M1..M5] text` bullets in the staging file) above the
//! configured score threshold are redacted, allowlist-checked, embedded,
//! and committed to a namespaced SQLite-backed curated store. Push/redaction
//! activity is append-logged for audit, but the audit log never carries raw
//! bullet text — only rule names and counts.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::Path;
use std::sync::LazyLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use regex::Regex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::redaction::{redact, validate_allowlist};
use crate::workspace::Workspace;

static SCORE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*-\s*\[M([1-5])\]\s+(.*)$").unwrap());

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

fn content_sha(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

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
        "CREATE TABLE IF NOT EXISTS hm_cloud_item (
            id INTEGER PRIMARY KEY,
            namespace TEXT NOT NULL,
            content TEXT NOT NULL,
            content_sha TEXT NOT NULL,
            score INTEGER NOT NULL,
            source_meta TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE(namespace, content_sha)
        );
        CREATE INDEX IF NOT EXISTS hm_cloud_item_ns_created
            ON hm_cloud_item(namespace, created_at DESC);
        CREATE TABLE IF NOT EXISTS hm_cloud_embedding (
            item_id INTEGER NOT NULL REFERENCES hm_cloud_item(id),
            model_id TEXT NOT NULL,
            dims INTEGER NOT NULL,
            vector BLOB NOT NULL,
            updated_at INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY(item_id, model_id)
        );",
    )?;
    Ok(())
}

/// The fixed `source_meta` recorded against every curated item pulled from
/// the pending-staging file — the only input source `prepare_payload` reads.
const PENDING_SOURCE_META: &str = "memory/staging/MEMORY.pending.md";

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingItem {
    score: u8,
    text: String,
}

/// Parse `- [M1..M5] text` bullets, keeping only `score >= threshold`.
fn parse_pending(text: &str, threshold: i32) -> Vec<PendingItem> {
    let mut out = Vec::new();
    for line in text.lines() {
        let Some(caps) = SCORE_RE.captures(line) else { continue };
        let score: u8 = caps[1].parse().unwrap_or(0);
        if (score as i32) < threshold {
            continue;
        }
        let body = caps[2].trim();
        if body.is_empty() {
            continue;
        }
        out.push(PendingItem { score, text: body.to_string() });
    }
    out
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedItem {
    pub score: u8,
    pub content: String,
    pub content_sha: String,
    pub redactions: usize,
    pub rules: Vec<String>,
    pub source_meta: String,
    /// Not part of the on-disk payload format — committed straight to the
    /// embedding table within the same process that prepared it.
    #[serde(skip)]
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedItem {
    pub content_sha: String,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PreparedPayload {
    pub namespace: String,
    pub threshold: i32,
    pub allowlist: bool,
    pub model_id: String,
    pub dims: usize,
    pub count: usize,
    pub skipped: usize,
    pub items: Vec<PreparedItem>,
    pub rejected: Vec<RejectedItem>,
}

#[derive(Serialize)]
struct RedactionAuditLine<'a> {
    ts_ms: i64,
    content_sha: &'a str,
    redaction_count: usize,
    matched_rules: &'a [String],
    allowed: bool,
}

fn append_jsonl_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    f.write_all(line.as_bytes())?;
    f.write_all(b"\n")?;
    f.flush()?;
    Ok(())
}

/// Read pending bullets at or above `threshold`, redact each (allowlist
/// validation runs on the *redacted* text, matching the upstream
/// reference's `prepare_payload` ordering), embed the survivors with
/// `"passage: "`, and write `cloud-push.payload.json` + an append-only
/// redaction audit trail that never repeats raw text.
pub fn prepare_payload(
    ws: &Workspace,
    namespace: &str,
    model_id: &str,
    threshold: i32,
    allowlist_enabled: bool,
    client: &EmbeddingClient,
) -> Result<PreparedPayload> {
    let raw = fs::read_to_string(ws.pending_md()).unwrap_or_default();
    let pending = parse_pending(&raw, threshold);

    // (score, sha, redacted_text, redaction_count, matched_rules)
    let mut survivors: Vec<(u8, String, String, usize, Vec<String>)> = Vec::new();
    let mut rejected = Vec::new();

    for item in &pending {
        let rr = redact(&item.text);
        let sha = content_sha(&rr.text);

        let (allowed, reasons) = if allowlist_enabled {
            validate_allowlist(&rr.text)
        } else {
            (true, Vec::new())
        };

        let audit = RedactionAuditLine {
            ts_ms: now_ms(),
            content_sha: &sha,
            redaction_count: rr.redaction_count,
            matched_rules: &rr.matched_rules,
            allowed,
        };
        if let Err(e) = append_jsonl_line(&ws.cloud_redaction_jsonl(), &serde_json::to_string(&audit)?) {
            warn!(error = %e, "cloud: failed to write redaction audit line");
        }

        if allowed {
            survivors.push((item.score, sha, rr.text, rr.redaction_count, rr.matched_rules));
        } else {
            rejected.push(RejectedItem { content_sha: sha, reasons });
        }
    }

    let texts: Vec<String> = survivors.iter().map(|(_, _, text, _, _)| text.clone()).collect();
    let vectors = if texts.is_empty() { Vec::new() } else { client.embed_passages(&texts)? };

    let dims = vectors.first().map(|v| v.len()).unwrap_or(0);

    let items: Vec<PreparedItem> = survivors
        .into_iter()
        .zip(vectors)
        .map(|((score, sha, text, redactions, rules), vector)| PreparedItem {
            score,
            content: text,
            content_sha: sha,
            redactions,
            rules,
            source_meta: PENDING_SOURCE_META.to_string(),
            vector,
        })
        .collect();

    let payload = PreparedPayload {
        namespace: namespace.to_string(),
        threshold,
        allowlist: allowlist_enabled,
        model_id: model_id.to_string(),
        dims,
        count: items.len(),
        skipped: rejected.len(),
        items,
        rejected,
    };

    ws.ensure_staging_dir()?;
    fs::write(ws.cloud_push_payload_json(), serde_json::to_string_pretty(&payload)?)?;

    Ok(payload)
}

#[derive(Debug, Clone, Default)]
pub struct CommitStats {
    pub committed: usize,
    pub total: usize,
}

/// Upsert every accepted item into the curated store and append one
/// `cloud-sync.jsonl` push line per item committed. Commits are per-item,
/// not transactional: the first backend error stops the loop and is
/// returned alongside the count already committed.
pub fn commit_payload(ws: &Workspace, db_path: &Path, payload: &PreparedPayload) -> Result<CommitStats> {
    let conn = open_conn(db_path)?;
    ensure_schema(&conn)?;

    let mut stats = CommitStats { committed: 0, total: payload.items.len() };

    for item in &payload.items {
        commit_one(&conn, &payload.namespace, &payload.model_id, item)?;

        let line = serde_json::json!({
            "ts_ms": now_ms(),
            "namespace": payload.namespace,
            "content_sha": item.content_sha,
        });
        append_jsonl_line(&ws.cloud_sync_jsonl(), &serde_json::to_string(&line)?)?;

        stats.committed += 1;
    }

    Ok(stats)
}

fn commit_one(conn: &Connection, namespace: &str, model_id: &str, item: &PreparedItem) -> Result<()> {
    let created_at = now_ms();
    conn.execute(
        "INSERT INTO hm_cloud_item(namespace, content, content_sha, score, source_meta, created_at)
         VALUES (?1,?2,?3,?4,?5,?6)
         ON CONFLICT(namespace, content_sha) DO UPDATE SET content = excluded.content, score = excluded.score, source_meta = excluded.source_meta",
        (namespace, &item.content, &item.content_sha, item.score, &item.source_meta, created_at),
    )?;
    let item_id: i64 = conn.query_row(
        "SELECT id FROM hm_cloud_item WHERE namespace = ?1 AND content_sha = ?2",
        (namespace, &item.content_sha),
        |r| r.get(0),
    )?;

    let blob: Vec<u8> = item.vector.iter().flat_map(|f| f.to_le_bytes()).collect();
    conn.execute(
        "INSERT INTO hm_cloud_embedding(item_id, model_id, dims, vector, updated_at) VALUES (?1,?2,?3,?4,?5)
         ON CONFLICT(item_id, model_id) DO UPDATE SET dims = excluded.dims, vector = excluded.vector, updated_at = excluded.updated_at",
        (item_id, model_id, item.vector.len() as i64, blob, created_at),
    )?;
    Ok(())
}

/// Pull every curated item for `namespace`, deduped by sha prefix against
/// what's already recorded in `MEMORY.cloud.md`, and append only the new ones.
pub fn pull_curated(ws: &Workspace, db_path: &Path, namespace: &str) -> Result<usize> {
    if !db_path.is_file() {
        return Ok(0);
    }
    let conn = open_conn(db_path)?;
    ensure_schema(&conn)?;

    let existing = fs::read_to_string(ws.cloud_md()).unwrap_or_default();
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
    for line in existing.lines() {
        if let Some(rest) = line.strip_prefix("- [sha=") {
            if let Some(end) = rest.find(']') {
                seen.insert(rest[..end].to_string());
            }
        }
    }

    let mut stmt = conn.prepare(
        "SELECT content_sha, content FROM hm_cloud_item WHERE namespace = ?1 ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map([namespace], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;

    let mut new_lines = String::new();
    let mut appended = 0usize;
    for row in rows {
        let (sha, content) = row?;
        if seen.contains(&sha) {
            continue;
        }
        new_lines.push_str(&format!("- [sha={sha}] {content}\n"));
        appended += 1;
    }

    if appended > 0 {
        ws.ensure_staging_dir()?;
        let mut f = OpenOptions::new().create(true).append(true).open(ws.cloud_md())?;
        f.write_all(new_lines.as_bytes())?;
        f.flush()?;
    }

    Ok(appended)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CuratedHit {
    pub content: String,
    pub similarity: f64,
}

pub fn search_curated(db_path: &Path, client: &EmbeddingClient, query: &str, namespace: &str, limit: usize) -> Result<Vec<CuratedHit>> {
    if !db_path.is_file() {
        return Ok(Vec::new());
    }
    let conn = open_conn(db_path)?;
    ensure_schema(&conn)?;

    let q_vec = client.embed_query(query)?;

    let mut stmt = conn.prepare(
        "SELECT i.content, e.vector FROM hm_cloud_item i
         JOIN hm_cloud_embedding e ON e.item_id = i.id
         WHERE i.namespace = ?1",
    )?;
    let rows = stmt.query_map([namespace], |r| Ok((r.get::<_, String>(0)?, r.get::<_, Vec<u8>>(1)?)))?;

    let mut hits = Vec::new();
    for row in rows {
        let (content, blob) = row?;
        let v: Vec<f32> = blob.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect();
        let similarity = cosine(&q_vec, &v);
        hits.push(CuratedHit { content, similarity });
    }
    hits.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(limit);
    Ok(hits)
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
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
