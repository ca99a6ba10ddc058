//! Deterministic regex-based entity/fact index (C5).
//!
//! `hm_entity(entity, attr, value, source, ts_ms, raw)` is a flat keyed
//! store, not a graph — rebuilt destructively from the journal and curated
//! chunks on every call to [`rebuild`].

use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use rusqlite::Connection;

use crate::chunks::iter_semantic_chunks;
use crate::error::Result;
use crate::journal::read_events;
use crate::workspace::Workspace;

static SERVICE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b([a-zA-Z0-9][\w-]*\.service)\b").unwrap());
static PORT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r":([0-9]{2,5})\b").unwrap());
static ERROR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b([A-Z]{3,}:?[A-Z0-9_]{3,})\b").unwrap());
static NODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bnode-[a-z0-9][a-z0-9-]*\b").unwrap());
static PATH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(/[^\s]+)\b").unwrap());

fn open_conn(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(Duration::from_millis(5_000))?;
    Ok(conn)
}

pub fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS hm_entity (
            entity TEXT NOT NULL,
            attr TEXT NOT NULL,
            value TEXT NOT NULL,
            source TEXT NOT NULL,
            ts_ms INTEGER NOT NULL DEFAULT 0,
            raw TEXT NOT NULL DEFAULT '',
            PRIMARY KEY(entity, attr, value, source, ts_ms)
        );
        CREATE INDEX IF NOT EXISTS hm_entity_entity ON hm_entity(entity);
        CREATE INDEX IF NOT EXISTS hm_entity_value ON hm_entity(value);
        CREATE INDEX IF NOT EXISTS hm_entity_attr ON hm_entity(attr);",
    )?;
    Ok(())
}

fn emit(conn: &Connection, entity: &str, attr: &str, value: &str, source: &str, ts_ms: i64, raw: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO hm_entity(entity, attr, value, source, ts_ms, raw) VALUES (?1,?2,?3,?4,?5,?6)",
        (entity, attr, value, source, ts_ms, raw),
    )?;
    Ok(())
}

/// Extract entity facts from one piece of text and write them (idempotently) to `conn`.
/// Returns the number of facts emitted (counting duplicates, which `INSERT OR IGNORE` collapses on write).
pub fn extract_from_text(conn: &Connection, text: &str, source: &str, ts_ms: i64) -> Result<usize> {
    let mut n = 0usize;

    let services: Vec<&str> = SERVICE_RE.captures_iter(text).map(|c| c.get(1).unwrap().as_str()).collect();
    let ports: Vec<&str> = PORT_RE.captures_iter(text).map(|c| c.get(1).unwrap().as_str()).collect();
    if !services.is_empty() && !ports.is_empty() {
        for s in &services {
            for p in &ports {
                emit(conn, s, "port", &format!(":{p}"), source, ts_ms, text)?;
                n += 1;
            }
        }
    }

    for m in NODE_RE.find_iter(text) {
        emit(conn, m.as_str(), "type", "node", source, ts_ms, text)?;
        n += 1;
    }

    for caps in ERROR_RE.captures_iter(text) {
        let tok = caps.get(1).unwrap().as_str();
        if tok.starts_with("HTTP") || tok == "OK" || tok == "FAIL" || tok.len() > 32 || tok.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        emit(conn, tok, "type", "error", source, ts_ms, text)?;
        n += 1;
    }

    for caps in PATH_RE.captures_iter(text) {
        let p = caps.get(1).unwrap().as_str();
        if p.len() < 2 {
            continue;
        }
        emit(conn, p, "type", "path", source, ts_ms, text)?;
        n += 1;
    }

    Ok(n)
}

#[derive(Debug, Clone, Default)]
pub struct RebuildStats {
    pub rows: usize,
    pub emitted: usize,
}

/// Destructively rebuild the entity index: delete everything, replay every
/// journal event, then replay every curated (and optionally pending) chunk.
pub fn rebuild(ws: &Workspace, include_pending: bool) -> Result<RebuildStats> {
    let conn = open_conn(&ws.entity_sqlite())?;
    ensure_schema(&conn)?;

    conn.execute("DELETE FROM hm_entity", [])?;

    let mut total = 0usize;
    for ev in read_events(ws)? {
        total += extract_from_text(&conn, &ev.message, &format!("journal:{}", ev.channel), ev.ts_ms)?;
    }

    for chunk in iter_semantic_chunks(ws.root(), include_pending) {
        let source = format!("{}:{}#{}", chunk.doc_id, chunk.source_key, chunk.chunk_ix);
        total += extract_from_text(&conn, &chunk.text, &source, 0)?;
    }

    let rows: i64 = conn.query_row("SELECT COUNT(*) FROM hm_entity", [], |r| r.get(0))?;
    Ok(RebuildStats { rows: rows as usize, emitted: total })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityHit {
    pub entity: String,
    pub attr: String,
    pub value: String,
    pub source: String,
    pub score: f64,
}

/// Search the entity index. A query containing a service token biases to
/// an exact `entity =` match (score 2.0); otherwise a LIKE scan across
/// `entity`/`value`/`raw` (score 1.0). Returns empty, never an error, when
/// the store doesn't exist.
pub fn search(ws: &Workspace, query: &str, limit: usize) -> Result<Vec<EntityHit>> {
    let db_path = ws.entity_sqlite();
    if !db_path.is_file() {
        return Ok(Vec::new());
    }
    let q = query.trim();
    if q.is_empty() {
        return Ok(Vec::new());
    }

    let conn = open_conn(&db_path)?;
    ensure_schema(&conn)?;

    let service = SERVICE_RE.captures(q).map(|c| c.get(1).unwrap().as_str().to_string());

    let mut out = Vec::new();
    if let Some(service) = &service {
        let mut stmt = conn.prepare(
            "SELECT entity, attr, value, source FROM hm_entity WHERE entity = ?1 ORDER BY ts_ms DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map((service, limit as i64), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?, r.get::<_, String>(3)?))
        })?;
        for row in rows {
            let (entity, attr, value, source) = row?;
            let score = if &entity == service { 2.0 } else { 1.0 };
            out.push(EntityHit { entity, attr, value, source, score });
        }
    } else {
        let like = format!("%{q}%");
        let mut stmt = conn.prepare(
            "SELECT entity, attr, value, source FROM hm_entity
             WHERE entity LIKE ?1 OR value LIKE ?1 OR raw LIKE ?1
             ORDER BY ts_ms DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map((&like, limit as i64), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?, r.get::<_, String>(3)?))
        })?;
        for row in rows {
            let (entity, attr, value, source) = row?;
            out.push(EntityHit { entity, attr, value, source, score: 1.0 });
        }
    }

    Ok(out)
}
