//! Incremental full-text index over curated bullets and daily logs (C4).
//!
//! Three tables: `doc_state` (fingerprint tracking), `entry` (one row per
//! chunk), and an `entry_fts` FTS5 virtual table mirroring `entry.text`
//! with `source`/`source_key`/`chunk_ix` carried as unindexed columns.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use std::time::{Duration, UNIX_EPOCH};

use regex::Regex;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::chunks::{extract_curated_chunks, extract_daily_chunks};
use crate::error::Result;
use crate::workspace::Workspace;

static DAILY_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4}-\d{2}-\d{2})\.md$").unwrap());

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

/// `true` when the `entry` table exists but predates the `doc_id` column —
/// the signal for an old-schema store that must be fully rebuilt.
fn needs_schema_rebuild(conn: &Connection) -> Result<bool> {
    let table_exists: bool = conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'entry'",
        [],
        |_| Ok(true),
    ).unwrap_or(false);
    if !table_exists {
        return Ok(false);
    }
    let mut stmt = conn.prepare("SELECT 1 FROM pragma_table_info('entry') WHERE name = 'doc_id'")?;
    Ok(!stmt.exists([])?)
}

fn init_schema(conn: &Connection, full_rebuild: bool) -> Result<()> {
    if full_rebuild {
        conn.execute_batch(
            "DROP TABLE IF EXISTS entry_fts;
             DROP TABLE IF EXISTS entry;
             DROP TABLE IF EXISTS doc_state;",
        )?;
    }

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS doc_state (
            doc_id TEXT PRIMARY KEY,
            fingerprint TEXT NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS entry (
            id INTEGER PRIMARY KEY,
            doc_id TEXT NOT NULL,
            source TEXT NOT NULL,
            source_key TEXT NOT NULL,
            chunk_ix INTEGER NOT NULL,
            text TEXT NOT NULL,
            UNIQUE(source, source_key, chunk_ix)
        );
        CREATE VIRTUAL TABLE IF NOT EXISTS entry_fts USING fts5(
            text,
            source UNINDEXED,
            source_key UNINDEXED,
            chunk_ix UNINDEXED,
            content='entry',
            content_rowid='id'
        );",
    )?;
    Ok(())
}

fn fingerprint_for_path(p: &Path) -> Result<String> {
    let meta = fs::metadata(p)?;
    let mtime_ns = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos();
    let name = p.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    Ok(format!("{name}:{mtime_ns}:{}", meta.len()))
}

fn delete_doc_entries(conn: &Connection, doc_id: &str) -> Result<()> {
    let ids: Vec<i64> = {
        let mut stmt = conn.prepare("SELECT id FROM entry WHERE doc_id = ?1")?;
        let rows = stmt.query_map([doc_id], |r| r.get(0))?;
        rows.collect::<std::result::Result<_, _>>()?
    };
    for id in ids {
        conn.execute(
            "INSERT INTO entry_fts(entry_fts, rowid, text, source, source_key, chunk_ix) VALUES('delete', ?1, '', '', '', '')",
            [id],
        )?;
    }
    conn.execute("DELETE FROM entry WHERE doc_id = ?1", [doc_id])?;
    Ok(())
}

fn upsert_entry(conn: &Connection, doc_id: &str, source: &str, source_key: &str, chunk_ix: i64, text: &str) -> Result<()> {
    let existing: Option<(i64, String)> = conn
        .query_row(
            "SELECT id, text FROM entry WHERE source = ?1 AND source_key = ?2 AND chunk_ix = ?3",
            (source, source_key, chunk_ix),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .ok();

    if let Some((id, old_text)) = existing {
        if old_text != text {
            conn.execute("UPDATE entry SET doc_id = ?1, text = ?2 WHERE id = ?3", (doc_id, text, id))?;
            conn.execute(
                "INSERT INTO entry_fts(entry_fts, rowid, text, source, source_key, chunk_ix) VALUES('delete', ?1, '', '', '', '')",
                [id],
            )?;
            conn.execute(
                "INSERT INTO entry_fts(rowid, text, source, source_key, chunk_ix) VALUES (?1,?2,?3,?4,?5)",
                (id, text, source, source_key, chunk_ix),
            )?;
        }
        return Ok(());
    }

    conn.execute(
        "INSERT INTO entry(doc_id, source, source_key, chunk_ix, text) VALUES (?1,?2,?3,?4,?5)",
        (doc_id, source, source_key, chunk_ix, text),
    )?;
    let id = conn.last_insert_rowid();
    conn.execute(
        "INSERT INTO entry_fts(rowid, text, source, source_key, chunk_ix) VALUES (?1,?2,?3,?4,?5)",
        (id, text, source, source_key, chunk_ix),
    )?;
    Ok(())
}

fn stamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default)]
pub struct BuildResult {
    pub full_rebuild: bool,
    pub docs_indexed: usize,
}

/// Incrementally (re)build the FTS index from `MEMORY.md` and every daily
/// file. Unchanged docs (same fingerprint) are skipped unless `force`.
pub fn build_index(ws: &Workspace, force: bool) -> Result<BuildResult> {
    let db_path = ws.supermemory_sqlite();
    let conn = open_conn(&db_path)?;

    let full_rebuild = needs_schema_rebuild(&conn)?;
    init_schema(&conn, full_rebuild)?;

    let mut docs_indexed = 0usize;

    let mem_path = ws.memory_md();
    if mem_path.is_file() {
        let doc_id = "MEMORY.md";
        let fp = fingerprint_for_path(&mem_path)?;
        let stored: Option<String> = conn
            .query_row("SELECT fingerprint FROM doc_state WHERE doc_id = ?1", [doc_id], |r| r.get(0))
            .ok();
        if force || stored.as_deref() != Some(fp.as_str()) {
            delete_doc_entries(&conn, doc_id)?;
            let text = fs::read_to_string(&mem_path)?;
            for chunk in extract_curated_chunks(doc_id, "memory", &text) {
                upsert_entry(&conn, doc_id, &chunk.source, &chunk.source_key, chunk.chunk_ix, &chunk.text)?;
            }
            conn.execute(
                "INSERT INTO doc_state(doc_id, fingerprint, updated_at_ms) VALUES (?1,?2,?3)
                 ON CONFLICT(doc_id) DO UPDATE SET fingerprint = excluded.fingerprint, updated_at_ms = excluded.updated_at_ms",
                (doc_id, &fp, stamp_ms()),
            )?;
            docs_indexed += 1;
        }
    }

    let mut seen_doc_ids: Vec<String> = Vec::new();
    let mdir = ws.memory_dir();
    if mdir.is_dir() {
        let mut names: Vec<String> = fs::read_dir(&mdir)?
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| DAILY_NAME_RE.is_match(n))
            .collect();
        names.sort();

        for name in names {
            let path = mdir.join(&name);
            let doc_id = format!("memory/{name}");
            seen_doc_ids.push(doc_id.clone());

            let fp = fingerprint_for_path(&path)?;
            let stored: Option<String> = conn
                .query_row("SELECT fingerprint FROM doc_state WHERE doc_id = ?1", [&doc_id], |r| r.get(0))
                .ok();
            if !force && stored.as_deref() == Some(fp.as_str()) {
                continue;
            }

            delete_doc_entries(&conn, &doc_id)?;
            let day = name.trim_end_matches(".md");
            let text = fs::read_to_string(&path)?;
            for chunk in extract_daily_chunks(&doc_id, day, &text) {
                upsert_entry(&conn, &doc_id, &chunk.source, &chunk.source_key, chunk.chunk_ix, &chunk.text)?;
            }
            conn.execute(
                "INSERT INTO doc_state(doc_id, fingerprint, updated_at_ms) VALUES (?1,?2,?3)
                 ON CONFLICT(doc_id) DO UPDATE SET fingerprint = excluded.fingerprint, updated_at_ms = excluded.updated_at_ms",
                (&doc_id, &fp, stamp_ms()),
            )?;
            docs_indexed += 1;
        }

        let stale: Vec<String> = {
            let mut stmt = conn.prepare("SELECT doc_id FROM doc_state WHERE doc_id LIKE 'memory/%'")?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        for doc_id in stale {
            if !seen_doc_ids.contains(&doc_id) {
                delete_doc_entries(&conn, &doc_id)?;
                conn.execute("DELETE FROM doc_state WHERE doc_id = ?1", [&doc_id])?;
            }
        }
    }

    debug!(docs_indexed, full_rebuild, "fts: build_index done");
    Ok(BuildResult { full_rebuild, docs_indexed })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtsHit {
    pub source: String,
    pub source_key: String,
    pub chunk_ix: i64,
    pub text: String,
}

/// Escape a query for FTS5 MATCH by doubling `"` and wrapping the whole
/// thing in quotes — this treats the query as one exact phrase rather
/// than FTS5 query-syntax operators.
pub fn escape_fts5_query(query: &str) -> String {
    format!("\"{}\"", query.replace('"', "\"\""))
}

/// Search the FTS index. Returns an empty result (never an error) when the
/// store does not exist yet.
pub fn fts_search(ws: &Workspace, query: &str, limit: usize) -> Result<Vec<FtsHit>> {
    let db_path = ws.supermemory_sqlite();
    if !db_path.is_file() {
        return Ok(Vec::new());
    }
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let conn = open_conn(&db_path)?;
    let escaped = escape_fts5_query(query);

    let mut stmt = conn.prepare(
        "SELECT source, source_key, chunk_ix, substr(text, 1, 180)
         FROM entry_fts
         WHERE entry_fts MATCH ?1
         ORDER BY rank
         LIMIT ?2",
    )?;
    let rows = stmt.query_map((escaped, limit as i64), |r| {
        Ok(FtsHit {
            source: r.get(0)?,
            source_key: r.get(1)?,
            chunk_ix: r.get(2)?,
            text: r.get(3)?,
        })
    });

    match rows {
        Ok(rows) => Ok(rows.collect::<std::result::Result<_, _>>()?),
        Err(e) => {
            warn!(error = %e, "fts: search failed");
            Ok(Vec::new())
        }
    }
}
