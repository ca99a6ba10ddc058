//! Append-only event journal with derived projections (C3).
//!
//! The journal is the single source of truth. `last-messages.jsonl` (tail
//! window) and the per-day markdown files are *projections*: best-effort,
//! rebuildable, never load-bearing for durability.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{HmError, Result};
use crate::workspace::Workspace;

const LOCK_POLL: Duration = Duration::from_millis(50);
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_TAIL_LIMIT: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub ts_ms: i64,
    pub channel: String,
    pub session_key: String,
    pub role: String,
    pub message: String,
}

/// Parameters for [`append`]; `ts_ms` defaults to the current time when `None`.
#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub message: String,
    pub role: String,
    pub channel: String,
    pub session_key: String,
    pub ts_ms: Option<i64>,
}

impl Default for AppendRequest {
    fn default() -> Self {
        AppendRequest {
            message: String::new(),
            role: "user".into(),
            channel: "unknown".into(),
            session_key: String::new(),
            ts_ms: None,
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn day_from_ts_ms(ts_ms: i64) -> String {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
        .format("%Y-%m-%d")
        .to_string()
}

struct DirLock {
    path: PathBuf,
}

impl DirLock {
    fn acquire(path: PathBuf) -> Result<Self> {
        let start = Instant::now();
        loop {
            match fs::create_dir(&path) {
                Ok(()) => return Ok(DirLock { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if start.elapsed() > LOCK_TIMEOUT {
                        return Err(HmError::LockTimeout { path });
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(HmError::Io(e)),
            }
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = fs::remove_dir(&self.path);
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    f.write_all(line.as_bytes())?;
    if !line.ends_with('\n') {
        f.write_all(b"\n")?;
    }
    f.flush()?;
    f.sync_all()?;
    Ok(())
}

/// Parse every line of `journal.jsonl`, skipping malformed lines, and
/// return events sorted by `ts_ms` ascending.
pub fn read_events(ws: &Workspace) -> Result<Vec<Event>> {
    let path = ws.journal_jsonl();
    let text = match fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(HmError::Io(e)),
    };

    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(line) {
            Ok(ev) => out.push(ev),
            Err(e) => {
                warn!(error = %e, "journal: skipping malformed line");
                continue;
            }
        }
    }
    out.sort_by_key(|e| e.ts_ms);
    Ok(out)
}

fn write_tail_window(ws: &Workspace, events: &[Event], tail_limit: usize) -> Result<()> {
    let tail: &[Event] = if tail_limit == 0 {
        &[]
    } else if events.len() > tail_limit {
        &events[events.len() - tail_limit..]
    } else {
        events
    };
    let mut buf = String::new();
    for ev in tail {
        buf.push_str(&serde_json::to_string(ev)?);
        buf.push('\n');
    }
    fs::write(ws.last_messages_jsonl(), buf)?;
    Ok(())
}

/// Append one event to the journal, then best-effort update both
/// projections. The append itself is durable; projection failures are
/// logged and swallowed — the journal remains the source of truth.
pub fn append(ws: &Workspace, req: AppendRequest) -> Result<Event> {
    ws.ensure_memory_dir()?;

    let ev = Event {
        ts_ms: req.ts_ms.unwrap_or_else(now_ms),
        channel: if req.channel.is_empty() { "unknown".into() } else { req.channel },
        session_key: req.session_key,
        role: if req.role.is_empty() { "user".into() } else { req.role },
        message: req.message,
    };

    let _lock = DirLock::acquire(ws.journal_lock_dir())?;

    append_line(&ws.journal_jsonl(), &serde_json::to_string(&ev)?)?;

    if let Err(e) = update_tail_projection(ws, &ev) {
        warn!(error = %e, "journal: tail projection update failed");
    }
    if let Err(e) = update_daily_projection(ws, &ev) {
        warn!(error = %e, "journal: daily projection update failed");
    }

    Ok(ev)
}

fn update_tail_projection(ws: &Workspace, ev: &Event) -> Result<()> {
    let path = ws.last_messages_jsonl();
    let mut lines: Vec<String> = match fs::read_to_string(&path) {
        Ok(t) => t.lines().map(str::to_string).collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(HmError::Io(e)),
    };
    if DEFAULT_TAIL_LIMIT > 1 && lines.len() > DEFAULT_TAIL_LIMIT - 1 {
        let start = lines.len() - (DEFAULT_TAIL_LIMIT - 1);
        lines.drain(0..start);
    } else if DEFAULT_TAIL_LIMIT <= 1 {
        lines.clear();
    }
    lines.push(serde_json::to_string(ev)?);
    let mut buf = lines.join("\n");
    buf.push('\n');
    fs::write(path, buf)?;
    Ok(())
}

fn update_daily_projection(ws: &Workspace, ev: &Event) -> Result<()> {
    let day = day_from_ts_ms(ev.ts_ms);
    let line = format!("- [{}@{}] {}", ev.role, ev.channel, ev.message);
    append_line(&ws.daily_md(&day), &line)
}

#[derive(Debug, Clone, Default)]
pub struct RebuildStats {
    pub events: usize,
    pub tail: usize,
    pub rebuilt_daily_files: usize,
    pub daily_counts: BTreeMap<String, usize>,
}

/// Rebuild both projections from the journal alone.
///
/// Rewrites `last-messages.jsonl` in place (it is purely derived). Daily
/// files are regenerated non-destructively into `memory/.rebuild/*.md` and
/// then copied out as `YYYY-MM-DD.rebuilt.md` siblings — existing daily
/// files are never overwritten or deleted by a rebuild.
pub fn rebuild_projections(ws: &Workspace, tail_limit: usize) -> Result<RebuildStats> {
    ws.ensure_memory_dir()?;
    let events = read_events(ws)?;

    write_tail_window(ws, &events, tail_limit)?;

    let rebuild_dir = ws.rebuild_dir();
    if rebuild_dir.exists() {
        if let Ok(rd) = fs::read_dir(&rebuild_dir) {
            for entry in rd.flatten() {
                let p = entry.path();
                if p.extension().and_then(|e| e.to_str()) == Some("md") {
                    let _ = fs::remove_file(p);
                }
            }
        }
    }
    fs::create_dir_all(&rebuild_dir)?;

    let mut daily_counts: BTreeMap<String, usize> = BTreeMap::new();
    for ev in &events {
        let day = day_from_ts_ms(ev.ts_ms);
        *daily_counts.entry(day.clone()).or_insert(0) += 1;
        let line = format!("- [{}@{}] {}", ev.role, ev.channel, ev.message);
        append_line(&rebuild_dir.join(format!("{day}.md")), &line)?;
    }

    let mut written = 0usize;
    if let Ok(rd) = fs::read_dir(&rebuild_dir) {
        for entry in rd.flatten() {
            let p = entry.path();
            if p.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let stem = p.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            let target = ws.memory_dir().join(format!("{stem}.rebuilt.md"));
            let content = fs::read_to_string(&p)?;
            fs::write(target, content)?;
            written += 1;
        }
    }

    debug!(events = events.len(), rebuilt = written, "journal: rebuild_projections done");

    let tail = if tail_limit == 0 { 0 } else { events.len().min(tail_limit) };
    Ok(RebuildStats { events: events.len(), tail, rebuilt_daily_files: written, daily_counts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ws() -> (TempDir, Workspace) {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        (dir, ws)
    }

    #[test]
    fn append_then_read_round_trips_sorted_by_ts() {
        let (_t, ws) = ws();
        append(&ws, AppendRequest { message: "second".into(), ts_ms: Some(2_000), ..Default::default() }).unwrap();
        append(&ws, AppendRequest { message: "first".into(), ts_ms: Some(1_000), ..Default::default() }).unwrap();

        let events = read_events(&ws).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "first");
        assert_eq!(events[1].message, "second");
    }

    #[test]
    fn append_writes_daily_projection_bullet() {
        let (_t, ws) = ws();
        append(&ws, AppendRequest {
            message: "set ngx.service port to :8080".into(),
            role: "user".into(),
            channel: "cli".into(),
            ts_ms: Some(1_000),
            ..Default::default()
        }).unwrap();

        let daily = fs::read_to_string(ws.daily_md("1970-01-01")).unwrap();
        assert_eq!(daily.trim(), "- [user@cli] set ngx.service port to :8080");
    }

    #[test]
    fn tail_window_truncates_to_limit() {
        let (_t, ws) = ws();
        for i in 0..5 {
            append(&ws, AppendRequest { message: format!("m{i}"), ts_ms: Some(1_000 + i), ..Default::default() }).unwrap();
        }
        let tail_text = fs::read_to_string(ws.last_messages_jsonl()).unwrap();
        assert_eq!(tail_text.lines().count(), 5);
    }

    #[test]
    fn rebuild_projections_is_non_destructive_to_existing_daily_files() {
        let (_t, ws) = ws();
        append(&ws, AppendRequest { message: "a".into(), ts_ms: Some(1_000), ..Default::default() }).unwrap();
        let original = fs::read_to_string(ws.daily_md("1970-01-01")).unwrap();

        let stats = rebuild_projections(&ws, 200).unwrap();
        assert_eq!(stats.events, 1);
        assert_eq!(stats.rebuilt_daily_files, 1);

        let untouched = fs::read_to_string(ws.daily_md("1970-01-01")).unwrap();
        assert_eq!(original, untouched);
        assert!(ws.memory_dir().join("1970-01-01.rebuilt.md").exists());
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let (_t, ws) = ws();
        ws.ensure_memory_dir().unwrap();
        fs::write(ws.journal_jsonl(), "not json\n{\"ts_ms\":5,\"channel\":\"c\",\"session_key\":\"\",\"role\":\"user\",\"message\":\"ok\"}\n").unwrap();
        let events = read_events(&ws).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "ok");
    }

    #[test]
    fn missing_journal_reads_as_empty() {
        let (_t, ws) = ws();
        assert!(read_events(&ws).unwrap().is_empty());
    }

    #[test]
    fn concurrent_appends_both_survive_intact() {
        let (_t, dir_ws) = ws();
        let root = dir_ws.root().to_path_buf();

        let handles: Vec<_> = ["A", "B"]
            .into_iter()
            .map(|msg| {
                let root = root.clone();
                std::thread::spawn(move || {
                    let ws = Workspace::new(root);
                    append(&ws, AppendRequest { message: msg.into(), ts_ms: Some(1_000), ..Default::default() }).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let events = read_events(&dir_ws).unwrap();
        assert_eq!(events.len(), 2);
        let mut messages: Vec<_> = events.iter().map(|e| e.message.as_str()).collect();
        messages.sort();
        assert_eq!(messages, ["A", "B"]);
    }
}
