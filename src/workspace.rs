//! Workspace layout (C1).
//!
//! Resolves the root directory and the fixed relative path of every
//! persisted artifact under it. Nothing here touches the filesystem except
//! `ensure_memory_dir`/`ensure_staging_dir`, which create missing parent
//! directories before a writer needs them.

use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Workspace { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn memory_md(&self) -> PathBuf {
        self.root.join("MEMORY.md")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.root.join("memory")
    }

    pub fn daily_md(&self, day: &str) -> PathBuf {
        self.memory_dir().join(format!("{day}.md"))
    }

    pub fn journal_jsonl(&self) -> PathBuf {
        self.memory_dir().join("journal.jsonl")
    }

    pub fn last_messages_jsonl(&self) -> PathBuf {
        self.memory_dir().join("last-messages.jsonl")
    }

    pub fn journal_lock_dir(&self) -> PathBuf {
        self.memory_dir().join(".journal.lock")
    }

    pub fn rebuild_dir(&self) -> PathBuf {
        self.memory_dir().join(".rebuild")
    }

    pub fn supermemory_sqlite(&self) -> PathBuf {
        self.memory_dir().join("supermemory.sqlite")
    }

    pub fn entity_sqlite(&self) -> PathBuf {
        self.memory_dir().join("entity.sqlite")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.memory_dir().join("staging")
    }

    pub fn pending_md(&self) -> PathBuf {
        self.staging_dir().join("MEMORY.pending.md")
    }

    pub fn cloud_md(&self) -> PathBuf {
        self.staging_dir().join("MEMORY.cloud.md")
    }

    pub fn cloud_push_payload_json(&self) -> PathBuf {
        self.staging_dir().join("cloud-push.payload.json")
    }

    pub fn cloud_sync_jsonl(&self) -> PathBuf {
        self.memory_dir().join("cloud-sync.jsonl")
    }

    pub fn cloud_redaction_jsonl(&self) -> PathBuf {
        self.memory_dir().join("cloud-redaction.jsonl")
    }

    pub fn ensure_memory_dir(&self) -> Result<()> {
        std::fs::create_dir_all(self.memory_dir())?;
        Ok(())
    }

    pub fn ensure_staging_dir(&self) -> Result<()> {
        std::fs::create_dir_all(self.staging_dir())?;
        Ok(())
    }

    /// `true` when `memory/` exists — the basis for a doctor-style health
    /// probe (the doctor tool itself is an external collaborator).
    pub fn memory_dir_exists(&self) -> bool {
        self.memory_dir().is_dir()
    }
}
