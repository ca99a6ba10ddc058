//! Crate-wide error type.
//!
//! One [`HmError`] enum is the error currency for every public function.
//! `NotFound`, `LockTimeout`, `SchemaMismatch`, `BackendUnavailable`,
//! `ValidationRejected` and `InvariantViolation` are the error kinds this
//! system defines; the remaining variants wrap the foreign error types
//! components are built on.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HmError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("lock timeout acquiring {path}")]
    LockTimeout { path: PathBuf },

    #[error("schema mismatch in {store}: {detail}")]
    SchemaMismatch { store: String, detail: String },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("validation rejected: {0}")]
    ValidationRejected(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding error: {0}")]
    Embedding(String),
}

pub type Result<T> = std::result::Result<T, HmError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn lock_timeout_displays_path() {
        let e = HmError::LockTimeout { path: PathBuf::from("memory/.journal.lock") };
        assert!(e.to_string().contains(".journal.lock"));
    }

    #[test]
    fn io_error_converts_via_from() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let e: HmError = io.into();
        assert!(matches!(e, HmError::Io(_)));
        let _: &dyn Error = &e;
    }

    #[test]
    fn schema_mismatch_carries_store_name() {
        let e = HmError::SchemaMismatch { store: "fts".into(), detail: "missing doc_id".into() };
        assert!(e.to_string().contains("fts"));
    }
}
