//! Tracing initialization.
//!
//! Callers init once at startup, typically before config is even fully
//! resolved, so this takes a bare level string rather than a `Config`.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

use crate::error::{HmError, Result};

static INIT: Once = Once::new();

/// Initialize the global tracing subscriber at `level` (e.g. `"info"`).
///
/// Safe to call more than once — only the first call takes effect, matching
/// `tracing`'s own global-subscriber-is-set-once constraint.
pub fn init(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .map_err(|e| HmError::Config(format!("invalid log level {level:?}: {e}")))?;

    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        assert!(init("info").is_ok());
        assert!(init("debug").is_ok());
    }

    #[test]
    fn rejects_invalid_level() {
        // A fresh process-wide filter string that's syntactically invalid.
        assert!(init("not a valid directive===").is_err());
    }
}
