//! Configuration loading with env-var overrides.
//!
//! Unlike the layered TOML configs elsewhere in this ecosystem, this
//! system has no config file (§6): every setting is read from the
//! environment. `Config::from_env` resolves a raw snapshot of the
//! process environment into typed, validated fields once at startup;
//! everything downstream consumes the resolved [`Config`].

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{HmError, Result};

/// Resolved configuration for one workspace session.
#[derive(Debug, Clone)]
pub struct Config {
    pub workspace: PathBuf,
    pub local_vector_db: Option<String>,
    pub embed_url: String,
    pub local_model_id: String,
    pub cloud_database_url: Option<String>,
    pub cloud_namespace: String,
    pub cloud_sync_threshold: i32,
    pub cloud_embed_url: String,
    pub cloud_model_id: String,
    pub cloud_allowlist: bool,
    pub cloud_fallback: bool,
    pub eval_min_recall: Option<f64>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workspace: PathBuf::from("."),
            local_vector_db: None,
            embed_url: "http://127.0.0.1:8080".into(),
            local_model_id: "local".into(),
            cloud_database_url: None,
            cloud_namespace: "default".into(),
            cloud_sync_threshold: 3,
            cloud_embed_url: "http://127.0.0.1:8080".into(),
            cloud_model_id: "local".into(),
            cloud_allowlist: true,
            cloud_fallback: false,
            eval_min_recall: None,
            log_level: "info".into(),
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_var(key) {
        Some(v) => v == "1" || v.eq_ignore_ascii_case("true"),
        None => default,
    }
}

impl Config {
    /// Resolve configuration from the process environment.
    ///
    /// `workspace_override` takes priority over `HYPERMEMORY_WORKSPACE`,
    /// which takes priority over the current directory.
    pub fn from_env(workspace_override: Option<&Path>) -> Result<Self> {
        let workspace = match workspace_override {
            Some(p) => p.to_path_buf(),
            None => match env_var("HYPERMEMORY_WORKSPACE") {
                Some(p) => PathBuf::from(p),
                None => env::current_dir().map_err(HmError::Io)?,
            },
        };

        let cloud_sync_threshold = match env_var("HYPERMEMORY_CLOUD_SYNC_THRESHOLD") {
            Some(v) => v
                .parse::<i32>()
                .map_err(|e| HmError::Config(format!("HYPERMEMORY_CLOUD_SYNC_THRESHOLD: {e}")))?,
            None => 3,
        };

        let eval_min_recall = match env_var("HYPERMEMORY_EVAL_MIN_RECALL") {
            Some(v) => Some(
                v.parse::<f64>()
                    .map_err(|e| HmError::Config(format!("HYPERMEMORY_EVAL_MIN_RECALL: {e}")))?,
            ),
            None => None,
        };

        Ok(Config {
            workspace,
            local_vector_db: env_var("HYPERMEMORY_LOCAL_VECTOR_DB"),
            embed_url: env_var("HYPERMEMORY_EMBED_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8080".into()),
            local_model_id: env_var("HYPERMEMORY_LOCAL_MODEL_ID").unwrap_or_else(|| "local".into()),
            cloud_database_url: env_var("HYPERMEMORY_CLOUD_DATABASE_URL"),
            cloud_namespace: env_var("HYPERMEMORY_CLOUD_NAMESPACE").unwrap_or_else(|| "default".into()),
            cloud_sync_threshold,
            cloud_embed_url: env_var("HYPERMEMORY_CLOUD_EMBED_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8080".into()),
            cloud_model_id: env_var("HYPERMEMORY_CLOUD_MODEL_ID").unwrap_or_else(|| "local".into()),
            cloud_allowlist: env_bool("HYPERMEMORY_CLOUD_ALLOWLIST", true),
            cloud_fallback: env_bool("HYPERMEMORY_CLOUD_FALLBACK", false),
            eval_min_recall,
            log_level: env_var("HYPERMEMORY_LOG_LEVEL").unwrap_or_else(|| "info".into()),
        })
    }

    /// A deterministic config for tests, rooted at `workspace`.
    pub fn test_default(workspace: &Path) -> Self {
        Config {
            workspace: workspace.to_path_buf(),
            ..Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_when_env_unset() {
        let _g = ENV_LOCK.lock().unwrap();
        for k in [
            "HYPERMEMORY_LOCAL_VECTOR_DB",
            "HYPERMEMORY_CLOUD_DATABASE_URL",
            "HYPERMEMORY_CLOUD_SYNC_THRESHOLD",
            "HYPERMEMORY_EVAL_MIN_RECALL",
        ] {
            unsafe { env::remove_var(k) };
        }
        let cfg = Config::from_env(Some(Path::new("/tmp/ws"))).unwrap();
        assert_eq!(cfg.cloud_sync_threshold, 3);
        assert!(cfg.cloud_allowlist);
        assert!(!cfg.cloud_fallback);
        assert!(cfg.local_vector_db.is_none());
    }

    #[test]
    fn explicit_workspace_overrides_env() {
        let _g = ENV_LOCK.lock().unwrap();
        unsafe { env::set_var("HYPERMEMORY_WORKSPACE", "/tmp/should-not-win") };
        let cfg = Config::from_env(Some(Path::new("/tmp/wins"))).unwrap();
        assert_eq!(cfg.workspace, Path::new("/tmp/wins"));
        unsafe { env::remove_var("HYPERMEMORY_WORKSPACE") };
    }

    #[test]
    fn invalid_threshold_is_config_error() {
        let _g = ENV_LOCK.lock().unwrap();
        unsafe { env::set_var("HYPERMEMORY_CLOUD_SYNC_THRESHOLD", "not-a-number") };
        let result = Config::from_env(Some(Path::new("/tmp/ws")));
        unsafe { env::remove_var("HYPERMEMORY_CLOUD_SYNC_THRESHOLD") };
        assert!(matches!(result, Err(HmError::Config(_))));
    }
}
