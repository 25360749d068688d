//! `EngineConfig`: retry policy, auto-commit, worktree/sandbox defaults, and
//! remote-server bind options, loaded from `.ralph-tui/engine.toml` via
//! `toml` + `serde(default)` so a missing or partial file is valid.
//! Grounded on the teacher's `config::loader` atomic tmp-write-then-rename
//! save strategy (`config/loader.rs`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::retry::RetryPolicy;
use crate::plugins::sandbox::SandboxConfig;
use crate::worktree::WorktreeLimits;

/// Bind options for the remote control server (component K).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteServerConfig {
    pub enabled: bool,
    pub port: u16,
    pub max_port_retries: u16,
    #[serde(default)]
    pub server_token_configured: bool,
}

impl Default for RemoteServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 4181,
            max_port_retries: 10,
            server_token_configured: false,
        }
    }
}

/// On-disk shape of `.ralph-tui/engine.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default = "default_true")]
    pub auto_commit: bool,
    #[serde(default)]
    pub max_iterations: u64,
    #[serde(default)]
    pub worktree_limits: WorktreeLimits,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub remote_server: RemoteServerConfig,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default = "default_backup_prefix")]
    pub backup_prefix: String,
    #[serde(default = "default_max_workers")]
    pub default_max_workers: usize,
}

fn default_true() -> bool {
    true
}

fn default_branch_prefix() -> String {
    "ralph".to_string()
}

fn default_backup_prefix() -> String {
    "ralph-backup".to_string()
}

fn default_max_workers() -> usize {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            auto_commit: true,
            max_iterations: 0,
            worktree_limits: WorktreeLimits::default(),
            sandbox: SandboxConfig::default(),
            remote_server: RemoteServerConfig::default(),
            branch_prefix: default_branch_prefix(),
            backup_prefix: default_backup_prefix(),
            default_max_workers: default_max_workers(),
        }
    }
}

fn config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(".ralph-tui").join("engine.toml")
}

/// Load `.ralph-tui/engine.toml`, falling back to [`EngineConfig::default`]
/// if the file does not exist.
pub fn load_config(project_dir: &Path) -> Result<EngineConfig, String> {
    let path = config_path(project_dir);
    match std::fs::read_to_string(&path) {
        Ok(content) => toml::from_str(&content).map_err(|e| format!("failed to parse {path:?}: {e}")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EngineConfig::default()),
        Err(e) => Err(format!("failed to read {path:?}: {e}")),
    }
}

/// Atomically save `config`: write to `<path>.tmp`, fsync, rename.
pub fn save_config(project_dir: &Path, config: &EngineConfig) -> Result<(), String> {
    let dir = project_dir.join(".ralph-tui");
    std::fs::create_dir_all(&dir).map_err(|e| e.to_string())?;

    let content = toml::to_string_pretty(config).map_err(|e| e.to_string())?;
    let tmp_path = dir.join("engine.toml.tmp");
    {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp_path).map_err(|e| e.to_string())?;
        file.write_all(content.as_bytes()).map_err(|e| e.to_string())?;
        file.sync_all().map_err(|e| e.to_string())?;
    }
    std::fs::rename(&tmp_path, config_path(project_dir)).map_err(|e| e.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_config_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path()).unwrap();
        assert_eq!(config.default_max_workers, 4);
        assert!(config.auto_commit);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.max_iterations = 25;
        config.branch_prefix = "custom".to_string();
        save_config(dir.path(), &config).unwrap();

        let loaded = load_config(dir.path()).unwrap();
        assert_eq!(loaded.max_iterations, 25);
        assert_eq!(loaded.branch_prefix, "custom");
    }

    #[test]
    fn partial_toml_defaults_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".ralph-tui")).unwrap();
        std::fs::write(
            dir.path().join(".ralph-tui").join("engine.toml"),
            "maxIterations = 5\n",
        )
        .unwrap();

        let loaded = load_config(dir.path()).unwrap();
        assert_eq!(loaded.max_iterations, 5);
        assert!(loaded.auto_commit);
    }
}
