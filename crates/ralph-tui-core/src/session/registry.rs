//! [`SessionRegistry`]: process-user-global map of resumable sessions across
//! project directories, per spec.md §3/§6.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// One entry in the registry, keyed by `sessionId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub cwd: PathBuf,
    #[serde(default)]
    pub alias: Option<String>,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    sessions: HashMap<String, RegistryEntry>,
}

/// `{user-config-dir}/ralph-tui/sessions.json`, shared by every project on
/// this host for the current user, so a viewer can list resumable sessions
/// across directories. Grounded on the teacher's per-user config directory
/// resolution (`directories::ProjectDirs`) generalized from a single config
/// file to a small keyed registry.
pub struct SessionRegistry {
    path: PathBuf,
}

impl SessionRegistry {
    /// Resolve the registry path via `directories::ProjectDirs`, falling
    /// back to `./.ralph-tui/sessions.json` if no home directory can be
    /// determined (matching the teacher's `load_default_config` fallback).
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "ralph-tui")
            .map(|dirs| dirs.config_dir().join("sessions.json"))
            .unwrap_or_else(|| PathBuf::from(".ralph-tui").join("sessions.json"))
    }

    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn read(&self) -> Result<RegistryFile, SessionError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| SessionError::Corrupt(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryFile::default()),
            Err(e) => Err(SessionError::Io(e)),
        }
    }

    fn write(&self, file: &RegistryFile) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(file)?;
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Insert or update the entry for `session_id`.
    pub fn upsert(&self, session_id: &str, entry: RegistryEntry) -> Result<(), SessionError> {
        let mut file = self.read()?;
        file.sessions.insert(session_id.to_string(), entry);
        self.write(&file)
    }

    /// Remove the entry for `session_id`, if present.
    pub fn remove(&self, session_id: &str) -> Result<(), SessionError> {
        let mut file = self.read()?;
        file.sessions.remove(session_id);
        self.write(&file)
    }

    /// List every registered session.
    pub fn list(&self) -> Result<HashMap<String, RegistryEntry>, SessionError> {
        Ok(self.read()?.sessions)
    }

    /// List only sessions registered under `cwd`.
    pub fn list_for_cwd(&self, cwd: &Path) -> Result<Vec<(String, RegistryEntry)>, SessionError> {
        Ok(self
            .read()?
            .sessions
            .into_iter()
            .filter(|(_, entry)| entry.cwd == cwd)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cwd: &Path) -> RegistryEntry {
        RegistryEntry {
            cwd: cwd.to_path_buf(),
            alias: None,
            host: "localhost".to_string(),
            port: Some(4181),
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn upsert_then_list_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path().join("sessions.json"));

        registry.upsert("s1", entry(dir.path())).unwrap();
        let sessions = registry.list().unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions.contains_key("s1"));
    }

    #[test]
    fn remove_deletes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path().join("sessions.json"));

        registry.upsert("s1", entry(dir.path())).unwrap();
        registry.remove("s1").unwrap();
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn list_for_cwd_filters() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path().join("sessions.json"));

        registry.upsert("s1", entry(dir.path())).unwrap();
        registry.upsert("s2", entry(other.path())).unwrap();

        let matches = registry.list_for_cwd(dir.path()).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0, "s1");
    }
}
