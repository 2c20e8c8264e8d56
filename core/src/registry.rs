//! Session registry: ordered name -> record table persisted to a single JSON document.
//! The daemon process is the only writer. Every mutation rewrites state.json in full
//! (temp file + fsync + rename) before the mutating call returns, so a crash right after
//! a successful API response never loses that mutation.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const STATE_FILE: &str = "state.json";

/// One running worker session. Immutable value: restarting a session produces a brand-new
/// record replacing the old one under the same name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub name: String,
    pub pid: u32,
    pub port: u16,
    pub url_path: String,
    pub working_dir: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Daemon metadata stored alongside the session table and reported by GET /status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub pid: u32,
    pub http_port: u16,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// On-disk shape of state.json.
#[derive(Serialize, Deserialize)]
struct StateDocument {
    daemon: DaemonInfo,
    sessions: Vec<SessionRecord>,
}

/// Ordered session table (insertion order, at most one record per name) plus daemon
/// metadata. Single source of truth for routing; nothing else holds a long-lived copy.
pub struct SessionRegistry {
    path: PathBuf,
    daemon: DaemonInfo,
    sessions: Vec<SessionRecord>,
}

impl SessionRegistry {
    /// Load state.json from `state_dir`, or start empty if the file is missing/unreadable.
    /// Daemon metadata is always replaced with the current process's info.
    pub fn open(state_dir: &Path, daemon: DaemonInfo) -> std::io::Result<Self> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join(STATE_FILE);
        let sessions = match fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str::<StateDocument>(&data)
                .map(|doc| doc.sessions)
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        let mut reg = Self { path, daemon, sessions };
        reg.persist()?;
        Ok(reg)
    }

    pub fn daemon(&self) -> &DaemonInfo {
        &self.daemon
    }

    /// All records in insertion order. Liveness is not checked here; see the manager.
    pub fn records(&self) -> &[SessionRecord] {
        &self.sessions
    }

    pub fn get(&self, name: &str) -> Option<&SessionRecord> {
        self.sessions.iter().find(|r| r.name == name)
    }

    /// Insert a record, replacing any prior record under the same name. Persisted before returning.
    pub fn insert(&mut self, record: SessionRecord) -> std::io::Result<()> {
        self.sessions.retain(|r| r.name != record.name);
        self.sessions.push(record);
        self.persist()
    }

    /// Remove a record by name. Persisted before returning. None if no such record.
    pub fn remove(&mut self, name: &str) -> std::io::Result<Option<SessionRecord>> {
        let idx = self.sessions.iter().position(|r| r.name == name);
        match idx {
            Some(i) => {
                let record = self.sessions.remove(i);
                self.persist()?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Remove several records at once with a single rewrite (used when pruning dead sessions).
    pub fn remove_many(&mut self, names: &[String]) -> std::io::Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        self.sessions.retain(|r| !names.contains(&r.name));
        self.persist()
    }

    /// Rewrite state.json in full: temp file in the same directory, fsync, rename.
    fn persist(&self) -> std::io::Result<()> {
        let doc = StateDocument {
            daemon: self.daemon.clone(),
            sessions: self.sessions.clone(),
        };
        let data = serde_json::to_vec_pretty(&doc)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daemon_info() -> DaemonInfo {
        DaemonInfo {
            pid: std::process::id(),
            http_port: 7600,
            started_at: chrono::Utc::now(),
        }
    }

    fn record(name: &str, port: u16) -> SessionRecord {
        SessionRecord {
            name: name.to_string(),
            pid: 4242,
            port,
            url_path: format!("/{name}"),
            working_dir: "/tmp".to_string(),
            started_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn persist_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut reg = SessionRegistry::open(dir.path(), daemon_info()).unwrap();
            reg.insert(record("alpha", 7601)).unwrap();
            reg.insert(record("beta", 7602)).unwrap();
        }
        let reg = SessionRegistry::open(dir.path(), daemon_info()).unwrap();
        let names: Vec<_> = reg.records().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["alpha", "beta"]);
        assert_eq!(reg.get("alpha").unwrap().port, 7601);
        assert_eq!(reg.get("beta").unwrap().url_path, "/beta");
    }

    #[test]
    fn insert_replaces_same_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = SessionRegistry::open(dir.path(), daemon_info()).unwrap();
        reg.insert(record("t", 7601)).unwrap();
        reg.insert(record("t", 7603)).unwrap();
        assert_eq!(reg.records().len(), 1);
        assert_eq!(reg.get("t").unwrap().port, 7603);
    }

    #[test]
    fn remove_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = SessionRegistry::open(dir.path(), daemon_info()).unwrap();
        assert!(reg.remove("ghost").unwrap().is_none());
    }

    #[test]
    fn remove_many_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = SessionRegistry::open(dir.path(), daemon_info()).unwrap();
        for (n, p) in [("a", 7601), ("b", 7602), ("c", 7603)] {
            reg.insert(record(n, p)).unwrap();
        }
        reg.remove_many(&["a".to_string(), "c".to_string()]).unwrap();
        let names: Vec<_> = reg.records().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["b"]);
    }

    #[test]
    fn corrupt_state_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("state.json"), b"{not json").unwrap();
        let reg = SessionRegistry::open(dir.path(), daemon_info()).unwrap();
        assert!(reg.records().is_empty());
    }
}
