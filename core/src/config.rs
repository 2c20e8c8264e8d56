//! Daemon configuration from settings.json in the ttymux home dir (~/.ttymux, or
//! TTYMUX_HOME). Parsed leniently: a missing or broken file yields defaults.
//! Reload splits changed fields into live-appliable vs restart-required; the daemon
//! owns one `Config` explicitly and passes it down (no global singleton).

use std::path::{Path, PathBuf};

use serde::Serialize;

const SETTINGS_FILE: &str = "settings.json";

pub const DEFAULT_BASE_PORT: u16 = 7600;
pub const DEFAULT_BASE_PATH: &str = "/ttymux";
pub const DEFAULT_WORKER_COMMAND: &str = "ttyd";

/// Daemon settings. `base_port` is both the daemon's HTTP port and the base for
/// worker port allocation (workers get base_port + k).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub home_dir: PathBuf,
    pub base_port: u16,
    pub base_path: String,
    pub worker_command: String,
    /// Worker argv template; `{port}` and `{base}` are substituted per session.
    pub worker_args: Vec<String>,
    pub inject_ime_helper: bool,
}

/// Result of a `reload` control command: which changed fields were applied live
/// and which need a full daemon restart. Serialized as the reload response.
#[derive(Debug, Clone, Serialize)]
pub struct ReloadOutcome {
    pub success: bool,
    pub reloaded: Vec<String>,
    #[serde(rename = "requiresRestart")]
    pub requires_restart: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Default home dir: $TTYMUX_HOME, else ~/.ttymux.
pub fn default_home_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TTYMUX_HOME") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir.trim());
        }
    }
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".ttymux")
}

impl Config {
    /// Load settings.json from `home_dir`. Missing file or unparseable JSON => defaults.
    pub fn load(home_dir: &Path) -> Self {
        let path = home_dir.join(SETTINGS_FILE);
        let root = std::fs::read_to_string(&path)
            .ok()
            .and_then(|data| serde_json::from_str::<serde_json::Value>(&data).ok())
            .unwrap_or(serde_json::Value::Null);
        Self::from_value(home_dir, &root)
    }

    fn from_value(home_dir: &Path, root: &serde_json::Value) -> Self {
        let base_port = root
            .get("base_port")
            .and_then(|v| v.as_u64())
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(DEFAULT_BASE_PORT);

        let base_path = root
            .get("base_path")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| s.starts_with('/'))
            .unwrap_or_else(|| DEFAULT_BASE_PATH.to_string());

        let worker = root.get("worker");
        let worker_command = worker
            .and_then(|w| w.get("command"))
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_WORKER_COMMAND.to_string());

        let worker_args = worker
            .and_then(|w| w.get("args"))
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_else(default_worker_args);

        let inject_ime_helper = root
            .get("inject_ime_helper")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        Self {
            home_dir: home_dir.to_path_buf(),
            base_port,
            base_path,
            worker_command,
            worker_args,
            inject_ime_helper,
        }
    }

    /// Directory holding state.json and the control socket. Same as the home dir.
    pub fn state_dir(&self) -> &Path {
        &self.home_dir
    }

    /// Path to the control socket.
    pub fn control_socket(&self) -> PathBuf {
        self.home_dir.join("control.sock")
    }

    /// Re-read settings.json and classify what changed. Live fields (worker command,
    /// worker args, IME helper toggle) are returned in the fresh config and listed in
    /// `reloaded`; bind-time fields are listed in `requires_restart` and keep their
    /// running values in the returned config.
    pub fn reload(&self) -> (Config, ReloadOutcome) {
        let fresh = Config::load(&self.home_dir);
        let mut reloaded = Vec::new();
        let mut requires_restart = Vec::new();

        if fresh.base_port != self.base_port {
            requires_restart.push("base_port".to_string());
        }
        if fresh.base_path != self.base_path {
            requires_restart.push("base_path".to_string());
        }
        if fresh.worker_command != self.worker_command {
            reloaded.push("worker_command".to_string());
        }
        if fresh.worker_args != self.worker_args {
            reloaded.push("worker_args".to_string());
        }
        if fresh.inject_ime_helper != self.inject_ime_helper {
            reloaded.push("inject_ime_helper".to_string());
        }

        let applied = Config {
            // bind-time fields keep their running values
            base_port: self.base_port,
            base_path: self.base_path.clone(),
            home_dir: self.home_dir.clone(),
            // live fields take the fresh values
            worker_command: fresh.worker_command,
            worker_args: fresh.worker_args,
            inject_ime_helper: fresh.inject_ime_helper,
        };
        let outcome = ReloadOutcome {
            success: true,
            reloaded,
            requires_restart,
            error: None,
        };
        (applied, outcome)
    }
}

fn default_worker_args() -> Vec<String> {
    ["-p", "{port}", "-b", "{base}", "--writable", "bash", "-l"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            base_port: DEFAULT_BASE_PORT,
            base_path: DEFAULT_BASE_PATH.to_string(),
            worker_command: DEFAULT_WORKER_COMMAND.to_string(),
            worker_args: default_worker_args(),
            inject_ime_helper: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(dir.path());
        assert_eq!(cfg.base_port, DEFAULT_BASE_PORT);
        assert_eq!(cfg.base_path, DEFAULT_BASE_PATH);
        assert_eq!(cfg.worker_command, "ttyd");
        assert!(cfg.inject_ime_helper);
    }

    #[test]
    fn settings_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("settings.json"),
            r#"{
                "base_port": 9000,
                "base_path": "/mux/",
                "worker": { "command": "ttyd-dev", "args": ["--readonly"] },
                "inject_ime_helper": false
            }"#,
        )
        .unwrap();
        let cfg = Config::load(dir.path());
        assert_eq!(cfg.base_port, 9000);
        assert_eq!(cfg.base_path, "/mux");
        assert_eq!(cfg.worker_command, "ttyd-dev");
        assert_eq!(cfg.worker_args, ["--readonly"]);
        assert!(!cfg.inject_ime_helper);
    }

    #[test]
    fn reload_classifies_live_vs_restart() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("settings.json"),
            r#"{ "base_port": 7600, "inject_ime_helper": true }"#,
        )
        .unwrap();
        let cfg = Config::load(dir.path());
        std::fs::write(
            dir.path().join("settings.json"),
            r#"{ "base_port": 9100, "inject_ime_helper": false }"#,
        )
        .unwrap();
        let (applied, outcome) = cfg.reload();
        assert!(outcome.success);
        assert_eq!(outcome.reloaded, ["inject_ime_helper"]);
        assert_eq!(outcome.requires_restart, ["base_port"]);
        // bind-time field keeps its running value, live field flips
        assert_eq!(applied.base_port, 7600);
        assert!(!applied.inject_ime_helper);
    }

    #[test]
    fn reload_with_no_changes_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(dir.path());
        let (_, outcome) = cfg.reload();
        assert!(outcome.reloaded.is_empty());
        assert!(outcome.requires_restart.is_empty());
    }
}
