//! Session lifecycle: validate requests, allocate ports, spawn/stop workers, and keep
//! the registry reconciled with OS process liveness. One manager per daemon, built at
//! startup and passed by reference to the router, API handlers, and control channel.
//!
//! Worker exit and explicit stop share one deregistration path; only the trigger
//! (exit notification vs API call) differs.

use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::broadcast;

use crate::config::Config;
use crate::ports;
use crate::process::{self, ProcessProbe, WorkerSpawner, WorkerSpec};
use crate::registry::{DaemonInfo, SessionRecord, SessionRegistry};

/// Capacity for the session event broadcast. Subscribers that lag simply miss events.
const EVENT_CHANNEL_CAP: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid session request: {0}")]
    Validation(String),
    #[error("session '{0}' is already running")]
    Conflict(String),
    #[error("no session named '{0}'")]
    NotFound(String),
    #[error("worker failed to start: {0}")]
    Process(String),
    #[error("state store error: {0}")]
    Storage(#[from] std::io::Error),
}

/// Lifecycle notifications, e.g. for the portal's live session list.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started { name: String, port: u16 },
    /// Stopped through the API or control channel.
    Stopped { name: String },
    /// Worker process exited on its own (crash or user quit inside the terminal).
    Exited { name: String },
}

pub struct SessionManager {
    registry: Mutex<SessionRegistry>,
    probe: Arc<dyn ProcessProbe>,
    spawner: Arc<dyn WorkerSpawner>,
    config: Arc<RwLock<Config>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(
        registry: SessionRegistry,
        probe: Arc<dyn ProcessProbe>,
        spawner: Arc<dyn WorkerSpawner>,
        config: Arc<RwLock<Config>>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        Arc::new(Self {
            registry: Mutex::new(registry),
            probe,
            spawner,
            config,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn daemon_info(&self) -> DaemonInfo {
        self.registry.lock().expect("registry mutex").daemon().clone()
    }

    /// Start a worker for `name` in `dir`, mounted at `url_path` (default `/{name}`).
    /// Conflict if a record with this name exists and its process is still alive; a dead
    /// leftover record is replaced. The whole operation, including the durable registry
    /// write, completes under the registry lock, so two concurrent starts for the same
    /// name cannot race past the existence check.
    pub fn start_session(
        self: &Arc<Self>,
        name: &str,
        dir: &Path,
        url_path: Option<&str>,
    ) -> Result<SessionRecord, SessionError> {
        validate_name(name)?;
        if !process::dir_exists(dir) {
            return Err(SessionError::Validation(format!(
                "working directory does not exist: {}",
                dir.display()
            )));
        }
        let url_path = match url_path {
            Some(p) => validate_url_path(p)?,
            None => format!("/{name}"),
        };

        let (base_port, base_path, program, args) = {
            let cfg = self.config.read().expect("config lock");
            (
                cfg.base_port,
                cfg.base_path.clone(),
                cfg.worker_command.clone(),
                cfg.worker_args.clone(),
            )
        };

        let mut reg = self.registry.lock().expect("registry mutex");
        if let Some(existing) = reg.get(name) {
            if self.probe.is_alive(existing.pid) {
                return Err(SessionError::Conflict(name.to_string()));
            }
        }

        let port = ports::allocate(base_port, reg.records());
        let mount = format!("{base_path}{url_path}");
        let spawn_args = args
            .iter()
            .map(|a| a.replace("{port}", &port.to_string()).replace("{base}", &mount))
            .collect();
        let spec = WorkerSpec {
            program,
            args: spawn_args,
            working_dir: dir.to_path_buf(),
        };
        let handle = self
            .spawner
            .spawn(&spec)
            .map_err(|e| SessionError::Process(e.to_string()))?;

        let record = SessionRecord {
            name: name.to_string(),
            pid: handle.pid,
            port,
            url_path,
            working_dir: dir.to_string_lossy().into_owned(),
            started_at: chrono::Utc::now(),
        };
        reg.insert(record.clone())?;
        drop(reg);

        println!(
            "[ttymux] session '{}' started: pid {} port {}",
            record.name, record.pid, record.port
        );
        let _ = self.events.send(SessionEvent::Started {
            name: record.name.clone(),
            port: record.port,
        });

        let mgr = Arc::clone(self);
        let watched_name = record.name.clone();
        let watched_pid = record.pid;
        let exited = handle.exited;
        tokio::spawn(async move {
            let _ = exited.await;
            mgr.handle_worker_exit(&watched_name, watched_pid);
        });

        Ok(record)
    }

    /// Stop a session: best-effort termination signal, then deregistration. A signal
    /// failure (process already gone) is swallowed; the record is removed either way.
    pub fn stop_session(&self, name: &str, force: bool) -> Result<(), SessionError> {
        let mut reg = self.registry.lock().expect("registry mutex");
        let record = reg
            .get(name)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(name.to_string()))?;
        let signalled = if force {
            self.probe.force_kill(record.pid)
        } else {
            self.probe.terminate(record.pid)
        };
        if let Err(e) = signalled {
            eprintln!(
                "[ttymux] signal to pid {} for session '{}' failed (already dead?): {}",
                record.pid, name, e
            );
        }
        reg.remove(name)?;
        drop(reg);
        println!("[ttymux] session '{}' stopped", name);
        let _ = self.events.send(SessionEvent::Stopped {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Live sessions only. Records whose process is gone are pruned from the registry
    /// as a side effect, so callers never see stale entries and no separate sweep runs.
    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>, SessionError> {
        let mut reg = self.registry.lock().expect("registry mutex");
        let (alive, dead) = partition_alive(reg.records(), self.probe.as_ref());
        if !dead.is_empty() {
            eprintln!("[ttymux] pruning dead sessions: {}", dead.join(", "));
            reg.remove_many(&dead)?;
        }
        Ok(alive)
    }

    /// Stop every live session. Per-session failures are logged and swallowed so the
    /// bulk operation always runs to completion.
    pub fn stop_all_sessions(&self) {
        let names: Vec<String> = match self.list_sessions() {
            Ok(records) => records.into_iter().map(|r| r.name).collect(),
            Err(e) => {
                eprintln!("[ttymux] stop-all: listing sessions failed: {e}");
                return;
            }
        };
        for name in names {
            if let Err(e) = self.stop_session(&name, false) {
                eprintln!("[ttymux] stop-all: session '{name}' failed to stop: {e}");
            }
        }
    }

    /// Exit-watcher callback. The pid guard keeps a stale watcher from removing a
    /// replacement record started later under the same name.
    fn handle_worker_exit(&self, name: &str, pid: u32) {
        let mut reg = self.registry.lock().expect("registry mutex");
        match reg.get(name) {
            Some(record) if record.pid == pid => {
                if let Err(e) = reg.remove(name) {
                    eprintln!("[ttymux] deregistering exited session '{name}' failed: {e}");
                    return;
                }
                drop(reg);
                println!("[ttymux] session '{name}' exited (pid {pid})");
                let _ = self.events.send(SessionEvent::Exited {
                    name: name.to_string(),
                });
            }
            _ => {}
        }
    }
}

/// Split records into (alive, dead-names) without mutating anything. The registry
/// pruning in `list_sessions` is layered on top of this.
pub fn partition_alive(
    records: &[SessionRecord],
    probe: &dyn ProcessProbe,
) -> (Vec<SessionRecord>, Vec<String>) {
    let mut alive = Vec::new();
    let mut dead = Vec::new();
    for record in records {
        if probe.is_alive(record.pid) {
            alive.push(record.clone());
        } else {
            dead.push(record.name.clone());
        }
    }
    (alive, dead)
}

fn validate_name(name: &str) -> Result<(), SessionError> {
    if name.is_empty() || name.len() > 64 {
        return Err(SessionError::Validation(
            "session name must be 1-64 characters".to_string(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(SessionError::Validation(format!(
            "session name may only contain alphanumerics, '-' and '_': {name}"
        )));
    }
    Ok(())
}

fn validate_url_path(path: &str) -> Result<String, SessionError> {
    if !path.starts_with('/') || path.len() < 2 || path.contains(char::is_whitespace) {
        return Err(SessionError::Validation(format!(
            "url path must start with '/' and contain no whitespace: {path}"
        )));
    }
    Ok(path.trim_end_matches('/').to_string())
}
