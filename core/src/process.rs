//! Worker process control: spawn detached ttyd workers, probe pid liveness, signal termination.
//! Both OS touchpoints are traits so the manager can run against fakes in tests.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::oneshot;

/// Liveness and termination for worker pids. The real impl delivers signals;
/// signal 0 answers "is it running" without touching the process.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
    /// Best-effort SIGTERM. Signalling an already-dead pid is not an error to callers.
    fn terminate(&self, pid: u32) -> std::io::Result<()>;
    /// SIGKILL, for the force flag on session delete.
    fn force_kill(&self, pid: u32) -> std::io::Result<()>;
}

/// Probe backed by `kill(2)`.
pub struct SignalProbe;

impl SignalProbe {
    fn send(&self, pid: u32, signal: Option<Signal>) -> std::io::Result<()> {
        kill(Pid::from_raw(pid as i32), signal).map_err(std::io::Error::from)
    }
}

impl ProcessProbe for SignalProbe {
    fn is_alive(&self, pid: u32) -> bool {
        self.send(pid, None).is_ok()
    }

    fn terminate(&self, pid: u32) -> std::io::Result<()> {
        self.send(pid, Some(Signal::SIGTERM))
    }

    fn force_kill(&self, pid: u32) -> std::io::Result<()> {
        self.send(pid, Some(Signal::SIGKILL))
    }
}

/// Fully-built spawn request: the manager resolves port and base-path flags into `args`
/// before handing it over, so the spawner stays a thin exec wrapper.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

/// A successfully spawned worker: its pid plus a channel that fires once on exit.
pub struct WorkerHandle {
    pub pid: u32,
    pub exited: oneshot::Receiver<()>,
}

/// Spawns worker processes. Faked in tests so manager logic runs without ttyd installed.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, spec: &WorkerSpec) -> std::io::Result<WorkerHandle>;
}

/// Real spawner: `tokio::process::Command` in a fresh process group so a daemon
/// restart does not take the workers down with it. Stdio is discarded; ttyd talks
/// to the daemon over its allocated port only.
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, spec: &WorkerSpec) -> std::io::Result<WorkerHandle> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd.spawn()?;
        let pid = child.id().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "spawned worker has no pid")
        })?;

        let (tx, rx) = oneshot::channel();
        // Reap the child and notify the manager's exit watcher. The receiver side
        // deregisters the session, same path as an explicit stop.
        tokio::spawn(async move {
            let _ = child.wait().await;
            let _ = tx.send(());
        });

        Ok(WorkerHandle { pid, exited: rx })
    }
}

/// True if `dir` exists and is a directory. Session working directories are
/// validated before any port is allocated.
pub fn dir_exists(dir: &Path) -> bool {
    dir.is_dir()
}
