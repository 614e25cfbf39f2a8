//! Worker subprocess spawning.
//!
//! Every worker runs in its own process group, so a single `killpg` also takes
//! down anything the interpreter forked.

use std::path::PathBuf;
use std::process::Stdio;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::channel::WorkerChannel;
use crate::error::{Result, TuskError};

/// Environment variable carrying the worker's slot id.
pub const WORKER_ID_ENV: &str = "TUSK_WORKER_ID";

/// How to launch a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    /// Interpreter binary.
    pub runtime: PathBuf,
    /// Interpreter configuration file, passed as `-c <path>`.
    pub runtime_config: Option<PathBuf>,
    /// Extra interpreter arguments placed before the entry point.
    pub interpreter_args: Vec<String>,
    /// Worker script.
    pub entry_point: PathBuf,
    /// Working directory for the worker.
    pub working_dir: Option<PathBuf>,
}

impl WorkerCommand {
    /// Create a command running `entry_point` with `runtime`.
    pub fn new(runtime: impl Into<PathBuf>, entry_point: impl Into<PathBuf>) -> Self {
        Self {
            runtime: runtime.into(),
            runtime_config: None,
            interpreter_args: Vec::new(),
            entry_point: entry_point.into(),
            working_dir: None,
        }
    }

    /// Arguments passed to the runtime, in order.
    pub fn args(&self) -> Vec<std::ffi::OsString> {
        let mut args = Vec::with_capacity(self.interpreter_args.len() + 3);
        if let Some(ini) = &self.runtime_config {
            args.push("-c".into());
            args.push(ini.clone().into_os_string());
        }
        args.extend(self.interpreter_args.iter().map(Into::into));
        args.push(self.entry_point.clone().into_os_string());
        args
    }
}

/// A freshly launched worker.
#[derive(Debug)]
pub struct SpawnedWorker {
    /// Child handle, used by the watcher to reap the process.
    pub child: Child,
    /// OS process id (also the process group id).
    pub pid: u32,
    /// Channel wired to the child's stdin/stdout.
    pub channel: WorkerChannel,
}

/// Spawn worker `id`.
///
/// stdin/stdout are piped into a [`WorkerChannel`]; stderr is inherited so
/// interpreter diagnostics reach the host's stderr unmodified.
pub async fn spawn_worker(
    id: usize,
    command: &WorkerCommand,
    max_frame_bytes: usize,
) -> Result<SpawnedWorker> {
    let spawn_err = |source| TuskError::Spawn { id, source };

    let mut cmd = Command::new(&command.runtime);
    cmd.args(command.args())
        .env(WORKER_ID_ENV, id.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .process_group(0)
        .kill_on_drop(true);
    if let Some(dir) = &command.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(spawn_err)?;

    let Some(pid) = child.id() else {
        return Err(spawn_err(std::io::Error::other(
            "worker exited before its pid was read",
        )));
    };
    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        kill_process_group(pid, &mut child);
        let _ = child.wait().await;
        return Err(spawn_err(std::io::Error::other(
            "worker stdio was not captured",
        )));
    };

    debug!(worker = id, pid, runtime = %command.runtime.display(), "Spawned worker");

    Ok(SpawnedWorker {
        child,
        pid,
        channel: WorkerChannel::new(id, stdin, stdout, max_frame_bytes),
    })
}

/// SIGKILL the worker's whole process group.
///
/// Falls back to killing the direct child if the group is already gone.
pub fn kill_process_group(pid: u32, child: &mut Child) {
    let Ok(raw) = i32::try_from(pid) else {
        let _ = child.start_kill();
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(pid, error = %e, "killpg failed, killing child directly");
        if let Err(e) = child.start_kill() {
            warn!(pid, error = %e, "Failed to kill worker");
        }
    }
}
