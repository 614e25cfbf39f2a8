//! Project configuration loaded from `tusk.json`.
//!
//! Every key is optional; missing keys take their defaults. Keys this module
//! does not know about (for example `scripts`) are ignored.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, TuskError};
use crate::worker::{RestartPolicy, WorkerCommand, WorkerPoolConfig};

/// Default configuration file name.
pub const CONFIG_FILE: &str = "tusk.json";

/// Configuration for the server and its worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port to listen on.
    pub port: u16,
    /// Address to bind to.
    pub address: String,
    /// Number of worker processes.
    pub worker_count: usize,
    /// Worker script, relative to `project_root` unless absolute.
    pub worker_command: String,
    /// Interpreter binary; empty means auto-detect.
    pub php_binary: String,
    /// Interpreter configuration file; empty means the interpreter's default.
    pub php_ini: String,
    /// Project directory; workers run here.
    pub project_root: String,
    /// Extra interpreter arguments placed before the worker script.
    pub interpreter_args: Vec<String>,
    /// How long a request waits for an idle worker (0 = fail immediately).
    pub acquire_timeout_ms: u64,
    /// Deadline for one worker exchange (0 = none).
    pub request_timeout_ms: u64,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    /// Largest accepted worker response line.
    pub max_frame_bytes: usize,
    /// First restart delay for a crashed worker.
    pub restart_delay_ms: u64,
    /// Upper bound on the restart delay.
    pub restart_max_delay_ms: u64,
    /// Consecutive failed restarts before giving up on a slot; `null` for unlimited.
    pub restart_max_attempts: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            address: "0.0.0.0".to_string(),
            worker_count: 4,
            worker_command: "worker.php".to_string(),
            php_binary: "php".to_string(),
            php_ini: String::new(),
            project_root: "./".to_string(),
            interpreter_args: Vec::new(),
            acquire_timeout_ms: 30_000,
            request_timeout_ms: 60_000,
            max_body_bytes: 16 * 1024 * 1024,
            max_frame_bytes: 64 * 1024 * 1024,
            restart_delay_ms: 1_000,
            restart_max_delay_ms: 30_000,
            restart_max_attempts: Some(10),
        }
    }
}

impl Config {
    /// Load configuration from `path`.
    ///
    /// A missing file yields defaults. A file that exists but does not parse is
    /// reported as a warning and also yields defaults; only I/O errors fail.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to parse config, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Write this configuration as pretty-printed JSON, refusing to overwrite.
    pub fn write_new(&self, path: &Path) -> Result<()> {
        if path.exists() {
            return Err(TuskError::Config(format!(
                "{} already exists",
                path.display()
            )));
        }
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Use `file` as the worker script. It must exist and be a `.php` file.
    pub fn set_worker_file(&mut self, file: &Path) -> Result<()> {
        if !file.exists() {
            return Err(TuskError::Config(format!(
                "worker file not found: {}",
                file.display()
            )));
        }
        let is_php = file
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("php"));
        if !is_php {
            return Err(TuskError::Config(format!(
                "worker file must be a PHP file (*.php): {}",
                file.display()
            )));
        }
        // Relative paths given on the command line are relative to the cwd,
        // not to project_root.
        let absolute = std::path::absolute(file)?;
        self.worker_command = absolute.to_string_lossy().into_owned();
        Ok(())
    }

    /// Check invariants the rest of the program relies on.
    pub fn validate(&self) -> Result<()> {
        if self.max_body_bytes == 0 {
            return Err(TuskError::Config("max_body_bytes must be positive".into()));
        }
        if self.max_frame_bytes == 0 {
            return Err(TuskError::Config("max_frame_bytes must be positive".into()));
        }
        if self.restart_max_delay_ms < self.restart_delay_ms {
            return Err(TuskError::Config(format!(
                "restart_max_delay_ms ({}) is less than restart_delay_ms ({})",
                self.restart_max_delay_ms, self.restart_delay_ms
            )));
        }
        if self.worker_command.trim().is_empty() {
            return Err(TuskError::Config("worker_command is empty".into()));
        }
        if self.worker_count == 0 {
            warn!("worker_count is 0; every request will fail with 502");
        }
        Ok(())
    }

    /// `host:port` string to bind to.
    pub fn bind_address(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Absolute-or-project-relative path of the worker script.
    pub fn entry_point(&self) -> PathBuf {
        let command = Path::new(&self.worker_command);
        if command.is_absolute() {
            command.to_path_buf()
        } else {
            Path::new(&self.project_root).join(command)
        }
    }

    /// Interpreter configuration file, if one is set.
    pub fn runtime_config(&self) -> Option<PathBuf> {
        (!self.php_ini.is_empty()).then(|| PathBuf::from(&self.php_ini))
    }

    /// Build the worker pool configuration for a resolved interpreter.
    pub fn pool_config(&self, runtime: PathBuf) -> WorkerPoolConfig {
        // Workers run inside project_root, so relative paths are anchored to
        // the current directory first.
        let command = WorkerCommand {
            runtime: anchored(runtime),
            runtime_config: self.runtime_config().map(anchored),
            interpreter_args: self.interpreter_args.clone(),
            entry_point: anchored(self.entry_point()),
            working_dir: Some(PathBuf::from(&self.project_root)),
        };
        WorkerPoolConfig {
            worker_count: self.worker_count,
            command,
            restart: RestartPolicy {
                initial_delay: Duration::from_millis(self.restart_delay_ms),
                max_delay: Duration::from_millis(self.restart_max_delay_ms),
                max_attempts: self.restart_max_attempts,
                ..Default::default()
            },
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            exchange_timeout: (self.request_timeout_ms > 0)
                .then(|| Duration::from_millis(self.request_timeout_ms)),
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

fn anchored(path: PathBuf) -> PathBuf {
    std::path::absolute(&path).unwrap_or(path)
}
