/// Core types and structures for the watchbox supervisor
use crate::stdio::IoEndpoint;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Notification fired from the monitor worker once the child is confirmed
/// to be running, before the first wait. Lets the caller start streaming
/// I/O as early as possible.
pub type SpawnCallback = Box<dyn FnOnce() + Send + 'static>;

/// Default live-stat polling cadence in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Bounds for the polling cadence. Finer than 10 ms burns CPU on the
/// supervisor side; coarser than 50 ms lets limit breaches run too long.
pub const MIN_POLL_INTERVAL_MS: u64 = 10;
pub const MAX_POLL_INTERVAL_MS: u64 = 50;

/// Hard cap on argv length accepted by `spawn`.
pub const MAX_ARGS: usize = 255;

/// One spawn: what to run, under which limits, wired to which endpoints.
#[derive(Serialize, Deserialize)]
pub struct SpawnRequest {
    /// Executable, resolved with the host's PATH-lookup semantics.
    pub command: String,
    /// Arguments passed verbatim. No shell is involved.
    pub args: Vec<String>,
    /// Working directory for the child; inherited when `None`.
    pub cwd: Option<PathBuf>,
    /// CPU-time limit (user + system) in milliseconds. 0 means no limit.
    pub cpu_time_limit_ms: u64,
    /// Resident-memory limit in bytes. 0 means no limit.
    pub memory_limit_bytes: u64,
    /// Endpoint the child's fd 0 is bound to.
    pub stdin: IoEndpoint,
    /// Endpoint the child's fd 1 is bound to.
    pub stdout: IoEndpoint,
    /// Endpoint the child's fd 2 is bound to.
    pub stderr: IoEndpoint,
    /// Live-stat polling cadence, clamped to [10, 50] ms.
    pub poll_interval_ms: u64,
    /// Fired once from the monitor worker when the child is live.
    #[serde(skip)]
    pub on_spawn: Option<SpawnCallback>,
    /// Correlation id used in log lines only.
    pub instance_id: String,
}

impl SpawnRequest {
    /// Request with no limits, inherited stdio, and the default cadence.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            cpu_time_limit_ms: 0,
            memory_limit_bytes: 0,
            stdin: IoEndpoint::Inherit,
            stdout: IoEndpoint::Inherit,
            stderr: IoEndpoint::Inherit,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            on_spawn: None,
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Validate the request before any OS resource is touched.
    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(MonitorError::InvalidRequest(
                "empty command provided".to_string(),
            ));
        }
        if self.args.len() > MAX_ARGS {
            return Err(MonitorError::InvalidRequest(format!(
                "too many arguments: {} (max {})",
                self.args.len(),
                MAX_ARGS
            )));
        }
        if contains_nul(&self.command) {
            return Err(MonitorError::InvalidRequest(
                "command contains NUL byte".to_string(),
            ));
        }
        for arg in &self.args {
            if contains_nul(arg) {
                return Err(MonitorError::InvalidRequest(
                    "argument contains NUL byte".to_string(),
                ));
            }
        }
        if let Some(cwd) = &self.cwd {
            if cwd.as_os_str().is_empty() {
                return Err(MonitorError::InvalidRequest(
                    "cwd is empty; use None to inherit".to_string(),
                ));
            }
            // Checked here, not left to the platform string conversion:
            // a wide-string path would silently truncate at the NUL.
            if cwd.to_string_lossy().bytes().any(|b| b == 0) {
                return Err(MonitorError::InvalidRequest(
                    "cwd contains NUL byte".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Polling cadence clamped to the supported range.
    pub fn effective_poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms
            .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS)
    }

    /// Copyable view of the configured limits, for the classifier.
    pub fn limits(&self) -> Limits {
        Limits {
            cpu_time_limit_ms: self.cpu_time_limit_ms,
            memory_limit_bytes: self.memory_limit_bytes,
        }
    }
}

impl std::fmt::Debug for SpawnRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnRequest")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("cwd", &self.cwd)
            .field("cpu_time_limit_ms", &self.cpu_time_limit_ms)
            .field("memory_limit_bytes", &self.memory_limit_bytes)
            .field("stdin", &self.stdin)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("on_spawn", &self.on_spawn.as_ref().map(|_| ".."))
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

/// The limits a monitor enforces, detached from the rest of the request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub cpu_time_limit_ms: u64,
    pub memory_limit_bytes: u64,
}

/// Final, structured outcome of one spawn.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// Total CPU time (user + system) consumed by the child, in ms.
    pub elapsed_cpu_ms: u64,
    /// High-water-mark resident set size in bytes.
    pub peak_memory_bytes: u64,
    /// Exit status if the child exited normally; `None` for signal or
    /// OS-exception deaths.
    pub exit_code: Option<i32>,
    /// Terminating signal (POSIX), if any.
    pub term_signal: Option<i32>,
    /// Raw termination/exception code (Windows), if any.
    pub term_code: Option<u32>,
    /// The CPU-time limit was the reason for termination.
    pub timed_out: bool,
    /// The memory limit was the reason for termination.
    pub memory_limit_exceeded: bool,
    /// External cancellation was the reason for termination.
    pub stopped: bool,
    /// The child never executed. Always false on these back-ends: spawn
    /// failures surface synchronously from `spawn`. Kept so records stay
    /// format-compatible with callback-owning runtimes.
    pub spawn_error: bool,
}

impl CompletionRecord {
    /// True when the child ran to completion without the monitor or the
    /// kernel cutting it short.
    pub fn exited_normally(&self) -> bool {
        self.exit_code.is_some() && self.term_signal.is_none() && self.term_code.is_none()
    }
}

/// What the monitor loop observed about the child's death, before
/// classification. Collected by the platform back-ends.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TerminationEvidence {
    /// Normal-exit status, when the OS reported one.
    pub exit_code: Option<i32>,
    /// Terminating signal (POSIX back-ends).
    pub term_signal: Option<i32>,
    /// Raw exit DWORD (Windows back-end); normal codes included.
    pub term_code: Option<u32>,
    /// CPU time (user + system) at reap, in ms.
    pub cpu_ms: u64,
    /// User-only CPU time at reap, where the platform separates it.
    pub user_cpu_ms: Option<u64>,
    /// Highest resident set observed across probes and final rusage.
    pub peak_memory_bytes: u64,
    /// The loop killed the child for CPU time.
    pub timed_out: bool,
    /// The loop killed the child for memory.
    pub memory_limit_exceeded: bool,
    /// The loop killed the child on cancellation.
    pub stopped: bool,
}

/// Custom error types for watchbox
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("endpoint connect failed: {0}")]
    EndpointConnect(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("limit setup failed: {0}")]
    LimitSetup(String),

    #[error("wait failed: {0}")]
    Wait(String),

    #[error("monitor worker terminated without producing a result")]
    WorkerLost,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(unix)]
impl From<nix::errno::Errno> for MonitorError {
    fn from(err: nix::errno::Errno) -> Self {
        MonitorError::Io(std::io::Error::from_raw_os_error(err as i32))
    }
}

/// Result type alias for watchbox operations
pub type Result<T> = std::result::Result<T, MonitorError>;

fn contains_nul(s: &str) -> bool {
    s.bytes().any(|b| b == 0)
}
