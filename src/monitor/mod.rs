//! Supervisor facade and the per-platform monitor back-ends.
//!
//! `spawn` is the single entry point: it validates the request, launches
//! the child with stdio bound (failing synchronously if the child never
//! gets to exec), then hands the live child to a dedicated worker thread
//! that runs the monitor loop and eventually delivers one completion
//! record through a one-shot channel.
//!
//! The back-ends differ only in the wait primitive, the stats probe, and
//! the limit-setup call; the state machine around them is the same:
//! Starting -> Watching -> Terminating -> Reaping -> Done.

#[cfg(target_os = "linux")]
pub(crate) mod linux;
#[cfg(target_os = "macos")]
pub(crate) mod macos;
#[cfg(windows)]
pub(crate) mod windows;

use std::thread;

use crossbeam_channel::{bounded, Receiver};

use crate::cancel::CancelChannel;
use crate::classify::Classifier;
use crate::observability;
use crate::types::{CompletionRecord, MonitorError, Result, SpawnRequest, TerminationEvidence};

#[cfg(target_os = "linux")]
use linux::PidfdMonitor as PlatformMonitor;
#[cfg(target_os = "macos")]
use macos::KqueueMonitor as PlatformMonitor;
#[cfg(windows)]
use windows::JobObjectMonitor as PlatformMonitor;

/// What a platform back-end must provide: launch a child, then watch it
/// until exit, cancellation, or a limit breach, and reap it. One
/// implementation per platform; the platform is fixed at build time, so
/// the facade binds the concrete type with a cfg alias instead of a
/// tagged enum.
pub(crate) trait MonitorBackend: Send + Sized + 'static {
    /// Bind stdio, seed kernel limits, and get the child running. Every
    /// failure here is synchronous; on success the child is live.
    fn launch(request: &SpawnRequest) -> Result<Self>;

    /// OS process id, for display only.
    fn pid(&self) -> u32;

    /// Block on exit / cancellation / poll ticks, kill on a breach,
    /// reap, and release every owned OS resource before returning.
    fn supervise(
        self,
        request: &SpawnRequest,
        cancel: &CancelChannel,
    ) -> Result<TerminationEvidence>;
}

/// Live monitor for one spawned child.
pub struct MonitorHandle {
    pid: u32,
    cancel: CancelChannel,
    result: Receiver<Result<CompletionRecord>>,
}

impl std::fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorHandle").field("pid", &self.pid).finish()
    }
}

impl MonitorHandle {
    /// OS pid of the child. Display only: the child may be reaped and
    /// the pid recycled at any time after completion.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Cloneable cancellation handle, callable from any thread.
    pub fn canceler(&self) -> CancelChannel {
        self.cancel.clone()
    }

    /// Request cancellation. Returns false once the monitor has already
    /// finished watching; that is a no-op, not an error.
    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    /// Block until the monitor delivers the completion record. Resolves
    /// strictly after every child fd/handle/job has been released.
    pub fn into_result(self) -> Result<CompletionRecord> {
        match self.result.recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(MonitorError::WorkerLost),
        }
    }

    /// Non-blocking peek at the outcome, if the worker already finished.
    pub fn try_result(&self) -> Option<Result<CompletionRecord>> {
        self.result.try_recv().ok()
    }
}

/// Launch a child under supervision.
///
/// Errors that prevent the child from executing (unknown binary, bad
/// working directory, endpoint connection refused) are returned here,
/// synchronously; no result future is produced for them. On success the
/// returned handle's result resolves exactly once.
pub fn spawn(mut request: SpawnRequest) -> Result<MonitorHandle> {
    request.validate()?;
    let on_spawn = request.on_spawn.take();

    let backend = PlatformMonitor::launch(&request)?;
    let pid = backend.pid();
    observability::global().record_spawn();
    log::debug!(
        "[{}] child {} running: {} {:?}",
        request.instance_id,
        pid,
        request.command,
        request.args
    );

    let cancel = CancelChannel::new()?;
    let worker_cancel = cancel.clone();
    let (tx, rx) = bounded(1);

    thread::Builder::new()
        .name(format!("watchbox-monitor-{}", pid))
        .spawn(move || {
            // Spawn notification fires from the worker, strictly after
            // the child is live and before the first wait.
            if let Some(notify) = on_spawn {
                notify();
            }

            let limits = request.limits();
            let outcome = backend
                .supervise(&request, &worker_cancel)
                .map(|evidence| Classifier::classify(&evidence, &limits));

            // The back-end closes the channel when it leaves its watching
            // state; closing again here makes error paths inert too.
            worker_cancel.close();
            observability::global().record_outcome(&outcome);

            match &outcome {
                Ok(record) => log::debug!(
                    "[{}] child {} done: cpu={}ms peak={}B exit={:?} tle={} mle={} stopped={}",
                    request.instance_id,
                    pid,
                    record.elapsed_cpu_ms,
                    record.peak_memory_bytes,
                    record.exit_code,
                    record.timed_out,
                    record.memory_limit_exceeded,
                    record.stopped
                ),
                Err(err) => log::warn!(
                    "[{}] monitor for child {} failed: {}",
                    request.instance_id,
                    pid,
                    err
                ),
            }

            if tx.send(outcome).is_err() {
                log::debug!(
                    "[{}] completion record for child {} dropped: handle went away",
                    request.instance_id,
                    pid
                );
            }
        })
        .map_err(|e| MonitorError::Spawn(format!("failed to start monitor worker: {}", e)))?;

    Ok(MonitorHandle {
        pid,
        cancel,
        result: rx,
    })
}
