// Outcome telemetry for supervised spawns.
//
// Process-local counters only: every completed monitor bumps exactly one
// outcome counter, so the embedding judge can watch verdict mix and
// failure rates without wiring an exporter. No histograms, no exporters,
// no per-spawn state.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::types::{CompletionRecord, MonitorError};

/// Counter metric (monotonically increasing)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters for every way a supervised child can end.
#[derive(Debug, Default)]
pub struct OutcomeMetrics {
    pub spawned: Counter,
    pub completed_ok: Counter,
    pub runtime_error: Counter,
    pub signaled: Counter,
    pub timed_out: Counter,
    pub memory_limit_exceeded: Counter,
    pub cancelled: Counter,
    pub monitor_errors: Counter,
}

impl OutcomeMetrics {
    pub const fn new() -> Self {
        Self {
            spawned: Counter::new(),
            completed_ok: Counter::new(),
            runtime_error: Counter::new(),
            signaled: Counter::new(),
            timed_out: Counter::new(),
            memory_limit_exceeded: Counter::new(),
            cancelled: Counter::new(),
            monitor_errors: Counter::new(),
        }
    }

    pub fn record_spawn(&self) {
        self.spawned.inc();
    }

    /// Bump the single counter matching this monitor outcome.
    pub fn record_outcome(&self, outcome: &Result<CompletionRecord, MonitorError>) {
        match outcome {
            Err(_) => self.monitor_errors.inc(),
            Ok(record) => {
                if record.stopped {
                    self.cancelled.inc();
                } else if record.memory_limit_exceeded {
                    self.memory_limit_exceeded.inc();
                } else if record.timed_out {
                    self.timed_out.inc();
                } else if record.term_signal.is_some() || record.term_code.is_some() {
                    self.signaled.inc();
                } else if record.exit_code == Some(0) {
                    self.completed_ok.inc();
                } else {
                    self.runtime_error.inc();
                }
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            spawned: self.spawned.get(),
            completed_ok: self.completed_ok.get(),
            runtime_error: self.runtime_error.get(),
            signaled: self.signaled.get(),
            timed_out: self.timed_out.get(),
            memory_limit_exceeded: self.memory_limit_exceeded.get(),
            cancelled: self.cancelled.get(),
            monitor_errors: self.monitor_errors.get(),
        }
    }
}

/// Point-in-time copy of the counters, serializable for status output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub spawned: u64,
    pub completed_ok: u64,
    pub runtime_error: u64,
    pub signaled: u64,
    pub timed_out: u64,
    pub memory_limit_exceeded: u64,
    pub cancelled: u64,
    pub monitor_errors: u64,
}

static GLOBAL: OutcomeMetrics = OutcomeMetrics::new();

/// Process-wide outcome counters shared by all monitors.
pub fn global() -> &'static OutcomeMetrics {
    &GLOBAL
}
