/// Termination classification
///
/// Turns what the monitor loop observed (exit status, terminating
/// signal or status code, accumulated stats, self-inflicted kill flags)
/// into the final completion record. This is a pure, deterministic
/// function: identical evidence always yields an identical record.
///
/// Invariant kept here: at most one of the cause flags (`timed_out`,
/// `memory_limit_exceeded`, `stopped`) is ever set. When an external
/// kill cannot be attributed, all three stay false and the raw signal or
/// status code is reported instead.
use crate::limits::cpu_limit_seconds;
use crate::types::{CompletionRecord, Limits, TerminationEvidence};

#[cfg(unix)]
use libc::{SIGKILL, SIGXCPU};
#[cfg(not(unix))]
const SIGKILL: i32 = 9;
#[cfg(not(unix))]
const SIGXCPU: i32 = 24;

/// Job terminated by the OS for exceeding a quota.
const STATUS_QUOTA_EXCEEDED: u32 = 0xC000_0044;
/// Win32 mapping of the same condition.
const ERROR_NOT_ENOUGH_QUOTA: u32 = 0x705;
/// Everything at or above this is an NTSTATUS error (access violation,
/// stack overflow, ...), not an exit code the child chose.
const NTSTATUS_ERROR_FLOOR: u32 = 0xC000_0000;

pub struct Classifier;

impl Classifier {
    /// Classify one reaped child. Pure over the evidence bundle.
    pub fn classify(evidence: &TerminationEvidence, limits: &Limits) -> CompletionRecord {
        let mut record = CompletionRecord {
            elapsed_cpu_ms: evidence.cpu_ms,
            peak_memory_bytes: evidence.peak_memory_bytes,
            ..Default::default()
        };

        // Cause attributed by the loop itself. The loop sets exactly one
        // flag per kill; if evidence ever carries more than one, stop
        // wins over memory wins over time.
        if evidence.stopped {
            record.stopped = true;
        } else if evidence.memory_limit_exceeded {
            record.memory_limit_exceeded = true;
        } else if evidence.timed_out {
            record.timed_out = true;
        }

        // Post-mortem re-check: a spike between the last poll tick and
        // the reap still counts, memory first, only when the loop did
        // not already attribute a cause.
        if !Self::has_cause(&record) {
            if limits.memory_limit_bytes > 0
                && evidence.peak_memory_bytes > limits.memory_limit_bytes
            {
                record.memory_limit_exceeded = true;
            } else if limits.cpu_time_limit_ms > 0 && evidence.cpu_ms > limits.cpu_time_limit_ms {
                record.timed_out = true;
            }
        }

        if let Some(code) = evidence.term_code {
            Self::apply_status_code(&mut record, evidence, limits, code);
        } else if let Some(signal) = evidence.term_signal {
            Self::apply_signal(&mut record, evidence, limits, signal);
        } else {
            record.exit_code = evidence.exit_code;
        }

        record
    }

    fn has_cause(record: &CompletionRecord) -> bool {
        record.timed_out || record.memory_limit_exceeded || record.stopped
    }

    /// POSIX: the child died to a signal; `exit_code` stays `None`.
    fn apply_signal(
        record: &mut CompletionRecord,
        evidence: &TerminationEvidence,
        limits: &Limits,
        signal: i32,
    ) {
        record.term_signal = Some(signal);

        if Self::has_cause(record) {
            return;
        }

        if signal == SIGXCPU {
            // The seeded RLIMIT_CPU fired before our polling did.
            record.timed_out = true;
            return;
        }

        if signal == SIGKILL {
            // Could be our own kill that lost its flag in a race, or an
            // external killer (system OOM). Attribute only when the
            // stats sit within 90% of a configured limit.
            let secs = cpu_limit_seconds(limits.cpu_time_limit_ms);
            if limits.cpu_time_limit_ms > 0 && evidence.cpu_ms >= secs * 900 {
                record.timed_out = true;
            } else if limits.memory_limit_bytes > 0
                && evidence.peak_memory_bytes * 10 >= limits.memory_limit_bytes * 9
            {
                record.memory_limit_exceeded = true;
            }
            // Otherwise: unknown external kill, flags stay false and the
            // raw signal is the caller's evidence.
        }
    }

    /// Windows: one DWORD carries exit codes, NTSTATUS values, and the
    /// job object's quota verdict.
    fn apply_status_code(
        record: &mut CompletionRecord,
        evidence: &TerminationEvidence,
        limits: &Limits,
        code: u32,
    ) {
        if code == STATUS_QUOTA_EXCEEDED || code == ERROR_NOT_ENOUGH_QUOTA {
            record.term_code = Some(code);
            if !Self::has_cause(record) {
                // The job kills for both time and memory with the same
                // status; user time against the limit disambiguates.
                let user_ms = evidence.user_cpu_ms.unwrap_or(evidence.cpu_ms);
                if limits.cpu_time_limit_ms > 0 && user_ms * 100 >= limits.cpu_time_limit_ms * 95 {
                    record.timed_out = true;
                } else {
                    record.memory_limit_exceeded = true;
                }
            }
            return;
        }

        if code >= NTSTATUS_ERROR_FLOOR {
            // Crash (access violation and friends): no exit code.
            record.term_code = Some(code);
            return;
        }

        if Self::has_cause(record) {
            // We terminated the process ourselves; the forced exit code
            // carries no meaning.
            record.term_code = Some(code);
            return;
        }

        record.exit_code = Some(code as i32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(cpu_ms: u64, mem_bytes: u64) -> Limits {
        Limits {
            cpu_time_limit_ms: cpu_ms,
            memory_limit_bytes: mem_bytes,
        }
    }

    fn exited(code: i32, cpu_ms: u64, peak: u64) -> TerminationEvidence {
        TerminationEvidence {
            exit_code: Some(code),
            cpu_ms,
            peak_memory_bytes: peak,
            ..Default::default()
        }
    }

    fn signaled(signal: i32, cpu_ms: u64, peak: u64) -> TerminationEvidence {
        TerminationEvidence {
            term_signal: Some(signal),
            cpu_ms,
            peak_memory_bytes: peak,
            ..Default::default()
        }
    }

    #[test]
    fn clean_exit_reports_code_and_stats() {
        let record = Classifier::classify(&exited(0, 120, 1 << 20), &limits(10_000, 1 << 30));
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(record.term_signal, None);
        assert_eq!(record.elapsed_cpu_ms, 120);
        assert_eq!(record.peak_memory_bytes, 1 << 20);
        assert!(!record.timed_out && !record.memory_limit_exceeded && !record.stopped);
    }

    #[test]
    fn nonzero_exit_is_not_a_cause_flag() {
        let record = Classifier::classify(&exited(1, 5, 1024), &limits(0, 0));
        assert_eq!(record.exit_code, Some(1));
        assert!(!record.timed_out && !record.memory_limit_exceeded && !record.stopped);
    }

    #[test]
    fn exit_codes_round_trip() {
        for code in [0, 1, 2, 42, 100, 255] {
            let record = Classifier::classify(&exited(code, 1, 0), &limits(0, 0));
            assert_eq!(record.exit_code, Some(code));
            assert_eq!(record.term_signal, None);
        }
    }

    #[test]
    fn loop_flags_survive_classification() {
        let evidence = TerminationEvidence {
            term_signal: Some(9),
            cpu_ms: 620,
            timed_out: true,
            ..Default::default()
        };
        let record = Classifier::classify(&evidence, &limits(500, 0));
        assert!(record.timed_out);
        assert!(!record.memory_limit_exceeded && !record.stopped);
        assert_eq!(record.exit_code, None);
        assert_eq!(record.term_signal, Some(9));
    }

    #[test]
    fn at_most_one_cause_even_from_racy_evidence() {
        let evidence = TerminationEvidence {
            term_signal: Some(9),
            stopped: true,
            timed_out: true,
            memory_limit_exceeded: true,
            ..Default::default()
        };
        let record = Classifier::classify(&evidence, &limits(500, 1 << 20));
        assert!(record.stopped);
        assert!(!record.timed_out);
        assert!(!record.memory_limit_exceeded);
    }

    #[test]
    fn sigxcpu_means_time_limit() {
        let record = Classifier::classify(&signaled(SIGXCPU, 1010, 0), &limits(1000, 0));
        assert!(record.timed_out);
        assert_eq!(record.exit_code, None);
        assert_eq!(record.term_signal, Some(SIGXCPU));
    }

    #[test]
    fn sigkill_near_cpu_limit_is_attributed_to_time() {
        // Limit rounds to 1s; 90% of that is 900 ms.
        let record = Classifier::classify(&signaled(SIGKILL, 900, 0), &limits(1000, 0));
        assert!(record.timed_out);

        let record = Classifier::classify(&signaled(SIGKILL, 899, 0), &limits(1000, 0));
        assert!(!record.timed_out);
    }

    #[test]
    fn sigkill_near_memory_limit_is_attributed_to_memory() {
        let limit = 128 * 1024 * 1024;
        let record =
            Classifier::classify(&signaled(SIGKILL, 10, limit * 9 / 10), &limits(0, limit));
        assert!(record.memory_limit_exceeded);
        assert!(!record.timed_out);
    }

    #[test]
    fn unattributable_sigkill_reports_raw_signal_only() {
        let record = Classifier::classify(&signaled(SIGKILL, 10, 1024), &limits(10_000, 1 << 30));
        assert!(!record.timed_out && !record.memory_limit_exceeded && !record.stopped);
        assert_eq!(record.term_signal, Some(SIGKILL));
        assert_eq!(record.exit_code, None);
    }

    #[test]
    fn other_fatal_signals_are_runtime_errors() {
        let record = Classifier::classify(&signaled(11, 10, 1024), &limits(1000, 1 << 20));
        assert_eq!(record.term_signal, Some(11));
        assert_eq!(record.exit_code, None);
        assert!(!record.timed_out && !record.memory_limit_exceeded && !record.stopped);
    }

    #[test]
    fn post_mortem_recovers_cpu_overrun_on_normal_exit() {
        // Child finished between the last tick and the reap.
        let record = Classifier::classify(&exited(0, 760, 0), &limits(500, 0));
        assert!(record.timed_out);
        assert_eq!(record.exit_code, Some(0));
    }

    #[test]
    fn post_mortem_prefers_memory_over_cpu() {
        let record =
            Classifier::classify(&exited(0, 760, 2 << 20), &limits(500, 1 << 20));
        assert!(record.memory_limit_exceeded);
        assert!(!record.timed_out);
    }

    #[test]
    fn zero_limits_disable_post_mortem_checks() {
        let record = Classifier::classify(&exited(0, 999_999, u64::MAX / 2), &limits(0, 0));
        assert!(!record.timed_out && !record.memory_limit_exceeded);
    }

    #[test]
    fn quota_status_disambiguates_by_user_time() {
        let evidence = TerminationEvidence {
            term_code: Some(STATUS_QUOTA_EXCEEDED),
            cpu_ms: 990,
            user_cpu_ms: Some(960),
            ..Default::default()
        };
        let record = Classifier::classify(&evidence, &limits(1000, 1 << 20));
        assert!(record.timed_out);
        assert!(!record.memory_limit_exceeded);
        assert_eq!(record.exit_code, None);

        let evidence = TerminationEvidence {
            term_code: Some(ERROR_NOT_ENOUGH_QUOTA),
            cpu_ms: 100,
            user_cpu_ms: Some(80),
            ..Default::default()
        };
        let record = Classifier::classify(&evidence, &limits(1000, 1 << 20));
        assert!(record.memory_limit_exceeded);
        assert!(!record.timed_out);
    }

    #[test]
    fn quota_status_without_cpu_limit_is_memory() {
        let evidence = TerminationEvidence {
            term_code: Some(STATUS_QUOTA_EXCEEDED),
            cpu_ms: 50,
            user_cpu_ms: Some(50),
            ..Default::default()
        };
        let record = Classifier::classify(&evidence, &limits(0, 1 << 20));
        assert!(record.memory_limit_exceeded);
    }

    #[test]
    fn ntstatus_crash_hides_exit_code() {
        let evidence = TerminationEvidence {
            term_code: Some(0xC000_0005),
            ..Default::default()
        };
        let record = Classifier::classify(&evidence, &limits(0, 0));
        assert_eq!(record.exit_code, None);
        assert_eq!(record.term_code, Some(0xC000_0005));
        assert!(!record.timed_out && !record.memory_limit_exceeded && !record.stopped);
    }

    #[test]
    fn plain_status_code_is_an_exit_code() {
        let evidence = TerminationEvidence {
            term_code: Some(3),
            ..Default::default()
        };
        let record = Classifier::classify(&evidence, &limits(0, 0));
        assert_eq!(record.exit_code, Some(3));
        assert_eq!(record.term_code, None);
    }

    #[test]
    fn forced_termination_exit_code_is_suppressed() {
        let evidence = TerminationEvidence {
            term_code: Some(1),
            stopped: true,
            ..Default::default()
        };
        let record = Classifier::classify(&evidence, &limits(0, 0));
        assert!(record.stopped);
        assert_eq!(record.exit_code, None);
        assert_eq!(record.term_code, Some(1));
    }

    #[test]
    fn classification_is_deterministic() {
        let evidence = signaled(SIGKILL, 950, 42);
        let l = limits(1000, 0);
        assert_eq!(
            Classifier::classify(&evidence, &l),
            Classifier::classify(&evidence, &l)
        );
    }
}
