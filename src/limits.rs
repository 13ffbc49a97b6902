//! Kernel-side limit seeding.
//!
//! The kernel is only used where its enforcement is precise and
//! fail-safe; everything else is covered by the polling tick. On POSIX
//! that means seeding RLIMIT_CPU in the child: the soft limit delivers
//! SIGXCPU at whole-second granularity, the hard limit one second later
//! delivers SIGKILL. The monitor's sub-second polling normally fires
//! first; the rlimit catches a child that outlives its supervisor.
//!
//! RLIMIT_AS is deliberately not set: address-space limits over-count
//! runtimes that reserve large mappings, so resident memory is enforced
//! purely by polling. On Windows the Job Object is the enforcer and is
//! configured by the monitor back-end directly.

/// Whole seconds a CPU budget rounds up to, floor 1s. This is also what
/// the classifier compares against when attributing a SIGKILL.
pub fn cpu_limit_seconds(cpu_time_limit_ms: u64) -> u64 {
    cpu_time_limit_ms.div_ceil(1000).max(1)
}

/// Seed RLIMIT_CPU in the forked child. Failure is absorbed: polling
/// enforces the same budget with better granularity.
#[cfg(unix)]
pub(crate) fn seed_cpu_rlimit(cpu_time_limit_ms: u64) {
    use nix::sys::resource::{setrlimit, Resource};

    if cpu_time_limit_ms == 0 {
        return;
    }
    let secs = cpu_limit_seconds(cpu_time_limit_ms);
    // Post-fork: no logging here, the parent cannot see it anyway.
    let _ = setrlimit(Resource::RLIMIT_CPU, secs, secs + 1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_budget_rounds_up_to_seconds() {
        assert_eq!(cpu_limit_seconds(1), 1);
        assert_eq!(cpu_limit_seconds(500), 1);
        assert_eq!(cpu_limit_seconds(1000), 1);
        assert_eq!(cpu_limit_seconds(1001), 2);
        assert_eq!(cpu_limit_seconds(2500), 3);
    }

    #[test]
    fn zero_budget_still_has_a_floor() {
        // Callers gate on limit == 0 before seeding; the floor protects
        // against a 0 -> rlim 0 which would kill the child instantly.
        assert_eq!(cpu_limit_seconds(0), 1);
    }
}
