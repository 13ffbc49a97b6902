//! Live resource probe for a running child.
//!
//! Samples the child's CPU time and resident memory from the OS while it
//! runs: procfs on Linux, `proc_pid_rusage` on macOS. The Windows
//! back-end reads its Job Object accounting instead and does not go
//! through this module. A failed sample is reported as `None`: the
//! child may already be gone, which the monitor loop treats as an exit
//! about to be observed, never as an error.

/// One point-in-time reading of a child's resource usage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProbeSample {
    /// CPU time (user + system) in milliseconds.
    pub cpu_ms: u64,
    /// Current resident set size in bytes.
    pub rss_bytes: u64,
    /// High-water-mark resident set size in bytes, where the platform
    /// tracks one (VmHWM on Linux; equals `rss_bytes` on macOS).
    pub peak_rss_bytes: u64,
}

/// Parse a `VmRSS:`/`VmHWM:`-style line of `/proc/<pid>/status` into
/// bytes. The kernel reports these in kB.
#[cfg(unix)]
pub fn parse_status_kb_line(line: &str, prefix: &str) -> Option<u64> {
    let rest = line.strip_prefix(prefix)?;
    let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
    Some(kb * 1024)
}

/// Extract (utime, stime) clock ticks from `/proc/<pid>/stat`.
///
/// The comm field is parenthesized and may itself contain spaces or
/// parentheses, so fields are counted from after the last ')'.
#[cfg(unix)]
pub fn parse_stat_cpu_ticks(stat: &str) -> Option<(u64, u64)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    // After the comm field: state ppid pgrp session tty_nr tpgid flags
    // minflt cminflt majflt cmajflt utime stime ...
    let utime = fields.nth(11)?.parse().ok()?;
    let stime = fields.next()?.parse().ok()?;
    Some((utime, stime))
}

#[cfg(target_os = "linux")]
pub fn sample(pid: u32) -> Option<ProbeSample> {
    use crate::clock;

    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    let mut rss_bytes = 0;
    let mut peak_rss_bytes = 0;
    for line in status.lines() {
        if let Some(bytes) = parse_status_kb_line(line, "VmRSS:") {
            rss_bytes = bytes;
        } else if let Some(bytes) = parse_status_kb_line(line, "VmHWM:") {
            peak_rss_bytes = bytes;
        }
    }

    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let (utime, stime) = parse_stat_cpu_ticks(&stat)?;
    let cpu_ms = clock::jiffies_to_ms(utime + stime, clock::clock_ticks_per_second());

    Some(ProbeSample {
        cpu_ms,
        rss_bytes,
        peak_rss_bytes: peak_rss_bytes.max(rss_bytes),
    })
}

#[cfg(target_os = "macos")]
pub fn sample(pid: u32) -> Option<ProbeSample> {
    use crate::clock;

    let mut info: libc::rusage_info_v2 = unsafe { std::mem::zeroed() };
    let rc = unsafe {
        libc::proc_pid_rusage(
            pid as libc::c_int,
            libc::RUSAGE_INFO_V2,
            &mut info as *mut libc::rusage_info_v2 as *mut libc::rusage_info_t,
        )
    };
    if rc != 0 {
        return None;
    }

    let cpu_ns = clock::mach_ticks_to_ns(info.ri_user_time + info.ri_system_time);
    Some(ProbeSample {
        cpu_ms: cpu_ns / 1_000_000,
        rss_bytes: info.ri_resident_size,
        peak_rss_bytes: info.ri_resident_size,
    })
}
