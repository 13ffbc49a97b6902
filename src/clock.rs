//! Monotonic wall clock and platform timebase conversion.
//!
//! The monitor loop measures wall time against a steady clock, never the
//! system clock. CPU-time samples arrive in platform units (jiffies on
//! Linux, Mach ticks on Apple Silicon) and are converted here.

use std::time::Instant;

/// Steady wall-clock anchored at monitor start.
#[derive(Clone, Copy, Debug)]
pub struct WallClock {
    start: Instant,
}

impl WallClock {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Milliseconds elapsed since `start()`.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Convert scheduler jiffies to milliseconds given the tick rate.
#[cfg(unix)]
pub fn jiffies_to_ms(jiffies: u64, ticks_per_second: u64) -> u64 {
    if ticks_per_second == 0 {
        return 0;
    }
    jiffies * 1000 / ticks_per_second
}

/// Cached `_SC_CLK_TCK`, typically 100 on Linux.
#[cfg(target_os = "linux")]
pub fn clock_ticks_per_second() -> u64 {
    use std::sync::OnceLock;
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| {
        let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if hz > 0 {
            hz as u64
        } else {
            100
        }
    })
}

/// Convert Mach absolute-time ticks to nanoseconds.
///
/// On Apple Silicon the values `proc_pid_rusage` reports for CPU time are
/// Mach ticks, not nanoseconds; the ratio comes from `mach_timebase_info`
/// (1/1 on Intel).
#[cfg(target_os = "macos")]
pub fn mach_ticks_to_ns(ticks: u64) -> u64 {
    use std::sync::OnceLock;
    static TIMEBASE: OnceLock<(u64, u64)> = OnceLock::new();
    let (numer, denom) = *TIMEBASE.get_or_init(|| {
        let mut info = libc::mach_timebase_info_data_t { numer: 0, denom: 0 };
        let rc = unsafe { libc::mach_timebase_info(&mut info) };
        if rc == 0 && info.denom != 0 {
            (info.numer as u64, info.denom as u64)
        } else {
            (1, 1)
        }
    });
    ticks * numer / denom
}
