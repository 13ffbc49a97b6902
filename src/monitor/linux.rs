//! Linux back-end: fork/exec with a close-on-exec errno pipe, then a
//! pidfd + eventfd poll loop with procfs stat sampling.
//!
//! Requires Linux 5.3+ for `pidfd_open`. The pidfd gives a pollable
//! process-exit event; the cancellation eventfd is polled next to it, so
//! the loop blocks on exit OR cancellation OR the poll tick and never
//! spins.

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::cancel::CancelChannel;
use crate::clock::WallClock;
use crate::limits;
use crate::probe;
use crate::stdio;
use crate::types::{MonitorError, Result, SpawnRequest, TerminationEvidence};

use super::MonitorBackend;

// Pre-exec failure stages reported through the errno pipe.
const STAGE_ENDPOINT: i32 = 1;
const STAGE_CHDIR: i32 = 2;
const STAGE_EXEC: i32 = 3;

pub(crate) struct PidfdMonitor {
    pid: libc::pid_t,
    reaped: bool,
}

fn pidfd_open(pid: libc::pid_t) -> std::result::Result<OwnedFd, Errno> {
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0u32) };
    if fd < 0 {
        Err(Errno::last())
    } else {
        Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
    }
}

/// Write `[stage, errno]` into the error pipe and die without running
/// any destructors. Only async-signal-safe calls on this path.
fn child_report_and_exit(err_fd: RawFd, stage: i32, errno: i32) -> ! {
    let payload = [stage, errno];
    unsafe {
        libc::write(
            err_fd,
            payload.as_ptr() as *const libc::c_void,
            std::mem::size_of_val(&payload),
        );
        libc::_exit(127);
    }
}

fn spawn_stage_error(stage: i32, errno: i32, command: &str) -> MonitorError {
    let err = std::io::Error::from_raw_os_error(errno);
    match stage {
        STAGE_ENDPOINT => {
            MonitorError::EndpointConnect(format!("child could not open endpoint: {}", err))
        }
        STAGE_CHDIR => MonitorError::Spawn(format!("chdir failed: {}", err)),
        _ => MonitorError::Spawn(format!("{}: {}", command, err)),
    }
}

impl MonitorBackend for PidfdMonitor {
    fn launch(request: &SpawnRequest) -> Result<Self> {
        let prepared = [
            stdio::prepare(&request.stdin)?,
            stdio::prepare(&request.stdout)?,
            stdio::prepare(&request.stderr)?,
        ];

        let exec = CString::new(request.command.as_str())
            .map_err(|_| MonitorError::InvalidRequest("command contains NUL byte".into()))?;
        let mut argv = Vec::with_capacity(request.args.len() + 1);
        argv.push(exec.clone());
        for arg in &request.args {
            argv.push(
                CString::new(arg.as_str())
                    .map_err(|_| MonitorError::InvalidRequest("argument contains NUL byte".into()))?,
            );
        }
        let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());

        let cwd = match &request.cwd {
            Some(dir) => Some(
                CString::new(dir.as_os_str().as_bytes())
                    .map_err(|_| MonitorError::InvalidRequest("cwd contains NUL byte".into()))?,
            ),
            None => None,
        };

        // Close-on-exec pipe: silently closed when exec succeeds, carries
        // [stage, errno] when any pre-exec step fails.
        let mut pipe_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let err_read = unsafe { OwnedFd::from_raw_fd(pipe_fds[0]) };
        let err_write = unsafe { OwnedFd::from_raw_fd(pipe_fds[1]) };

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(MonitorError::Spawn(format!(
                "fork failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        if pid == 0 {
            // Child. Shares no locks with the parent from here on; raw
            // libc only, and _exit on every failure path.
            let err_fd = err_write.as_raw_fd();

            unsafe {
                // Child must not outlive its supervisor.
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong);
            }

            if let Err(errno) = stdio::bind_child_stdio(&prepared) {
                child_report_and_exit(err_fd, STAGE_ENDPOINT, errno);
            }

            limits::seed_cpu_rlimit(request.cpu_time_limit_ms);

            if let Some(dir) = &cwd {
                if unsafe { libc::chdir(dir.as_ptr()) } < 0 {
                    child_report_and_exit(
                        err_fd,
                        STAGE_CHDIR,
                        std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
                    );
                }
            }

            unsafe {
                libc::execvp(exec.as_ptr(), argv_ptrs.as_ptr());
            }
            child_report_and_exit(
                err_fd,
                STAGE_EXEC,
                std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
            );
        }

        // Parent: the write end must go away so a successful exec reads
        // as EOF here.
        drop(err_write);

        let mut buf = [0u8; 8];
        let n = loop {
            let n = unsafe {
                libc::read(
                    err_read.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n < 0 && Errno::last() == Errno::EINTR {
                continue;
            }
            break n;
        };

        if n > 0 {
            // Child reported a pre-exec failure and exited; reap it so
            // no zombie outlives the error.
            let mut status = 0;
            while unsafe { libc::waitpid(pid, &mut status, 0) } < 0
                && Errno::last() == Errno::EINTR
            {}
            let (stage, errno) = if n as usize >= buf.len() {
                (
                    i32::from_ne_bytes(buf[0..4].try_into().unwrap()),
                    i32::from_ne_bytes(buf[4..8].try_into().unwrap()),
                )
            } else {
                (STAGE_EXEC, libc::EIO)
            };
            return Err(spawn_stage_error(stage, errno, &request.command));
        }

        Ok(Self { pid, reaped: false })
    }

    fn pid(&self) -> u32 {
        self.pid as u32
    }

    fn supervise(
        mut self,
        request: &SpawnRequest,
        cancel: &CancelChannel,
    ) -> Result<TerminationEvidence> {
        let interval = request.effective_poll_interval_ms() as libc::c_int;
        let lim = request.limits();
        let clock = WallClock::start();
        let cancel_fd = cancel.wake_fd();

        let mut peak_memory_bytes = 0u64;
        let mut timed_out = false;
        let mut memory_limit_exceeded = false;
        let mut stopped = false;

        let pidfd = match pidfd_open(self.pid) {
            Ok(fd) => Some(fd),
            // Already a zombie (or reaped elsewhere): skip straight to
            // the reap, final stats are still collected there.
            Err(Errno::ESRCH) => None,
            Err(e) => {
                return Err(MonitorError::Wait(format!(
                    "pidfd_open failed (requires Linux 5.3+): {}",
                    e
                )))
            }
        };

        if let Some(pidfd) = &pidfd {
            'watch: loop {
                let mut pfds = [
                    libc::pollfd {
                        fd: pidfd.as_raw_fd(),
                        events: libc::POLLIN,
                        revents: 0,
                    },
                    libc::pollfd {
                        fd: cancel_fd,
                        events: libc::POLLIN,
                        revents: 0,
                    },
                ];

                let n = unsafe { libc::poll(pfds.as_mut_ptr(), 2, interval) };
                if n < 0 {
                    if Errno::last() == Errno::EINTR {
                        continue 'watch;
                    }
                    return Err(MonitorError::Wait(format!(
                        "poll failed: {}",
                        std::io::Error::last_os_error()
                    )));
                }

                if n > 0 {
                    // Exit beats cancellation when both are pending: a
                    // child that finished on its last cycle is not
                    // reported as cancelled.
                    if pfds[0].revents != 0 {
                        break 'watch;
                    }
                    if pfds[1].revents & libc::POLLIN != 0 {
                        stopped = true;
                        let _ = kill(Pid::from_raw(self.pid), Signal::SIGKILL);
                        break 'watch;
                    }
                    continue 'watch;
                }

                // Poll tick: sample live stats, memory first.
                if let Some(sample) = probe::sample(self.pid as u32) {
                    peak_memory_bytes = peak_memory_bytes.max(sample.peak_rss_bytes);

                    if lim.memory_limit_bytes > 0
                        && sample.peak_rss_bytes > lim.memory_limit_bytes
                    {
                        memory_limit_exceeded = true;
                        let _ = kill(Pid::from_raw(self.pid), Signal::SIGKILL);
                        break 'watch;
                    }
                    if lim.cpu_time_limit_ms > 0 && sample.cpu_ms > lim.cpu_time_limit_ms {
                        timed_out = true;
                        let _ = kill(Pid::from_raw(self.pid), Signal::SIGKILL);
                        break 'watch;
                    }
                }

                // Wall-clock safety net: catches children that sleep or
                // block forever and so never burn CPU.
                if lim.cpu_time_limit_ms > 0 && clock.elapsed_ms() > lim.cpu_time_limit_ms * 2 {
                    timed_out = true;
                    let _ = kill(Pid::from_raw(self.pid), Signal::SIGKILL);
                    break 'watch;
                }
            }
        }

        // Leaving the watching state: cancellation becomes a no-op.
        cancel.close();
        drop(pidfd);

        let mut status: libc::c_int = 0;
        let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
        loop {
            let rc = unsafe { libc::wait4(self.pid, &mut status, 0, &mut rusage) };
            if rc < 0 && Errno::last() == Errno::EINTR {
                continue;
            }
            if rc < 0 {
                // Reaped elsewhere: proceed with zeroed rusage and a
                // zero (clean-exit) status rather than hanging.
                log::warn!(
                    "[{}] wait4 for child {} failed: {}",
                    request.instance_id,
                    self.pid,
                    std::io::Error::last_os_error()
                );
            }
            break;
        }
        self.reaped = true;

        let cpu_us = (rusage.ru_utime.tv_sec + rusage.ru_stime.tv_sec) as u64 * 1_000_000
            + (rusage.ru_utime.tv_usec + rusage.ru_stime.tv_usec) as u64;
        let cpu_ms = (cpu_us + 500) / 1000;
        // ru_maxrss is kilobytes on Linux.
        peak_memory_bytes = peak_memory_bytes.max(rusage.ru_maxrss.max(0) as u64 * 1024);

        let mut evidence = TerminationEvidence {
            cpu_ms,
            peak_memory_bytes,
            timed_out,
            memory_limit_exceeded,
            stopped,
            ..Default::default()
        };
        if libc::WIFSIGNALED(status) {
            evidence.term_signal = Some(libc::WTERMSIG(status));
        } else if libc::WIFEXITED(status) {
            evidence.exit_code = Some(libc::WEXITSTATUS(status));
        }

        Ok(evidence)
    }
}

impl Drop for PidfdMonitor {
    fn drop(&mut self) {
        // Dropped without supervising (worker failed to start, or the
        // monitor loop errored out): do not leak a running child or a
        // zombie.
        if !self.reaped {
            let _ = kill(Pid::from_raw(self.pid), Signal::SIGKILL);
            let mut status = 0;
            while unsafe { libc::waitpid(self.pid, &mut status, 0) } < 0
                && Errno::last() == Errno::EINTR
            {}
            self.reaped = true;
        }
    }
}
