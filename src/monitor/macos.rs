//! macOS back-end: fork/exec with a close-on-exec errno pipe, then a
//! kqueue wait (EVFILT_PROC/NOTE_EXIT for exit, EVFILT_USER for
//! cancellation) with `proc_pid_rusage` sampling.
//!
//! There is no RLIMIT_AS-equivalent for resident memory here, so memory
//! is enforced purely by polling physical footprint; CPU time is seeded
//! with RLIMIT_CPU as a backstop and polled in nanoseconds (after Mach
//! timebase conversion) for sub-second accuracy.

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

const STAGE_ENDPOINT: i32 = 1;
const STAGE_CHDIR: i32 = 2;
const STAGE_EXEC: i32 = 3;

pub(crate) struct KqueueMonitor {
    pid: libc::pid_t,
    reaped: bool,
}

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

fn zeroed_kevent() -> libc::kevent {
    unsafe { std::mem::zeroed() }
}

impl MonitorBackend for KqueueMonitor {
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

        let mut pipe_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let err_read = unsafe { OwnedFd::from_raw_fd(pipe_fds[0]) };
        let err_write = unsafe { OwnedFd::from_raw_fd(pipe_fds[1]) };
        // Close-on-exec on the write end: a successful exec reads as EOF.
        if unsafe { libc::fcntl(err_write.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(MonitorError::Spawn(format!(
                "fork failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        if pid == 0 {
            let err_fd = err_write.as_raw_fd();

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
        let interval = request.effective_poll_interval_ms();
        let lim = request.limits();
        let clock = WallClock::start();
        // Shared with the cancellation waker, which posts NOTE_TRIGGER
        // on the user filter registered below.
        let kq = cancel.kqueue_fd();

        let mut peak_memory_bytes = 0u64;
        let mut timed_out = false;
        let mut memory_limit_exceeded = false;
        let mut stopped = false;

        // The user (cancellation) filter was registered when the channel
        // was created; only the process-exit event is added here.
        let mut exit_event = zeroed_kevent();
        exit_event.ident = self.pid as usize;
        exit_event.filter = libc::EVFILT_PROC;
        exit_event.flags = libc::EV_ADD | libc::EV_ENABLE;
        exit_event.fflags = libc::NOTE_EXIT;

        let register = unsafe {
            libc::kevent(
                kq,
                &exit_event,
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };

        let mut should_wait = true;
        if register < 0 {
            if Errno::last() == Errno::ESRCH {
                // Already a zombie: skip straight to the reap.
                should_wait = false;
            } else {
                return Err(MonitorError::Wait(format!(
                    "kevent registration failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
        }

        if should_wait {
            'watch: loop {
                let timeout = libc::timespec {
                    tv_sec: (interval / 1000) as libc::time_t,
                    tv_nsec: ((interval % 1000) * 1_000_000) as libc::c_long,
                };
                let mut events = [zeroed_kevent(), zeroed_kevent()];

                let n = unsafe {
                    libc::kevent(
                        kq,
                        std::ptr::null(),
                        0,
                        events.as_mut_ptr(),
                        2,
                        &timeout,
                    )
                };

                if n < 0 {
                    match Errno::last() {
                        Errno::EINTR | Errno::ESRCH => continue 'watch,
                        _ => {
                            return Err(MonitorError::Wait(format!(
                                "kevent failed: {}",
                                std::io::Error::last_os_error()
                            )))
                        }
                    }
                }

                if n > 0 {
                    let fired = &events[..n as usize];
                    // Exit beats cancellation when both are pending.
                    if fired.iter().any(|e| e.filter == libc::EVFILT_PROC) {
                        break 'watch;
                    }
                    if fired.iter().any(|e| e.filter == libc::EVFILT_USER) {
                        stopped = true;
                        let _ = kill(Pid::from_raw(self.pid), Signal::SIGKILL);
                        break 'watch;
                    }
                    continue 'watch;
                }

                // Poll tick.
                if let Some(sample) = probe::sample(self.pid as u32) {
                    peak_memory_bytes = peak_memory_bytes.max(sample.rss_bytes);

                    if lim.memory_limit_bytes > 0 && sample.rss_bytes > lim.memory_limit_bytes {
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

                if lim.cpu_time_limit_ms > 0 && clock.elapsed_ms() > lim.cpu_time_limit_ms * 2 {
                    timed_out = true;
                    let _ = kill(Pid::from_raw(self.pid), Signal::SIGKILL);
                    break 'watch;
                }
            }
        }

        cancel.close();

        let mut status: libc::c_int = 0;
        let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
        loop {
            let rc = unsafe { libc::wait4(self.pid, &mut status, 0, &mut rusage) };
            if rc < 0 && Errno::last() == Errno::EINTR {
                continue;
            }
            if rc < 0 {
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
        // ru_maxrss is bytes on macOS.
        peak_memory_bytes = peak_memory_bytes.max(rusage.ru_maxrss.max(0) as u64);

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

impl Drop for KqueueMonitor {
    fn drop(&mut self) {
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
