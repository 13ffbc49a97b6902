//! Windows back-end: CreateProcessW with named-pipe stdio, a Job Object
//! for kernel-enforced limits, and a timed WaitForMultipleObjects loop.
//!
//! The child is created suspended and joins the job before its initial
//! thread is resumed, so it never executes a single instruction outside
//! the configured limits. The job's time limit counts user time only, so
//! the loop additionally polls TotalUserTime + TotalKernelTime from the
//! job accounting and terminates when the sum exceeds the CPU budget.
//! Memory is enforced by JOB_OBJECT_LIMIT_PROCESS_MEMORY in the kernel;
//! when the job cannot be set up at all the loop falls back to polling
//! the process counters.

use std::os::windows::ffi::OsStrExt;

use windows_sys::Win32::Foundation::{
    CloseHandle, FILETIME, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectBasicAccountingInformation,
    JobObjectExtendedLimitInformation, QueryInformationJobObject, SetInformationJobObject,
    JOBOBJECT_BASIC_ACCOUNTING_INFORMATION, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JOB_OBJECT_LIMIT_PROCESS_MEMORY, JOB_OBJECT_LIMIT_PROCESS_TIME,
};
use windows_sys::Win32::System::ProcessStatus::{
    K32GetProcessMemoryInfo, PROCESS_MEMORY_COUNTERS,
};
use windows_sys::Win32::System::Threading::{
    CreateProcessW, GetExitCodeProcess, GetProcessTimes, ResumeThread, TerminateProcess,
    WaitForMultipleObjects, WaitForSingleObject, CREATE_NO_WINDOW, CREATE_SUSPENDED,
    CREATE_UNICODE_ENVIRONMENT, INFINITE, PROCESS_INFORMATION, STARTF_USESTDHANDLES,
    STARTUPINFOW,
};

use crate::cancel::CancelChannel;
use crate::clock::WallClock;
use crate::stdio;
use crate::types::{MonitorError, Result, SpawnRequest, TerminationEvidence};

use super::MonitorBackend;

/// Handle closed on drop, on every exit path.
struct ScopedHandle(HANDLE);

impl Drop for ScopedHandle {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe {
                CloseHandle(self.0);
            }
        }
    }
}

// Only the owning monitor worker touches the handle.
unsafe impl Send for ScopedHandle {}

pub(crate) struct JobObjectMonitor {
    process: ScopedHandle,
    job: Option<ScopedHandle>,
    pid: u32,
    reaped: bool,
}

/// 100-nanosecond intervals carried by a FILETIME.
fn filetime_100ns(ft: &FILETIME) -> u64 {
    ((ft.dwHighDateTime as u64) << 32) | ft.dwLowDateTime as u64
}

/// Quote one argument for the single command-line string CreateProcessW
/// takes. Backslashes double only in front of a quote; a literal quote
/// gets a backslash escape.
fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "\"\"".to_string();
    }
    if !arg
        .chars()
        .any(|c| matches!(c, ' ' | '\t' | '\n' | '\x0b' | '"'))
    {
        return arg.to_string();
    }

    let chars: Vec<char> = arg.chars().collect();
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');

    let mut i = 0;
    while i < chars.len() {
        let mut backslashes = 0;
        while i < chars.len() && chars[i] == '\\' {
            i += 1;
            backslashes += 1;
        }
        if i == chars.len() {
            // Trailing backslashes must not escape the closing quote.
            quoted.extend(std::iter::repeat('\\').take(backslashes * 2));
        } else if chars[i] == '"' {
            quoted.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
            quoted.push('"');
            i += 1;
        } else {
            quoted.extend(std::iter::repeat('\\').take(backslashes));
            quoted.push(chars[i]);
            i += 1;
        }
    }

    quoted.push('"');
    quoted
}

fn wide_null(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

impl JobObjectMonitor {
    /// Create, configure, and attach the job while the child's initial
    /// thread is still suspended, so the limits are in force before it
    /// runs. Any failure is logged and absorbed: the polling tick
    /// enforces the same budgets.
    fn setup_job(process: HANDLE, request: &SpawnRequest) -> Option<ScopedHandle> {
        let job = unsafe { CreateJobObjectW(std::ptr::null(), std::ptr::null()) };
        if job.is_null() {
            log::warn!(
                "[{}] job object creation failed: {}; falling back to polling",
                request.instance_id,
                std::io::Error::last_os_error()
            );
            return None;
        }
        let job = ScopedHandle(job);

        let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { std::mem::zeroed() };
        if request.cpu_time_limit_ms > 0 {
            info.BasicLimitInformation.PerProcessUserTimeLimit =
                (request.cpu_time_limit_ms * 10_000) as i64;
            info.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_PROCESS_TIME;
        }
        if request.memory_limit_bytes > 0 {
            info.ProcessMemoryLimit = request.memory_limit_bytes as usize;
            info.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_PROCESS_MEMORY;
        }

        let set = unsafe {
            SetInformationJobObject(
                job.0,
                JobObjectExtendedLimitInformation,
                &info as *const JOBOBJECT_EXTENDED_LIMIT_INFORMATION as *const std::ffi::c_void,
                std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            )
        };
        if set == 0 {
            log::warn!(
                "[{}] job limit setup failed: {}; falling back to polling",
                request.instance_id,
                std::io::Error::last_os_error()
            );
            return None;
        }

        if unsafe { AssignProcessToJobObject(job.0, process) } == 0 {
            log::warn!(
                "[{}] could not assign child to job: {}; falling back to polling",
                request.instance_id,
                std::io::Error::last_os_error()
            );
            return None;
        }

        Some(job)
    }

    /// User and kernel CPU of the child in ms, from the job accounting
    /// when available, from the process times otherwise.
    fn cpu_sample_ms(&self, job: Option<&ScopedHandle>) -> Option<(u64, u64)> {
        if let Some(job) = job {
            let mut acct: JOBOBJECT_BASIC_ACCOUNTING_INFORMATION = unsafe { std::mem::zeroed() };
            let ok = unsafe {
                QueryInformationJobObject(
                    job.0,
                    JobObjectBasicAccountingInformation,
                    &mut acct as *mut JOBOBJECT_BASIC_ACCOUNTING_INFORMATION
                        as *mut std::ffi::c_void,
                    std::mem::size_of::<JOBOBJECT_BASIC_ACCOUNTING_INFORMATION>() as u32,
                    std::ptr::null_mut(),
                )
            };
            if ok != 0 {
                let user = acct.TotalUserTime as u64 / 10_000;
                let kernel = acct.TotalKernelTime as u64 / 10_000;
                return Some((user, kernel));
            }
        }

        let mut creation: FILETIME = unsafe { std::mem::zeroed() };
        let mut exit: FILETIME = unsafe { std::mem::zeroed() };
        let mut kernel: FILETIME = unsafe { std::mem::zeroed() };
        let mut user: FILETIME = unsafe { std::mem::zeroed() };
        let ok = unsafe {
            GetProcessTimes(self.process.0, &mut creation, &mut exit, &mut kernel, &mut user)
        };
        if ok == 0 {
            return None;
        }
        Some((
            filetime_100ns(&user) / 10_000,
            filetime_100ns(&kernel) / 10_000,
        ))
    }

    fn peak_memory_bytes(&self, job: Option<&ScopedHandle>) -> u64 {
        if let Some(job) = job {
            let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { std::mem::zeroed() };
            let ok = unsafe {
                QueryInformationJobObject(
                    job.0,
                    JobObjectExtendedLimitInformation,
                    &mut info as *mut JOBOBJECT_EXTENDED_LIMIT_INFORMATION
                        as *mut std::ffi::c_void,
                    std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
                    std::ptr::null_mut(),
                )
            };
            if ok != 0 {
                return info.PeakProcessMemoryUsed as u64;
            }
        }

        let mut counters: PROCESS_MEMORY_COUNTERS = unsafe { std::mem::zeroed() };
        counters.cb = std::mem::size_of::<PROCESS_MEMORY_COUNTERS>() as u32;
        let ok = unsafe {
            K32GetProcessMemoryInfo(
                self.process.0,
                &mut counters,
                std::mem::size_of::<PROCESS_MEMORY_COUNTERS>() as u32,
            )
        };
        if ok != 0 {
            counters.PeakWorkingSetSize as u64
        } else {
            0
        }
    }
}

impl MonitorBackend for JobObjectMonitor {
    fn launch(request: &SpawnRequest) -> Result<Self> {
        let mut cmdline = quote_arg(&request.command);
        for arg in &request.args {
            cmdline.push(' ');
            cmdline.push_str(&quote_arg(arg));
        }
        let mut cmdline_w = wide_null(&cmdline);

        let cwd_w: Option<Vec<u16>> = request.cwd.as_ref().map(|dir| {
            dir.as_os_str()
                .encode_wide()
                .chain(std::iter::once(0))
                .collect()
        });

        // Handles must be open (and inheritable) before the child is
        // created; the parent copies are released right after.
        let stdin_h = stdio::open_endpoint_handle(&request.stdin, 0)?;
        let stdout_h = stdio::open_endpoint_handle(&request.stdout, 1)?;
        let stderr_h = stdio::open_endpoint_handle(&request.stderr, 2)?;

        let mut startup: STARTUPINFOW = unsafe { std::mem::zeroed() };
        startup.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
        startup.hStdInput = stdin_h.raw;
        startup.hStdOutput = stdout_h.raw;
        startup.hStdError = stderr_h.raw;
        startup.dwFlags |= STARTF_USESTDHANDLES;

        let mut proc_info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

        let ok = unsafe {
            CreateProcessW(
                std::ptr::null(),
                cmdline_w.as_mut_ptr(),
                std::ptr::null(),
                std::ptr::null(),
                1,
                CREATE_SUSPENDED | CREATE_UNICODE_ENVIRONMENT | CREATE_NO_WINDOW,
                std::ptr::null_mut(),
                cwd_w
                    .as_ref()
                    .map(|w| w.as_ptr())
                    .unwrap_or(std::ptr::null()),
                &startup,
                &mut proc_info,
            )
        };

        drop(stdin_h);
        drop(stdout_h);
        drop(stderr_h);

        if ok == 0 {
            return Err(MonitorError::Spawn(format!(
                "CreateProcessW failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let process = ScopedHandle(proc_info.hProcess);

        // Limits must be in force before the child executes anything:
        // attach the job while the initial thread is still suspended,
        // only then let it run.
        let job = Self::setup_job(process.0, request);

        unsafe {
            ResumeThread(proc_info.hThread);
            CloseHandle(proc_info.hThread);
        }

        Ok(Self {
            process,
            job,
            pid: proc_info.dwProcessId,
            reaped: false,
        })
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn supervise(
        mut self,
        request: &SpawnRequest,
        cancel: &CancelChannel,
    ) -> Result<TerminationEvidence> {
        let interval = request.effective_poll_interval_ms() as u32;
        let lim = request.limits();
        let clock = WallClock::start();
        let stop_event = cancel.event_handle();

        let mut exited = false;
        let mut timed_out = false;
        let mut memory_limit_exceeded = false;
        let mut stopped = false;

        'watch: loop {
            let handles = [self.process.0, stop_event];
            let wait = unsafe { WaitForMultipleObjects(2, handles.as_ptr(), 0, interval) };

            // Exit beats cancellation: the wait reports the lowest
            // signaled index, and the process handle is first.
            if wait == WAIT_OBJECT_0 {
                exited = true;
                break 'watch;
            }
            if wait == WAIT_OBJECT_0 + 1 {
                stopped = true;
                break 'watch;
            }
            if wait != WAIT_TIMEOUT {
                return Err(MonitorError::Wait(format!(
                    "WaitForMultipleObjects failed: {}",
                    std::io::Error::last_os_error()
                )));
            }

            // Poll tick. The job enforces memory in the kernel; when it
            // is absent, the process counters stand in.
            if self.job.is_none() && lim.memory_limit_bytes > 0 {
                let peak = self.peak_memory_bytes(None);
                if peak > lim.memory_limit_bytes {
                    memory_limit_exceeded = true;
                    break 'watch;
                }
            }

            // The job time limit counts user time only; the sum of user
            // and kernel time is what the budget means.
            if lim.cpu_time_limit_ms > 0 {
                if let Some((user_ms, kernel_ms)) = self.cpu_sample_ms(self.job.as_ref()) {
                    if user_ms + kernel_ms > lim.cpu_time_limit_ms {
                        timed_out = true;
                        break 'watch;
                    }
                }

                if clock.elapsed_ms() > lim.cpu_time_limit_ms * 2 {
                    timed_out = true;
                    break 'watch;
                }
            }
        }

        cancel.close();

        if !exited {
            unsafe {
                TerminateProcess(self.process.0, 1);
                // Accounting is only final once the OS confirms death.
                WaitForSingleObject(self.process.0, INFINITE);
            }
        }
        self.reaped = true;

        let peak_memory_bytes = self.peak_memory_bytes(self.job.as_ref());
        let (user_ms, kernel_ms) = self.cpu_sample_ms(None).unwrap_or((0, 0));

        let mut code = 0u32;
        if unsafe { GetExitCodeProcess(self.process.0, &mut code) } == 0 {
            return Err(MonitorError::Wait(format!(
                "GetExitCodeProcess failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(TerminationEvidence {
            term_code: Some(code),
            cpu_ms: user_ms + kernel_ms,
            user_cpu_ms: Some(user_ms),
            peak_memory_bytes,
            timed_out,
            memory_limit_exceeded,
            stopped,
            ..Default::default()
        })
    }
}

impl Drop for JobObjectMonitor {
    fn drop(&mut self) {
        if !self.reaped {
            unsafe {
                TerminateProcess(self.process.0, 1);
            }
            self.reaped = true;
        }
    }
}
