//! Cross-thread cancellation channel.
//!
//! Shared between the caller (who may request cancellation from any
//! thread) and the monitor worker (which owns shutdown). The channel
//! holds the platform wake-up primitive the monitor loop waits on, plus
//! a `closed` flag; both are mutated under one lock so a cancel racing
//! the loop's own shutdown can never fire into a dead primitive.
//!
//! Contract:
//! - `cancel()` returns false once the monitor has left its watching
//!   state; that is not an error, the child is already being reaped.
//! - Multiple `cancel()` calls coalesce into a single wake.
//! - The primitive lives as long as the channel; the last clone to drop
//!   releases it.

use std::sync::{Arc, Mutex};

use crate::types::Result;

/// eventfd-based waker. The monitor loop polls the fd alongside the
/// child's pidfd.
#[cfg(target_os = "linux")]
struct Waker {
    fd: std::os::fd::RawFd,
}

#[cfg(target_os = "linux")]
impl Waker {
    fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Self { fd })
    }

    fn fire(&self) -> bool {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        ret == std::mem::size_of::<u64>() as isize
    }
}

#[cfg(target_os = "linux")]
impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// kqueue-based waker. The queue is shared with the monitor loop, which
/// adds the process-exit filter to it; firing posts NOTE_TRIGGER on the
/// user filter registered at creation.
#[cfg(target_os = "macos")]
struct Waker {
    kq: std::os::fd::RawFd,
}

#[cfg(target_os = "macos")]
impl Waker {
    fn new() -> Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        // Register the user filter up front so a cancel racing monitor
        // start-up still has a target to trigger.
        let register = libc::kevent {
            ident: 0,
            filter: libc::EVFILT_USER,
            flags: libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR,
            fflags: 0,
            data: 0,
            udata: std::ptr::null_mut(),
        };
        let rc = unsafe {
            libc::kevent(kq, &register, 1, std::ptr::null_mut(), 0, std::ptr::null())
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(kq) };
            return Err(err.into());
        }
        Ok(Self { kq })
    }

    fn fire(&self) -> bool {
        let kev = libc::kevent {
            ident: 0,
            filter: libc::EVFILT_USER,
            flags: 0,
            fflags: libc::NOTE_TRIGGER,
            data: 0,
            udata: std::ptr::null_mut(),
        };
        let ret = unsafe { libc::kevent(self.kq, &kev, 1, std::ptr::null_mut(), 0, std::ptr::null()) };
        ret == 0
    }
}

#[cfg(target_os = "macos")]
impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}

/// Manual-reset event waker, waited on next to the process handle.
#[cfg(windows)]
struct Waker {
    event: windows_sys::Win32::Foundation::HANDLE,
}

#[cfg(windows)]
impl Waker {
    fn new() -> Result<Self> {
        use windows_sys::Win32::System::Threading::CreateEventW;
        let event = unsafe { CreateEventW(std::ptr::null(), 1, 0, std::ptr::null()) };
        if event.is_null() {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Self { event })
    }

    fn fire(&self) -> bool {
        use windows_sys::Win32::System::Threading::SetEvent;
        unsafe { SetEvent(self.event) != 0 }
    }
}

#[cfg(windows)]
impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            windows_sys::Win32::Foundation::CloseHandle(self.event);
        }
    }
}

// The raw handle inside is only ever used through the channel's lock or
// by the single monitor worker that outlives no clone of the channel.
#[cfg(windows)]
unsafe impl Send for Waker {}
#[cfg(windows)]
unsafe impl Sync for Waker {}

struct ChannelState {
    waker: Waker,
    closed: bool,
}

/// One-shot, thread-safe cancellation signal for a single monitor.
#[derive(Clone)]
pub struct CancelChannel {
    state: Arc<Mutex<ChannelState>>,
}

impl CancelChannel {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self {
            state: Arc::new(Mutex::new(ChannelState {
                waker: Waker::new()?,
                closed: false,
            })),
        })
    }

    /// Request cancellation. Returns true if the monitor was still
    /// watching and the wake-up was delivered; false once the monitor
    /// has finished. Safe to call from any thread, any number of times.
    pub fn cancel(&self) -> bool {
        let state = self.state.lock().expect("cancel channel lock poisoned");
        if state.closed {
            return false;
        }
        state.waker.fire()
    }

    /// Called by the monitor loop exactly once when it stops watching.
    /// Every later `cancel()` is a no-op.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock().expect("cancel channel lock poisoned");
        state.closed = true;
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().expect("cancel channel lock poisoned").closed
    }

    /// Fd the monitor loop polls for the wake-up.
    #[cfg(target_os = "linux")]
    pub(crate) fn wake_fd(&self) -> std::os::fd::RawFd {
        self.state.lock().expect("cancel channel lock poisoned").waker.fd
    }

    /// The shared kqueue both the loop and the waker use.
    #[cfg(target_os = "macos")]
    pub(crate) fn kqueue_fd(&self) -> std::os::fd::RawFd {
        self.state.lock().expect("cancel channel lock poisoned").waker.kq
    }

    /// Event handle waited on next to the process handle.
    #[cfg(windows)]
    pub(crate) fn event_handle(&self) -> windows_sys::Win32::Foundation::HANDLE {
        self.state.lock().expect("cancel channel lock poisoned").waker.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_before_close_fires() {
        let chan = CancelChannel::new().unwrap();
        assert!(chan.cancel());
        // Repeated cancels coalesce but still report delivery.
        assert!(chan.cancel());
    }

    #[test]
    fn cancel_after_close_is_noop() {
        let chan = CancelChannel::new().unwrap();
        chan.close();
        assert!(!chan.cancel());
        assert!(!chan.cancel());
    }

    #[test]
    fn clones_share_the_closed_flag() {
        let chan = CancelChannel::new().unwrap();
        let other = chan.clone();
        other.close();
        assert!(chan.is_closed());
        assert!(!chan.cancel());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn wake_fd_becomes_readable_after_cancel() {
        let chan = CancelChannel::new().unwrap();
        let fd = chan.wake_fd();
        assert!(chan.cancel());

        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pfd, 1, 0) };
        assert_eq!(n, 1);
        assert!(pfd.revents & libc::POLLIN != 0);
    }
}
