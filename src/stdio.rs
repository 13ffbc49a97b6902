//! Stdio endpoint binding.
//!
//! The caller supplies one endpoint per standard stream; the binder
//! connects them to the child's fds 0/1/2 between fork and exec (POSIX)
//! or through the startup-info block (Windows). Endpoints are owned by
//! the caller; the supervisor only connects them and never reads or
//! writes the streams itself.

use serde::{Deserialize, Serialize};

use crate::types::{MonitorError, Result};

/// Where a child standard stream is routed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoEndpoint {
    /// Child shares the supervisor's own stream.
    Inherit,
    /// Bound to /dev/null (NUL on Windows).
    Null,
    /// Endpoint by name: a Unix-domain stream socket path on POSIX, a
    /// named pipe on Windows. The caller must already be listening.
    Named(String),
}

impl Default for IoEndpoint {
    fn default() -> Self {
        IoEndpoint::Inherit
    }
}

/// Endpoint pre-resolved in the parent so the post-fork child path can
/// stay async-signal-safe: no allocation, no formatting, raw libc only.
#[cfg(unix)]
pub(crate) enum PreparedEndpoint {
    Inherit,
    Null,
    Socket(libc::sockaddr_un),
}

#[cfg(unix)]
pub(crate) fn prepare(endpoint: &IoEndpoint) -> Result<PreparedEndpoint> {
    match endpoint {
        IoEndpoint::Inherit => Ok(PreparedEndpoint::Inherit),
        IoEndpoint::Null => Ok(PreparedEndpoint::Null),
        IoEndpoint::Named(path) => {
            let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
            addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

            let bytes = path.as_bytes();
            // One byte reserved for the trailing NUL.
            if bytes.is_empty() || bytes.len() >= addr.sun_path.len() {
                return Err(MonitorError::EndpointConnect(format!(
                    "socket path length {} outside 1..{}: {}",
                    bytes.len(),
                    addr.sun_path.len(),
                    path
                )));
            }
            if bytes.contains(&0) {
                return Err(MonitorError::EndpointConnect(
                    "socket path contains NUL byte".to_string(),
                ));
            }
            for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
                *dst = *src as libc::c_char;
            }
            Ok(PreparedEndpoint::Socket(addr))
        }
    }
}

#[cfg(unix)]
fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

/// Duplicate the prepared endpoints onto fds 0/1/2.
///
/// Runs in the forked child before exec. Only async-signal-safe calls:
/// socket/connect/open/dup2/close. On failure returns the errno for the
/// pre-exec error channel; the child must `_exit` without unwinding.
#[cfg(unix)]
pub(crate) fn bind_child_stdio(
    endpoints: &[PreparedEndpoint; 3],
) -> std::result::Result<(), i32> {
    for (target, endpoint) in endpoints.iter().enumerate() {
        let target = target as libc::c_int;
        let fd = match endpoint {
            PreparedEndpoint::Inherit => continue,
            PreparedEndpoint::Null => {
                let flags = if target == 0 {
                    libc::O_RDONLY
                } else {
                    libc::O_WRONLY
                };
                let fd = unsafe { libc::open(b"/dev/null\0".as_ptr().cast(), flags) };
                if fd < 0 {
                    return Err(last_errno());
                }
                fd
            }
            PreparedEndpoint::Socket(addr) => {
                let sock = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
                if sock < 0 {
                    return Err(last_errno());
                }
                let rc = unsafe {
                    libc::connect(
                        sock,
                        addr as *const libc::sockaddr_un as *const libc::sockaddr,
                        std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
                    )
                };
                if rc < 0 {
                    let err = last_errno();
                    unsafe { libc::close(sock) };
                    return Err(err);
                }
                sock
            }
        };

        if unsafe { libc::dup2(fd, target) } < 0 {
            let err = last_errno();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        if fd > 2 {
            unsafe { libc::close(fd) };
        }
    }
    Ok(())
}

/// Handle for one child stream, closed on drop only when this module
/// opened it (inherited standard handles stay untouched).
#[cfg(windows)]
pub(crate) struct EndpointHandle {
    pub raw: windows_sys::Win32::Foundation::HANDLE,
    owned: bool,
}

#[cfg(windows)]
impl Drop for EndpointHandle {
    fn drop(&mut self) {
        if self.owned && !self.raw.is_null() {
            unsafe {
                windows_sys::Win32::Foundation::CloseHandle(self.raw);
            }
        }
    }
}

/// Open the handle for one child stream. Named endpoints open the client
/// end of a pipe the caller is already serving; handles are created
/// inheritable for the startup-info block.
#[cfg(windows)]
pub(crate) fn open_endpoint_handle(
    endpoint: &IoEndpoint,
    stream_index: u32,
) -> Result<EndpointHandle> {
    use windows_sys::Win32::Foundation::{GENERIC_READ, GENERIC_WRITE, INVALID_HANDLE_VALUE};
    use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
    use windows_sys::Win32::Storage::FileSystem::{
        CreateFileW, FILE_ATTRIBUTE_NORMAL, OPEN_EXISTING,
    };
    use windows_sys::Win32::System::Console::{
        GetStdHandle, STD_ERROR_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
    };

    // stdin is read by the child, stdout/stderr are written by it.
    let access = if stream_index == 0 {
        GENERIC_READ
    } else {
        GENERIC_WRITE
    };

    match endpoint {
        IoEndpoint::Inherit => {
            let std_id = match stream_index {
                0 => STD_INPUT_HANDLE,
                1 => STD_OUTPUT_HANDLE,
                _ => STD_ERROR_HANDLE,
            };
            let handle = unsafe { GetStdHandle(std_id) };
            if handle == INVALID_HANDLE_VALUE {
                return Err(MonitorError::EndpointConnect(format!(
                    "no inheritable standard handle for stream {}",
                    stream_index
                )));
            }
            Ok(EndpointHandle {
                raw: handle,
                owned: false,
            })
        }
        IoEndpoint::Null | IoEndpoint::Named(_) => {
            let name = match endpoint {
                IoEndpoint::Null => "NUL".to_string(),
                IoEndpoint::Named(name) => name.clone(),
                IoEndpoint::Inherit => unreachable!(),
            };
            // A wide string truncates at the first NUL; reject it rather
            // than open whatever precedes it.
            if name.bytes().any(|b| b == 0) {
                return Err(MonitorError::EndpointConnect(
                    "endpoint name contains NUL byte".to_string(),
                ));
            }
            let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
            let sa = SECURITY_ATTRIBUTES {
                nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
                lpSecurityDescriptor: std::ptr::null_mut(),
                bInheritHandle: 1,
            };
            let handle = unsafe {
                CreateFileW(
                    wide.as_ptr(),
                    access,
                    0,
                    &sa,
                    OPEN_EXISTING,
                    FILE_ATTRIBUTE_NORMAL,
                    std::ptr::null_mut(),
                )
            };
            if handle == INVALID_HANDLE_VALUE {
                return Err(MonitorError::EndpointConnect(format!(
                    "failed to open endpoint {}: {}",
                    name,
                    std::io::Error::last_os_error()
                )));
            }
            Ok(EndpointHandle {
                raw: handle,
                owned: true,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_serde_round_trip() {
        let ep = IoEndpoint::Named("/tmp/judge-stdout.sock".to_string());
        let json = serde_json::to_string(&ep).unwrap();
        let back: IoEndpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(ep, back);
    }

    #[cfg(unix)]
    #[test]
    fn prepare_accepts_plain_endpoints() {
        assert!(matches!(
            prepare(&IoEndpoint::Inherit),
            Ok(PreparedEndpoint::Inherit)
        ));
        assert!(matches!(
            prepare(&IoEndpoint::Null),
            Ok(PreparedEndpoint::Null)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn prepare_builds_socket_address() {
        let path = "/tmp/wb-io.sock";
        match prepare(&IoEndpoint::Named(path.to_string())).unwrap() {
            PreparedEndpoint::Socket(addr) => {
                assert_eq!(addr.sun_family, libc::AF_UNIX as libc::sa_family_t);
                let stored: Vec<u8> = addr.sun_path[..path.len()]
                    .iter()
                    .map(|c| *c as u8)
                    .collect();
                assert_eq!(stored, path.as_bytes());
                assert_eq!(addr.sun_path[path.len()], 0);
            }
            _ => panic!("expected socket endpoint"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn prepare_rejects_oversized_path() {
        let long = "/tmp/".to_string() + &"x".repeat(200);
        assert!(matches!(
            prepare(&IoEndpoint::Named(long)),
            Err(MonitorError::EndpointConnect(_))
        ));
        assert!(matches!(
            prepare(&IoEndpoint::Named(String::new())),
            Err(MonitorError::EndpointConnect(_))
        ));
    }
}
