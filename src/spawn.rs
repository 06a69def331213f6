//! Local program spawning (spec §4.4 "Local program spawning"). Grounded on
//! `examples/original_source/src/client.c`'s `connect_local`/`make_sockets`:
//! allocate a connected descriptor pair, fork, wire the child's half onto
//! stdio, `execvp`. Pty allocation is out of scope for this port (no
//! `openpty` binding in the dependency stack); the socketpair path is the
//! one implemented, matching the `#else` branch of the original.

use std::ffi::CString;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::endpoint::Endpoint;

/// What the forked child should become.
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub remote_host: String,
    pub foreground: bool,
    pub ssl_client_dn: Option<String>,
    pub ssl_client_issuer_dn: Option<String>,
}

/// Spawn `spec.program`, connected to the parent via a UNIX socketpair
/// wired onto the child's stdin/stdout(/stderr). Returns the parent-side
/// endpoint and the child's pid.
pub fn spawn(spec: &SpawnSpec) -> io::Result<(Endpoint, libc::pid_t)> {
    let (parent_sock, child_sock) = UnixStream::pair()?;
    let child_fd = child_sock.as_raw_fd();

    let program = CString::new(spec.program.clone())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "program name contains NUL"))?;
    let mut c_args: Vec<CString> = Vec::with_capacity(spec.args.len() + 1);
    c_args.push(program.clone());
    for a in &spec.args {
        c_args.push(CString::new(a.as_str()).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "argument contains NUL"))?);
    }
    let mut argv: Vec<*const libc::c_char> = c_args.iter().map(|s| s.as_ptr()).collect();
    argv.push(std::ptr::null());

    let remote_host_env = CString::new(format!("REMOTE_HOST={}", strip_port(&spec.remote_host))).unwrap();
    let dn_env = spec
        .ssl_client_dn
        .as_ref()
        .map(|dn| CString::new(format!("SSL_CLIENT_DN={dn}")).unwrap());
    let issuer_env = spec
        .ssl_client_issuer_dn
        .as_ref()
        .map(|dn| CString::new(format!("SSL_CLIENT_I_DN={dn}")).unwrap());

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }
    if pid == 0 {
        // Child: wire the socket onto stdio, exec, never return.
        unsafe {
            libc::dup2(child_fd, 0);
            libc::dup2(child_fd, 1);
            if !spec.foreground {
                libc::dup2(child_fd, 2);
            }
            if child_fd > 2 {
                libc::close(child_fd);
            }
            libc::putenv(remote_host_env.into_raw());
            if let Some(e) = dn_env {
                libc::putenv(e.into_raw());
            }
            if let Some(e) = issuer_env {
                libc::putenv(e.into_raw());
            }
            let mut empty_mask: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut empty_mask);
            libc::sigprocmask(libc::SIG_SETMASK, &empty_mask, std::ptr::null_mut());

            libc::execvp(argv[0], argv.as_ptr());
            // execvp only returns on failure.
            libc::_exit(1);
        }
    }

    // Parent: drop our copy of the child's fd, keep the parent side.
    drop(child_sock);
    set_cloexec(parent_sock.as_raw_fd());
    let endpoint = Endpoint::from_unix_stream(parent_sock)?;
    Ok((endpoint, pid))
}

fn strip_port(addr: &str) -> &str {
    match addr.rfind(':') {
        Some(i) => &addr[..i],
        None => addr,
    }
}

fn set_cloexec(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
}

/// Reap a finished child non-blockingly (spec §6 "Process spawner"; the
/// outer loop calls this after the signal pipe wakes it on SIGCHLD).
pub fn reap_nonblocking() -> Option<(libc::pid_t, i32)> {
    let mut status: libc::c_int = 0;
    let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
    if pid > 0 {
        Some((pid, status))
    } else {
        None
    }
}

#[allow(dead_code)]
fn owned_fd_from_raw(fd: RawFd) -> OwnedFd {
    unsafe { OwnedFd::from_raw_fd(fd) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_port_removes_trailing_port() {
        assert_eq!(strip_port("10.0.0.1:4433"), "10.0.0.1");
        assert_eq!(strip_port("10.0.0.1"), "10.0.0.1");
    }

    #[test]
    fn spawn_runs_true_and_exits_cleanly() {
        let spec = SpawnSpec {
            program: "/bin/true".into(),
            args: vec![],
            remote_host: "127.0.0.1:1234".into(),
            foreground: true,
            ssl_client_dn: None,
            ssl_client_issuer_dn: None,
        };
        let (endpoint, pid) = spawn(&spec).unwrap();
        assert!(pid > 0);
        drop(endpoint);
        let mut status: libc::c_int = 0;
        let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
        assert_eq!(waited, pid);
    }
}
