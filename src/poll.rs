//! Readiness-polling facade over either a descriptor-array mechanism
//! (`poll(2)`, the default) or a bit-set mechanism (`select(2)`, behind the
//! `select-poll` feature). Spec §4.1.
//!
//! EINTR is swallowed internally by `wait`; callers never see it.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// Maximum descriptors a single `PollSet` may track. Registrations beyond
/// this are logged and ignored rather than causing undefined behaviour in
/// the underlying `pollfd` array.
pub const MAX_DESCRIPTORS: usize = 256;

/// Outcome of [`PollSet::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// `n` descriptors are ready.
    Ready(usize),
    /// The timeout elapsed with nothing ready.
    Timeout,
}

#[cfg(not(feature = "select-poll"))]
mod backend {
    use super::*;

    #[derive(Clone, Copy)]
    struct Registration {
        fd: RawFd,
        read: bool,
        write: bool,
    }

    pub struct Backend {
        regs: Vec<Registration>,
        pollfds: Vec<libc::pollfd>,
    }

    impl Backend {
        pub fn new() -> Self {
            Self {
                regs: Vec::with_capacity(8),
                pollfds: Vec::new(),
            }
        }

        pub fn zero(&mut self) {
            self.regs.clear();
        }

        pub fn add(&mut self, fd: RawFd, read: bool, write: bool) {
            if let Some(r) = self.regs.iter_mut().find(|r| r.fd == fd) {
                r.read |= read;
                r.write |= write;
                return;
            }
            if self.regs.len() >= MAX_DESCRIPTORS {
                tracing::warn!(fd, "poll: descriptor limit exceeded, ignoring registration");
                return;
            }
            self.regs.push(Registration { fd, read, write });
        }

        pub fn wait(&mut self, timeout_seconds: f64) -> std::io::Result<WaitOutcome> {
            self.pollfds.clear();
            self.pollfds.reserve(self.regs.len());
            for r in &self.regs {
                let mut events = 0;
                if r.read {
                    events |= libc::POLLIN;
                }
                if r.write {
                    events |= libc::POLLOUT;
                }
                self.pollfds.push(libc::pollfd {
                    fd: r.fd,
                    events,
                    revents: 0,
                });
            }

            let deadline = if timeout_seconds >= 0.0 {
                Some(Instant::now() + Duration::from_secs_f64(timeout_seconds))
            } else {
                None
            };

            loop {
                let timeout_ms = match deadline {
                    None => -1,
                    Some(d) => {
                        let remaining = d.saturating_duration_since(Instant::now());
                        remaining.as_millis().min(i32::MAX as u128) as i32
                    }
                };

                let rc = unsafe {
                    libc::poll(
                        self.pollfds.as_mut_ptr(),
                        self.pollfds.len() as libc::nfds_t,
                        timeout_ms,
                    )
                };

                if rc < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.kind() == std::io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }
                if rc == 0 {
                    return Ok(WaitOutcome::Timeout);
                }
                return Ok(WaitOutcome::Ready(rc as usize));
            }
        }

        pub fn canread(&self, fd: RawFd) -> bool {
            self.pollfds
                .iter()
                .any(|p| p.fd == fd && (p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR)) != 0)
        }

        pub fn canwrite(&self, fd: RawFd) -> bool {
            self.pollfds
                .iter()
                .any(|p| p.fd == fd && (p.revents & (libc::POLLOUT | libc::POLLHUP | libc::POLLERR)) != 0)
        }
    }
}

#[cfg(feature = "select-poll")]
mod backend {
    use super::*;

    #[derive(Clone, Copy)]
    struct Registration {
        fd: RawFd,
        read: bool,
        write: bool,
    }

    pub struct Backend {
        regs: Vec<Registration>,
        last_read: libc::fd_set,
        last_write: libc::fd_set,
    }

    unsafe fn empty_fd_set() -> libc::fd_set {
        let mut set: libc::fd_set = std::mem::zeroed();
        libc::FD_ZERO(&mut set);
        set
    }

    impl Backend {
        pub fn new() -> Self {
            Self {
                regs: Vec::with_capacity(8),
                last_read: unsafe { empty_fd_set() },
                last_write: unsafe { empty_fd_set() },
            }
        }

        pub fn zero(&mut self) {
            self.regs.clear();
        }

        pub fn add(&mut self, fd: RawFd, read: bool, write: bool) {
            if let Some(r) = self.regs.iter_mut().find(|r| r.fd == fd) {
                r.read |= read;
                r.write |= write;
                return;
            }
            if self.regs.len() >= MAX_DESCRIPTORS || fd as usize >= libc::FD_SETSIZE {
                tracing::warn!(fd, "poll: descriptor limit exceeded, ignoring registration");
                return;
            }
            self.regs.push(Registration { fd, read, write });
        }

        pub fn wait(&mut self, timeout_seconds: f64) -> std::io::Result<WaitOutcome> {
            let deadline = if timeout_seconds >= 0.0 {
                Some(Instant::now() + Duration::from_secs_f64(timeout_seconds))
            } else {
                None
            };

            loop {
                let mut read_set = unsafe { empty_fd_set() };
                let mut write_set = unsafe { empty_fd_set() };
                let mut maxfd = 0;
                for r in &self.regs {
                    if r.read {
                        unsafe { libc::FD_SET(r.fd, &mut read_set) };
                    }
                    if r.write {
                        unsafe { libc::FD_SET(r.fd, &mut write_set) };
                    }
                    maxfd = maxfd.max(r.fd);
                }

                let mut tv;
                let tv_ptr = match deadline {
                    None => std::ptr::null_mut(),
                    Some(d) => {
                        let remaining = d.saturating_duration_since(Instant::now());
                        tv = libc::timeval {
                            tv_sec: remaining.as_secs() as libc::time_t,
                            tv_usec: remaining.subsec_micros() as libc::suseconds_t,
                        };
                        &mut tv as *mut _
                    }
                };

                let rc = unsafe {
                    libc::select(
                        maxfd + 1,
                        &mut read_set,
                        &mut write_set,
                        std::ptr::null_mut(),
                        tv_ptr,
                    )
                };

                if rc < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.kind() == std::io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }
                self.last_read = read_set;
                self.last_write = write_set;
                if rc == 0 {
                    return Ok(WaitOutcome::Timeout);
                }
                return Ok(WaitOutcome::Ready(rc as usize));
            }
        }

        pub fn canread(&self, fd: RawFd) -> bool {
            unsafe { libc::FD_ISSET(fd, &self.last_read) }
        }

        pub fn canwrite(&self, fd: RawFd) -> bool {
            unsafe { libc::FD_ISSET(fd, &self.last_write) }
        }
    }
}

/// Readiness-polling facade used by every non-blocking loop in the engine.
pub struct PollSet {
    backend: backend::Backend,
}

impl PollSet {
    pub fn new() -> Self {
        Self {
            backend: backend::Backend::new(),
        }
    }

    /// Discard all registrations (spec: `zero(set)`).
    pub fn zero(&mut self) {
        self.backend.zero();
    }

    /// Register interest in `fd`. Re-adding the same fd unions interests.
    pub fn add(&mut self, fd: RawFd, want_read: bool, want_write: bool) {
        if !want_read && !want_write {
            return;
        }
        self.backend.add(fd, want_read, want_write);
    }

    /// Block up to `timeout_seconds` (negative = infinite). EINTR is
    /// retried internally.
    pub fn wait(&mut self, timeout_seconds: f64) -> std::io::Result<WaitOutcome> {
        self.backend.wait(timeout_seconds)
    }

    pub fn canread(&self, fd: RawFd) -> bool {
        self.backend.canread(fd)
    }

    pub fn canwrite(&self, fd: RawFd) -> bool {
        self.backend.canwrite(fd)
    }
}

impl Default for PollSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll a single fd for zero-timeout "is data already pending?" (used by the
/// RFC 2487 probe, spec §4.3 / Design Note 2). Deliberately racy if the peer
/// is slow to write; that is the documented, intentional behaviour.
pub fn readable_now(fd: RawFd) -> std::io::Result<bool> {
    let mut set = PollSet::new();
    set.add(fd, true, false);
    match set.wait(0.0)? {
        WaitOutcome::Timeout => Ok(false),
        WaitOutcome::Ready(_) => Ok(set.canread(fd)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn wait_times_out_when_nothing_ready() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut set = PollSet::new();
        set.add(a.as_raw_fd(), true, false);
        let outcome = set.wait(0.05).unwrap();
        assert_eq!(outcome, WaitOutcome::Timeout);
    }

    #[test]
    fn wait_reports_readable_after_write() {
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(b"hi").unwrap();
        let mut set = PollSet::new();
        set.add(a.as_raw_fd(), true, false);
        let outcome = set.wait(1.0).unwrap();
        assert!(matches!(outcome, WaitOutcome::Ready(_)));
        assert!(set.canread(a.as_raw_fd()));
    }

    #[test]
    fn readable_now_is_false_for_empty_pipe() {
        let (a, _b) = UnixStream::pair().unwrap();
        assert!(!readable_now(a.as_raw_fd()).unwrap());
    }

    #[test]
    fn re_add_unions_interest() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut set = PollSet::new();
        set.add(a.as_raw_fd(), true, false);
        set.add(a.as_raw_fd(), false, true);
        // both interests should coexist; verified indirectly via wait not erroring
        let outcome = set.wait(0.01).unwrap();
        assert_eq!(outcome, WaitOutcome::Timeout);
    }
}
