//! Endpoint aliasing (spec §3 Data model, Design Note "Endpoint aliasing").
//!
//! Four role slots (`ssl_read`, `ssl_write`, `plain_read`, `plain_write`) can
//! map onto one, two, or three underlying descriptors. We model the
//! concrete handle as a small value record and let the session hold up to
//! three of them (local read, local write, remote), referencing the same
//! `Endpoint` from more than one role when they share a descriptor.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// A concrete I/O handle: a socket, a pipe to a child process, or one end of
/// standard I/O. `is_socket` and the two `_open` flags are read by the
/// connection-establishment and data-pump logic; `Endpoint` itself only
/// owns the descriptor and performs raw reads/writes.
pub struct Endpoint {
    fd: OwnedFd,
    pub is_socket: bool,
    pub read_open: bool,
    pub write_open: bool,
}

impl Endpoint {
    pub fn new(fd: OwnedFd, is_socket: bool) -> Self {
        Self {
            fd,
            is_socket,
            read_open: true,
            write_open: true,
        }
    }

    pub fn from_tcp_stream(stream: std::net::TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::new(OwnedFd::from(stream), true))
    }

    pub fn from_unix_stream(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::new(OwnedFd::from(stream), true))
    }

    /// Construct from a raw fd inherited from fork/socketpair/pty setup.
    /// # Safety
    /// `fd` must be a valid, open, non-blocking descriptor not owned
    /// elsewhere.
    pub unsafe fn from_raw(fd: RawFd, is_socket: bool) -> Self {
        Self::new(OwnedFd::from_raw_fd(fd), is_socket)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }

    /// Half-close the read side (best-effort `shutdown(SHUT_RD)` on
    /// sockets; a no-op marker on pipes, since pipes have no notion of a
    /// partial shutdown).
    pub fn shutdown_read(&mut self) {
        if self.is_socket {
            raw_shutdown(self.raw_fd(), libc::SHUT_RD);
        }
        self.read_open = false;
    }

    /// Half-close the write side.
    pub fn shutdown_write(&mut self) {
        if self.is_socket {
            raw_shutdown(self.raw_fd(), libc::SHUT_WR);
        }
        self.write_open = false;
    }

    /// Force an RST rather than a graceful FIN by disabling lingering close
    /// (spec §7 / Design Note "Forced RST vs graceful FIN"), then close.
    pub fn close_with_rst(self) {
        if self.is_socket {
            let linger = libc::linger {
                l_onoff: 1,
                l_linger: 0,
            };
            unsafe {
                libc::setsockopt(
                    self.raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_LINGER,
                    &linger as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::linger>() as libc::socklen_t,
                );
            }
        }
        // OwnedFd closes on drop.
    }
}

impl Read for Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        raw_read(self.fd.as_raw_fd(), buf)
    }
}

impl Write for Endpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        raw_write(self.fd.as_raw_fd(), buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for &Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        raw_read(self.fd.as_raw_fd(), buf)
    }
}

impl Write for &Endpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        raw_write(self.fd.as_raw_fd(), buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Single non-blocking `read(2)` on a raw descriptor, translating errno
/// into `io::Error` the normal way. Shared by [`Endpoint`]'s `Read` impl,
/// the TLS driver, and the data pump, all of which need to read from a
/// plain `RawFd` without taking ownership.
pub fn raw_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Single non-blocking `write(2)` on a raw descriptor.
pub fn raw_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// `shutdown(2)` a half of a raw socket descriptor. No-op (but harmless) on
/// a non-socket descriptor's unsupported half.
pub fn raw_shutdown(fd: RawFd, how: libc::c_int) {
    unsafe {
        libc::shutdown(fd, how);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_fd_roundtrips_through_unix_stream() {
        let (a, _b) = UnixStream::pair().unwrap();
        let ep = Endpoint::from_unix_stream(a).unwrap();
        assert!(ep.is_socket);
        assert!(ep.read_open && ep.write_open);
        assert!(ep.raw_fd() >= 0);
    }

    #[test]
    fn shutdown_flags_flip_independently() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut ep = Endpoint::from_unix_stream(a).unwrap();
        ep.shutdown_write();
        assert!(ep.read_open);
        assert!(!ep.write_open);
    }
}
