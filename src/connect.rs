//! Connection establishment (spec §4.4). Grounded on
//! `examples/original_source/src/client.c`'s `connect_remote`/`connect_wait`
//! for the remote side's round-robin dial loop.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};

use socket2::{Domain, Socket, Type};

use crate::endpoint::Endpoint;
use crate::error::{SessionError, TimeoutPhase};
use crate::poll::{PollSet, WaitOutcome};

/// A pre-resolved destination list with a round-robin cursor. The cursor is
/// updated without a lock (spec §5 shared-state item (c), §9 Open Question
/// 3): a concurrent race between two sessions advancing it is a benign,
/// deliberately-preserved property, not a bug.
pub struct AddressList {
    addrs: Vec<SocketAddr>,
    cursor: AtomicUsize,
}

impl AddressList {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self {
            addrs,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Take the next address and advance the cursor, racily (see struct docs).
    fn next(&self) -> SocketAddr {
        let n = self.addrs.len();
        let i = self.cursor.load(Ordering::Relaxed) % n;
        self.cursor.store((i + 1) % n, Ordering::Relaxed);
        self.addrs[i]
    }
}

/// Dial every address in `list`, round-robin starting from its current
/// cursor, until one connects or the list is exhausted. `bind_addr`, if
/// given, is applied before each connect attempt (explicit source address
/// or transparent-mode binding, spec §4.4).
pub fn connect_remote(
    list: &AddressList,
    bind_addr: Option<SocketAddr>,
    connect_timeout: f64,
) -> Result<Endpoint, SessionError> {
    if list.is_empty() {
        return Err(SessionError::ConnectFailed { attempted: 0 });
    }

    let mut attempted = 0;
    for _ in 0..list.len() {
        let addr = list.next();
        attempted += 1;
        tracing::debug!(%addr, "connecting");
        match dial_one(addr, bind_addr, connect_timeout) {
            Ok(ep) => return Ok(ep),
            Err(e) => tracing::warn!(%addr, error = %e, "connect attempt failed"),
        }
    }
    Err(SessionError::ConnectFailed { attempted })
}

fn dial_one(addr: SocketAddr, bind_addr: Option<SocketAddr>, connect_timeout: f64) -> io::Result<Endpoint> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;

    if let Some(bind) = bind_addr {
        socket.bind(&bind.into())?;
    }

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS) => {
            connect_wait(&socket, connect_timeout)?;
        }
        Err(e) => return Err(e),
    }

    let stream: TcpStream = socket.into();
    Endpoint::from_tcp_stream(stream)
}

/// Wait for a non-blocking connect to resolve (spec §4.4): poll read+write
/// readiness with the connect timeout, then confirm via `SO_ERROR`.
fn connect_wait(socket: &Socket, timeout: f64) -> io::Result<()> {
    let mut poll = PollSet::new();
    poll.add(socket.as_raw_fd(), true, true);
    match poll.wait(timeout)? {
        WaitOutcome::Timeout => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        WaitOutcome::Ready(_) => match socket.take_error()? {
            Some(e) => Err(e),
            None => Ok(()),
        },
    }
}

/// Classify the connect-wait failure as the `Connect` timeout phase for
/// diagnostics, when the caller wants to distinguish it from a refused
/// connection.
pub fn is_connect_timeout(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::TimedOut
}

pub const CONNECT_TIMEOUT_PHASE: TimeoutPhase = TimeoutPhase::Connect;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, ToSocketAddrs};

    #[test]
    fn address_list_round_robins() {
        let list = AddressList::new(vec![
            "127.0.0.1:1".to_socket_addrs().unwrap().next().unwrap(),
            "127.0.0.1:2".to_socket_addrs().unwrap().next().unwrap(),
        ]);
        let first = list.next();
        let second = list.next();
        let third = list.next();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn connect_remote_succeeds_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_thread = std::thread::spawn(move || listener.accept().unwrap());

        let list = AddressList::new(vec![addr]);
        let ep = connect_remote(&list, None, 2.0).unwrap();
        assert!(ep.is_socket);
        accept_thread.join().unwrap();
    }

    #[test]
    fn connect_remote_exhausts_list_on_refused_connections() {
        // Bind and immediately close to get a port nobody's listening on.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let list = AddressList::new(vec![addr]);
        let result = connect_remote(&list, None, 1.0);
        assert!(matches!(result, Err(SessionError::ConnectFailed { attempted: 1 })));
    }
}
