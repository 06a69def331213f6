//! TLS handshake driver (spec §4.5) and the TLS ↔ plaintext I/O primitives
//! the data pump (spec §4.6) drives. Grounded on `runtime/async/tls.rs`,
//! generalized from an async `Poll`/`Waker` shape to a synchronous
//! poll-retry loop against [`crate::poll::PollSet`].

pub mod cache;

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};

use crate::endpoint::{raw_read, raw_write};
use crate::error::TlsIoError;
use crate::poll::{PollSet, WaitOutcome};

const TLS_IO_CHUNK: usize = 16 * 1024;

/// Build a client config with the system root store plus session-ticket
/// resumption enabled, matching `TlsClientConfig::new()`'s defaults.
pub fn client_config() -> Arc<ClientConfig> {
    let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.resumption = config
        .resumption
        .tls12_resumption(rustls::client::Tls12Resumption::SessionIdOrTickets);
    Arc::new(config)
}

/// Load a server config from PEM-encoded cert chain + key files, with a
/// session-ticket cache (teacher: `TlsServerConfig::from_pem_files_with_cache`).
pub fn server_config_from_pem(cert_path: &Path, key_path: &Path, cache_size: usize) -> io::Result<Arc<ServerConfig>> {
    let cert_file = std::fs::File::open(cert_path)?;
    let key_file = std::fs::File::open(key_path)?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut io::BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("invalid cert: {e}")))?;
    let key = rustls_pemfile::private_key(&mut io::BufReader::new(key_file))?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("TLS config error: {e}")))?;
    config.send_tls13_tickets = 2;
    config.session_storage = rustls::server::ServerSessionMemoryCache::new(cache_size);
    Ok(Arc::new(config))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Done,
    WantRead,
    WantWrite,
}

/// Drives one `rustls::Connection` handshake and, once established,
/// performs its plaintext<->ciphertext I/O. Reads and writes go to
/// `read_fd`/`write_fd` directly via raw syscalls; these are equal when the
/// session's ssl-read and ssl-write roles share a descriptor (spec Design
/// Note "Endpoint aliasing").
pub struct TlsDriver {
    conn: Connection,
    read_fd: RawFd,
    write_fd: RawFd,
    resumed_hint: bool,
}

impl TlsDriver {
    pub fn client(config: Arc<ClientConfig>, server_name: String, read_fd: RawFd, write_fd: RawFd) -> Result<Self, TlsIoError> {
        let name: ServerName<'static> = server_name
            .try_into()
            .map_err(|_| TlsIoError::Protocol(rustls::Error::General("invalid server name".into())))?;
        let conn = ClientConnection::new(config, name)?;
        Ok(Self {
            conn: Connection::Client(conn),
            read_fd,
            write_fd,
            resumed_hint: false,
        })
    }

    pub fn server(config: Arc<ServerConfig>, read_fd: RawFd, write_fd: RawFd) -> Result<Self, TlsIoError> {
        let conn = ServerConnection::new(config)?;
        Ok(Self {
            conn: Connection::Server(conn),
            read_fd,
            write_fd,
            resumed_hint: false,
        })
    }

    /// Run the handshake to completion, polling for readiness with
    /// `busy_timeout` whenever the connection wants I/O it cannot do right
    /// now (spec §4.5).
    pub fn handshake(&mut self, busy_timeout: f64) -> Result<(), TlsIoError> {
        let mut poll = PollSet::new();
        loop {
            match self.step()? {
                Step::Done => return Ok(()),
                Step::WantRead => {
                    poll.zero();
                    poll.add(self.read_fd, true, false);
                    match poll.wait(busy_timeout).map_err(TlsIoError::Io)? {
                        WaitOutcome::Timeout => {
                            return Err(TlsIoError::Io(io::Error::new(
                                io::ErrorKind::TimedOut,
                                "TLS handshake busy timeout (want read)",
                            )))
                        }
                        WaitOutcome::Ready(_) => continue,
                    }
                }
                Step::WantWrite => {
                    poll.zero();
                    poll.add(self.write_fd, false, true);
                    match poll.wait(busy_timeout).map_err(TlsIoError::Io)? {
                        WaitOutcome::Timeout => {
                            return Err(TlsIoError::Io(io::Error::new(
                                io::ErrorKind::TimedOut,
                                "TLS handshake busy timeout (want write)",
                            )))
                        }
                        WaitOutcome::Ready(_) => continue,
                    }
                }
            }
        }
    }

    fn step(&mut self) -> Result<Step, TlsIoError> {
        while self.conn.wants_write() {
            match self.flush_once() {
                Ok(0) => break,
                Ok(_) => continue,
                Err(TlsIoError::WantWrite) => return Ok(Step::WantWrite),
                Err(e) => return Err(e),
            }
        }
        if self.conn.wants_read() {
            match self.fill_once() {
                Ok(()) => {}
                Err(TlsIoError::WantRead) => return Ok(Step::WantRead),
                Err(e) => return Err(e),
            }
        }
        if !self.conn.is_handshaking() {
            return Ok(Step::Done);
        }
        Ok(if self.conn.wants_write() { Step::WantWrite } else { Step::WantRead })
    }

    fn flush_once(&mut self) -> Result<usize, TlsIoError> {
        let mut buf = [0u8; TLS_IO_CHUNK];
        let mut cursor = io::Cursor::new(&mut buf[..]);
        let n = self.conn.write_tls(&mut cursor)?;
        if n == 0 {
            return Ok(0);
        }
        match raw_write(self.write_fd, &buf[..n]) {
            Ok(written) => Ok(written),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(TlsIoError::WantWrite),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(TlsIoError::Io(e)),
        }
    }

    fn fill_once(&mut self) -> Result<(), TlsIoError> {
        let mut buf = [0u8; TLS_IO_CHUNK];
        match raw_read(self.read_fd, &mut buf) {
            Ok(0) => Err(TlsIoError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected EOF during TLS I/O",
            ))),
            Ok(n) => {
                let mut cursor = io::Cursor::new(&buf[..n]);
                self.conn.read_tls(&mut cursor)?;
                self.conn.process_new_packets()?;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(TlsIoError::WantRead),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(TlsIoError::Io(e)),
        }
    }

    /// Whether this handshake reused cached resumption material. `rustls`
    /// doesn't expose an explicit per-connection "was resumed" flag the way
    /// OpenSSL's `SSL_session_reused` does; we approximate it by whether
    /// the caller told us it handed in a config it had already used for
    /// this destination (see `ResumptionCache`), recorded via
    /// [`TlsDriver::mark_resumed_hint`].
    pub fn is_resumed(&self) -> bool {
        self.resumed_hint
    }

    pub fn mark_resumed_hint(&mut self, resumed: bool) {
        self.resumed_hint = resumed;
    }

    pub fn cipher_description(&self) -> Option<String> {
        self.conn
            .negotiated_cipher_suite()
            .map(|suite| format!("{:?}", suite.suite()))
    }

    pub fn peer_certificates(&self) -> Option<Vec<CertificateDer<'static>>> {
        self.conn.peer_certificates().map(|certs| certs.to_vec())
    }

    /// Read plaintext out of the connection (spec: TLS read in the data
    /// pump). Drives ciphertext I/O first (`drive_io`) so that any
    /// available ciphertext on `read_fd` is actually pulled off the wire
    /// and decrypted before we ask rustls's plaintext buffer for bytes —
    /// without this, the plaintext buffer only ever holds what trickled in
    /// during the handshake. Returns `Ok(0)` only on EOF from the
    /// application-data layer.
    pub fn read_plaintext(&mut self, buf: &mut [u8]) -> Result<usize, TlsIoError> {
        match self.drive_io() {
            Ok(()) => {}
            Err(TlsIoError::WantRead) | Err(TlsIoError::WantWrite) => {}
            Err(e) => return Err(e),
        }
        match self.conn.reader().read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(TlsIoError::WantRead),
            Err(e) => Err(TlsIoError::Io(e)),
        }
    }

    /// Write plaintext into the connection and drive ciphertext I/O
    /// (`drive_io`) so it is actually flushed to `write_fd` in the same
    /// call — buffering into rustls's writer alone never touches the
    /// socket. Returns `WantWrite` only when nothing was buffered and
    /// nothing could be flushed, so the pump's readiness loop retries
    /// instead of mistaking this for silent progress.
    pub fn write_plaintext(&mut self, buf: &[u8]) -> Result<usize, TlsIoError> {
        let wrote = match self.conn.writer().write(buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => return Err(TlsIoError::Io(e)),
        };
        match self.drive_io() {
            Ok(()) => {}
            Err(TlsIoError::WantRead) | Err(TlsIoError::WantWrite) => {}
            Err(e) => return Err(e),
        }
        if wrote == 0 && !buf.is_empty() {
            return Err(TlsIoError::WantWrite);
        }
        Ok(wrote)
    }

    pub fn wants_read(&self) -> bool {
        self.conn.wants_read()
    }

    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Pump any ciphertext `write_tls` has queued out to the write fd, and
    /// any available ciphertext on the read fd in. Non-blocking: returns
    /// immediately with a `Want*` error rather than retrying internally so
    /// the data pump's own readiness loop stays in control (spec §4.6).
    pub fn drive_io(&mut self) -> Result<(), TlsIoError> {
        while self.conn.wants_write() {
            match self.flush_once() {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) => return Err(e),
            }
        }
        if self.conn.wants_read() {
            self.fill_once()?;
        }
        Ok(())
    }

    /// Send a close_notify alert and flush it out (spec §4.6 Phase 3).
    /// Returns `Ok(true)` once fully flushed, `Ok(false)` if more write
    /// readiness is still needed.
    pub fn shutdown(&mut self) -> Result<bool, TlsIoError> {
        self.conn.send_close_notify();
        loop {
            if !self.conn.wants_write() {
                return Ok(true);
            }
            match self.flush_once() {
                Ok(0) => return Ok(true),
                Ok(_) => continue,
                Err(TlsIoError::WantWrite) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub fn write_fd(&self) -> RawFd {
        self.write_fd
    }
}

/// Discard TLS state without blocking on a final close-notify round trip,
/// matching OpenSSL's `SSL_SHUTDOWN_SENT|RECEIVED` hint (spec §3, TLS
/// object lifecycle). `rustls::Connection`'s `Drop` already never blocks on
/// I/O, so this is a no-op marker kept for documentation of the contract;
/// callers invoke it at cleanup time regardless of whether a handshake ever
/// started (spec invariant 4, idempotent close).
pub fn discard_without_blocking(_driver: Option<TlsDriver>) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_enables_session_id_or_ticket_resumption() {
        let cfg = client_config();
        assert_eq!(
            cfg.resumption.tls12_resumption,
            rustls::client::Tls12Resumption::SessionIdOrTickets
        );
    }
}
