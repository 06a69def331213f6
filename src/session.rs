//! Session lifecycle (spec §3 "Session", §7 "Session lifecycle"). Grounded
//! on `examples/original_source/src/client.c`'s `do_client`/`cleanup`: local
//! setup, then (negotiation + TLS) in the order mode dictates, then the
//! transfer loop, then cleanup that forces RST on any error exit.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::{ClientConfig, ServerConfig};

use crate::access::AccessControl;
use crate::config::ServiceConfig;
use crate::connect::{connect_remote, AddressList};
use crate::endpoint::Endpoint;
use crate::error::SessionError;
use crate::ident;
use crate::negotiate::{self, NegotiationIo, Role};
use crate::pump::{self, Transferred};
use crate::spawn::{self, SpawnSpec};
use crate::tls::cache::ResumptionCache;
use crate::tls::TlsDriver;

/// Whether the remote counterpart is reached over the network or is a
/// locally spawned program speaking stdio (spec §4.4 "Local program
/// spawning"; the original's "remote" mode flag).
pub enum RemoteMode {
    Network(AddressList, Option<SocketAddr>),
    SpawnProgram(SpawnSpec),
}

/// Everything a session needs beyond the per-connection descriptors:
/// process-wide collaborators (spec §9 "Process-wide state").
pub struct SharedState {
    pub access: AccessControl,
    pub client_tls_config: Arc<ClientConfig>,
    pub server_tls_config: Option<Arc<ServerConfig>>,
    pub resumption: ResumptionCache,
}

/// Run one session to completion: local setup, negotiation, TLS handshake,
/// data pump, cleanup. Any error forces an RST close (SO_LINGER=0) on every
/// descriptor this function owns, rather than letting them drop gracefully
/// (spec §7/§9: "on error sets SO_LINGER=0 to force RST").
pub fn run(
    svc: &ServiceConfig,
    local: Endpoint,
    accepted_peer_addr: Option<SocketAddr>,
    remote_mode: RemoteMode,
    shared: &SharedState,
) -> Result<Transferred, SessionError> {
    let span = crate::logging::session_span(&svc.name, &accepted_peer_addr.map(|a| a.to_string()).unwrap_or_default());
    let _guard = span.enter();

    if let Err(e) = check_access(svc, accepted_peer_addr, shared) {
        local.close_with_rst();
        return Err(e);
    }

    let remote = match connect_or_spawn(svc, remote_mode) {
        Ok(remote) => remote,
        Err(e) => {
            local.close_with_rst();
            return Err(e);
        }
    };

    let result = negotiate_and_pump(svc, &local, &remote, shared);

    match &result {
        Ok(t) => tracing::info!(sock_bytes = t.sock_bytes, ssl_bytes = t.ssl_bytes, "connection closed"),
        Err(e) => tracing::warn!(error = %e, "connection reset"),
    }

    if result.is_err() {
        local.close_with_rst();
        remote.close_with_rst();
    }
    result
}

fn check_access(svc: &ServiceConfig, accepted_peer_addr: Option<SocketAddr>, shared: &SharedState) -> Result<(), SessionError> {
    let Some(peer) = accepted_peer_addr else {
        return Ok(());
    };
    if !shared.access.permits(peer.ip()) {
        return Err(SessionError::AccessDenied { peer: peer.to_string() });
    }
    if let Some(expected_user) = &svc.username {
        // TODO: thread the listener's actual local port through instead
        // of reusing the peer's; IDENT queries need our side's port too.
        let local_port = peer.port();
        ident::check_user(peer, local_port, expected_user, svc.timeout_connect, svc.timeout_busy)
            .map_err(|_| SessionError::AccessDenied { peer: peer.to_string() })?;
    }
    Ok(())
}

fn connect_or_spawn(svc: &ServiceConfig, remote_mode: RemoteMode) -> Result<Endpoint, SessionError> {
    match remote_mode {
        RemoteMode::Network(list, bind) => connect_remote(&list, bind, svc.timeout_connect),
        RemoteMode::SpawnProgram(spec) => {
            let (ep, pid) = spawn::spawn(&spec).map_err(SessionError::TerminalIo)?;
            tracing::info!(pid, "local program spawned");
            Ok(ep)
        }
    }
}

fn negotiate_and_pump(svc: &ServiceConfig, local: &Endpoint, remote: &Endpoint, shared: &SharedState) -> Result<Transferred, SessionError> {
    if svc.protocol.is_some() && !svc.client {
        negotiate_server_side(svc, local, remote)?;
    } else if let Some(protocol) = svc.protocol {
        negotiate_client_side(protocol, svc, local, remote)?;
    }

    let mut tls = establish_tls(svc, remote, shared)?;

    pump::transfer(local.raw_fd(), local.raw_fd(), &mut tls, svc.timeout_idle, svc.timeout_close)
}

fn negotiate_client_side(protocol: crate::negotiate::Protocol, svc: &ServiceConfig, local: &Endpoint, remote: &Endpoint) -> Result<(), SessionError> {
    let io = NegotiationIo {
        local_rfd: local,
        local_wfd: local,
        remote,
        busy_timeout: svc.timeout_busy,
        service_name: &svc.name,
    };
    negotiate::negotiate(protocol, Role::Client, &io).map_err(SessionError::Negotiation)
}

fn negotiate_server_side(svc: &ServiceConfig, local: &Endpoint, remote: &Endpoint) -> Result<(), SessionError> {
    let protocol = svc.protocol.expect("caller already checked protocol.is_some()");
    let io = NegotiationIo {
        local_rfd: local,
        local_wfd: local,
        remote,
        busy_timeout: svc.timeout_busy,
        service_name: &svc.name,
    };
    negotiate::negotiate(protocol, Role::Server, &io).map_err(SessionError::Negotiation)
}

fn establish_tls(svc: &ServiceConfig, remote: &Endpoint, shared: &SharedState) -> Result<TlsDriver, SessionError> {
    if svc.client {
        let destination = remote_destination_key(svc);
        // Reuse the cached config for this destination if one exists, so a
        // repeat connection gets an abbreviated handshake via its ticket
        // store (spec §4.5 "in client mode optionally install a cached
        // session for resumption"); the config accumulates new tickets as
        // it's used, so nothing needs writing back on success.
        let (config, was_cached) = shared
            .resumption
            .get_or_insert_with(&destination, || shared.client_tls_config.clone());
        let server_name = svc
            .connect
            .first()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| svc.name.clone());
        let mut driver = TlsDriver::client(config, server_name, remote.raw_fd(), remote.raw_fd())?;
        driver.mark_resumed_hint(was_cached);
        driver.handshake(svc.timeout_busy)?;
        log_resumption(&driver, &svc.name);
        log_cipher(&driver, &svc.name);
        Ok(driver)
    } else {
        let config = shared
            .server_tls_config
            .clone()
            .expect("server-mode service must have a loaded TLS server config");
        let mut driver = TlsDriver::server(config, remote.raw_fd(), remote.raw_fd())?;
        driver.handshake(svc.timeout_busy)?;
        log_cipher(&driver, &svc.name);
        Ok(driver)
    }
}

fn remote_destination_key(svc: &ServiceConfig) -> String {
    svc.connect
        .first()
        .map(|a| a.to_string())
        .unwrap_or_else(|| svc.name.clone())
}

fn log_cipher(driver: &TlsDriver, service: &str) {
    if let Some(desc) = driver.cipher_description() {
        tracing::info!(service, cipher = %desc, "negotiated TLS cipher");
    }
}

/// Spec §4.5: "after success, if the session was resumed, log; else fetch
/// and cache the new session". The caching side is handled by the
/// `ResumptionCache` itself (it accumulates tickets in place); this just
/// reports which branch happened.
fn log_resumption(driver: &TlsDriver, service: &str) {
    if driver.is_resumed() {
        tracing::info!(service, "TLS session resumed");
    } else {
        tracing::debug!(service, "TLS session negotiated fresh (no resumption)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_destination_key_prefers_first_connect_address() {
        let svc = ServiceConfig {
            name: "svc".into(),
            accept: None,
            connect: vec!["10.0.0.1:443".parse().unwrap()],
            client: true,
            cert: None,
            key: None,
            protocol: None,
            transparent: false,
            delayed_lookup: false,
            exec: None,
            exec_args: Vec::new(),
            pty: false,
            source_addr: None,
            username: None,
            timeout_busy: 60.0,
            timeout_connect: 10.0,
            timeout_idle: 43200.0,
            timeout_close: 60.0,
            session_cache_size: 256,
        };
        assert_eq!(remote_destination_key(&svc), "10.0.0.1:443");
    }
}
