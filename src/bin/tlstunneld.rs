//! Daemon entry point (§10 "Daemon lifecycle"). Deliberately
//! thin: argument parsing, config load, one listener thread per configured
//! service, thread-per-session dispatch to [`tlstunnel::session::run`].
//! Grounded on `examples/original_source/src/client.c`'s `client()`/outer
//! accept loop and `network.c`'s signal-pipe pattern, translated from
//! fork-per-client to thread-per-client (spec §5 "one session per worker,
//! either a dedicated thread or a forked process depending on platform").

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;

use tlstunnel::access::AccessControl;
use tlstunnel::config::{Config, ServiceConfig};
use tlstunnel::connect::AddressList;
use tlstunnel::endpoint::Endpoint;
use tlstunnel::session::{RemoteMode, SharedState};
use tlstunnel::spawn::SpawnSpec;
use tlstunnel::{logging, session, spawn, tls};

#[derive(Parser, Debug)]
#[command(name = "tlstunneld", about = "Universal TLS tunnel daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,
}

fn main() {
    logging::init();

    let args = Args::parse();
    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, path = %args.config.display(), "failed to load configuration");
            std::process::exit(1);
        }
    };

    if config.service.is_empty() {
        tracing::error!("configuration defines no [[service]] entries");
        std::process::exit(1);
    }

    let shared = Arc::new(build_shared_state(&config));

    // Reap exec'd children periodically instead of wiring a real signal
    // self-pipe (spec §9 "Signal-driven wakeup"); the outer loop is the
    // only place SIGCHLD-adjacent bookkeeping happens, never the data pump.
    thread::spawn(|| loop {
        while let Some((pid, status)) = spawn::reap_nonblocking() {
            tracing::debug!(pid, status, "local process exited");
        }
        thread::sleep(Duration::from_millis(500));
    });

    let mut listeners = Vec::new();
    for svc in &config.service {
        let Some(accept_addr) = svc.accept else {
            tracing::warn!(service = %svc.name, "service has no accept address, skipping listener");
            continue;
        };
        match TcpListener::bind(accept_addr) {
            Ok(listener) => listeners.push((svc.clone(), listener)),
            Err(e) => {
                tracing::error!(service = %svc.name, %accept_addr, error = %e, "failed to bind listener");
            }
        }
    }

    if listeners.is_empty() {
        tracing::error!("no listeners could be bound");
        std::process::exit(1);
    }

    let mut handles = Vec::new();
    for (svc, listener) in listeners {
        let shared = shared.clone();
        handles.push(thread::spawn(move || accept_loop(svc, listener, shared)));
    }
    for h in handles {
        let _ = h.join();
    }
}

fn build_shared_state(config: &Config) -> SharedState {
    let server_tls_config = config
        .service
        .iter()
        .find(|s| !s.client)
        .and_then(|s| match (&s.cert, &s.key) {
            (Some(cert), Some(key)) => tls::server_config_from_pem(cert, key, s.session_cache_size).ok(),
            _ => None,
        });

    SharedState {
        access: AccessControl::default(),
        client_tls_config: tls::client_config(),
        server_tls_config,
        resumption: Default::default(),
    }
}

fn accept_loop(svc: ServiceConfig, listener: TcpListener, shared: Arc<SharedState>) {
    tracing::info!(service = %svc.name, addr = %listener.local_addr().unwrap(), "listening");
    loop {
        let (stream, peer_addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(service = %svc.name, error = %e, "accept failed");
                continue;
            }
        };
        let svc = svc.clone();
        let shared = shared.clone();
        thread::spawn(move || {
            let local = match Endpoint::from_tcp_stream(stream) {
                Ok(ep) => ep,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to prepare accepted connection");
                    return;
                }
            };
            let remote_mode = remote_mode_for(&svc, peer_addr);
            // session::run forces an RST close on every descriptor it owns
            // when it returns an error; nothing further to close here.
            if let Err(e) = session::run(&svc, local, Some(peer_addr), remote_mode, &shared) {
                tracing::warn!(service = %svc.name, error = %e, "session ended with error");
            }
        });
    }
}

fn remote_mode_for(svc: &ServiceConfig, accepted_peer: std::net::SocketAddr) -> RemoteMode {
    if let Some(program) = &svc.exec {
        RemoteMode::SpawnProgram(SpawnSpec {
            program: program.clone(),
            args: svc.exec_args.clone(),
            remote_host: svc
                .connect
                .first()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            foreground: true,
            ssl_client_dn: None,
            ssl_client_issuer_dn: None,
        })
    } else {
        // Bind address precedence matches spec §4.4: explicit source
        // address, else the accepted peer's address in transparent mode,
        // else unbound.
        let bind = svc.source_addr.or_else(|| {
            if svc.transparent {
                Some(std::net::SocketAddr::new(accepted_peer.ip(), 0))
            } else {
                None
            }
        });
        RemoteMode::Network(AddressList::new(svc.connect.clone()), bind)
    }
}
