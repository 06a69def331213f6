//! Logging setup (§10 "Logging"; §6 "Logger" collaborator — severity plus
//! formatted message, never fails the core). Grounded on the
//! `tracing_subscriber::fmt().init()` pattern seen across the example pack
//! (e.g. `bitcoin_sprint_api.rs`); per-session context is attached via
//! `tracing::span!` at the call sites rather than through a custom trait,
//! since "never fails the core" is exactly what `tracing`'s macros
//! already provide (logging calls can't return an error).

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Call once from the daemon's `main`.
/// Respects `RUST_LOG`/`TLSTUNNEL_LOG`, defaulting to `info`.
pub fn init() {
    let filter = EnvFilter::try_from_env("TLSTUNNEL_LOG")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Build the per-session span carrying the identity fields spec §3 lists:
/// service name, accepted-peer address, connecting-peer address.
pub fn session_span(service: &str, accepted_peer: &str) -> tracing::Span {
    tracing::info_span!("session", service, accepted_peer)
}
