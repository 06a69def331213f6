//! Universal TLS tunnel: transparently bridges a plaintext endpoint and a
//! TLS peer, with optional STARTTLS negotiation.

pub mod access;
pub mod blocking;
pub mod config;
pub mod connect;
pub mod endpoint;
pub mod error;
pub mod ident;
pub mod logging;
pub mod negotiate;
pub mod poll;
pub mod pump;
pub mod session;
pub mod spawn;
pub mod tls;

#[cfg(test)]
pub(crate) mod testutil;
