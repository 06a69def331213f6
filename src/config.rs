//! Options/configuration layer (§3 "Options", §6 "Config/options"
//! collaborator; §10 "Configuration"). TOML via `serde` + `toml`, matching
//! the corpus's config-struct-plus-`Deserialize` idiom.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::negotiate::Protocol;

fn default_busy() -> f64 {
    60.0
}
fn default_connect() -> f64 {
    10.0
}
fn default_idle() -> f64 {
    43200.0
}
fn default_close() -> f64 {
    60.0
}
fn default_session_cache() -> usize {
    256
}

/// One tunnel definition: a single service listening locally and bridging
/// to (or from) TLS on the other side.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Logged as the service tag (spec §3 Identity, §4.3 SMTP server probe
    /// relay tag).
    pub name: String,

    /// Local accept address, or `None` for an `exec`-only service whose
    /// "local" endpoint is stdio/the spawned child.
    pub accept: Option<SocketAddr>,

    /// Remote address list (pre-resolved unless `delayed_lookup`).
    #[serde(default)]
    pub connect: Vec<SocketAddr>,

    /// `true`: this process originates TLS to `connect` (client mode).
    /// `false`: this process terminates TLS from `accept` and forwards
    /// plaintext to `connect` (server mode).
    pub client: bool,

    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,

    /// STARTTLS protocol to negotiate before the TLS handshake, if any.
    #[serde(default, deserialize_with = "deserialize_protocol")]
    pub protocol: Option<Protocol>,

    #[serde(default)]
    pub transparent: bool,
    #[serde(default)]
    pub delayed_lookup: bool,
    #[serde(default)]
    pub exec: Option<String>,
    #[serde(default)]
    pub exec_args: Vec<String>,
    #[serde(default)]
    pub pty: bool,
    #[serde(default)]
    pub source_addr: Option<SocketAddr>,
    pub username: Option<String>,

    #[serde(default = "default_busy")]
    pub timeout_busy: f64,
    #[serde(default = "default_connect")]
    pub timeout_connect: f64,
    #[serde(default = "default_idle")]
    pub timeout_idle: f64,
    #[serde(default = "default_close")]
    pub timeout_close: f64,

    #[serde(default = "default_session_cache")]
    pub session_cache_size: usize,
}

impl ServiceConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_busy)
    }
}

fn deserialize_protocol<'de, D>(deserializer: D) -> Result<Option<Protocol>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(name) => Protocol::parse(&name)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown STARTTLS protocol {name:?}"))),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub service: Vec<ServiceConfig>,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn load(path: &std::path::Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_client_service() {
        let toml = r#"
            [[service]]
            name = "imaps"
            accept = "127.0.0.1:9993"
            connect = ["10.0.0.1:143"]
            client = true
            protocol = "smtp"
        "#;
        let cfg = Config::from_toml_str(toml).unwrap();
        assert_eq!(cfg.service.len(), 1);
        let svc = &cfg.service[0];
        assert_eq!(svc.name, "imaps");
        assert!(svc.client);
        assert_eq!(svc.protocol, Some(Protocol::Smtp));
        assert_eq!(svc.timeout_idle, default_idle());
    }

    #[test]
    fn rejects_unknown_protocol_name() {
        let toml = r#"
            [[service]]
            name = "x"
            client = true
            protocol = "imap"
        "#;
        assert!(Config::from_toml_str(toml).is_err());
    }
}
