//! Configuration system for peerlink.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PEERLINK_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/peerlink/config.toml
//!   3. ~/.config/peerlink/config.toml
//!
//! The `engine` section is handed verbatim to the session engine when a
//! session is built. Nothing in the dialer or listener reads it.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerlinkConfig {
    pub engine: EngineConfig,
    pub dialer: DialerConfig,
    pub listener: ListenerConfig,
}

/// Session engine settings, forwarded without interpretation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// STUN/TURN server URLs.
    pub ice_servers: Vec<String>,
    /// Restrict candidate gathering to these network types. Empty = all.
    pub network_types: Vec<NetworkType>,
    /// Only gather candidates on these interface names. Empty = all.
    pub interfaces: Vec<String>,
    /// 1:1 NAT mapping advertised instead of the gathered addresses.
    pub nat_1to1: Option<Nat1To1Ips>,
    /// Ephemeral UDP port range for gathered candidates.
    pub port_range: Option<PortRange>,
    /// DTLS role taken when answering an offer.
    pub answering_dtls_role: DtlsRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Udp4,
    Udp6,
    Tcp4,
    Tcp6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    /// Full 1:1 DNAT.
    Host,
    /// Behind a NAT; the IPs are server-reflexive.
    Srflx,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nat1To1Ips {
    pub ips: Vec<String>,
    pub candidate_type: CandidateType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

/// DTLS role of the answering side (RFC 4347).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    /// Derived from the ICE role.
    #[default]
    Auto,
    /// Sends the ClientHello.
    Client,
    /// Waits for the ClientHello.
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
    /// Multiplex new streams onto the last negotiated session.
    pub reuse_session: bool,
    /// Close a Conn after this long without writes. 0 = never.
    pub idle_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Idle timeout for accepted Conns and for emptied sessions. 0 = never.
    pub idle_timeout_ms: u64,
    /// Upper bound on one inbound offer's negotiation.
    pub negotiation_timeout_ms: u64,
    /// Accepted Conns buffered ahead of `accept` callers.
    pub accept_backlog: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_ACCEPT_BACKLOG: usize = 8;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            network_types: Vec::new(),
            interfaces: Vec::new(),
            nat_1to1: None,
            port_range: None,
            answering_dtls_role: DtlsRole::Auto,
        }
    }
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            reuse_session: false,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT.as_millis() as u64,
            negotiation_timeout_ms: DEFAULT_NEGOTIATION_TIMEOUT.as_millis() as u64,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
        }
    }
}

impl DialerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl ListenerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// A zero timeout falls back to the default; an offer is never negotiated unbounded.
    pub fn negotiation_timeout(&self) -> Duration {
        match self.negotiation_timeout_ms {
            0 => DEFAULT_NEGOTIATION_TIMEOUT,
            ms => Duration::from_millis(ms),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("peerlink")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PeerlinkConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            PeerlinkConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PEERLINK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&PeerlinkConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply PEERLINK_* overrides read through `lookup`.
    ///
    /// Unparseable values are ignored and the file/default value is kept.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("PEERLINK_ENGINE__ICE_SERVERS") {
            self.engine.ice_servers = split_list(&v);
        }
        if let Some(v) = lookup("PEERLINK_ENGINE__INTERFACES") {
            self.engine.interfaces = split_list(&v);
        }
        if let Some(v) = lookup("PEERLINK_DIALER__REUSE_SESSION") {
            self.dialer.reuse_session = parse_flag(&v);
        }
        if let Some(ms) = lookup("PEERLINK_DIALER__IDLE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.dialer.idle_timeout_ms = ms;
        }
        if let Some(ms) =
            lookup("PEERLINK_LISTENER__IDLE_TIMEOUT_MS").and_then(|v| v.parse().ok())
        {
            self.listener.idle_timeout_ms = ms;
        }
        if let Some(ms) =
            lookup("PEERLINK_LISTENER__NEGOTIATION_TIMEOUT_MS").and_then(|v| v.parse().ok())
        {
            self.listener.negotiation_timeout_ms = ms;
        }
        if let Some(n) = lookup("PEERLINK_LISTENER__ACCEPT_BACKLOG").and_then(|v| v.parse().ok()) {
            self.listener.accept_backlog = n;
        }
    }
}

fn parse_flag(v: &str) -> bool {
    v == "true" || v == "1"
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
