//! Mirror and access-policy configuration
//!
//! Two JSON documents drive a mirror process:
//! - `Servers.json`: one entry per mirror (target server, bind endpoint and
//!   whether to register with the directory)
//! - `Settings.json`: the geographic access policy shared by every mirror
//!
//! Both files use PascalCase keys so existing deployments keep working. Raw entries are validated into immutable
//! [`MirrorConfig`] / [`AccessPolicy`] values before any mirror starts.

use crate::error::ConfigError;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::path::Path;

/// One element of `Servers.json` as written on disk.
///
/// Decoding never fails: a field with the wrong type or out of range is kept
/// in a form that [`MirrorConfig::from_entry`] rejects, so one broken entry
/// only stops its own mirror.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Value")]
pub struct ServerEntry {
    #[serde(rename = "TargetIP")]
    pub target_ip: String,
    #[serde(rename = "TargetPort")]
    pub target_port: Option<i64>,
    /// Empty means "use this host's primary IPv4 address".
    #[serde(rename = "BindIP")]
    pub bind_ip: String,
    #[serde(rename = "BindPort")]
    pub bind_port: Option<i64>,
    #[serde(rename = "ShowMaster")]
    pub show_master: bool,
}

impl From<Value> for ServerEntry {
    fn from(value: Value) -> Self {
        Self {
            target_ip: field(&value, "TargetIP").map(text_of).unwrap_or_default(),
            target_port: field(&value, "TargetPort").and_then(integer_of),
            bind_ip: field(&value, "BindIP").map(text_of).unwrap_or_default(),
            bind_port: field(&value, "BindPort").and_then(integer_of),
            show_master: field(&value, "ShowMaster")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }
}

fn field<'a>(entry: &'a Value, key: &str) -> Option<&'a Value> {
    entry.get(key).filter(|value| !value.is_null())
}

/// Integers, also when written as a string.
fn integer_of(value: &Value) -> Option<i64> {
    match value {
        Value::String(text) => text.trim().parse().ok(),
        other => other.as_i64(),
    }
}

/// Strings as-is, anything else as its JSON text so it shows up in errors.
fn text_of(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn port_of(value: Option<i64>, field: &'static str) -> Result<u16, ConfigError> {
    let value = value.ok_or_else(|| ConfigError::InvalidPort {
        field,
        value: "missing".to_string(),
    })?;
    u16::try_from(value).map_err(|_| ConfigError::InvalidPort {
        field,
        value: value.to_string(),
    })
}

/// Validated configuration of one mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorConfig {
    /// The real game server being mirrored
    pub target: SocketAddrV4,
    /// Where the mirror listens
    pub bind: SocketAddrV4,
    /// Send heartbeats to the directory service
    pub show_master: bool,
}

impl MirrorConfig {
    pub fn new(target: SocketAddrV4, bind: SocketAddrV4, show_master: bool) -> Self {
        Self {
            target,
            bind,
            show_master,
        }
    }

    /// Validates a raw entry. Both addresses must be IPv4 and both ports
    /// must fit in 0..=65535.
    pub fn from_entry(entry: &ServerEntry) -> Result<Self, ConfigError> {
        let target_port = port_of(entry.target_port, "TargetPort")?;
        let bind_port = port_of(entry.bind_port, "BindPort")?;

        let target_ip: Ipv4Addr = entry
            .target_ip
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidTarget(entry.target_ip.clone()))?;

        let bind_ip = if entry.bind_ip.trim().is_empty() {
            local_ipv4()?
        } else {
            entry
                .bind_ip
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidBind(entry.bind_ip.clone()))?
        };

        Ok(Self::new(
            SocketAddrV4::new(target_ip, target_port),
            SocketAddrV4::new(bind_ip, bind_port),
            entry.show_master,
        ))
    }
}

/// Primary IPv4 address of this host.
///
/// Connecting a UDP socket only selects a route; nothing is sent.
pub fn local_ipv4() -> Result<Ipv4Addr, ConfigError> {
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(ConfigError::LocalAddress)?;
    socket
        .connect("8.8.8.8:53")
        .map_err(ConfigError::LocalAddress)?;

    match socket.local_addr().map_err(ConfigError::LocalAddress)? {
        SocketAddr::V4(addr) => Ok(*addr.ip()),
        SocketAddr::V6(addr) => Err(ConfigError::LocalAddress(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("route resolved to IPv6 address {}", addr.ip()),
        ))),
    }
}

/// `Settings.json` as written on disk. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Settings {
    pub debug: bool,

    pub enable_subdivision_whitelist: bool,
    pub subdivision_whitelist: Vec<String>,

    pub enable_subdivision_blacklist: bool,
    pub subdivision_blacklist: Vec<String>,

    pub enable_continent_whitelist: bool,
    pub continent_whitelist: Vec<String>,

    pub enable_continent_blacklist: bool,
    pub continent_blacklist: Vec<String>,
}

/// A list-based rule with its own enable flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRule {
    pub enabled: bool,
    pub entries: Vec<String>,
}

impl ListRule {
    pub fn new(enabled: bool, entries: Vec<String>) -> Self {
        Self { enabled, entries }
    }

    pub fn active<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(true, entries.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, value: &str) -> bool {
        self.entries.iter().any(|entry| entry == value)
    }
}

/// Geographic access policy shared read-only by all mirrors.
///
/// With every rule disabled the policy permits everyone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessPolicy {
    pub subdivision_allow: ListRule,
    pub subdivision_deny: ListRule,
    pub continent_allow: ListRule,
    pub continent_deny: ListRule,
    /// Raises the default log level to `debug`
    pub debug: bool,
}

impl AccessPolicy {
    /// Default `env_logger` filter for this policy.
    pub fn log_filter(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }

    pub fn any_enabled(&self) -> bool {
        self.subdivision_allow.enabled
            || self.subdivision_deny.enabled
            || self.continent_allow.enabled
            || self.continent_deny.enabled
    }
}

impl From<Settings> for AccessPolicy {
    fn from(settings: Settings) -> Self {
        Self {
            subdivision_allow: ListRule::new(
                settings.enable_subdivision_whitelist,
                settings.subdivision_whitelist,
            ),
            subdivision_deny: ListRule::new(
                settings.enable_subdivision_blacklist,
                settings.subdivision_blacklist,
            ),
            continent_allow: ListRule::new(
                settings.enable_continent_whitelist,
                settings.continent_whitelist,
            ),
            continent_deny: ListRule::new(
                settings.enable_continent_blacklist,
                settings.continent_blacklist,
            ),
            debug: settings.debug,
        }
    }
}

pub fn load_servers(path: &Path) -> Result<Vec<ServerEntry>, ConfigError> {
    let text = read_file(path)?;
    parse_servers(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn parse_servers(text: &str) -> Result<Vec<ServerEntry>, serde_json::Error> {
    serde_json::from_str(text)
}

pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let text = read_file(path)?;
    parse_settings(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn parse_settings(text: &str) -> Result<Settings, serde_json::Error> {
    serde_json::from_str(text)
}

/// Writes default `Servers.json` / `Settings.json` where they are missing.
pub fn ensure_default_files(servers: &Path, settings: &Path) -> Result<(), ConfigError> {
    if !servers.exists() {
        write_file(servers, "[]")?;
        info!("Created empty server list at {}", servers.display());
    }

    if !settings.exists() {
        let defaults = serde_json::to_string_pretty(&Settings::default()).map_err(|source| {
            ConfigError::Parse {
                path: settings.to_path_buf(),
                source,
            }
        })?;
        write_file(settings, &defaults)?;
        info!("Created default settings at {}", settings.display());
    }

    Ok(())
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_file(path: &Path, contents: &str) -> Result<(), ConfigError> {
    fs::write(path, contents).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}
