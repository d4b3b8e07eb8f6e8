//! Error types shared by the mirror modules.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Problems with the configuration files or a single mirror entry.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid target address {0:?}")]
    InvalidTarget(String),

    #[error("invalid bind address {0:?}")]
    InvalidBind(String),

    #[error("invalid {field}: {value}")]
    InvalidPort { field: &'static str, value: String },

    #[error("could not determine a local IPv4 address: {0}")]
    LocalAddress(#[source] io::Error),

    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Geolocation lookup failures. All of them make the access filter deny.
#[derive(Error, Debug)]
pub enum GeoError {
    #[error("failed to open geolocation database {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("geolocation database unavailable: {0}")]
    Unavailable(String),

    #[error("lookup failed: {0}")]
    Lookup(String),

    #[error("database download failed: {0}")]
    Download(String),

    #[error("failed to decompress database: {0}")]
    Decompress(#[source] io::Error),

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Reasons a single mirror fails to start.
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to resolve directory host {host}: {source}")]
    DirectoryResolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("directory host {0} has no IPv4 address")]
    DirectoryNotFound(String),

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}
