//! Starts and tracks every configured mirror
//!
//! Each entry is validated, bound and spawned on its own. A mirror that fails
//! to start is recorded and skipped; the others keep running.

use crate::cache::UpstreamQuery;
use crate::config::{AccessPolicy, MirrorConfig, ServerEntry};
use crate::error::MirrorError;
use crate::error_log::ErrorLog;
use crate::geo::{GeoAccessFilter, GeoLookup};
use crate::heartbeat::{DEFAULT_DIRECTORY_HOST, DEFAULT_DIRECTORY_PORT};
use crate::network::{MirrorRuntime, MirrorTimings};
use log::{error, info};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::lookup_host;
use tokio::task::JoinHandle;

/// Where heartbeats go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryTarget {
    pub host: String,
    pub port: u16,
}

impl Default for DirectoryTarget {
    fn default() -> Self {
        Self {
            host: DEFAULT_DIRECTORY_HOST.to_string(),
            port: DEFAULT_DIRECTORY_PORT,
        }
    }
}

impl DirectoryTarget {
    /// Resolves the host to its first IPv4 address.
    pub async fn resolve(&self) -> Result<SocketAddr, MirrorError> {
        let addrs = lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|source| MirrorError::DirectoryResolve {
                host: self.host.clone(),
                source,
            })?;

        addrs
            .into_iter()
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| MirrorError::DirectoryNotFound(self.host.clone()))
    }
}

/// Process-wide, read-only collaborators handed to every mirror.
#[derive(Clone)]
pub struct MirrorContext {
    pub policy: Arc<AccessPolicy>,
    pub geo: Arc<dyn GeoLookup>,
    pub error_log: Arc<ErrorLog>,
    pub directory: DirectoryTarget,
    pub timings: MirrorTimings,
}

impl MirrorContext {
    pub fn new(policy: AccessPolicy, geo: Arc<dyn GeoLookup>, error_log: ErrorLog) -> Self {
        Self {
            policy: Arc::new(policy),
            geo,
            error_log: Arc::new(error_log),
            directory: DirectoryTarget::default(),
            timings: MirrorTimings::default(),
        }
    }

    pub fn with_directory(mut self, directory: DirectoryTarget) -> Self {
        self.directory = directory;
        self
    }

    pub fn with_timings(mut self, timings: MirrorTimings) -> Self {
        self.timings = timings;
        self
    }

    fn filter(&self) -> GeoAccessFilter {
        GeoAccessFilter::new(
            Arc::clone(&self.policy),
            Arc::clone(&self.geo),
            Arc::clone(&self.error_log),
        )
    }
}

/// A mirror task that started successfully.
#[derive(Debug)]
pub struct RunningMirror {
    pub bind: SocketAddr,
    pub target: SocketAddrV4,
    pub show_master: bool,
    handle: JoinHandle<()>,
}

impl RunningMirror {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// A configured mirror that did not start.
#[derive(Debug)]
pub struct MirrorFailure {
    /// Position of the entry in the server list
    pub index: usize,
    pub error: MirrorError,
}

/// All mirrors of this process.
#[derive(Debug, Default)]
pub struct MirrorSet {
    running: Vec<RunningMirror>,
    failures: Vec<MirrorFailure>,
}

impl MirrorSet {
    /// Starts one mirror per entry. Never fails as a whole.
    pub async fn start(entries: &[ServerEntry], context: &MirrorContext) -> Self {
        let mut set = MirrorSet::default();

        for (index, entry) in entries.iter().enumerate() {
            let started = match MirrorConfig::from_entry(entry) {
                Ok(config) => start_mirror(config, context).await,
                Err(e) => Err(e.into()),
            };

            match started {
                Ok(mirror) => set.running.push(mirror),
                Err(error) => {
                    error!(
                        "Could not create mirror #{} (target {}): {}",
                        index, entry.target_ip, error
                    );
                    set.failures.push(MirrorFailure { index, error });
                }
            }
        }

        set
    }

    pub fn running(&self) -> &[RunningMirror] {
        &self.running
    }

    pub fn failures(&self) -> &[MirrorFailure] {
        &self.failures
    }

    /// Stops every mirror task.
    pub fn shutdown(self) {
        for mirror in self.running {
            mirror.handle.abort();
        }
    }
}

/// Binds one mirror and spawns its loop.
pub async fn start_mirror(
    config: MirrorConfig,
    context: &MirrorContext,
) -> Result<RunningMirror, MirrorError> {
    let directory = if config.show_master {
        Some(context.directory.resolve().await?)
    } else {
        None
    };

    let runtime = MirrorRuntime::bind(
        config,
        UpstreamQuery::new(config.target),
        context.filter(),
        directory,
        context.timings,
    )
    .await?;
    let bind = runtime.local_addr()?;

    info!(
        "Started on {} targeting {} {} master list",
        bind,
        config.target,
        if config.show_master { "on" } else { "off" }
    );

    let handle = tokio::spawn(runtime.run());

    Ok(RunningMirror {
        bind,
        target: config.target,
        show_master: config.show_master,
        handle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::UnavailableLookup;

    fn context() -> MirrorContext {
        MirrorContext::new(
            AccessPolicy::default(),
            Arc::new(UnavailableLookup::new("no database in tests")),
            ErrorLog::disabled(),
        )
    }

    fn entry(target_ip: &str, bind_ip: &str) -> ServerEntry {
        ServerEntry {
            target_ip: target_ip.to_string(),
            target_port: Some(9),
            bind_ip: bind_ip.to_string(),
            bind_port: Some(0),
            show_master: false,
        }
    }

    #[tokio::test]
    async fn test_bad_entry_does_not_stop_others() {
        let entries = vec![
            entry("127.0.0.1", "not-an-ip"),
            entry("127.0.0.1", "127.0.0.1"),
            entry("bogus", "127.0.0.1"),
        ];

        let set = MirrorSet::start(&entries, &context()).await;

        assert_eq!(set.running().len(), 1);
        assert_eq!(set.failures().len(), 2);
        assert_eq!(set.failures()[0].index, 0);
        assert_eq!(set.failures()[1].index, 2);
        assert!(matches!(set.failures()[0].error, MirrorError::Config(_)));
        assert!(!set.running()[0].is_finished());

        set.shutdown();
    }

    #[tokio::test]
    async fn test_directory_resolves_literal_address() {
        let target = DirectoryTarget {
            host: "127.0.0.1".to_string(),
            port: 27011,
        };
        assert_eq!(
            target.resolve().await.unwrap(),
            "127.0.0.1:27011".parse::<SocketAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_unresolvable_directory_fails_only_that_mirror() {
        let context = context().with_directory(DirectoryTarget {
            host: "directory.invalid".to_string(),
            port: 27011,
        });
        let mut registering = entry("127.0.0.1", "127.0.0.1");
        registering.show_master = true;

        let set = MirrorSet::start(&[registering, entry("127.0.0.1", "127.0.0.1")], &context).await;

        assert_eq!(set.running().len(), 1);
        assert!(!set.running()[0].show_master);
        assert_eq!(set.failures().len(), 1);
        assert!(matches!(
            set.failures()[0].error,
            MirrorError::DirectoryResolve { .. } | MirrorError::DirectoryNotFound(_)
        ));

        set.shutdown();
    }
}
