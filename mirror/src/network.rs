//! Mirror network layer: one UDP socket and the poll loop that drives it

use crate::cache::{SnapshotCache, SnapshotSource, CACHE_TTL};
use crate::config::MirrorConfig;
use crate::error::MirrorError;
use crate::geo::GeoAccessFilter;
use crate::heartbeat::{
    directory_reply, encode_ascii, read_challenge, DirectoryHeartbeat, HeartbeatState,
    HEARTBEAT_INTERVAL,
};
use log::{debug, info, warn};
use shared::{classify_packet, QueryKind};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::{interval, sleep, MissedTickBehavior};

/// Upper bound on how long the loop waits for a datagram before it checks
/// its timers again.
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

const RECV_BUFFER_SIZE: usize = 1024;

/// Timer settings of a mirror. Defaults match the public protocol cadence.
#[derive(Debug, Clone, Copy)]
pub struct MirrorTimings {
    pub cache_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for MirrorTimings {
    fn default() -> Self {
        Self {
            cache_ttl: CACHE_TTL,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            poll_interval: POLL_INTERVAL,
        }
    }
}

/// A single mirror: answers queries for one target server from its cache.
///
/// Dispatch, cache refresh and heartbeats all run sequentially inside
/// [`MirrorRuntime::run`], so none of the state needs locking.
pub struct MirrorRuntime<S> {
    config: MirrorConfig,
    socket: UdpSocket,
    cache: SnapshotCache,
    source: S,
    filter: GeoAccessFilter,
    heartbeat: Option<DirectoryHeartbeat>,
    poll_interval: Duration,
}

impl<S: SnapshotSource> MirrorRuntime<S> {
    /// Binds the mirror's socket.
    ///
    /// `directory` is only used when the config opts into directory
    /// participation.
    pub async fn bind(
        config: MirrorConfig,
        source: S,
        filter: GeoAccessFilter,
        directory: Option<SocketAddr>,
        timings: MirrorTimings,
    ) -> Result<Self, MirrorError> {
        let socket = UdpSocket::bind(config.bind)
            .await
            .map_err(|source| MirrorError::Bind {
                addr: config.bind.to_string(),
                source,
            })?;

        // Advertise the port actually bound when the config asked for port 0
        let mut config = config;
        if let SocketAddr::V4(local) = socket.local_addr()? {
            config.bind = local;
        }

        let now = Instant::now();
        let heartbeat = directory.filter(|_| config.show_master).map(|endpoint| {
            DirectoryHeartbeat::new(
                endpoint,
                HeartbeatState::with_interval(now, timings.heartbeat_interval),
            )
        });

        Ok(MirrorRuntime {
            config,
            socket,
            cache: SnapshotCache::with_ttl(now, timings.cache_ttl),
            source,
            filter,
            heartbeat,
            poll_interval: timings.poll_interval,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, MirrorError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    /// Main mirror loop. Runs until the task is dropped.
    ///
    /// Each iteration handles at most one datagram, then services the cache
    /// and heartbeat timers. The short ticker bounds how long timers wait
    /// when no traffic arrives.
    pub async fn run(mut self) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        self.service_timers(Instant::now()).await;

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, addr)) => self.dispatch(&buffer[..len], addr).await,
                        Err(e) => {
                            warn!("Query polling error on {}: {}", self.config.bind, e);
                            sleep(Duration::from_millis(10)).await;
                        }
                    }
                },

                _ = ticker.tick() => {},
            }

            self.service_timers(Instant::now()).await;
        }
    }

    /// Refreshes the cache and sends a heartbeat when due.
    async fn service_timers(&mut self, now: Instant) {
        self.cache.refresh_if_expired(&self.source, now).await;

        if let Some(heartbeat) = self.heartbeat.as_mut() {
            heartbeat.send_if_due(&self.socket, now).await;
        }
    }

    /// Answers one inbound datagram, if it warrants an answer.
    async fn dispatch(&self, datagram: &[u8], from: SocketAddr) {
        if let Some(reply) = self.reply_for(datagram, from) {
            if let Err(e) = self.socket.send_to(&reply, from).await {
                warn!("Failed to reply to {}: {}", from, e);
            }
        }
    }

    /// Builds the reply to `datagram`. `None` means stay silent.
    fn reply_for(&self, datagram: &[u8], from: SocketAddr) -> Option<Vec<u8>> {
        match classify_packet(datagram)? {
            QueryKind::DirectoryQuery => {
                let challenge = read_challenge(datagram);
                let reply = directory_reply(challenge, self.config.bind, self.cache.get());
                info!("Answered directory query from {}", from);
                Some(encode_ascii(&reply))
            }

            QueryKind::Info => {
                if !self.filter.is_allowed(from.ip()) {
                    debug!("Ignoring a2s_info from {}", from);
                    return None;
                }

                let data = &self.cache.get().data;
                if data.is_empty() {
                    debug!("No cached response yet for {}", from);
                    return None;
                }

                debug!("Sent a2s_info to {}", from);
                Some(data.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::QueryOutcome;
    use crate::config::{AccessPolicy, ListRule};
    use crate::error::GeoError;
    use crate::error_log::ErrorLog;
    use crate::geo::{GeoLocation, GeoLookup};
    use shared::{build_info_request, encode_info_response, ServerOs, ServerSnapshot};
    use std::net::{IpAddr, SocketAddrV4};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::timeout;

    #[derive(Clone)]
    struct CountingSource {
        snapshot: ServerSnapshot,
        calls: Arc<AtomicUsize>,
    }

    impl SnapshotSource for CountingSource {
        async fn query(&self) -> QueryOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            QueryOutcome::Fresh(self.snapshot.clone())
        }
    }

    /// Places every address on the given continent.
    struct ContinentLookup(&'static str);

    impl GeoLookup for ContinentLookup {
        fn lookup(&self, _ip: IpAddr) -> Result<GeoLocation, GeoError> {
            Ok(GeoLocation {
                continent_code: Some(self.0.to_string()),
                continent_name: None,
                subdivision: None,
            })
        }
    }

    fn snapshot() -> ServerSnapshot {
        let mut snapshot = ServerSnapshot {
            name: "Runtime Test".to_string(),
            map: "de_dust".to_string(),
            directory: "cstrike".to_string(),
            game: "valve".to_string(),
            app_id: 10,
            players: 5,
            max_players: 10,
            bots: 0,
            dedicated: true,
            os: ServerOs::Linux,
            password: false,
            secure: true,
            version: "1.0".to_string(),
            data: Vec::new(),
        };
        snapshot.data = encode_info_response(&snapshot);
        snapshot
    }

    fn loopback_config(show_master: bool) -> MirrorConfig {
        MirrorConfig::new(
            "127.0.0.1:9".parse().unwrap(),
            SocketAddrV4::new([127, 0, 0, 1].into(), 0),
            show_master,
        )
    }

    fn filter(policy: AccessPolicy, continent: &'static str) -> GeoAccessFilter {
        GeoAccessFilter::new(
            Arc::new(policy),
            Arc::new(ContinentLookup(continent)),
            Arc::new(ErrorLog::disabled()),
        )
    }

    fn source() -> (CountingSource, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            snapshot: snapshot(),
            calls: Arc::clone(&calls),
        };
        (source, calls)
    }

    fn directory_query(challenge: i32) -> Vec<u8> {
        let mut packet = vec![0xFF, 0xFF, 0xFF, 0xFF, 0x73, 0x0A];
        packet.extend_from_slice(&challenge.to_le_bytes());
        packet
    }

    async fn exchange(client: &UdpSocket, mirror: SocketAddr, packet: &[u8]) -> Option<Vec<u8>> {
        client.send_to(packet, mirror).await.unwrap();
        let mut buf = [0u8; 2048];
        match timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_reply_for_routes_by_command_byte() {
        let (source, _) = source();
        let mut runtime = MirrorRuntime::bind(
            loopback_config(false),
            source,
            filter(AccessPolicy::default(), "EU"),
            None,
            MirrorTimings::default(),
        )
        .await
        .unwrap();
        let from: SocketAddr = "198.51.100.4:50000".parse().unwrap();

        // Nothing cached yet
        assert_eq!(runtime.reply_for(&build_info_request(), from), None);

        runtime.service_timers(Instant::now()).await;
        assert_eq!(
            runtime.reply_for(&build_info_request(), from),
            Some(snapshot().data)
        );

        let reply = runtime.reply_for(&directory_query(1234), from).unwrap();
        let text = String::from_utf8(reply).unwrap();
        assert!(text.contains("\\challenge\\1234\\"));
        assert!(text.contains("\\players\\5\\max\\10\\"));

        assert_eq!(runtime.reply_for(&[0xFF, 0xFF, 0xFF, 0xFF, 0x55], from), None);
        assert_eq!(runtime.reply_for(b"hello", from), None);
    }

    #[tokio::test]
    async fn test_filtered_info_query_gets_no_reply_but_directory_query_does() {
        let (source, _) = source();
        let policy = AccessPolicy {
            continent_deny: ListRule::active(["AS"]),
            ..AccessPolicy::default()
        };
        let runtime = MirrorRuntime::bind(
            loopback_config(false),
            source,
            filter(policy, "AS"),
            None,
            MirrorTimings::default(),
        )
        .await
        .unwrap();
        let addr = runtime.local_addr().unwrap();
        tokio::spawn(runtime.run());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        assert_eq!(exchange(&client, addr, &build_info_request()).await, None);

        let reply = exchange(&client, addr, &directory_query(77)).await.unwrap();
        assert!(String::from_utf8(reply).unwrap().contains("\\challenge\\77\\"));
    }

    #[tokio::test]
    async fn test_allowed_info_query_gets_cached_bytes() {
        let (source, calls) = source();
        let runtime = MirrorRuntime::bind(
            loopback_config(false),
            source,
            filter(AccessPolicy::default(), "EU"),
            None,
            MirrorTimings::default(),
        )
        .await
        .unwrap();
        let addr = runtime.local_addr().unwrap();
        tokio::spawn(runtime.run());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for _ in 0..3 {
            let reply = exchange(&client, addr, &build_info_request()).await;
            assert_eq!(reply, Some(snapshot().data));
        }

        // Served from cache: one refresh at startup only
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timers_serviced_under_continuous_traffic() {
        let (source, calls) = source();
        let directory = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let timings = MirrorTimings {
            cache_ttl: Duration::from_millis(50),
            heartbeat_interval: Duration::from_millis(100),
            poll_interval: Duration::from_millis(5),
        };
        let runtime = MirrorRuntime::bind(
            loopback_config(true),
            source,
            filter(AccessPolicy::default(), "EU"),
            Some(directory.local_addr().unwrap()),
            timings,
        )
        .await
        .unwrap();
        let addr = runtime.local_addr().unwrap();
        tokio::spawn(runtime.run());

        // Flood the mirror with junk it never answers
        let flood = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let flooding = tokio::spawn(async move {
            loop {
                let _ = flood.send_to(&[0xFF, 0xFF, 0xFF, 0xFF, 0x55], addr).await;
                tokio::task::yield_now().await;
            }
        });

        let mut heartbeats = 0;
        let deadline = Instant::now() + Duration::from_millis(600);
        let mut buf = [0u8; 8];
        while Instant::now() < deadline {
            if let Ok(Ok((len, _))) =
                timeout(Duration::from_millis(50), directory.recv_from(&mut buf)).await
            {
                assert_eq!(&buf[..len], &[0x71]);
                heartbeats += 1;
            }
        }
        flooding.abort();

        assert!(heartbeats >= 2, "only {} heartbeats under load", heartbeats);
        assert!(
            calls.load(Ordering::SeqCst) >= 3,
            "only {} refreshes under load",
            calls.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_no_heartbeat_without_opt_in() {
        let (source, _) = source();
        let directory = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let runtime = MirrorRuntime::bind(
            loopback_config(false),
            source,
            filter(AccessPolicy::default(), "EU"),
            Some(directory.local_addr().unwrap()),
            MirrorTimings::default(),
        )
        .await
        .unwrap();
        tokio::spawn(runtime.run());

        let mut buf = [0u8; 8];
        let received = timeout(Duration::from_millis(200), directory.recv_from(&mut buf)).await;
        assert!(received.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let config = MirrorConfig::new(
            "127.0.0.1:9".parse().unwrap(),
            SocketAddrV4::new([127, 0, 0, 1].into(), port),
            false,
        );
        let (source, _) = source();

        let result = MirrorRuntime::bind(
            config,
            source,
            filter(AccessPolicy::default(), "EU"),
            None,
            MirrorTimings::default(),
        )
        .await;
        assert!(matches!(result, Err(MirrorError::Bind { .. })));
    }
}
