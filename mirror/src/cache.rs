//! Cached snapshot of the mirrored server
//!
//! The cache is owned by a single mirror loop and refreshed from inside it, so
//! it needs no locking. Each refresh attempt, successful or not, pushes the
//! expiry forward by the TTL.

use log::{debug, info};
use shared::{build_info_request, parse_info_response, ServerSnapshot, INFO_BUFFER_SIZE};
use std::future::Future;
use std::io;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// How long a snapshot is served before the target is queried again.
pub const CACHE_TTL: Duration = Duration::from_secs(10);
/// How long to wait for the target server to answer.
pub const QUERY_TIMEOUT: Duration = Duration::from_millis(2500);

/// Result of one query against the target server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    Fresh(ServerSnapshot),
    TimedOut,
    /// The request could not be sent or the target refused it.
    Unreachable(String),
}

/// Something that can produce a snapshot of the target server.
pub trait SnapshotSource {
    fn query(&self) -> impl Future<Output = QueryOutcome> + Send;
}

/// Queries the real server over UDP.
#[derive(Debug, Clone)]
pub struct UpstreamQuery {
    target: SocketAddrV4,
    timeout: Duration,
}

impl UpstreamQuery {
    pub fn new(target: SocketAddrV4) -> Self {
        Self::with_timeout(target, QUERY_TIMEOUT)
    }

    pub fn with_timeout(target: SocketAddrV4, timeout: Duration) -> Self {
        Self { target, timeout }
    }

    pub fn target(&self) -> SocketAddrV4 {
        self.target
    }

    async fn exchange(&self) -> io::Result<[u8; INFO_BUFFER_SIZE]> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(self.target).await?;
        socket.send(&build_info_request()).await?;

        let mut buffer = [0u8; INFO_BUFFER_SIZE];
        socket.recv(&mut buffer).await?;
        Ok(buffer)
    }
}

impl SnapshotSource for UpstreamQuery {
    async fn query(&self) -> QueryOutcome {
        match timeout(self.timeout, self.exchange()).await {
            Ok(Ok(buffer)) => QueryOutcome::Fresh(parse_info_response(&buffer)),
            Ok(Err(e)) => QueryOutcome::Unreachable(e.to_string()),
            Err(_) => QueryOutcome::TimedOut,
        }
    }
}

/// Latest snapshot plus the time it stops being served.
#[derive(Debug, Clone)]
pub struct SnapshotCache {
    snapshot: ServerSnapshot,
    expires_at: Instant,
    ttl: Duration,
}

impl SnapshotCache {
    /// Starts with an unavailable snapshot that is already expired.
    pub fn new(now: Instant) -> Self {
        Self::with_ttl(now, CACHE_TTL)
    }

    pub fn with_ttl(now: Instant, ttl: Duration) -> Self {
        Self {
            snapshot: ServerSnapshot::unavailable(Vec::new()),
            expires_at: now,
            ttl,
        }
    }

    pub fn get(&self) -> &ServerSnapshot {
        &self.snapshot
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Replaces the snapshot with the outcome of an attempt started at `now`.
    pub fn store(&mut self, outcome: QueryOutcome, now: Instant) {
        self.expires_at = now + self.ttl;

        match outcome {
            QueryOutcome::Fresh(snapshot) => {
                debug!("Built cache: {} on {}", snapshot.name, snapshot.map);
                self.snapshot = snapshot;
            }
            QueryOutcome::TimedOut => {
                info!("Cache refresh timed out, serving unavailable snapshot");
                self.mark_unavailable();
            }
            QueryOutcome::Unreachable(reason) => {
                info!("Cache refresh failed ({}), serving unavailable snapshot", reason);
                self.mark_unavailable();
            }
        }
    }

    /// Queries `source` if the TTL has elapsed. Returns whether it did.
    pub async fn refresh_if_expired<S: SnapshotSource>(&mut self, source: &S, now: Instant) -> bool {
        if !self.is_expired(now) {
            return false;
        }

        let outcome = source.query().await;
        self.store(outcome, now);
        true
    }

    fn mark_unavailable(&mut self) {
        let data = std::mem::take(&mut self.snapshot.data);
        self.snapshot = ServerSnapshot::unavailable(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{encode_info_response, ServerOs};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio_test::block_on;

    /// Hands out queued outcomes and counts queries.
    struct ScriptedSource {
        outcomes: Mutex<Vec<QueryOutcome>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(mut outcomes: Vec<QueryOutcome>) -> Self {
            outcomes.reverse();
            Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl SnapshotSource for ScriptedSource {
        async fn query(&self) -> QueryOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(QueryOutcome::TimedOut)
        }
    }

    fn snapshot(players: i32) -> ServerSnapshot {
        let mut snapshot = ServerSnapshot {
            name: "Cached".to_string(),
            map: "de_dust".to_string(),
            directory: "cstrike".to_string(),
            game: "Counter-Strike".to_string(),
            app_id: 10,
            players,
            max_players: 32,
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

    #[test]
    fn test_new_cache_is_expired_and_unavailable() {
        let now = Instant::now();
        let cache = SnapshotCache::new(now);
        assert!(cache.is_expired(now));
        assert!(cache.get().is_unavailable());
        assert!(cache.get().data.is_empty());
    }

    #[test]
    fn test_ttl_serves_same_snapshot_until_expiry() {
        let start = Instant::now();
        let source = ScriptedSource::new(vec![
            QueryOutcome::Fresh(snapshot(5)),
            QueryOutcome::Fresh(snapshot(6)),
        ]);
        let mut cache = SnapshotCache::new(start);

        assert!(block_on(cache.refresh_if_expired(&source, start)));
        assert_eq!(cache.get().players, 5);

        for offset in [1, 5_000, 9_999] {
            let now = start + Duration::from_millis(offset);
            assert!(!block_on(cache.refresh_if_expired(&source, now)));
            assert_eq!(cache.get().players, 5);
        }
        assert_eq!(source.calls(), 1);

        let due = start + CACHE_TTL;
        assert!(block_on(cache.refresh_if_expired(&source, due)));
        assert!(!block_on(cache.refresh_if_expired(&source, due)));
        assert_eq!(source.calls(), 2);
        assert_eq!(cache.get().players, 6);
        assert_eq!(cache.expires_at(), due + CACHE_TTL);
    }

    #[test]
    fn test_timeout_keeps_previous_bytes_and_resets_timer() {
        let start = Instant::now();
        let good = snapshot(7);
        let source = ScriptedSource::new(vec![
            QueryOutcome::Fresh(good.clone()),
            QueryOutcome::TimedOut,
        ]);
        let mut cache = SnapshotCache::new(start);

        block_on(cache.refresh_if_expired(&source, start));
        let later = start + CACHE_TTL;
        block_on(cache.refresh_if_expired(&source, later));

        let current = cache.get();
        assert!(current.is_unavailable());
        assert_eq!(current.name, "N/A (request timed out)");
        assert_eq!(current.data, good.data);
        assert!(!cache.is_expired(later + Duration::from_secs(9)));
        assert!(cache.is_expired(later + CACHE_TTL));
    }

    #[test]
    fn test_unreachable_before_first_success_has_no_bytes() {
        let now = Instant::now();
        let mut cache = SnapshotCache::new(now);
        cache.store(QueryOutcome::Unreachable("connection refused".to_string()), now);

        assert!(cache.get().is_unavailable());
        assert!(cache.get().data.is_empty());
        assert!(!cache.is_expired(now));
    }

    #[test]
    fn test_custom_ttl() {
        let now = Instant::now();
        let mut cache = SnapshotCache::with_ttl(now, Duration::from_millis(50));
        cache.store(QueryOutcome::Fresh(snapshot(1)), now);

        assert!(!cache.is_expired(now + Duration::from_millis(49)));
        assert!(cache.is_expired(now + Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn test_upstream_query_times_out_on_silent_target() {
        // Bound but never answers
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = match silent.local_addr().unwrap() {
            std::net::SocketAddr::V4(addr) => addr,
            _ => unreachable!(),
        };

        let query = UpstreamQuery::with_timeout(target, Duration::from_millis(100));
        assert_eq!(query.query().await, QueryOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_upstream_query_decodes_reply() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = match server.local_addr().unwrap() {
            std::net::SocketAddr::V4(addr) => addr,
            _ => unreachable!(),
        };
        let reply = snapshot(9).data;

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            if let Ok((len, from)) = server.recv_from(&mut buf).await {
                assert_eq!(&buf[..len], build_info_request().as_slice());
                let _ = server.send_to(&reply, from).await;
            }
        });

        match UpstreamQuery::new(target).query().await {
            QueryOutcome::Fresh(snapshot) => {
                assert_eq!(snapshot.players, 9);
                assert_eq!(snapshot.map, "de_dust");
            }
            other => panic!("Unexpected outcome: {:?}", other),
        }
    }
}
