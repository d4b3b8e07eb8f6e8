//! Directory (master server) participation
//!
//! A mirror that opts in announces itself to the directory every four minutes
//! with a single `0x71` byte sent from its own socket. The directory then
//! queries the mirror with `0x73`; the reply is a backslash-delimited
//! key/value string built from the cached snapshot.

use log::{info, warn};
use shared::{ServerSnapshot, MASTER_HEARTBEAT};
use std::net::{SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

/// Time between two heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4 * 60);
/// Default directory host and port.
pub const DEFAULT_DIRECTORY_HOST: &str = "hl2master.steampowered.com";
pub const DEFAULT_DIRECTORY_PORT: u16 = 27011;

/// Game directory and product advertised to the directory.
pub const DIRECTORY_GAME_DIR: &str = "garrysmod";

// Challenge token position inside a directory query
const CHALLENGE_OFFSET: usize = 6;

/// When the next heartbeat is due. The first one is due immediately.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatState {
    next_due: Instant,
    interval: Duration,
}

impl HeartbeatState {
    pub fn new(now: Instant) -> Self {
        Self::with_interval(now, HEARTBEAT_INTERVAL)
    }

    pub fn with_interval(now: Instant, interval: Duration) -> Self {
        Self {
            next_due: now,
            interval,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_due
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    pub fn mark_sent(&mut self, now: Instant) {
        self.next_due = now + self.interval;
    }
}

/// Heartbeat sender for one mirror.
#[derive(Debug, Clone)]
pub struct DirectoryHeartbeat {
    endpoint: SocketAddr,
    state: HeartbeatState,
}

impl DirectoryHeartbeat {
    pub fn new(endpoint: SocketAddr, state: HeartbeatState) -> Self {
        Self { endpoint, state }
    }

    pub fn state(&self) -> &HeartbeatState {
        &self.state
    }

    /// Sends a heartbeat if one is due. Returns whether one was attempted.
    ///
    /// The timer is rearmed even when the send fails; the next attempt comes
    /// one interval later.
    pub async fn send_if_due(&mut self, socket: &UdpSocket, now: Instant) -> bool {
        if !self.state.is_due(now) {
            return false;
        }

        self.state.mark_sent(now);
        match socket.send_to(&[MASTER_HEARTBEAT], self.endpoint).await {
            Ok(_) => info!("Sent directory heartbeat to {}", self.endpoint),
            Err(e) => warn!("Failed to send heartbeat to {}: {}", self.endpoint, e),
        }
        true
    }
}

/// Reads the little-endian challenge token of a directory query.
///
/// Missing bytes of a short packet count as zero.
pub fn read_challenge(packet: &[u8]) -> i32 {
    let mut token = [0u8; 4];
    for (i, byte) in token.iter_mut().enumerate() {
        *byte = packet.get(CHALLENGE_OFFSET + i).copied().unwrap_or(0);
    }
    i32::from_le_bytes(token)
}

/// Builds the directory reply advertising `game_addr` with the cached state.
pub fn directory_reply(challenge: i32, game_addr: SocketAddrV4, snapshot: &ServerSnapshot) -> String {
    format!(
        "0\n\\protocol\\7\\challenge\\{challenge}\\gameaddr\\{addr}\\players\\{players}\\max\\{max}\
         \\bots\\0\\gamedir\\{dir}\\map\\{map}\\password\\0\\os\\l\\lan\\0\\region\\255\
         \\gametype\\{game}\\type\\d\\secure\\1\\version\\{version}\\product\\{dir}\n",
        challenge = challenge,
        addr = game_addr,
        players = snapshot.players,
        max = snapshot.max_players,
        dir = DIRECTORY_GAME_DIR,
        map = snapshot.map,
        game = snapshot.game,
        version = snapshot.version,
    )
}

/// ASCII bytes of `reply`; anything outside ASCII becomes `?`.
pub fn encode_ascii(reply: &str) -> Vec<u8> {
    reply
        .chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect()
}
