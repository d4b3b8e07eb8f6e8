//! Wire layer for the Source engine discovery protocol (A2S_INFO) as spoken
//! between game clients, mirrors and the real game servers.
//!
//! Everything here is pure: building the request, decoding a response into a
//! [`ServerSnapshot`], and classifying inbound datagrams. Socket handling lives
//! in the `mirror` crate.

use serde::{Deserialize, Serialize};

/// Every connectionless packet starts with four `0xFF` bytes.
pub const A2S_HEADER: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
/// Command byte of a discovery info request.
pub const A2S_INFO: u8 = 0x54;
/// Payload that follows the command byte in an info request.
pub const A2S_INFO_STUB: &[u8] = b"Source Engine Query\0";
/// Type byte written by [`encode_info_response`].
pub const A2S_INFO_RESPONSE: u8 = 0x49;
/// Command byte of a directory (master server) query.
pub const MASTER_QUERY: u8 = 0x73;
/// The single byte sent to the directory as a heartbeat.
pub const MASTER_HEARTBEAT: u8 = 0x71;

/// Size of the receive buffer used for info responses.
pub const INFO_BUFFER_SIZE: usize = 512;

// Fields start right after header, type byte and protocol byte.
const INFO_FIELDS_OFFSET: usize = 6;
const PROTOCOL_VERSION: u8 = 17;
// Bytes kept past the last non-zero byte when trimming a receive buffer.
const PADDING_KEEP: usize = 7;

/// Operating system reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerOs {
    Linux,
    Windows,
    /// Placeholder used by the unavailable snapshot.
    Unknown,
}

/// Decoded discovery response plus the raw bytes it was decoded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub name: String,
    pub map: String,
    pub directory: String,
    pub game: String,
    pub app_id: i16,
    pub players: i32,
    pub max_players: i32,
    pub bots: i32,
    pub dedicated: bool,
    pub os: ServerOs,
    pub password: bool,
    pub secure: bool,
    pub version: String,
    /// Exact bytes answered to clients. Empty until a real response arrives.
    #[serde(skip)]
    pub data: Vec<u8>,
}

impl ServerSnapshot {
    /// Snapshot used when the target server did not answer in time.
    ///
    /// Carries over `data` from the previous snapshot so clients keep getting
    /// the last real answer while the decoded fields show the outage.
    pub fn unavailable(data: Vec<u8>) -> Self {
        Self {
            name: "N/A (request timed out)".to_string(),
            map: "N/A".to_string(),
            directory: "N/A".to_string(),
            game: "N/A".to_string(),
            app_id: -1,
            players: 0,
            max_players: 0,
            bots: -1,
            dedicated: false,
            os: ServerOs::Unknown,
            password: false,
            secure: false,
            version: "N/A".to_string(),
            data,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.app_id == -1 && self.bots == -1
    }
}

/// Kinds of inbound datagram a mirror reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Info,
    DirectoryQuery,
}

/// Builds the fixed A2S_INFO request packet.
pub fn build_info_request() -> Vec<u8> {
    let mut request = Vec::with_capacity(A2S_HEADER.len() + 1 + A2S_INFO_STUB.len());
    request.extend_from_slice(&A2S_HEADER);
    request.push(A2S_INFO);
    request.extend_from_slice(A2S_INFO_STUB);
    request
}

/// Classifies an inbound datagram by its magic header and command byte.
///
/// Anything shorter than five bytes, without the header, or with an unknown
/// command byte yields `None` and is dropped by the caller.
pub fn classify_packet(datagram: &[u8]) -> Option<QueryKind> {
    if datagram.len() <= A2S_HEADER.len() || datagram[..4] != A2S_HEADER {
        return None;
    }

    match datagram[4] {
        A2S_INFO => Some(QueryKind::Info),
        MASTER_QUERY => Some(QueryKind::DirectoryQuery),
        _ => None,
    }
}

/// Drops the zero padding at the tail of a receive buffer.
///
/// Keeps everything up to the last non-zero byte plus six more bytes, growing
/// with zeros if the buffer is too short. An all-zero buffer is returned as is.
pub fn trim_padding(buffer: &[u8]) -> Vec<u8> {
    let mut data = buffer.to_vec();
    if let Some(last) = buffer.iter().rposition(|&b| b != 0) {
        data.resize(last + PADDING_KEEP, 0);
    }
    data
}

/// Decodes an A2S_INFO response.
///
/// Never fails: reads past the end of `buffer` yield zero bytes and strings
/// end at the buffer end, so truncated or garbage packets decode into
/// (possibly empty) fields instead of faulting.
pub fn parse_info_response(buffer: &[u8]) -> ServerSnapshot {
    let data = trim_padding(buffer);
    let mut reader = InfoReader::new(&data, INFO_FIELDS_OFFSET);

    let name = reader.read_string();
    let map = reader.read_string();
    let directory = reader.read_string();
    let game = reader.read_string();
    let app_id = reader.read_i16();
    let players = i32::from(reader.read_u8());
    let max_players = i32::from(reader.read_u8());
    let bots = i32::from(reader.read_u8());
    let dedicated = reader.read_u8() == b'd';
    let os = if reader.read_u8() == b'l' {
        ServerOs::Linux
    } else {
        ServerOs::Windows
    };
    let password = reader.read_u8() == 1;
    let secure = reader.read_u8() == 1;
    let version = reader.read_string();

    ServerSnapshot {
        name,
        map,
        directory,
        game,
        app_id,
        players,
        max_players,
        bots,
        dedicated,
        os,
        password,
        secure,
        version,
        data,
    }
}

/// Lays the decoded fields of `snapshot` out as an A2S_INFO response.
///
/// Counts are clamped into a byte. Used by stand-in servers and diagnostics.
pub fn encode_info_response(snapshot: &ServerSnapshot) -> Vec<u8> {
    let mut packet = Vec::with_capacity(64);
    packet.extend_from_slice(&A2S_HEADER);
    packet.push(A2S_INFO_RESPONSE);
    packet.push(PROTOCOL_VERSION);

    for field in [
        &snapshot.name,
        &snapshot.map,
        &snapshot.directory,
        &snapshot.game,
    ] {
        write_string(&mut packet, field);
    }

    packet.extend_from_slice(&snapshot.app_id.to_le_bytes());
    packet.push(clamp_count(snapshot.players));
    packet.push(clamp_count(snapshot.max_players));
    packet.push(clamp_count(snapshot.bots));
    packet.push(if snapshot.dedicated { b'd' } else { b'l' });
    packet.push(match snapshot.os {
        ServerOs::Linux => b'l',
        ServerOs::Windows | ServerOs::Unknown => b'w',
    });
    packet.push(u8::from(snapshot.password));
    packet.push(u8::from(snapshot.secure));
    write_string(&mut packet, &snapshot.version);

    packet
}

fn write_string(packet: &mut Vec<u8>, value: &str) {
    packet.extend_from_slice(value.as_bytes());
    packet.push(0);
}

fn clamp_count(value: i32) -> u8 {
    value.clamp(0, i32::from(u8::MAX)) as u8
}

/// Forward-only cursor that treats everything past the end as zero bytes.
struct InfoReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> InfoReader<'a> {
    fn new(data: &'a [u8], offset: usize) -> Self {
        Self { data, offset }
    }

    fn read_u8(&mut self) -> u8 {
        let value = self.data.get(self.offset).copied().unwrap_or(0);
        self.offset += 1;
        value
    }

    fn read_i16(&mut self) -> i16 {
        i16::from_le_bytes([self.read_u8(), self.read_u8()])
    }

    fn read_string(&mut self) -> String {
        let start = self.offset.min(self.data.len());
        let rest = &self.data[start..];
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());

        // Skip the terminator too when there is one
        self.offset = start + end + usize::from(end < rest.len());
        String::from_utf8_lossy(&rest[..end]).into_owned()
    }
}
