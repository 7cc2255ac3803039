use std::net::SocketAddr;

use bytes::Bytes;

/// Direction of data flow in a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ToServer,
    ToClient,
}

impl Direction {
    /// Return a string representation of the direction.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToServer => "to_server",
            Direction::ToClient => "to_client",
        }
    }

    /// Slot of this direction in per-direction arrays.
    #[inline]
    pub fn index(&self) -> usize {
        match self {
            Direction::ToServer => 0,
            Direction::ToClient => 1,
        }
    }

    pub fn reverse(&self) -> Direction {
        match self {
            Direction::ToServer => Direction::ToClient,
            Direction::ToClient => Direction::ToServer,
        }
    }
}

/// Contiguous, ordered bytes of one direction, ready for a reader.
///
/// `seq`, `ack` and `timestamp_us` are those of the first segment merged
/// into the chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Bytes,
    pub seq: u32,
    pub ack: u32,
    pub timestamp_us: i64,
    /// Number of segments merged into this chunk.
    pub packets: u32,
    /// Bytes declared missed immediately before this chunk.
    pub skipped: u32,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn meta(&self) -> ChunkMeta {
        ChunkMeta {
            seq: self.seq,
            ack: self.ack,
            timestamp_us: self.timestamp_us,
        }
    }
}

/// TCP position and capture time of a byte in a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkMeta {
    pub seq: u32,
    pub ack: u32,
    pub timestamp_us: i64,
}

/// Identity of a reassembled flow, handed to the stream factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowInfo {
    pub id: u64,
    /// `"<client_ip>-><server_ip>:<client_port>-><server_port>:<id>"`
    pub ident: String,
    pub client: SocketAddr,
    pub server: SocketAddr,
}

impl FlowInfo {
    pub fn new(id: u64, client: SocketAddr, server: SocketAddr) -> Self {
        let ident = format!(
            "{}->{}:{}->{}:{}",
            client.ip(),
            server.ip(),
            client.port(),
            server.port(),
            id
        );
        Self {
            id,
            ident,
            client,
            server,
        }
    }
}
