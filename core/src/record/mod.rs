//! Finalized connection records.
//!
//! A connection becomes a [ConnectionRecord] plus its [MessageRecord]s at
//! finalization. Records are written to the document store exactly once and
//! are immutable afterwards except for the user flags (`hidden`, `marked`,
//! `comment`).

pub mod format;
pub mod sink;

pub use format::MessageFormat;
pub use sink::{CoreEvent, EventSink, NoopSink};

use crate::conntrack::conn_id::{ConnectionId, SessionId};

use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a connection was finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeReason {
    /// FIN observed in both directions.
    Fin,
    /// RST observed in either direction.
    Rst,
    /// No bytes on either side for the idle timeout.
    IdleTimeout,
    /// Session ended with forced finalization.
    SessionEnd,
    /// Session cancelled by the operator.
    Cancelled,
    /// The flow exceeded the per-connection byte ceiling.
    Oversized,
    /// A new SYN arrived for a flow that was still open.
    Restarted,
    /// Evicted to make room in a full flow table.
    Evicted,
}

impl fmt::Display for FinalizeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinalizeReason::Fin => "fin",
            FinalizeReason::Rst => "rst",
            FinalizeReason::IdleTimeout => "idle_timeout",
            FinalizeReason::SessionEnd => "session_end",
            FinalizeReason::Cancelled => "cancelled",
            FinalizeReason::Oversized => "oversized",
            FinalizeReason::Restarted => "restarted",
            FinalizeReason::Evicted => "evicted",
        };
        write!(f, "{}", s)
    }
}

/// Message direction relative to the resolved client/server roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// A finalized connection document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    /// Resolved client endpoint.
    pub client: SocketAddr,
    /// Resolved server endpoint.
    pub server: SocketAddr,
    /// Server port, denormalized for store-side filtering.
    pub server_port: u16,
    /// Capture timestamp of the first packet.
    pub started_at: DateTime<Utc>,
    /// Millisecond timestamp of the first packet, denormalized for
    /// store-side range filtering.
    pub started_at_ms: i64,
    /// Capture timestamp of the last packet.
    pub closed_at: DateTime<Utc>,
    /// Elapsed capture time between first and last packet.
    pub duration_ms: u64,
    pub client_bytes: u64,
    pub server_bytes: u64,
    pub client_packets: u64,
    pub server_packets: u64,
    /// Bytes lost to abandoned sequence gaps.
    pub dropped_bytes: u64,
    pub message_count: u32,
    /// Ids of the rules this connection matched.
    pub matched_rules: Vec<String>,
    /// Pattern-set version the match decision was computed under.
    pub rules_version: u64,
    /// Port of the configured service this connection maps to, if any.
    pub service: Option<u16>,
    /// Sessions whose packets contributed to this connection.
    pub sessions: Vec<SessionId>,
    pub close_reason: FinalizeReason,
    // user flags, mutable after finalization
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub marked: bool,
    #[serde(default)]
    pub comment: Option<String>,
}

impl ConnectionRecord {
    /// Total payload bytes across both sides.
    #[inline]
    pub fn total_bytes(&self) -> u64 {
        self.client_bytes + self.server_bytes
    }
}

impl fmt::Display for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} -> {} ({} msgs, {} bytes, {})",
            self.id,
            self.client,
            self.server,
            self.message_count,
            self.total_bytes(),
            self.close_reason
        )
    }
}

/// One message of a connection: the contiguous bytes one side sent before
/// the other side next sent bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub connection_id: ConnectionId,
    /// Position of the message within the connection.
    pub index: u32,
    pub direction: Direction,
    /// Capture timestamp of the first byte of the message.
    pub ts: DateTime<Utc>,
    /// Payload, base64-encoded in documents.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Serde adapter storing `Vec<u8>` as base64 text.
pub(crate) mod base64_bytes {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::decode(s).map_err(D::Error::custom)
    }
}
