//! Per-connection accumulation state.
//!
//! Turns in-order reassembled segments into messages (split on direction
//! flips), drives incremental pattern matching, and produces the final
//! [ConnectionRecord] and [MessageRecord] documents at close.

use crate::conntrack::conn_id::{ConnectionId, SessionId};
use crate::conntrack::flow_key::Endpoints;
use crate::conntrack::pdu::{L4Context, L4Pdu};
use crate::dispatch::PipelineShared;
use crate::protocols::packet::tcp::{ACK, SYN};
use crate::record::{ConnectionRecord, Direction, FinalizeReason, MessageRecord};
use crate::rules::pattern_index::{
    CompiledPatterns, ConnMeta, MatchCounts, StreamScanner, SIDE_CLIENT, SIDE_SERVER,
};
use crate::storage::collections;

use std::sync::Arc;

use chrono::{DateTime, Utc};

/// A message under construction: one side's contiguous bytes between
/// direction flips.
struct MessageBuf {
    /// `true` for client -> server.
    dir: bool,
    /// Capture timestamp of the first byte.
    ts: DateTime<Utc>,
    data: Vec<u8>,
}

/// Accumulated state of one open connection.
pub(crate) struct ConnData {
    pub(crate) id: ConnectionId,
    pub(crate) endpoints: Endpoints,
    pub(crate) first_ts: DateTime<Utc>,
    pub(crate) last_ts: DateTime<Utc>,
    messages: Vec<MessageBuf>,
    /// Payload bytes per side, client first.
    bytes: [u64; 2],
    /// Packets consumed per side, client first.
    pkts: [u64; 2],
    /// Bytes lost to abandoned sequence gaps.
    gap_bytes: u64,
    /// Incremental literal scanners, one per side.
    scanners: [StreamScanner; 2],
    counts: MatchCounts,
    /// Pattern snapshot pinned when the connection started.
    patterns: Arc<CompiledPatterns>,
    /// Sessions whose packets contributed to this connection.
    sessions: Vec<SessionId>,
    finalized: bool,
}

impl ConnData {
    /// Creates accumulation state from the first observed packet, resolving
    /// the client side: the sender of the first SYN, the receiver of a
    /// SYN/ACK, or (mid-stream) the sender of the first observed packet.
    pub(crate) fn new(
        ctxt: &L4Context,
        ts: DateTime<Utc>,
        id: ConnectionId,
        patterns: Arc<CompiledPatterns>,
    ) -> Self {
        let mut endpoints = Endpoints {
            client: ctxt.src,
            server: ctxt.dst,
        };
        if ctxt.flags & (SYN | ACK) == SYN | ACK {
            endpoints = endpoints.flipped();
        }
        ConnData {
            id,
            endpoints,
            first_ts: ts,
            last_ts: ts,
            messages: Vec::new(),
            bytes: [0; 2],
            pkts: [0; 2],
            gap_bytes: 0,
            scanners: [StreamScanner::new(&patterns), StreamScanner::new(&patterns)],
            counts: MatchCounts::new(&patterns),
            patterns,
            sessions: Vec::new(),
            finalized: false,
        }
    }

    /// Total payload bytes across both sides.
    #[inline]
    pub(crate) fn total_bytes(&self) -> u64 {
        self.bytes[SIDE_CLIENT] + self.bytes[SIDE_SERVER]
    }

    /// Returns `true` once any payload byte has been consumed. A SYN seen
    /// while this is still `false` is treated as a handshake retransmission
    /// rather than a new conversation.
    #[inline]
    pub(crate) fn has_data(&self) -> bool {
        self.total_bytes() > 0
    }

    /// Records bytes skipped over an abandoned sequence gap.
    pub(crate) fn note_gap_skip(&mut self, bytes: u64) {
        self.gap_bytes += bytes;
    }

    /// Returns `true` once the connection has been finalized. A finalized
    /// connection may linger in the flow table as a tombstone (oversized
    /// flows wait for the next SYN); its packets are discarded.
    #[inline]
    pub(crate) fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Consumes one in-order segment: counters, message boundaries, and
    /// incremental pattern scanning.
    ///
    /// Callers guarantee byte order per side; a direction change relative to
    /// the previous payload-carrying segment starts a new message.
    pub(crate) fn consume_pdu(&mut self, segment: L4Pdu) {
        let ts = segment.buf.timestamp();
        if ts > self.last_ts {
            self.last_ts = ts;
        }
        if !self.sessions.contains(&segment.session) {
            self.sessions.push(segment.session);
        }

        let dir = segment.dir;
        let side = if dir { SIDE_CLIENT } else { SIDE_SERVER };
        self.pkts[side] += 1;

        if segment.length() == 0 {
            return;
        }
        let payload = segment.payload();
        self.bytes[side] += payload.len() as u64;

        match self.messages.last_mut() {
            Some(last) if last.dir == dir => last.data.extend_from_slice(payload),
            _ => self.messages.push(MessageBuf {
                dir,
                ts,
                data: payload.to_vec(),
            }),
        }

        self.scanners[side].push(&self.patterns, side, payload, &mut self.counts);
    }

    /// Closes the connection: finishes pattern matching, evaluates rules,
    /// persists the record and its messages, and announces the event.
    ///
    /// Idempotent; only the first call persists anything.
    pub(crate) fn finalize(&mut self, reason: FinalizeReason, shared: &PipelineShared) {
        if self.finalized {
            log::debug!("Connection {} already finalized", self.id);
            return;
        }
        self.finalized = true;

        // Regex patterns are counted once over the complete side streams.
        if self.patterns.has_regexes() {
            let patterns = Arc::clone(&self.patterns);
            for (side, dir) in [(SIDE_CLIENT, true), (SIDE_SERVER, false)] {
                let stream: Vec<u8> = self
                    .messages
                    .iter()
                    .filter(|m| m.dir == dir)
                    .flat_map(|m| m.data.iter().copied())
                    .collect();
                patterns.count_regexes(&stream, side, &mut self.counts);
            }
        }

        let duration_ms = (self.last_ts - self.first_ts).num_milliseconds().max(0) as u64;
        let meta = ConnMeta {
            total_bytes: self.total_bytes(),
            duration_ms,
            server_port: self.endpoints.server.port(),
        };
        let matched_rules = self.patterns.evaluate(&meta, &self.counts);

        let record = ConnectionRecord {
            id: self.id,
            client: self.endpoints.client,
            server: self.endpoints.server,
            server_port: self.endpoints.server.port(),
            started_at: self.first_ts,
            started_at_ms: self.first_ts.timestamp_millis(),
            closed_at: self.last_ts,
            duration_ms,
            client_bytes: self.bytes[SIDE_CLIENT],
            server_bytes: self.bytes[SIDE_SERVER],
            client_packets: self.pkts[SIDE_CLIENT],
            server_packets: self.pkts[SIDE_SERVER],
            dropped_bytes: self.gap_bytes,
            message_count: self.messages.len() as u32,
            matched_rules,
            rules_version: self.patterns.version(),
            service: shared
                .services
                .is_registered(self.endpoints.server.port())
                .then(|| self.endpoints.server.port()),
            sessions: self.sessions.clone(),
            close_reason: reason,
            hidden: false,
            marked: false,
            comment: None,
        };

        let messages: Vec<MessageRecord> = std::mem::take(&mut self.messages)
            .into_iter()
            .enumerate()
            .map(|(index, m)| MessageRecord {
                connection_id: self.id,
                index: index as u32,
                direction: if m.dir {
                    Direction::ClientToServer
                } else {
                    Direction::ServerToClient
                },
                ts: m.ts,
                data: m.data,
            })
            .collect();

        log::debug!("Finalized {}", record);
        persist(shared, &record, &messages);
        shared.sink.connection_finalized(&record);
    }
}

/// Writes the connection and message documents. Storage failures are logged
/// and swallowed; the pipeline keeps processing other flows.
fn persist(shared: &PipelineShared, record: &ConnectionRecord, messages: &[MessageRecord]) {
    let doc = match serde_json::to_value(record) {
        Ok(doc) => doc,
        Err(e) => {
            log::error!("Failed to encode connection {}: {}", record.id, e);
            return;
        }
    };
    if let Err(e) = shared.storage.insert(collections::CONNECTIONS, doc) {
        log::error!("Failed to persist connection {}: {}", record.id, e);
        return;
    }
    for message in messages {
        match serde_json::to_value(message) {
            Ok(doc) => {
                if let Err(e) = shared.storage.insert(collections::MESSAGES, doc) {
                    log::error!(
                        "Failed to persist message {}/{}: {}",
                        record.id,
                        message.index,
                        e
                    );
                }
            }
            Err(e) => log::error!("Failed to encode message: {}", e),
        }
    }
}
