//! Connection state management.
//!
//! One [ConnTracker] is maintained per pipeline worker. It owns that
//! worker's slice of the flow table, performs TCP reassembly inline, and
//! drives connection finalization on natural termination, inactivity, or
//! forced flush.

pub(crate) mod conn;
pub mod conn_id;
pub mod flow_key;
pub(crate) mod pdu;
mod timerwheel;

use self::conn::conn_data::ConnData;
use self::conn::Conn;
use self::flow_key::FlowKey;
use self::pdu::{L4Context, L4Pdu};
use self::timerwheel::TimerWheel;
use crate::config::ConnTrackConfig;
use crate::dispatch::PipelineShared;
use crate::memory::pktbuf::PktBuf;
use crate::protocols::packet::tcp::{ACK, SYN};
use crate::record::FinalizeReason;

use std::sync::Arc;
use std::time::Instant;

use crate::conntrack::conn_id::SessionId;
use hashlink::linked_hash_map::{LinkedHashMap, RawEntryMut};

/// Manages state for the TCP flows owned by one worker.
///
/// The table keeps flows in recency order: every touch moves a flow to the
/// back, so the front is the least recently touched flow and the first
/// eviction victim when the table fills up.
pub(crate) struct ConnTracker {
    /// Configuration
    config: TrackerConfig,
    /// Manages `FlowKey` to `Conn` mappings.
    table: LinkedHashMap<FlowKey, Conn>,
    /// Manages connection timeouts.
    timerwheel: TimerWheel,
    /// Shared pipeline context (storage, patterns, sinks).
    shared: Arc<PipelineShared>,
}

impl ConnTracker {
    /// Creates a new `ConnTracker`.
    pub(crate) fn new(config: TrackerConfig, shared: Arc<PipelineShared>) -> Self {
        let timerwheel = TimerWheel::new(config.tcp_inactivity_timeout, config.timeout_resolution);
        ConnTracker {
            table: LinkedHashMap::with_capacity(config.max_connections.min(1 << 16)),
            config,
            timerwheel,
            shared,
        }
    }

    /// Returns the number of entries in the table.
    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.table.len()
    }

    /// Process a single incoming packet `buf` with layer-4 context `ctxt`.
    pub(crate) fn process(&mut self, buf: PktBuf, ctxt: L4Context, session: SessionId) {
        let key = FlowKey::new(ctxt.src, ctxt.dst);

        // A fresh SYN for a flow that is still open (or tombstoned after an
        // oversized finalization) closes the old connection and starts a
        // new one.
        if ctxt.flags & SYN != 0 && ctxt.flags & ACK == 0 {
            let restart = self
                .table
                .get(&key)
                .map(|conn| conn.data.has_data() || conn.data.is_finalized())
                .unwrap_or(false);
            if restart {
                if let Some(mut old) = self.table.remove(&key) {
                    log::debug!("SYN on open flow {}; restarting", key);
                    old.finalize(FinalizeReason::Restarted, &self.shared);
                }
            }
        }

        match self.table.raw_entry_mut().from_key(&key) {
            RawEntryMut::Occupied(mut occupied) => {
                let conn = occupied.get_mut();
                if conn.data.is_finalized() {
                    // tombstone of an oversized flow; only a SYN restarts it
                    return;
                }
                let dir = conn.packet_dir(&ctxt);
                conn.last_seen_ts = Instant::now();
                conn.inactivity_window = self.config.tcp_inactivity_timeout;
                let pdu = L4Pdu::new(buf, ctxt, dir, session);
                conn.update(pdu);

                if conn.terminated() {
                    let reason = conn.close_reason();
                    conn.finalize(reason, &self.shared);
                    occupied.remove();
                } else if conn.data.total_bytes() > self.config.max_flow_bytes as u64 {
                    // finalize but keep the entry so the remainder of the
                    // overweight stream does not respawn connections; the
                    // next SYN or the idle timer clears it
                    conn.finalize(FinalizeReason::Oversized, &self.shared);
                } else {
                    occupied.to_back();
                }
            }
            RawEntryMut::Vacant(_) => {
                if ctxt.flags & crate::protocols::packet::tcp::RST != 0 {
                    // lone RST; nothing worth tracking
                    return;
                }
                if self.size() >= self.config.max_connections {
                    if let Some((evicted_key, mut evicted)) = self.table.pop_front() {
                        log::warn!("Flow table full; evicting {}", evicted_key);
                        evicted.finalize(FinalizeReason::Evicted, &self.shared);
                    }
                }
                let ts = buf.timestamp();
                let id = self.shared.conn_ids.next(ts);
                let data = ConnData::new(&ctxt, ts, id, self.shared.patterns.snapshot());
                let mut conn = Conn::new_tcp(
                    self.config.tcp_establish_timeout,
                    self.config.max_out_of_order,
                    self.config.max_gap_bytes,
                    data,
                );
                let dir = conn.packet_dir(&ctxt);
                let pdu = L4Pdu::new(buf, ctxt, dir, session);
                conn.update(pdu);
                self.timerwheel
                    .insert(&key, conn.last_seen_ts, conn.inactivity_window);
                self.table.insert(key, conn);
            }
        }
    }

    /// Finalizes and removes every tracked flow. Used at forced flush
    /// (session end, cancel, capture stop).
    pub(crate) fn drain(&mut self, reason: FinalizeReason) {
        log::info!("Draining {} flows ({})", self.table.len(), reason);
        for (_, mut conn) in self.table.drain() {
            conn.finalize(reason, &self.shared);
        }
    }

    /// Checks for and removes inactive flows.
    pub(crate) fn check_inactive(&mut self, now: Instant) {
        let expired = self
            .timerwheel
            .check_inactive(now, &mut self.table, &self.shared);
        if expired > 0 {
            log::debug!("expired: {}, new table size: {}", expired, self.table.len());
        }
    }
}

/// Configurable options for a `ConnTracker`.
#[derive(Debug, Clone)]
pub(crate) struct TrackerConfig {
    /// Maximum number of flows tracked per-worker.
    pub(crate) max_connections: usize,
    /// Maximum number of out-of-order segments buffered per flow side.
    pub(crate) max_out_of_order: usize,
    /// Maximum bytes buffered ahead of a sequence gap before fast-forward.
    pub(crate) max_gap_bytes: usize,
    /// Maximum payload bytes per connection before forced finalization.
    pub(crate) max_flow_bytes: usize,
    /// Time to expire inactive flows (in milliseconds).
    pub(crate) tcp_inactivity_timeout: usize,
    /// Time to expire unestablished flows (in milliseconds).
    pub(crate) tcp_establish_timeout: usize,
    /// Frequency to check for inactive flows (in milliseconds).
    pub(crate) timeout_resolution: usize,
}

impl From<&ConnTrackConfig> for TrackerConfig {
    fn from(config: &ConnTrackConfig) -> Self {
        TrackerConfig {
            max_connections: config.max_connections,
            max_out_of_order: config.max_out_of_order,
            max_gap_bytes: config.max_gap_bytes,
            max_flow_bytes: config.max_flow_bytes,
            tcp_inactivity_timeout: config.tcp_inactivity_timeout,
            tcp_establish_timeout: config.tcp_establish_timeout,
            timeout_resolution: config.timeout_resolution,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::conn_id::ConnIdGen;
    use crate::protocols::packet::tcp::{ACK, FIN, PSH, RST, SYN};
    use crate::record::{ConnectionRecord, Direction, FinalizeReason, MessageRecord, NoopSink};
    use crate::rules::{
        PatternExpr, PatternIndex, PatternOrigin, Rule, RuleFilter, RulePattern,
    };
    use crate::services::ServiceRegistry;
    use crate::storage::{collections, DocumentStore, Filter, MemoryStore, SortOrder};

    use chrono::{TimeZone, Utc};

    const CLIENT: [u8; 4] = [10, 0, 0, 1];
    const SERVER: [u8; 4] = [10, 0, 0, 2];

    /// Builds a raw Ethernet/IPv4/TCP frame.
    fn frame(
        src: [u8; 4],
        dst: [u8; 4],
        sport: u16,
        dport: u16,
        seq: u32,
        flags: u8,
        payload: &[u8],
        ts_ms: i64,
    ) -> PktBuf {
        let mut bytes = Vec::with_capacity(54 + payload.len());
        // ethernet
        bytes.extend_from_slice(&[0u8; 12]);
        bytes.extend_from_slice(&[0x08, 0x00]);
        // ipv4, no options
        bytes.push(0x45);
        bytes.push(0);
        bytes.extend_from_slice(&((40 + payload.len()) as u16).to_be_bytes());
        bytes.extend_from_slice(&[0, 0]); // identification
        bytes.extend_from_slice(&[0x40, 0]); // DF
        bytes.push(64); // ttl
        bytes.push(6); // tcp
        bytes.extend_from_slice(&[0, 0]); // checksum
        bytes.extend_from_slice(&src);
        bytes.extend_from_slice(&dst);
        // tcp, no options
        bytes.extend_from_slice(&sport.to_be_bytes());
        bytes.extend_from_slice(&dport.to_be_bytes());
        bytes.extend_from_slice(&seq.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes()); // ack no
        bytes.push(0x50); // data offset 5 words
        bytes.push(flags);
        bytes.extend_from_slice(&0xffffu16.to_be_bytes()); // window
        bytes.extend_from_slice(&[0, 0, 0, 0]); // checksum + urgent
        bytes.extend_from_slice(payload);

        let ts = Utc.timestamp_millis_opt(ts_ms).single().unwrap();
        PktBuf::from_bytes(&bytes, ts)
    }

    fn harness(rules: &[Rule]) -> (ConnTracker, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let patterns = Arc::new(PatternIndex::new());
        if !rules.is_empty() {
            patterns.rebuild(rules).unwrap();
        }
        let services = Arc::new(ServiceRegistry::load(store.clone()).unwrap());
        let shared = Arc::new(PipelineShared {
            storage: store.clone(),
            sink: Arc::new(NoopSink),
            patterns,
            services,
            conn_ids: ConnIdGen::new(),
        });
        let config = TrackerConfig {
            max_connections: 1024,
            max_out_of_order: 64,
            max_gap_bytes: 1 << 20,
            max_flow_bytes: 1 << 30,
            tcp_inactivity_timeout: 300_000,
            tcp_establish_timeout: 5000,
            timeout_resolution: 1000,
        };
        (ConnTracker::new(config, shared), store)
    }

    fn feed(tracker: &mut ConnTracker, buf: PktBuf) {
        let ctxt = L4Context::parse(&buf).expect("synthetic frame parses");
        tracker.process(buf, ctxt, SessionId::new(Utc::now(), 1));
    }

    fn stored_connections(store: &MemoryStore) -> Vec<ConnectionRecord> {
        store
            .find(collections::CONNECTIONS, &Filter::all(), None, 0, 0)
            .unwrap()
            .into_iter()
            .map(|doc| serde_json::from_value(doc).unwrap())
            .collect()
    }

    fn stored_messages(store: &MemoryStore, record: &ConnectionRecord) -> Vec<MessageRecord> {
        store
            .find(
                collections::MESSAGES,
                &Filter::new().eq("connection_id", record.id.to_string()),
                Some(("index", SortOrder::Asc)),
                0,
                0,
            )
            .unwrap()
            .into_iter()
            .map(|doc| serde_json::from_value(doc).unwrap())
            .collect()
    }

    /// One request, one response, clean FIN close: one connection, two
    /// messages, correct sides and byte counts.
    #[test]
    fn core_tracker_request_response_round_trip() {
        let (mut tracker, store) = harness(&[]);
        let request = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let response = b"HTTP/1.1 200 OK\r\n\r\nhello";

        feed(&mut tracker, frame(CLIENT, SERVER, 40000, 80, 100, SYN, b"", 0));
        feed(&mut tracker, frame(SERVER, CLIENT, 80, 40000, 500, SYN | ACK, b"", 1));
        feed(&mut tracker, frame(CLIENT, SERVER, 40000, 80, 101, ACK | PSH, request, 2));
        feed(&mut tracker, frame(SERVER, CLIENT, 80, 40000, 501, ACK | PSH, response, 3));
        feed(
            &mut tracker,
            frame(CLIENT, SERVER, 40000, 80, 101 + request.len() as u32, FIN | ACK, b"", 4),
        );
        feed(
            &mut tracker,
            frame(SERVER, CLIENT, 80, 40000, 501 + response.len() as u32, FIN | ACK, b"", 5),
        );

        assert_eq!(tracker.size(), 0, "connection removed after FIN both sides");
        let connections = stored_connections(&store);
        assert_eq!(connections.len(), 1);
        let conn = &connections[0];
        assert_eq!(conn.client.port(), 40000);
        assert_eq!(conn.server.port(), 80);
        assert_eq!(conn.client_bytes, request.len() as u64);
        assert_eq!(conn.server_bytes, response.len() as u64);
        assert_eq!(conn.message_count, 2);
        assert_eq!(conn.close_reason, FinalizeReason::Fin);
        assert_eq!(conn.duration_ms, 5);

        let messages = stored_messages(&store, conn);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].direction, Direction::ClientToServer);
        assert_eq!(messages[0].data, request);
        assert_eq!(messages[1].direction, Direction::ServerToClient);
        assert_eq!(messages[1].data, response);
    }

    /// Retransmitted SYN plus out-of-order segments `[100,200)`, `[0,100)`,
    /// `[200,300)` reassemble into one 300-byte message.
    #[test]
    fn core_tracker_out_of_order_reassembly() {
        let (mut tracker, store) = harness(&[]);
        let body: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        let isn = 1_000u32;

        feed(&mut tracker, frame(CLIENT, SERVER, 40001, 9000, isn, SYN, b"", 0));
        // retransmitted SYN
        feed(&mut tracker, frame(CLIENT, SERVER, 40001, 9000, isn, SYN, b"", 1));
        let base = isn + 1;
        feed(
            &mut tracker,
            frame(CLIENT, SERVER, 40001, 9000, base + 100, ACK, &body[100..200], 2),
        );
        feed(
            &mut tracker,
            frame(CLIENT, SERVER, 40001, 9000, base, ACK, &body[..100], 3),
        );
        feed(
            &mut tracker,
            frame(CLIENT, SERVER, 40001, 9000, base + 200, ACK, &body[200..], 4),
        );

        tracker.drain(FinalizeReason::SessionEnd);
        let connections = stored_connections(&store);
        assert_eq!(connections.len(), 1);
        let messages = stored_messages(&store, &connections[0]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data, body);
    }

    /// Overlapping retransmission: only the new tail is emitted.
    #[test]
    fn core_tracker_overlap_emits_new_tail_only() {
        let (mut tracker, store) = harness(&[]);
        let isn = 50u32;
        feed(&mut tracker, frame(CLIENT, SERVER, 40002, 9000, isn, SYN, b"", 0));
        let base = isn + 1;
        feed(&mut tracker, frame(CLIENT, SERVER, 40002, 9000, base, ACK, b"abcdef", 1));
        // retransmits "cdef" plus new "gh"
        feed(
            &mut tracker,
            frame(CLIENT, SERVER, 40002, 9000, base + 2, ACK, b"cdefgh", 2),
        );

        tracker.drain(FinalizeReason::SessionEnd);
        let connections = stored_connections(&store);
        let messages = stored_messages(&store, &connections[0]);
        assert_eq!(messages[0].data, b"abcdefgh");
    }

    /// Same-side segments coalesce; a direction flip starts a new message.
    #[test]
    fn core_tracker_message_boundary_is_direction_flip() {
        let (mut tracker, store) = harness(&[]);
        feed(&mut tracker, frame(CLIENT, SERVER, 40003, 9000, 10, SYN, b"", 0));
        feed(&mut tracker, frame(SERVER, CLIENT, 9000, 40003, 90, SYN | ACK, b"", 1));
        feed(&mut tracker, frame(CLIENT, SERVER, 40003, 9000, 11, ACK, b"ab", 2));
        feed(&mut tracker, frame(CLIENT, SERVER, 40003, 9000, 13, ACK, b"cd", 3));
        feed(&mut tracker, frame(SERVER, CLIENT, 9000, 40003, 91, ACK, b"resp", 4));
        feed(&mut tracker, frame(CLIENT, SERVER, 40003, 9000, 15, ACK, b"ef", 5));

        tracker.drain(FinalizeReason::SessionEnd);
        let connections = stored_connections(&store);
        let messages = stored_messages(&store, &connections[0]);
        let shapes: Vec<(Direction, Vec<u8>)> = messages
            .into_iter()
            .map(|m| (m.direction, m.data))
            .collect();
        assert_eq!(
            shapes,
            vec![
                (Direction::ClientToServer, b"abcd".to_vec()),
                (Direction::ServerToClient, b"resp".to_vec()),
                (Direction::ClientToServer, b"ef".to_vec()),
            ]
        );
    }

    /// RST finalizes immediately with the rst close reason.
    #[test]
    fn core_tracker_rst_finalizes() {
        let (mut tracker, store) = harness(&[]);
        feed(&mut tracker, frame(CLIENT, SERVER, 40004, 9000, 10, SYN, b"", 0));
        feed(&mut tracker, frame(SERVER, CLIENT, 9000, 40004, 90, SYN | ACK, b"", 1));
        feed(&mut tracker, frame(CLIENT, SERVER, 40004, 9000, 11, ACK, b"x", 2));
        feed(&mut tracker, frame(SERVER, CLIENT, 9000, 40004, 91, RST, b"", 3));

        assert_eq!(tracker.size(), 0);
        let connections = stored_connections(&store);
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].close_reason, FinalizeReason::Rst);
    }

    /// A new SYN on an open flow finalizes the old connection and starts a
    /// second one.
    #[test]
    fn core_tracker_syn_on_open_flow_restarts() {
        let (mut tracker, store) = harness(&[]);
        feed(&mut tracker, frame(CLIENT, SERVER, 40005, 9000, 10, SYN, b"", 0));
        feed(&mut tracker, frame(SERVER, CLIENT, 9000, 40005, 90, SYN | ACK, b"", 1));
        feed(&mut tracker, frame(CLIENT, SERVER, 40005, 9000, 11, ACK, b"one", 2));
        // same 4-tuple comes back with a fresh handshake
        feed(&mut tracker, frame(CLIENT, SERVER, 40005, 9000, 7000, SYN, b"", 3));
        feed(&mut tracker, frame(SERVER, CLIENT, 9000, 40005, 8000, SYN | ACK, b"", 4));
        feed(&mut tracker, frame(CLIENT, SERVER, 40005, 9000, 7001, ACK, b"two", 5));

        tracker.drain(FinalizeReason::SessionEnd);
        let mut connections = stored_connections(&store);
        connections.sort_by_key(|c| c.id);
        assert_eq!(connections.len(), 2);
        assert_eq!(connections[0].close_reason, FinalizeReason::Restarted);
        assert_eq!(connections[0].client_bytes, 3);
        assert_eq!(connections[1].close_reason, FinalizeReason::SessionEnd);
        assert_eq!(connections[1].client_bytes, 3);
    }

    /// Mid-stream capture (no SYN observed): the first packet's sender
    /// becomes the client and bytes still reassemble.
    #[test]
    fn core_tracker_midstream_capture() {
        let (mut tracker, store) = harness(&[]);
        feed(&mut tracker, frame(CLIENT, SERVER, 40006, 9000, 5000, ACK, b"hello", 0));
        feed(&mut tracker, frame(SERVER, CLIENT, 9000, 40006, 9000, ACK, b"world", 1));

        tracker.drain(FinalizeReason::SessionEnd);
        let connections = stored_connections(&store);
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].client.port(), 40006);
        assert_eq!(connections[0].client_bytes, 5);
        assert_eq!(connections[0].server_bytes, 5);
    }

    fn flag_rule() -> Rule {
        Rule {
            id: "rule-flag".to_string(),
            name: "flag".to_string(),
            color: String::new(),
            notes: String::new(),
            patterns: vec![RulePattern {
                expr: PatternExpr::Literal(b"flag{".to_vec()),
                case_sensitive: true,
                min_occurrences: 1,
                max_occurrences: Some(1),
                origin: PatternOrigin::Server,
            }],
            filter: RuleFilter {
                services: vec![1337],
                ..Default::default()
            },
            version: 0,
        }
    }

    /// A literal rule restricted to server bytes and service 1337 matches
    /// only on that port and only from the server side.
    #[test]
    fn core_tracker_rule_matching_respects_service_and_origin() {
        let rules = [flag_rule()];

        // server emits the flag once on port 1337 -> match
        let (mut tracker, store) = harness(&rules);
        feed(&mut tracker, frame(CLIENT, SERVER, 40007, 1337, 10, SYN, b"", 0));
        feed(&mut tracker, frame(SERVER, CLIENT, 1337, 40007, 90, SYN | ACK, b"", 1));
        feed(&mut tracker, frame(SERVER, CLIENT, 1337, 40007, 91, ACK, b"flag{abc}", 2));
        tracker.drain(FinalizeReason::SessionEnd);
        let conn = &stored_connections(&store)[0];
        assert_eq!(conn.matched_rules, vec!["rule-flag".to_string()]);

        // same payload on port 80 -> no match
        let (mut tracker, store) = harness(&rules);
        feed(&mut tracker, frame(CLIENT, SERVER, 40008, 80, 10, SYN, b"", 0));
        feed(&mut tracker, frame(SERVER, CLIENT, 80, 40008, 90, SYN | ACK, b"", 1));
        feed(&mut tracker, frame(SERVER, CLIENT, 80, 40008, 91, ACK, b"flag{abc}", 2));
        tracker.drain(FinalizeReason::SessionEnd);
        assert!(stored_connections(&store)[0].matched_rules.is_empty());

        // flag sent by the client -> wrong origin, no match
        let (mut tracker, store) = harness(&rules);
        feed(&mut tracker, frame(CLIENT, SERVER, 40009, 1337, 10, SYN, b"", 0));
        feed(&mut tracker, frame(SERVER, CLIENT, 1337, 40009, 90, SYN | ACK, b"", 1));
        feed(&mut tracker, frame(CLIENT, SERVER, 40009, 1337, 11, ACK, b"flag{abc}", 2));
        tracker.drain(FinalizeReason::SessionEnd);
        assert!(stored_connections(&store)[0].matched_rules.is_empty());

        // two server occurrences exceed max_occurrences -> no match
        let (mut tracker, store) = harness(&rules);
        feed(&mut tracker, frame(CLIENT, SERVER, 40010, 1337, 10, SYN, b"", 0));
        feed(&mut tracker, frame(SERVER, CLIENT, 1337, 40010, 90, SYN | ACK, b"", 1));
        feed(
            &mut tracker,
            frame(SERVER, CLIENT, 1337, 40010, 91, ACK, b"flag{a} flag{b}", 2),
        );
        tracker.drain(FinalizeReason::SessionEnd);
        assert!(stored_connections(&store)[0].matched_rules.is_empty());
    }

    /// A literal straddling two segments is still counted (stream scan).
    #[test]
    fn core_tracker_pattern_across_segments() {
        let mut rule = flag_rule();
        rule.filter.services.clear();
        let rules = [rule];

        let (mut tracker, store) = harness(&rules);
        feed(&mut tracker, frame(CLIENT, SERVER, 40011, 1337, 10, SYN, b"", 0));
        feed(&mut tracker, frame(SERVER, CLIENT, 1337, 40011, 90, SYN | ACK, b"", 1));
        feed(&mut tracker, frame(SERVER, CLIENT, 1337, 40011, 91, ACK, b"xxfl", 2));
        feed(&mut tracker, frame(SERVER, CLIENT, 1337, 40011, 95, ACK, b"ag{1}", 3));
        tracker.drain(FinalizeReason::SessionEnd);
        let conn = &stored_connections(&store)[0];
        assert_eq!(conn.matched_rules, vec!["rule-flag".to_string()]);
    }

    /// Rule evaluation is idempotent: replaying the same packets with the
    /// same rule set yields the same matched set.
    #[test]
    fn core_tracker_rule_match_idempotent() {
        let rules = [flag_rule()];
        let mut matched = Vec::new();
        for _ in 0..2 {
            let (mut tracker, store) = harness(&rules);
            feed(&mut tracker, frame(CLIENT, SERVER, 40012, 1337, 10, SYN, b"", 0));
            feed(&mut tracker, frame(SERVER, CLIENT, 1337, 40012, 90, SYN | ACK, b"", 1));
            feed(&mut tracker, frame(SERVER, CLIENT, 1337, 40012, 91, ACK, b"flag{x}", 2));
            tracker.drain(FinalizeReason::SessionEnd);
            matched.push(stored_connections(&store)[0].matched_rules.clone());
        }
        assert_eq!(matched[0], matched[1]);
    }

    /// Overflowing the out-of-order buffer abandons the gap: the stream
    /// fast-forwards and the skipped bytes are recorded.
    #[test]
    fn core_tracker_gap_fast_forward() {
        let (mut tracker, store) = harness(&[]);
        tracker.config.max_out_of_order = 2;

        let isn = 100u32;
        feed(&mut tracker, frame(CLIENT, SERVER, 40013, 9000, isn, SYN, b"", 0));
        let base = isn + 1;
        // bytes [100,105), [200,205), [300,305) arrive while [0,100) never does
        feed(&mut tracker, frame(CLIENT, SERVER, 40013, 9000, base + 100, ACK, b"AAAAA", 1));
        feed(&mut tracker, frame(CLIENT, SERVER, 40013, 9000, base + 200, ACK, b"BBBBB", 2));
        feed(&mut tracker, frame(CLIENT, SERVER, 40013, 9000, base + 300, ACK, b"CCCCC", 3));

        tracker.drain(FinalizeReason::SessionEnd);
        let conn = &stored_connections(&store)[0];
        assert_eq!(conn.client_bytes, 15, "buffered bytes emitted after fast-forward");
        assert!(conn.dropped_bytes >= 100, "initial gap recorded as dropped");
        let messages = stored_messages(&store, conn);
        let total: usize = messages.iter().map(|m| m.data.len()).sum();
        assert_eq!(total, 15);
    }

    /// Finalization flushes buffered segments even when a gap remains.
    #[test]
    fn core_tracker_flush_emits_past_gaps() {
        let (mut tracker, store) = harness(&[]);
        let isn = 100u32;
        feed(&mut tracker, frame(CLIENT, SERVER, 40014, 9000, isn, SYN, b"", 0));
        let base = isn + 1;
        feed(&mut tracker, frame(CLIENT, SERVER, 40014, 9000, base, ACK, b"start", 1));
        // [105,200) is lost; [200,205) waits in the out-of-order buffer
        feed(&mut tracker, frame(CLIENT, SERVER, 40014, 9000, base + 100, ACK, b"tail!", 2));

        tracker.drain(FinalizeReason::SessionEnd);
        let conn = &stored_connections(&store)[0];
        assert_eq!(conn.client_bytes, 10);
        assert_eq!(conn.dropped_bytes, 95);
        let messages = stored_messages(&store, conn);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data, b"starttail!");
    }

    /// Flow table overflow evicts the least recently touched flow with a
    /// persisted record.
    #[test]
    fn core_tracker_eviction_on_full_table() {
        let (tracker, store) = harness(&[]);
        let mut tracker = tracker;
        tracker.config.max_connections = 2;

        feed(&mut tracker, frame(CLIENT, SERVER, 50001, 9000, 10, SYN, b"", 0));
        feed(&mut tracker, frame(CLIENT, SERVER, 50002, 9000, 10, SYN, b"", 1));
        feed(&mut tracker, frame(CLIENT, SERVER, 50003, 9000, 10, SYN, b"", 2));

        assert_eq!(tracker.size(), 2);
        let connections = stored_connections(&store);
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].close_reason, FinalizeReason::Evicted);
        assert_eq!(connections[0].client.port(), 50001);
    }
}
