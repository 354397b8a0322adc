//! State management for connections.
//!
//! Tracks a TCP conversation, performs stream reassembly, and (via
//! [ConnData]) accumulates messages and pattern matches throughout the
//! duration of the connection.

pub(crate) mod conn_data;
pub(crate) mod tcp_conn;

use self::conn_data::ConnData;
use self::tcp_conn::TcpConn;
use crate::conntrack::pdu::{L4Context, L4Pdu};
use crate::dispatch::PipelineShared;
use crate::record::FinalizeReason;

use std::time::Instant;

/// Connection state.
pub(crate) struct Conn {
    /// Timestamp of the last observed packet in the connection.
    pub(crate) last_seen_ts: Instant,
    /// Amount of time (in milliseconds) before the connection should be expired for inactivity.
    pub(crate) inactivity_window: usize,
    /// Layer-4 stream reassembly.
    pub(crate) l4conn: TcpConn,
    /// Accumulated connection data.
    pub(crate) data: ConnData,
}

impl Conn {
    /// Creates a new connection from its first observed packet. The packet
    /// itself must then be delivered via [update](Self::update).
    pub(super) fn new_tcp(
        initial_timeout: usize,
        max_ooo: usize,
        max_gap_bytes: usize,
        data: ConnData,
    ) -> Self {
        Conn {
            last_seen_ts: Instant::now(),
            inactivity_window: initial_timeout,
            l4conn: TcpConn::new(max_ooo, max_gap_bytes),
            data,
        }
    }

    /// Updates a connection on the arrival of a new packet.
    pub(super) fn update(&mut self, pdu: L4Pdu) {
        self.l4conn.reassemble(pdu, &mut self.data);
    }

    /// Returns `true` if the packet represented by `ctxt` is in the
    /// direction of client -> server.
    pub(super) fn packet_dir(&self, ctxt: &L4Context) -> bool {
        self.data.endpoints.dir_of(ctxt.src)
    }

    /// Returns `true` if the connection has been naturally terminated.
    pub(super) fn terminated(&self) -> bool {
        self.l4conn.is_terminated()
    }

    /// The finalize reason for a naturally terminated connection.
    pub(super) fn close_reason(&self) -> FinalizeReason {
        if self.l4conn.saw_reset() {
            FinalizeReason::Rst
        } else {
            FinalizeReason::Fin
        }
    }

    /// Invokes connection termination tasks, triggered when any of the
    /// following conditions occur:
    /// - the connection naturally terminates (FIN both sides, or RST)
    /// - the connection expires due to inactivity
    /// - the flow is drained at session end, cancel, or eviction
    pub(crate) fn finalize(&mut self, reason: FinalizeReason, shared: &PipelineShared) {
        self.l4conn.flush_all(&mut self.data);
        self.data.finalize(reason, shared);
    }
}
