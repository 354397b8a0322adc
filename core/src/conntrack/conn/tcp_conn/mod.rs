pub(crate) mod reassembly;

use self::reassembly::TcpFlow;
use crate::conntrack::conn::conn_data::ConnData;
use crate::conntrack::pdu::L4Pdu;
use crate::protocols::packet::tcp::{FIN, RST};

pub(crate) struct TcpConn {
    pub(crate) ctos: TcpFlow,
    pub(crate) stoc: TcpFlow,
}

impl TcpConn {
    pub(crate) fn new(max_ooo: usize, max_gap_bytes: usize) -> Self {
        TcpConn {
            ctos: TcpFlow::default(max_ooo, max_gap_bytes),
            stoc: TcpFlow::default(max_ooo, max_gap_bytes),
        }
    }

    /// Insert TCP segment ordered into ctos or stoc flow
    #[inline]
    pub(crate) fn reassemble(&mut self, segment: L4Pdu, data: &mut ConnData) {
        if segment.dir {
            self.ctos.insert_segment(segment, data);
        } else {
            self.stoc.insert_segment(segment, data);
        }
    }

    /// Returns `true` if the connection should be terminated
    #[inline]
    pub(crate) fn is_terminated(&self) -> bool {
        // Both sides have sent FIN, or a RST has been sent
        (self.ctos.consumed_flags & self.stoc.consumed_flags & FIN
            | self.ctos.consumed_flags & RST
            | self.stoc.consumed_flags & RST)
            != 0
    }

    /// Returns `true` if either side consumed a RST.
    #[inline]
    pub(crate) fn saw_reset(&self) -> bool {
        (self.ctos.consumed_flags | self.stoc.consumed_flags) & RST != 0
    }

    /// Emits all buffered bytes regardless of gaps. Used at finalization.
    pub(crate) fn flush_all(&mut self, data: &mut ConnData) {
        self.ctos.flush_all(data);
        self.stoc.flush_all(data);
    }
}
