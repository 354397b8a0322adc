use crate::conntrack::conn::conn_data::ConnData;
use crate::conntrack::pdu::L4Pdu;
use crate::protocols::packet::tcp::{FIN, RST, SYN};

use std::collections::VecDeque;

/// Represents a uni-directional TCP flow
#[derive(Debug)]
pub(crate) struct TcpFlow {
    /// Expected sequence number of next segment
    pub(super) next_seq: Option<u32>,
    /// Flow status for consumed control packets.
    /// Matches TCP flag bits.
    pub(super) consumed_flags: u8,
    /// Out-of-order buffer
    pub(crate) ooo_buf: OutOfOrderBuffer,
}

impl TcpFlow {
    /// Creates a default TCP flow
    #[inline]
    pub(super) fn default(capacity: usize, max_gap_bytes: usize) -> Self {
        TcpFlow {
            next_seq: None,
            consumed_flags: 0,
            ooo_buf: OutOfOrderBuffer::new(capacity, max_gap_bytes),
        }
    }

    /// Attempt to insert incoming data segment into flow.
    /// Buffers future segments and drops pure retransmissions. A segment
    /// that overflows the out-of-order buffer abandons the gap and
    /// fast-forwards the stream.
    #[inline]
    pub(super) fn insert_segment(&mut self, mut segment: L4Pdu, data: &mut ConnData) {
        let length = segment.length() as u32;
        let cur_seq = segment.seq_no();

        if let Some(next_seq) = self.next_seq {
            if next_seq == cur_seq {
                // Segment is the next expected segment in the sequence
                self.consumed_flags |= segment.flags();
                if segment.flags() & RST != 0 {
                    data.consume_pdu(segment);
                    return;
                }
                let mut expected_seq = cur_seq.wrapping_add(length);
                if segment.flags() & FIN != 0 {
                    expected_seq = expected_seq.wrapping_add(1);
                }
                data.consume_pdu(segment);
                self.flush_ooo_buffer(expected_seq, data);
            } else if wrapping_lt(next_seq, cur_seq) {
                // Segment comes after the next expected segment
                self.buffer_ooo_seg(segment, data);
            } else if let Some(end_seq) = overlap(&mut segment, next_seq) {
                // Segment starts before the next expected segment but has new data
                self.consumed_flags |= segment.flags();
                let mut expected_seq = end_seq;
                if segment.flags() & FIN != 0 {
                    expected_seq = expected_seq.wrapping_add(1);
                }
                data.consume_pdu(segment);
                self.flush_ooo_buffer(expected_seq, data);
            } else {
                // Segment contains old data
                log::debug!(
                    "Dropping retransmitted segment. cur: {} expect: {}",
                    cur_seq,
                    next_seq
                );
                drop(segment);
            }
        } else {
            // First segment observed on this side. A SYN pins the initial
            // sequence number; anything else is a mid-stream start and
            // seeds the expected sequence from the first seen segment.
            let mut expected_seq = cur_seq.wrapping_add(length);
            if segment.flags() & SYN != 0 {
                expected_seq = expected_seq.wrapping_add(1);
            }
            if segment.flags() & FIN != 0 {
                expected_seq = expected_seq.wrapping_add(1);
            }
            self.next_seq = Some(expected_seq);
            self.consumed_flags |= segment.flags();
            data.consume_pdu(segment);
            self.flush_ooo_buffer(expected_seq, data);
        }
    }

    /// Insert packet into ooo buffer; on overflow, abandon the gap and
    /// fast-forward to the earliest buffered segment.
    #[inline]
    fn buffer_ooo_seg(&mut self, segment: L4Pdu, data: &mut ConnData) {
        if self.ooo_buf.insert_back(segment) {
            let next_seq = self.next_seq.unwrap_or(0);
            if let Some(min_seq) = self.ooo_buf.min_seq_from(next_seq) {
                let skipped = min_seq.wrapping_sub(next_seq);
                log::warn!("Out-of-order buffer overflow; skipping {} byte gap", skipped);
                data.note_gap_skip(skipped as u64);
                self.flush_ooo_buffer(min_seq, data);
            }
        }
    }

    /// Flushes the flow's out-of-order buffer given the next expected
    /// sequence number and updates the flow's new next expected
    /// sequence number and status after the flush.
    #[inline]
    pub(super) fn flush_ooo_buffer(&mut self, expected_seq: u32, data: &mut ConnData) {
        let next_seq = self
            .ooo_buf
            .flush_ordered(expected_seq, &mut self.consumed_flags, data);
        self.next_seq = Some(next_seq);
    }

    /// Emits every remaining buffered segment in sequence order regardless
    /// of gaps, then leaves the flow empty. Used at finalization.
    pub(super) fn flush_all(&mut self, data: &mut ConnData) {
        let mut next_seq = self.next_seq.unwrap_or(0);
        if self.ooo_buf.len() > 0 && self.next_seq.is_none() {
            // never initialized; start from the earliest buffered segment
            if let Some(min_seq) = self.ooo_buf.min_seq_from(0) {
                next_seq = min_seq;
            }
        }
        while let Some(mut segment) = self.ooo_buf.remove_min_from(next_seq) {
            let cur_seq = segment.seq_no();
            if wrapping_lt(cur_seq, next_seq) || cur_seq == next_seq {
                match overlap(&mut segment, next_seq) {
                    Some(end_seq) => {
                        self.consumed_flags |= segment.flags();
                        next_seq = end_seq;
                        data.consume_pdu(segment);
                    }
                    None => drop(segment),
                }
            } else {
                // gap: skip over it and keep emitting
                data.note_gap_skip(cur_seq.wrapping_sub(next_seq) as u64);
                self.consumed_flags |= segment.flags();
                next_seq = cur_seq.wrapping_add(segment.length() as u32);
                data.consume_pdu(segment);
            }
        }
        self.next_seq = Some(next_seq);
    }
}

/// A buffer to hold reordered TCP segments
#[derive(Debug)]
pub(crate) struct OutOfOrderBuffer {
    capacity: usize,
    max_gap_bytes: usize,
    buffered_bytes: usize,
    pub(crate) buf: VecDeque<L4Pdu>,
}

impl OutOfOrderBuffer {
    /// Creates a new OutOfOrderBuffer with capacity
    fn new(capacity: usize, max_gap_bytes: usize) -> Self {
        OutOfOrderBuffer {
            capacity,
            max_gap_bytes,
            buffered_bytes: 0,
            buf: VecDeque::new(),
        }
    }

    /// Returns the number of elements in the buffer
    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    /// Inserts segment at the end of the buffer. Returns `true` if the
    /// buffer now exceeds its segment or byte ceiling.
    fn insert_back(&mut self, segment: L4Pdu) -> bool {
        log::debug!("insert with seq : {:#?}", segment.seq_no());
        self.buffered_bytes += segment.length();
        self.buf.push_back(segment);
        self.buf.len() > self.capacity || self.buffered_bytes > self.max_gap_bytes
    }

    /// Returns the buffered sequence number closest after `from` (in
    /// wrapping distance).
    fn min_seq_from(&self, from: u32) -> Option<u32> {
        self.buf
            .iter()
            .map(|segment| segment.seq_no())
            .min_by_key(|seq| seq.wrapping_sub(from))
    }

    /// Removes and returns the buffered segment closest after `from`.
    fn remove_min_from(&mut self, from: u32) -> Option<L4Pdu> {
        let index = self
            .buf
            .iter()
            .enumerate()
            .min_by_key(|(_, segment)| segment.seq_no().wrapping_sub(from))
            .map(|(i, _)| i)?;
        let segment = self.buf.remove(index)?;
        self.buffered_bytes -= segment.length();
        Some(segment)
    }

    /// Consumes segments with expected data, retains segments with future data,
    /// and drops segments with old data.
    /// Returns the next expected sequence number.
    #[inline]
    fn flush_ordered(
        &mut self,
        expected_seq: u32,
        consumed_flags: &mut u8,
        data: &mut ConnData,
    ) -> u32 {
        let mut next_seq = expected_seq;
        let mut index = 0;
        while index < self.len() {
            // unwraps ok because index < len
            let cur_seq = self.buf.get(index).unwrap().seq_no();
            log::debug!("Flushing...current seq: {:#?}", cur_seq);

            if next_seq == cur_seq {
                let segment = self.buf.remove(index).unwrap();
                self.buffered_bytes -= segment.length();
                *consumed_flags |= segment.flags();
                if segment.flags() & RST != 0 {
                    data.consume_pdu(segment);
                    return next_seq;
                }
                next_seq = next_seq.wrapping_add(segment.length() as u32);
                if segment.flags() & FIN != 0 {
                    next_seq = next_seq.wrapping_add(1);
                }
                data.consume_pdu(segment);
                index = 0;
            } else if wrapping_lt(next_seq, cur_seq) {
                index += 1;
            } else {
                let mut segment = self.buf.remove(index).unwrap();
                self.buffered_bytes -= segment.length();
                if let Some(end_seq) = overlap(&mut segment, next_seq) {
                    next_seq = end_seq;
                    if segment.flags() & FIN != 0 {
                        next_seq = next_seq.wrapping_add(1);
                    }
                    *consumed_flags |= segment.flags();
                    data.consume_pdu(segment);
                    index = 0;
                } else {
                    log::debug!("Dropping old segment during flush.");
                    drop(segment);
                    // the removal shifted the next element into `index`
                }
            }
        }
        next_seq
    }
}

pub(crate) fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    // From RFC1323:
    //     TCP determines if a data segment is "old" or "new" by testing
    //     whether its sequence number is within 2**31 bytes of the left edge
    //     of the window, and if it is not, discarding the data as "old".  To
    //     insure that new data is never mistakenly considered old and vice-
    //     versa, the left edge of the sender's window has to be at most
    //     2**31 away from the right edge of the receiver's window.
    lhs.wrapping_sub(rhs) > (1 << 31)
}

/// Check if a segment has overlapping data with the received bytes.
/// Returns the new expected sequence number if there is overlap
fn overlap(segment: &mut L4Pdu, expected_seq: u32) -> Option<u32> {
    let length = segment.length();
    let cur_seq = segment.seq_no();
    let end_seq = cur_seq.wrapping_add(length as u32);

    if wrapping_lt(expected_seq, end_seq) {
        // contains new data
        let new_data_len = end_seq.wrapping_sub(expected_seq);
        let overlap_data_len = expected_seq.wrapping_sub(cur_seq);

        log::debug!("Overlap with new data size : {:#?}", new_data_len);
        segment.ctxt.offset += overlap_data_len as usize;
        segment.ctxt.length = new_data_len as usize;
        Some(end_seq)
    } else {
        None
    }
}
