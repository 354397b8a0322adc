//! Transport-layer protocol data unit for stream reassembly.

use crate::conntrack::conn_id::SessionId;
use crate::memory::pktbuf::PktBuf;
use crate::protocols::packet::ethernet::Ethernet;
use crate::protocols::packet::ipv4::Ipv4;
use crate::protocols::packet::ipv6::Ipv6;
use crate::protocols::packet::tcp::Tcp;
use crate::protocols::packet::Packet;

use std::net::{IpAddr, SocketAddr};

use anyhow::{bail, Result};

/// One TCP segment moving through the pipeline.
#[derive(Debug)]
pub struct L4Pdu {
    /// Packet buffer containing frame data.
    pub(crate) buf: PktBuf,
    /// Transport layer context.
    pub(crate) ctxt: L4Context,
    /// `true` if the segment travels client -> server.
    pub(crate) dir: bool,
    /// Session whose reader produced this segment.
    pub(crate) session: SessionId,
}

impl L4Pdu {
    pub(crate) fn new(buf: PktBuf, ctxt: L4Context, dir: bool, session: SessionId) -> Self {
        L4Pdu {
            buf,
            ctxt,
            dir,
            session,
        }
    }

    #[inline]
    pub(crate) fn length(&self) -> usize {
        self.ctxt.length
    }

    #[inline]
    pub(crate) fn seq_no(&self) -> u32 {
        self.ctxt.seq_no
    }

    #[inline]
    pub(crate) fn flags(&self) -> u8 {
        self.ctxt.flags
    }

    /// Payload bytes of the segment (after any overlap trim).
    #[inline]
    pub(crate) fn payload(&self) -> &[u8] {
        &self.buf.data()[self.ctxt.offset..self.ctxt.offset + self.ctxt.length]
    }
}

/// Parsed transport-layer context used for connection tracking.
#[derive(Debug, Clone, Copy)]
pub struct L4Context {
    /// Source socket address.
    pub(crate) src: SocketAddr,
    /// Destination socket address.
    pub(crate) dst: SocketAddr,
    /// Offset into the buffer where payload begins.
    pub(crate) offset: usize,
    /// Length of the payload in bytes.
    pub(crate) length: usize,
    /// Raw sequence number of segment.
    pub(crate) seq_no: u32,
    /// TCP flags.
    pub(crate) flags: u8,
}

impl L4Context {
    /// Parses an Ethernet/IP/TCP frame. Fails on anything that is not TCP
    /// and on frames whose advertised lengths fall outside the buffer.
    pub fn parse(buf: &PktBuf) -> Result<Self> {
        if let Ok(eth) = buf.parse_to::<Ethernet>() {
            if let Ok(ipv4) = eth.parse_to::<Ipv4>() {
                if let Ok(tcp) = ipv4.parse_to::<Tcp>() {
                    if let Some(payload_size) = (ipv4.total_length() as usize)
                        .checked_sub(ipv4.header_len() + tcp.header_len())
                    {
                        Self::checked(
                            buf,
                            SocketAddr::new(IpAddr::V4(ipv4.src_addr()), tcp.src_port()),
                            SocketAddr::new(IpAddr::V4(ipv4.dst_addr()), tcp.dst_port()),
                            tcp.next_header_offset(),
                            payload_size,
                            &tcp,
                        )
                    } else {
                        bail!("Malformed packet");
                    }
                } else {
                    bail!("Not TCP");
                }
            } else if let Ok(ipv6) = eth.parse_to::<Ipv6>() {
                if let Ok(tcp) = ipv6.parse_to::<Tcp>() {
                    if let Some(payload_size) =
                        (ipv6.payload_length() as usize).checked_sub(tcp.header_len())
                    {
                        Self::checked(
                            buf,
                            SocketAddr::new(IpAddr::V6(ipv6.src_addr()), tcp.src_port()),
                            SocketAddr::new(IpAddr::V6(ipv6.dst_addr()), tcp.dst_port()),
                            tcp.next_header_offset(),
                            payload_size,
                            &tcp,
                        )
                    } else {
                        bail!("Malformed packet");
                    }
                } else {
                    bail!("Not TCP");
                }
            } else {
                bail!("Not IP");
            }
        } else {
            bail!("Not Ethernet");
        }
    }

    fn checked(
        buf: &PktBuf,
        src: SocketAddr,
        dst: SocketAddr,
        offset: usize,
        length: usize,
        tcp: &Tcp,
    ) -> Result<Self> {
        // Truncated captures advertise more payload than the frame carries.
        if offset + length > buf.data_len() {
            bail!("Truncated packet");
        }
        Ok(L4Context {
            src,
            dst,
            offset,
            length,
            seq_no: tcp.seq_no(),
            flags: tcp.flags(),
        })
    }
}
