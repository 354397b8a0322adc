//! Packet sources.
//!
//! Every ingestion path — PCAP/PCAPNG files, live libpcap interfaces, and
//! remote `tcpdump -w -` streams over SSH — implements [PacketSource] and
//! feeds the same pipeline.

pub mod file;
pub mod live;
pub mod remote;

pub use file::FileSource;
pub use live::LiveSource;
pub use remote::{RemoteSource, SshConfig};

use crate::error::CoreError;
use crate::memory::pktbuf::PktBuf;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

/// Outcome of one source read.
pub(crate) enum SourceRead {
    /// A captured frame.
    Frame(PktBuf),
    /// Nothing available yet (live read timeout); poll again.
    Idle,
    /// End of the stream.
    Eof,
}

/// A stream of captured frames.
pub(crate) trait PacketSource: Send {
    /// Reads the next frame. Live sources return [SourceRead::Idle] on read
    /// timeout so callers can poll cancellation between packets.
    fn read(&mut self) -> Result<SourceRead, CoreError>;

    /// Human-readable description of the source, recorded on the session.
    fn descriptor(&self) -> String;

    /// Packets dropped by the kernel since the last call, if the driver
    /// exposes drop counters.
    fn kernel_drops(&mut self) -> u64 {
        0
    }
}

/// Converts a libpcap record timestamp.
pub(crate) fn ts_from_timeval(tv: libc::timeval) -> DateTime<Utc> {
    Utc.timestamp_opt(tv.tv_sec as i64, (tv.tv_usec as u32).saturating_mul(1000))
        .single()
        .unwrap_or_else(Utc::now)
}

/// Builds a PCAP record header for writing `buf` to a savefile.
pub(crate) fn header_for(buf: &PktBuf) -> pcap::PacketHeader {
    let ts = buf.timestamp();
    pcap::PacketHeader {
        ts: libc::timeval {
            tv_sec: ts.timestamp() as libc::time_t,
            tv_usec: ts.timestamp_subsec_micros() as libc::suseconds_t,
        },
        caplen: buf.data_len() as u32,
        len: buf.data_len() as u32,
    }
}

/// A capturable network interface.
#[derive(Debug, Clone, Serialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub description: String,
    pub addresses: Vec<String>,
}

/// Enumerates local capture interfaces.
pub fn list_interfaces() -> Result<Vec<InterfaceInfo>, CoreError> {
    let devices = pcap::Device::list().map_err(|e| CoreError::source("local", e))?;
    Ok(devices
        .into_iter()
        .map(|device| InterfaceInfo {
            description: device.desc.clone().unwrap_or_default(),
            addresses: device
                .addresses
                .iter()
                .map(|address| address.addr.to_string())
                .collect(),
            name: device.name,
        })
        .collect())
}
