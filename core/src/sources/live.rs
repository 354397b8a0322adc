//! Live libpcap interface source.

use super::{ts_from_timeval, PacketSource, SourceRead};
use crate::config::CaptureConfig;
use crate::error::CoreError;
use crate::memory::pktbuf::PktBuf;

use pcap::{Active, Capture};

/// Per-capture options layered over the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
    /// Interface name as reported by
    /// [list_interfaces](crate::sources::list_interfaces).
    pub interface: String,
    /// BPF filter applied at the driver.
    pub bpf: Option<String>,
    /// Snapshot length override.
    pub snaplen: Option<i32>,
    /// Promiscuous-mode override.
    pub promiscuous: Option<bool>,
}

/// Reads frames from a live interface.
pub struct LiveSource {
    interface: String,
    cap: Capture<Active>,
    /// Cumulative kernel drop count at the last `kernel_drops` call.
    last_drops: u64,
}

impl LiveSource {
    /// Opens `options.interface` with the given BPF filter and snaplen.
    pub fn open(options: &CaptureOptions, config: &CaptureConfig) -> Result<Self, CoreError> {
        let interface = options.interface.clone();
        let fail = |e: pcap::Error| CoreError::source(&format!("live:{}", interface), e);

        let inactive = Capture::from_device(interface.as_str()).map_err(fail)?;
        let mut cap = inactive
            .promisc(options.promiscuous.unwrap_or(config.promiscuous))
            .snaplen(options.snaplen.unwrap_or(config.snaplen))
            .timeout(config.read_timeout)
            .immediate_mode(true)
            .open()
            .map_err(fail)?;
        if let Some(bpf) = &options.bpf {
            cap.filter(bpf, true).map_err(fail)?;
        }
        log::info!("Capturing on {}", interface);
        Ok(LiveSource {
            interface,
            cap,
            last_drops: 0,
        })
    }
}

impl PacketSource for LiveSource {
    fn read(&mut self) -> Result<SourceRead, CoreError> {
        match self.cap.next_packet() {
            Ok(frame) => Ok(SourceRead::Frame(PktBuf::from_bytes(
                frame.data,
                ts_from_timeval(frame.header.ts),
            ))),
            Err(pcap::Error::TimeoutExpired) => Ok(SourceRead::Idle),
            Err(pcap::Error::NoMorePackets) => Ok(SourceRead::Eof),
            Err(e) => Err(CoreError::source(&self.descriptor(), e)),
        }
    }

    fn descriptor(&self) -> String {
        format!("live:{}", self.interface)
    }

    fn kernel_drops(&mut self) -> u64 {
        match self.cap.stats() {
            Ok(stats) => {
                let total = u64::from(stats.dropped) + u64::from(stats.if_dropped);
                let delta = total.saturating_sub(self.last_drops);
                self.last_drops = total;
                delta
            }
            Err(_) => 0,
        }
    }
}
