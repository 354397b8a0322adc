//! Shared helpers: synthetic frames and generated capture files.

use std::path::Path;

/// Builds a raw Ethernet/IPv4/TCP frame.
pub fn tcp_frame(
    src: [u8; 4],
    dst: [u8; 4],
    sport: u16,
    dport: u16,
    seq: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(54 + payload.len());
    // ethernet
    bytes.extend_from_slice(&[0u8; 12]);
    bytes.extend_from_slice(&[0x08, 0x00]);
    // ipv4, no options
    bytes.push(0x45);
    bytes.push(0);
    bytes.extend_from_slice(&((40 + payload.len()) as u16).to_be_bytes());
    bytes.extend_from_slice(&[0, 0]);
    bytes.extend_from_slice(&[0x40, 0]);
    bytes.push(64);
    bytes.push(6);
    bytes.extend_from_slice(&[0, 0]);
    bytes.extend_from_slice(&src);
    bytes.extend_from_slice(&dst);
    // tcp, no options
    bytes.extend_from_slice(&sport.to_be_bytes());
    bytes.extend_from_slice(&dport.to_be_bytes());
    bytes.extend_from_slice(&seq.to_be_bytes());
    bytes.extend_from_slice(&0u32.to_be_bytes());
    bytes.push(0x50);
    bytes.push(flags);
    bytes.extend_from_slice(&0xffffu16.to_be_bytes());
    bytes.extend_from_slice(&[0, 0, 0, 0]);
    bytes.extend_from_slice(payload);
    bytes
}

/// Writes `frames` (bytes + capture timestamp in ms) into a PCAP file.
pub fn write_pcap(path: &Path, frames: &[(Vec<u8>, i64)]) {
    let cap = pcap::Capture::dead(pcap::Linktype::ETHERNET).expect("dead capture");
    let mut savefile = cap.savefile(path).expect("open savefile");
    for (bytes, ts_ms) in frames {
        let header = pcap::PacketHeader {
            ts: libc::timeval {
                tv_sec: (ts_ms / 1000) as libc::time_t,
                tv_usec: ((ts_ms % 1000) * 1000) as libc::suseconds_t,
            },
            caplen: bytes.len() as u32,
            len: bytes.len() as u32,
        };
        savefile.write(&pcap::Packet {
            header: &header,
            data: bytes,
        });
    }
}

/// Counts the packets of a PCAP file.
pub fn count_packets(path: &Path) -> usize {
    let mut cap = pcap::Capture::from_file(path).expect("open pcap");
    let mut count = 0;
    while cap.next_packet().is_ok() {
        count += 1;
    }
    count
}
