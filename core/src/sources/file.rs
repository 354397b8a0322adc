//! PCAP/PCAPNG file source.

use super::{ts_from_timeval, PacketSource, SourceRead};
use crate::error::CoreError;
use crate::memory::pktbuf::PktBuf;

use std::path::{Path, PathBuf};

use pcap::{Capture, Offline};

/// Reads frames from a capture file.
pub struct FileSource {
    path: PathBuf,
    cap: Capture<Offline>,
}

impl FileSource {
    /// Opens a PCAP or PCAPNG file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CoreError> {
        let path = path.as_ref().to_path_buf();
        let cap = Capture::from_file(&path)
            .map_err(|e| CoreError::source(&path.display().to_string(), e))?;
        log::debug!(
            "Opened {} (linktype {:?})",
            path.display(),
            cap.get_datalink()
        );
        Ok(FileSource { path, cap })
    }
}

impl PacketSource for FileSource {
    fn read(&mut self) -> Result<SourceRead, CoreError> {
        match self.cap.next_packet() {
            Ok(frame) => Ok(SourceRead::Frame(PktBuf::from_bytes(
                frame.data,
                ts_from_timeval(frame.header.ts),
            ))),
            Err(pcap::Error::NoMorePackets) => Ok(SourceRead::Eof),
            Err(pcap::Error::TimeoutExpired) => Ok(SourceRead::Idle),
            Err(e) => Err(CoreError::source(&self.descriptor(), e)),
        }
    }

    fn descriptor(&self) -> String {
        format!("file:{}", self.path.display())
    }
}
