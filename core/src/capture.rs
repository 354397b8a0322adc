//! Live capture management.
//!
//! Transforms a continuous live capture into a sequence of bounded
//! sessions: every captured packet is written to a rotating PCAP file and
//! simultaneously dispatched into the analysis pipeline. At each rotation
//! boundary the current PCAP closes, its session completes, and a new one
//! begins — the flow tables are untouched, so a flow spanning a rotation
//! yields a single connection.

use crate::conntrack::pdu::L4Context;
use crate::dispatch::{PacketDispatcher, PipelineShared};
use crate::error::CoreError;
use crate::importer::{complete_session, PcapImporter, SessionState};
use crate::record::FinalizeReason;
use crate::sources::live::CaptureOptions;
use crate::sources::{header_for, LiveSource, PacketSource, RemoteSource, SourceRead, SshConfig};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use pcap::{Capture, Linktype};

struct ActiveCapture {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Rotates a live capture into bounded PCAP sessions.
pub struct LiveCaptureManager {
    dispatcher: Arc<PacketDispatcher>,
    importer: Arc<PcapImporter>,
    shared: Arc<PipelineShared>,
    /// Rotation interval in milliseconds; runtime-adjustable.
    rotation_ms: Arc<AtomicU64>,
    active: Mutex<Option<ActiveCapture>>,
}

impl LiveCaptureManager {
    pub(crate) fn new(
        dispatcher: Arc<PacketDispatcher>,
        importer: Arc<PcapImporter>,
        shared: Arc<PipelineShared>,
        rotation_ms: u64,
    ) -> Self {
        LiveCaptureManager {
            dispatcher,
            importer,
            shared,
            rotation_ms: Arc::new(AtomicU64::new(rotation_ms.max(1000))),
            active: Mutex::new(None),
        }
    }

    /// Begins capturing on a local interface.
    pub fn start_local_capture(
        &self,
        options: CaptureOptions,
        config: &crate::config::CaptureConfig,
    ) -> Result<(), CoreError> {
        let source = LiveSource::open(&options, config)?;
        self.start(Box::new(source))
    }

    /// Begins capturing on a remote host through an SSH tunnel.
    pub fn start_remote_capture(
        &self,
        ssh: &SshConfig,
        options: CaptureOptions,
        config: &crate::config::CaptureConfig,
    ) -> Result<(), CoreError> {
        let source = RemoteSource::open(ssh, &options, config)?;
        self.start(Box::new(source))
    }

    fn start(&self, source: Box<dyn PacketSource>) -> Result<(), CoreError> {
        let mut active = self.active.lock().unwrap();
        if active.is_some() {
            return Err(CoreError::CaptureState(
                "a live capture is already running".to_string(),
            ));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let worker = CaptureWorker {
            dispatcher: Arc::clone(&self.dispatcher),
            importer: Arc::clone(&self.importer),
            shared: Arc::clone(&self.shared),
            rotation_ms: Arc::clone(&self.rotation_ms),
            stop: Arc::clone(&stop),
        };
        let handle = std::thread::Builder::new()
            .name("seine-capture".to_string())
            .spawn(move || worker.run(source))
            .map_err(|e| CoreError::source("capture worker", e))?;
        *active = Some(ActiveCapture { stop, handle });
        Ok(())
    }

    /// Stops the running capture; open flows are flushed.
    pub fn stop_capture(&self) -> Result<(), CoreError> {
        let capture = self
            .active
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| CoreError::CaptureState("no live capture is running".to_string()))?;
        capture.stop.store(true, Ordering::Release);
        let _ = capture.handle.join();
        log::info!("Live capture stopped");
        Ok(())
    }

    /// Returns `true` if a capture is currently running.
    pub fn is_running(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }

    /// Updates the rotation interval. Takes effect at the next rotation
    /// boundary check.
    pub fn set_rotation_interval(&self, millis: u64) -> Result<(), CoreError> {
        if millis < 1000 {
            return Err(CoreError::CaptureState(
                "rotation interval must be at least one second".to_string(),
            ));
        }
        self.rotation_ms.store(millis, Ordering::Relaxed);
        log::info!("Rotation interval set to {} ms", millis);
        Ok(())
    }
}

/// One running capture: the read/write/dispatch loop with rotation.
struct CaptureWorker {
    dispatcher: Arc<PacketDispatcher>,
    importer: Arc<PcapImporter>,
    shared: Arc<PipelineShared>,
    rotation_ms: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
}

impl CaptureWorker {
    fn run(self, mut source: Box<dyn PacketSource>) {
        let descriptor = source.descriptor();
        loop {
            let state = self.importer.register_session(descriptor.clone());
            let window_end = self.run_window(&mut source, &state);
            state
                .packets_dropped
                .fetch_add(source.kernel_drops(), Ordering::AcqRel);
            complete_session(&self.shared, &state);

            match window_end {
                WindowEnd::Rotate => continue,
                WindowEnd::Stopped | WindowEnd::SourceDead => break,
            }
        }
        // stop (or death of the source) flushes every open flow
        self.dispatcher.flush_all(FinalizeReason::SessionEnd);
    }

    /// Runs one rotation window. The window's PCAP is written under
    /// `pcaps/processing/` and moved into `pcaps/` when the window closes.
    fn run_window(&self, source: &mut Box<dyn PacketSource>, state: &SessionState) -> WindowEnd {
        let dirs = self.importer.dirs();
        let processing_path = dirs.processing.join(format!("{}.pcap", state.id));
        let final_path = dirs.pcaps.join(format!("{}.pcap", state.id));

        let mut writer = match open_writer(&processing_path) {
            Ok(writer) => Some(writer),
            Err(e) => {
                log::error!("Failed to open rotation writer: {}", e);
                *state.error.lock().unwrap() = Some(e.to_string());
                None
            }
        };

        let window_started = Instant::now();
        let window_length = Duration::from_millis(self.rotation_ms.load(Ordering::Relaxed));
        let outcome = loop {
            if self.stop.load(Ordering::Acquire) {
                break WindowEnd::Stopped;
            }
            if window_started.elapsed() >= window_length {
                break WindowEnd::Rotate;
            }
            match source.read() {
                Ok(SourceRead::Frame(buf)) => {
                    state.packets_read.fetch_add(1, Ordering::AcqRel);
                    state
                        .bytes_processed
                        .fetch_add(buf.data_len() as u64, Ordering::AcqRel);
                    if let Some(writer) = writer.as_mut() {
                        writer.write(&pcap::Packet {
                            header: &header_for(&buf),
                            data: buf.data(),
                        });
                    }
                    match L4Context::parse(&buf) {
                        Ok(ctxt) => self.dispatcher.dispatch(buf, ctxt, state.id),
                        Err(e) => {
                            state.packets_dropped.fetch_add(1, Ordering::AcqRel);
                            log::debug!("Dropping unparseable packet: {}", e);
                        }
                    }
                }
                Ok(SourceRead::Idle) => continue,
                Ok(SourceRead::Eof) => {
                    log::warn!("Capture source ended");
                    break WindowEnd::SourceDead;
                }
                Err(e) => {
                    log::error!("Capture source failed: {}", e);
                    *state.error.lock().unwrap() = Some(e.to_string());
                    break WindowEnd::SourceDead;
                }
            }
        };

        // close the writer before moving the finished window into pcaps/
        drop(writer);
        if processing_path.exists() {
            if let Err(e) = std::fs::rename(&processing_path, &final_path) {
                log::error!("Failed to move {}: {}", processing_path.display(), e);
            }
        }
        outcome
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowEnd {
    /// Rotation boundary reached; open the next window.
    Rotate,
    /// Operator stop.
    Stopped,
    /// The source ended or failed.
    SourceDead,
}

/// Opens a PCAP writer independent of the capture handle.
fn open_writer(path: &std::path::Path) -> Result<pcap::Savefile, pcap::Error> {
    Capture::dead(Linktype::ETHERNET)?.savefile(path)
}
