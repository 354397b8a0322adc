//! PCAP ingestion sessions.
//!
//! A session is one ingestion job: a file import or one live-capture
//! window. [PcapImporter] owns the session registry, spawns import workers,
//! tracks their progress through atomics, and supports cooperative
//! cancellation checked between packets.

use crate::conntrack::conn_id::{SessionId, SessionIdGen};
use crate::conntrack::pdu::L4Context;
use crate::dispatch::{PacketDispatcher, PipelineShared};
use crate::error::CoreError;
use crate::record::FinalizeReason;
use crate::sources::{FileSource, PacketSource, SourceRead};
use crate::storage::{collections, Filter};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use cpu_time::ProcessTime;
use serde::{Deserialize, Serialize};

/// Reserved on-disk layout beneath the configured data directory.
#[derive(Debug, Clone)]
pub(crate) struct DataDirs {
    /// Completed session PCAPs.
    pub(crate) pcaps: PathBuf,
    /// Work-in-progress PCAPs, moved to `pcaps` on completion.
    pub(crate) processing: PathBuf,
    /// Per-connection PCAP slices generated on demand.
    pub(crate) connections: PathBuf,
}

impl DataDirs {
    pub(crate) fn create(root: &Path) -> std::io::Result<Self> {
        let dirs = DataDirs {
            pcaps: root.join("pcaps"),
            processing: root.join("pcaps").join("processing"),
            connections: root.join("connections"),
        };
        std::fs::create_dir_all(&dirs.processing)?;
        std::fs::create_dir_all(&dirs.connections)?;
        Ok(dirs)
    }
}

/// Live progress state of one session.
#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) id: SessionId,
    pub(crate) source: String,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) completed_at: Mutex<Option<DateTime<Utc>>>,
    pub(crate) packets_read: AtomicU64,
    pub(crate) packets_dropped: AtomicU64,
    pub(crate) bytes_processed: AtomicU64,
    pub(crate) cancelled: AtomicBool,
    pub(crate) error: Mutex<Option<String>>,
}

impl SessionState {
    fn new(id: SessionId, source: String) -> Self {
        SessionState {
            id,
            source,
            started_at: Utc::now(),
            completed_at: Mutex::new(None),
            packets_read: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    /// Consistent point-in-time snapshot.
    pub(crate) fn snapshot(&self) -> SessionRecord {
        SessionRecord {
            id: self.id,
            source: self.source.clone(),
            started_at: self.started_at,
            completed_at: *self.completed_at.lock().unwrap(),
            packets_read: self.packets_read.load(Ordering::Acquire),
            packets_dropped: self.packets_dropped.load(Ordering::Acquire),
            bytes_processed: self.bytes_processed.load(Ordering::Acquire),
            cancelled: self.cancelled.load(Ordering::Acquire),
            error: self.error.lock().unwrap().clone(),
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.completed_at.lock().unwrap().is_some()
    }
}

/// A session status document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    /// Source descriptor (`file:...`, `live:...`, `remote:...`).
    pub source: String,
    pub started_at: DateTime<Utc>,
    /// Set when the session reaches a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    pub packets_read: u64,
    pub packets_dropped: u64,
    pub bytes_processed: u64,
    pub cancelled: bool,
    /// Recorded cause when the source failed.
    pub error: Option<String>,
}

/* --------------------------------------------------------------------------------- */

/// Drives packet ingestion through the pipeline with session bookkeeping,
/// progress, and cancellation.
pub struct PcapImporter {
    dispatcher: Arc<PacketDispatcher>,
    shared: Arc<PipelineShared>,
    sessions: Mutex<HashMap<SessionId, Arc<SessionState>>>,
    session_ids: SessionIdGen,
    workers: Mutex<Vec<JoinHandle<()>>>,
    dirs: DataDirs,
}

impl PcapImporter {
    pub(crate) fn new(
        dispatcher: Arc<PacketDispatcher>,
        shared: Arc<PipelineShared>,
        dirs: DataDirs,
    ) -> Self {
        let importer = PcapImporter {
            dispatcher,
            shared,
            sessions: Mutex::new(HashMap::new()),
            session_ids: SessionIdGen::new(),
            workers: Mutex::new(Vec::new()),
            dirs,
        };
        importer.load_persisted_sessions();
        importer
    }

    /// Restores terminal sessions persisted by earlier runs, so
    /// `get_sessions` reflects history across restarts.
    fn load_persisted_sessions(&self) {
        let docs = match self
            .shared
            .storage
            .find(collections::SESSIONS, &Filter::all(), None, 0, 0)
        {
            Ok(docs) => docs,
            Err(e) => {
                log::error!("Failed to load persisted sessions: {}", e);
                return;
            }
        };
        let mut sessions = self.sessions.lock().unwrap();
        for doc in docs {
            match serde_json::from_value::<SessionRecord>(doc) {
                Ok(record) => {
                    let state = SessionState {
                        id: record.id,
                        source: record.source,
                        started_at: record.started_at,
                        completed_at: Mutex::new(record.completed_at),
                        packets_read: AtomicU64::new(record.packets_read),
                        packets_dropped: AtomicU64::new(record.packets_dropped),
                        bytes_processed: AtomicU64::new(record.bytes_processed),
                        cancelled: AtomicBool::new(record.cancelled),
                        error: Mutex::new(record.error),
                    };
                    sessions.insert(record.id, Arc::new(state));
                }
                Err(e) => log::error!("Skipping undecodable session document: {}", e),
            }
        }
    }

    /// Registers a new session and announces it.
    pub(crate) fn register_session(&self, source: String) -> Arc<SessionState> {
        let id = self.session_ids.next();
        let state = Arc::new(SessionState::new(id, source));
        self.sessions.lock().unwrap().insert(id, Arc::clone(&state));
        self.shared.sink.session_updated(&state.snapshot());
        state
    }

    /// Moves a session to its terminal state, persists it, and announces
    /// the transition.
    pub(crate) fn complete_session(&self, state: &SessionState) {
        complete_session(&self.shared, state);
    }

    /// Imports a capture file. Returns the new session id immediately; a
    /// worker thread reads the file into the pipeline.
    ///
    /// With `flush_all`, every flow still open at end-of-file is
    /// force-finalized (for captures without clean FINs).
    pub fn import_file<P: AsRef<Path>>(
        &self,
        path: P,
        flush_all: bool,
    ) -> Result<SessionId, CoreError> {
        let path = path.as_ref();
        let state = self.register_session(format!("file:{}", path.display()));
        let id = state.id;

        // Stage the file under processing/ so a crash leaves no ambiguity
        // about which pcaps are fully analyzed.
        let extension = match path.extension().and_then(|e| e.to_str()) {
            Some("pcapng") => "pcapng",
            _ => "pcap",
        };
        let processing_path = self.dirs.processing.join(format!("{}.{}", id, extension));
        let final_path = self.dirs.pcaps.join(format!("{}.{}", id, extension));
        if let Err(e) = std::fs::copy(path, &processing_path) {
            *state.error.lock().unwrap() = Some(e.to_string());
            self.complete_session(&state);
            return Err(CoreError::source(&format!("file:{}", path.display()), e));
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        let worker_state = Arc::clone(&state);
        let handle = std::thread::Builder::new()
            .name(format!("seine-import-{}", id))
            .spawn(move || {
                let start = ProcessTime::try_now().ok();
                let source = match FileSource::open(&processing_path) {
                    Ok(source) => source,
                    Err(e) => {
                        *worker_state.error.lock().unwrap() = Some(e.to_string());
                        return;
                    }
                };
                run_session(source, &worker_state, &dispatcher, id);

                let cancelled = worker_state.cancelled.load(Ordering::Acquire);
                if flush_all || cancelled {
                    let reason = if cancelled {
                        FinalizeReason::Cancelled
                    } else {
                        FinalizeReason::SessionEnd
                    };
                    dispatcher.flush_all(reason);
                }
                if let Err(e) = std::fs::rename(&processing_path, &final_path) {
                    log::error!("Failed to move {} to pcaps/: {}", processing_path.display(), e);
                }
                if let Some(start) = start {
                    log::info!("Import {} CPU time: {:?}ms", id, start.elapsed().as_millis());
                }
            })
            .map_err(|e| CoreError::source("import worker", e))?;

        // completion (including error paths) is recorded by the caller-side
        // monitor below; the worker only signals through `state`
        self.track_worker(handle, state);
        Ok(id)
    }

    /// Joins the worker in a monitor thread and completes the session once
    /// it exits.
    fn track_worker(&self, handle: JoinHandle<()>, state: Arc<SessionState>) {
        let shared = Arc::clone(&self.shared);
        let monitor = std::thread::Builder::new()
            .name(format!("seine-monitor-{}", state.id))
            .spawn(move || {
                let _ = handle.join();
                complete_session(&shared, &state);
            })
            .expect("spawn session monitor");
        self.workers.lock().unwrap().push(monitor);
    }

    /// Signals a running session to abort. Returns `true` if the session
    /// existed and was still running.
    pub fn cancel_session(&self, id: SessionId) -> bool {
        let sessions = self.sessions.lock().unwrap();
        match sessions.get(&id) {
            Some(state) if !state.is_terminal() => {
                state.cancelled.store(true, Ordering::Release);
                log::info!("Cancelling session {}", id);
                true
            }
            _ => false,
        }
    }

    /// Status snapshot of one session.
    pub fn get_session(&self, id: SessionId) -> Result<SessionRecord, CoreError> {
        self.sessions
            .lock()
            .unwrap()
            .get(&id)
            .map(|s| s.snapshot())
            .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))
    }

    /// Status snapshots of all known sessions, newest first.
    pub fn get_sessions(&self) -> Vec<SessionRecord> {
        let mut sessions: Vec<SessionRecord> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .map(|s| s.snapshot())
            .collect();
        sessions.sort_by(|a, b| b.id.cmp(&a.id));
        sessions
    }

    pub(crate) fn dirs(&self) -> &DataDirs {
        &self.dirs
    }

    /// Waits for all import workers to finish. Used on shutdown and in
    /// tests.
    pub fn join_workers(&self) {
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Moves `state` to its terminal state, persists the session document, and
/// announces the transition.
pub(crate) fn complete_session(shared: &PipelineShared, state: &SessionState) {
    *state.completed_at.lock().unwrap() = Some(Utc::now());
    let record = state.snapshot();
    match serde_json::to_value(&record) {
        Ok(doc) => {
            if let Err(e) = shared.storage.insert(collections::SESSIONS, doc) {
                log::error!("Failed to persist session {}: {}", record.id, e);
            }
        }
        Err(e) => log::error!("Failed to encode session {}: {}", record.id, e),
    }
    shared.sink.session_updated(&record);
    log::info!(
        "Session {} done: {} pkts, {} bytes, {} dropped{}",
        record.id,
        record.packets_read,
        record.bytes_processed,
        record.packets_dropped,
        if record.cancelled { " (cancelled)" } else { "" }
    );
}

/// Common read loop: pulls frames from `source` until EOF, error, or
/// cancellation, updating session counters and dispatching parsed packets.
pub(crate) fn run_session(
    mut source: impl PacketSource,
    state: &SessionState,
    dispatcher: &PacketDispatcher,
    id: SessionId,
) {
    loop {
        // cancellation is checked between packets, bounding cancel latency
        // to one packet read
        if state.cancelled.load(Ordering::Acquire) {
            break;
        }
        match source.read() {
            Ok(SourceRead::Frame(buf)) => {
                state.packets_read.fetch_add(1, Ordering::AcqRel);
                state
                    .bytes_processed
                    .fetch_add(buf.data_len() as u64, Ordering::AcqRel);
                match L4Context::parse(&buf) {
                    Ok(ctxt) => dispatcher.dispatch(buf, ctxt, id),
                    Err(e) => {
                        state.packets_dropped.fetch_add(1, Ordering::AcqRel);
                        log::debug!("Dropping unparseable packet: {}", e);
                    }
                }
            }
            Ok(SourceRead::Idle) => continue,
            Ok(SourceRead::Eof) => break,
            Err(e) => {
                log::error!("Session {} source failed: {}", id, e);
                *state.error.lock().unwrap() = Some(e.to_string());
                break;
            }
        }
    }
    state
        .packets_dropped
        .fetch_add(source.kernel_drops(), Ordering::AcqRel);
}
